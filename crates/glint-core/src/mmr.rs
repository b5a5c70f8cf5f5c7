//! Merkle Mountain Range over the confirmed header chain, with node
//! payloads distributed across the backing store.
//!
//! Classic MMRs keep every interior node in one array. Here the range grows
//! with the chain, and each leaf's bookkeeping lives in the store row of the
//! header that appended it: the payload written by [`Mmr::append`] carries
//! the interior hashes of every perfect subtree ending at that leaf, plus
//! backward navigation keys at power-of-two distances. Earlier payloads are
//! read back through a [`NodeSource`], so no operation ever needs the whole
//! range in memory.
//!
//! Hashing is BLAKE3 with domain separation:
//! - Leaf: `BLAKE3(0x00 || contribution)`
//! - Interior node: `BLAKE3(0x01 || left || right)`
//!
//! Proof and root queries operate on the range *extended by one virtual
//! leaf*: the root a successor header commits to. [`Mmr::proof`] output
//! therefore verifies directly against [`Mmr::predicted_root`].

use serde::{Deserialize, Serialize};

use crate::types::Hash256;

/// Store key of a persisted leaf payload (a header row id).
pub type NodeKey = u64;

/// Domain separation prefix for leaf hashes.
const LEAF_PREFIX: u8 = 0x00;

/// Domain separation prefix for interior node hashes.
const NODE_PREFIX: u8 = 0x01;

/// Compute a domain-separated leaf hash: `BLAKE3(0x00 || data)`.
pub fn leaf_hash(data: &Hash256) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[LEAF_PREFIX]);
    hasher.update(data.as_bytes());
    Hash256(hasher.finalize().into())
}

/// Compute a domain-separated interior hash: `BLAKE3(0x01 || left || right)`.
pub fn node_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[NODE_PREFIX]);
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Hash256(hasher.finalize().into())
}

/// Read access to persisted leaf payloads and leaf contributions.
///
/// Implementations may memoize the most recent key; proof construction
/// frequently re-reads the same leaf.
pub trait NodeSource {
    /// Failure surfaced by the backing store.
    type Error;

    /// The payload previously produced by [`Mmr::append`] for this leaf.
    fn node_data(&mut self, key: NodeKey) -> Result<Vec<u8>, Self::Error>;

    /// The hash this leaf contributes to the range.
    fn node_hash(&mut self, key: NodeKey) -> Result<Hash256, Self::Error>;
}

/// Errors raised while walking distributed payloads.
#[derive(Debug)]
pub enum MmrError<E> {
    /// The backing store failed.
    Source(E),
    /// A persisted payload does not have the width the layout requires.
    PayloadSize {
        /// Key of the offending leaf.
        key: NodeKey,
        /// Width the layout requires.
        expected: usize,
        /// Width found in the store.
        actual: usize,
    },
}

/// Number of subtree hashes stored in the payload of leaf `n`: one per
/// perfect subtree of at least two leaves ending at `n`.
fn hash_count(n: u64) -> u32 {
    (n + 1).trailing_zeros()
}

/// Number of navigation keys stored in the payload of leaf `n`: one per
/// power of two not exceeding `n`.
fn key_count(n: u64) -> u32 {
    if n == 0 {
        0
    } else {
        64 - n.leading_zeros()
    }
}

/// Payload width for leaf `n`. Genesis (`n == 0`) has the empty payload.
pub fn node_size(n: u64) -> usize {
    32 * hash_count(n) as usize + 8 * key_count(n) as usize
}

/// Decoded leaf payload.
struct NodePayload {
    /// Hash of the subtree of `2^(i+1)` leaves ending at this leaf.
    subtrees: Vec<Hash256>,
    /// Key of the leaf `2^i` positions back.
    back_keys: Vec<NodeKey>,
}

impl NodePayload {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 * self.subtrees.len() + 8 * self.back_keys.len());
        for h in &self.subtrees {
            out.extend_from_slice(h.as_bytes());
        }
        for k in &self.back_keys {
            out.extend_from_slice(&k.to_le_bytes());
        }
        out
    }

    fn decode(n: u64, raw: &[u8]) -> Option<Self> {
        if raw.len() != node_size(n) {
            return None;
        }
        let hashes = hash_count(n) as usize;
        let keys = key_count(n) as usize;
        let mut subtrees = Vec::with_capacity(hashes);
        for i in 0..hashes {
            let mut h = [0u8; 32];
            h.copy_from_slice(&raw[32 * i..32 * (i + 1)]);
            subtrees.push(Hash256(h));
        }
        let tail = &raw[32 * hashes..];
        let mut back_keys = Vec::with_capacity(keys);
        for i in 0..keys {
            let mut k = [0u8; 8];
            k.copy_from_slice(&tail[8 * i..8 * (i + 1)]);
            back_keys.push(NodeKey::from_le_bytes(k));
        }
        Some(Self { subtrees, back_keys })
    }
}

/// The peaks of a range of `m` leaves, left to right, as
/// `(last leaf index, leaf count)` pairs.
fn peaks(m: u64) -> Vec<(u64, u64)> {
    let mut out = Vec::new();
    let mut pos = 0u64;
    for bit in (0..64).rev() {
        let size = 1u64 << bit;
        if m & size != 0 {
            pos += size;
            out.push((pos - 1, size));
        }
    }
    out
}

/// Which side a sibling hash is on relative to the current node.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub enum Side {
    /// Sibling is on the left (we are on the right).
    Left,
    /// Sibling is on the right (we are on the left).
    Right,
}

/// A single step in an inclusion proof.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct ProofStep {
    /// The sibling hash at this level.
    pub hash: Hash256,
    /// Which side the sibling is on.
    pub side: Side,
}

/// Inclusion proof of one leaf against a range root.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct MmrProof {
    /// Index of the proven leaf.
    pub leaf_index: u64,
    /// The proven leaf's contribution.
    pub leaf: Hash256,
    /// Sibling hashes from the leaf up to the root fold.
    pub path: Vec<ProofStep>,
}

impl MmrProof {
    /// Recompute the root from the leaf and sibling path, then compare.
    pub fn verify(&self, expected_root: &Hash256) -> bool {
        let mut current = leaf_hash(&self.leaf);
        for step in &self.path {
            current = match step.side {
                Side::Left => node_hash(&step.hash, &current),
                Side::Right => node_hash(&current, &step.hash),
            };
        }
        current == *expected_root
    }
}

/// A view of the distributed range: `count` persisted leaves, the last of
/// which lives at store key `last`.
#[derive(Clone, Copy, Debug)]
pub struct Mmr {
    count: u64,
    last: NodeKey,
}

impl Mmr {
    /// View a range of `count` leaves whose tail payload lives at `last`.
    /// `last` is ignored for the empty range.
    pub fn new(count: u64, last: NodeKey) -> Self {
        Self { count, last }
    }

    /// Produce the payload for appending leaf `count` with the given
    /// contribution. The caller persists the returned bytes under the new
    /// leaf's key; the payload width always equals `node_size(count)`.
    pub fn append<S: NodeSource>(
        &self,
        source: &mut S,
        leaf: &Hash256,
    ) -> Result<Vec<u8>, MmrError<S::Error>> {
        let n = self.count;
        if n == 0 {
            return Ok(Vec::new());
        }

        let mut walker = Walker { source, count: n, last: self.last };

        let mut back_keys = Vec::with_capacity(key_count(n) as usize);
        back_keys.push(walker.last);
        for j in 1..key_count(n) {
            back_keys.push(walker.key_of(n - (1u64 << j))?);
        }

        let mut subtrees = Vec::with_capacity(hash_count(n) as usize);
        let mut acc = leaf_hash(leaf);
        for k in 1..=hash_count(n) {
            let half = 1u64 << (k - 1);
            let left = walker.subtree_hash(n - half, half)?;
            acc = node_hash(&left, &acc);
            subtrees.push(acc);
        }

        Ok(NodePayload { subtrees, back_keys }.encode())
    }

    /// Root of the persisted range. [`Hash256::ZERO`] for the empty range.
    pub fn root<S: NodeSource>(&self, source: &mut S) -> Result<Hash256, MmrError<S::Error>> {
        let mut view = RangeView { walker: Walker { source, count: self.count, last: self.last }, appended: None };
        view.fold_peaks(self.count)
    }

    /// Root of the range extended by one more leaf with the given
    /// contribution: the commitment a successor header carries.
    pub fn predicted_root<S: NodeSource>(
        &self,
        source: &mut S,
        appended: &Hash256,
    ) -> Result<Hash256, MmrError<S::Error>> {
        let mut view = RangeView {
            walker: Walker { source, count: self.count, last: self.last },
            appended: Some(leaf_hash(appended)),
        };
        view.fold_peaks(self.count + 1)
    }

    /// Inclusion proof of persisted leaf `index` inside the extended range,
    /// verifiable against [`Mmr::predicted_root`] for the same `appended`
    /// contribution. `index` must be below `count`.
    pub fn proof<S: NodeSource>(
        &self,
        source: &mut S,
        index: u64,
        appended: &Hash256,
    ) -> Result<MmrProof, MmrError<S::Error>> {
        debug_assert!(index < self.count);
        let total = self.count + 1;
        let mut view = RangeView {
            walker: Walker { source, count: self.count, last: self.last },
            appended: Some(leaf_hash(appended)),
        };

        let pks = peaks(total);
        let mut peak_idx = 0;
        while pks[peak_idx].0 < index {
            peak_idx += 1;
        }
        let (peak_end, peak_size) = pks[peak_idx];
        let peak_start = peak_end + 1 - peak_size;

        let leaf_key = view.walker.key_of(index)?;
        let leaf = view
            .walker
            .source
            .node_hash(leaf_key)
            .map_err(MmrError::Source)?;

        // Climb inside the peak.
        let mut path = Vec::new();
        let mut start = index;
        let mut size = 1u64;
        while size < peak_size {
            if (start - peak_start) % (size * 2) == 0 {
                let sibling = view.subtree(start + 2 * size - 1, size)?;
                path.push(ProofStep { hash: sibling, side: Side::Right });
            } else {
                let sibling = view.subtree(start - 1, size)?;
                path.push(ProofStep { hash: sibling, side: Side::Left });
                start -= size;
            }
            size *= 2;
        }

        // Bag the peaks to the right into a single hash, then prepend the
        // peaks to the left, mirroring the root fold.
        let rest = &pks[peak_idx + 1..];
        if let Some(&(last_end, last_size)) = rest.last() {
            let mut bag = view.subtree(last_end, last_size)?;
            for &(end, size) in rest[..rest.len() - 1].iter().rev() {
                bag = node_hash(&view.subtree(end, size)?, &bag);
            }
            path.push(ProofStep { hash: bag, side: Side::Right });
        }
        for &(end, size) in pks[..peak_idx].iter().rev() {
            path.push(ProofStep { hash: view.subtree(end, size)?, side: Side::Left });
        }

        Ok(MmrProof { leaf_index: index, leaf, path })
    }
}

/// Backward navigation over persisted payloads.
struct Walker<'a, S: NodeSource> {
    source: &'a mut S,
    count: u64,
    last: NodeKey,
}

impl<S: NodeSource> Walker<'_, S> {
    fn payload(&mut self, n: u64, key: NodeKey) -> Result<NodePayload, MmrError<S::Error>> {
        let raw = self.source.node_data(key).map_err(MmrError::Source)?;
        let actual = raw.len();
        NodePayload::decode(n, &raw).ok_or(MmrError::PayloadSize {
            key,
            expected: node_size(n),
            actual,
        })
    }

    /// Store key of persisted leaf `target`, walking back from the tail in
    /// power-of-two jumps.
    fn key_of(&mut self, target: u64) -> Result<NodeKey, MmrError<S::Error>> {
        let mut idx = self.count - 1;
        let mut key = self.last;
        while idx > target {
            let payload = self.payload(idx, key)?;
            let gap = idx - target;
            let jump = 63 - gap.leading_zeros();
            key = payload.back_keys[jump as usize];
            idx -= 1u64 << jump;
        }
        Ok(key)
    }

    /// Hash of the perfect subtree of `size` persisted leaves ending at
    /// leaf `end`. `size` must divide `end + 1`.
    fn subtree_hash(&mut self, end: u64, size: u64) -> Result<Hash256, MmrError<S::Error>> {
        let key = self.key_of(end)?;
        if size == 1 {
            let hv = self.source.node_hash(key).map_err(MmrError::Source)?;
            Ok(leaf_hash(&hv))
        } else {
            let payload = self.payload(end, key)?;
            let level = size.trailing_zeros() as usize;
            Ok(payload.subtrees[level - 1])
        }
    }
}

/// A walker extended by at most one virtual leaf at index `count`.
struct RangeView<'a, S: NodeSource> {
    walker: Walker<'a, S>,
    /// Leaf hash of the virtual tail, if the view is extended.
    appended: Option<Hash256>,
}

impl<S: NodeSource> RangeView<'_, S> {
    /// Subtree hash where the range may end in the virtual leaf.
    fn subtree(&mut self, end: u64, size: u64) -> Result<Hash256, MmrError<S::Error>> {
        match self.appended {
            Some(tail) if end == self.walker.count => {
                let mut acc = tail;
                let mut half = 1u64;
                while half < size {
                    let left = self.walker.subtree_hash(end - half, half)?;
                    acc = node_hash(&left, &acc);
                    half *= 2;
                }
                Ok(acc)
            }
            _ => self.walker.subtree_hash(end, size),
        }
    }

    /// Root of a range of `m` leaves: peak hashes folded right to left.
    fn fold_peaks(&mut self, m: u64) -> Result<Hash256, MmrError<S::Error>> {
        let pks = peaks(m);
        let Some(&(last_end, last_size)) = pks.last() else {
            return Ok(Hash256::ZERO);
        };
        let mut acc = self.subtree(last_end, last_size)?;
        for &(end, size) in pks[..pks.len() - 1].iter().rev() {
            acc = node_hash(&self.subtree(end, size)?, &acc);
        }
        Ok(acc)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::convert::Infallible;

    use super::*;

    /// Store stub: payloads and contributions keyed the way rows would be.
    #[derive(Default)]
    struct MemSource {
        nodes: HashMap<NodeKey, (Vec<u8>, Hash256)>,
    }

    impl NodeSource for MemSource {
        type Error = Infallible;

        fn node_data(&mut self, key: NodeKey) -> Result<Vec<u8>, Infallible> {
            Ok(self.nodes[&key].0.clone())
        }

        fn node_hash(&mut self, key: NodeKey) -> Result<Hash256, Infallible> {
            Ok(self.nodes[&key].1)
        }
    }

    fn contribution(i: u64) -> Hash256 {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&i.to_le_bytes());
        bytes[31] = 0x5A;
        Hash256(bytes)
    }

    /// Leaf keys deliberately non-contiguous: payload navigation must not
    /// assume adjacent rows.
    fn key(i: u64) -> NodeKey {
        100 + 3 * i
    }

    /// Append `n` leaves and return the populated source.
    fn build(n: u64) -> MemSource {
        let mut source = MemSource::default();
        for i in 0..n {
            let mmr = Mmr::new(i, if i == 0 { 0 } else { key(i - 1) });
            let payload = mmr.append(&mut source, &contribution(i)).unwrap();
            assert_eq!(payload.len(), node_size(i), "payload width for leaf {i}");
            source.nodes.insert(key(i), (payload, contribution(i)));
        }
        source
    }

    /// Reference root: classic in-memory peak fold over the same hashing.
    fn reference_root(hashes: &[Hash256]) -> Hash256 {
        fn subtree(hashes: &[Hash256]) -> Hash256 {
            if hashes.len() == 1 {
                return leaf_hash(&hashes[0]);
            }
            let mid = hashes.len() / 2;
            node_hash(&subtree(&hashes[..mid]), &subtree(&hashes[mid..]))
        }

        if hashes.is_empty() {
            return Hash256::ZERO;
        }
        let mut parts = Vec::new();
        let mut rest = hashes;
        while !rest.is_empty() {
            let size = 1usize << (63 - (rest.len() as u64).leading_zeros());
            parts.push(subtree(&rest[..size]));
            rest = &rest[size..];
        }
        let mut acc = *parts.last().unwrap();
        for p in parts[..parts.len() - 1].iter().rev() {
            acc = node_hash(p, &acc);
        }
        acc
    }

    #[test]
    fn node_size_layout() {
        assert_eq!(node_size(0), 0);
        assert_eq!(node_size(1), 32 + 8); // one merge, one back key
        assert_eq!(node_size(2), 2 * 8); // no merge, keys for 1 and 2 back
        assert_eq!(node_size(3), 2 * 32 + 2 * 8);
        assert_eq!(node_size(7), 3 * 32 + 3 * 8);
        assert_eq!(node_size(8), 4 * 8);
    }

    #[test]
    fn empty_range_root_is_zero() {
        let mut source = MemSource::default();
        assert_eq!(Mmr::new(0, 0).root(&mut source).unwrap(), Hash256::ZERO);
    }

    #[test]
    fn root_matches_reference_fold() {
        for n in 1..=40u64 {
            let mut source = build(n);
            let got = Mmr::new(n, key(n - 1)).root(&mut source).unwrap();
            let hashes: Vec<Hash256> = (0..n).map(contribution).collect();
            assert_eq!(got, reference_root(&hashes), "root mismatch at {n} leaves");
        }
    }

    #[test]
    fn predicted_root_matches_next_append() {
        for n in 0..=32u64 {
            let mut source = build(n + 1);
            let tail = if n == 0 { 0 } else { key(n - 1) };
            let predicted = Mmr::new(n, tail)
                .predicted_root(&mut source, &contribution(n))
                .unwrap();
            let materialized = Mmr::new(n + 1, key(n)).root(&mut source).unwrap();
            assert_eq!(predicted, materialized, "prediction diverges at {n} leaves");
        }
    }

    #[test]
    fn proofs_verify_against_predicted_root() {
        for n in 1..=24u64 {
            let mut source = build(n);
            let mmr = Mmr::new(n, key(n - 1));
            let appended = contribution(n);
            let root = mmr.predicted_root(&mut source, &appended).unwrap();
            for i in 0..n {
                let proof = mmr.proof(&mut source, i, &appended).unwrap();
                assert_eq!(proof.leaf_index, i);
                assert_eq!(proof.leaf, contribution(i));
                assert!(proof.verify(&root), "proof {i} of {n} failed");
            }
        }
    }

    #[test]
    fn proof_rejects_wrong_root() {
        let mut source = build(9);
        let mmr = Mmr::new(9, key(8));
        let appended = contribution(9);
        let proof = mmr.proof(&mut source, 4, &appended).unwrap();
        assert!(!proof.verify(&Hash256([0xFF; 32])));
    }

    #[test]
    fn proof_rejects_tampered_leaf() {
        let mut source = build(9);
        let mmr = Mmr::new(9, key(8));
        let appended = contribution(9);
        let root = mmr.predicted_root(&mut source, &appended).unwrap();
        let mut proof = mmr.proof(&mut source, 4, &appended).unwrap();
        proof.leaf = contribution(5);
        assert!(!proof.verify(&root));
    }

    #[test]
    fn proof_rejects_tampered_sibling() {
        let mut source = build(9);
        let mmr = Mmr::new(9, key(8));
        let appended = contribution(9);
        let root = mmr.predicted_root(&mut source, &appended).unwrap();
        let mut proof = mmr.proof(&mut source, 0, &appended).unwrap();
        proof.path[0].hash = Hash256([0xFF; 32]);
        assert!(!proof.verify(&root));
    }

    #[test]
    fn proof_depends_on_appended_contribution() {
        let mut source = build(6);
        let mmr = Mmr::new(6, key(5));
        let root_a = mmr.predicted_root(&mut source, &contribution(6)).unwrap();
        let root_b = mmr.predicted_root(&mut source, &contribution(7)).unwrap();
        assert_ne!(root_a, root_b);

        let proof = mmr.proof(&mut source, 2, &contribution(6)).unwrap();
        assert!(proof.verify(&root_a));
        assert!(!proof.verify(&root_b));
    }

    #[test]
    fn corrupt_payload_is_detected() {
        let mut source = build(4);
        let entry = source.nodes.get_mut(&key(3)).unwrap();
        entry.0.pop();
        let err = Mmr::new(4, key(3)).root(&mut source).unwrap_err();
        match err {
            MmrError::PayloadSize { key: k, expected, actual } => {
                assert_eq!(k, key(3));
                assert_eq!(expected, node_size(3));
                assert_eq!(actual, node_size(3) - 1);
            }
            MmrError::Source(_) => panic!("expected a payload error"),
        }
    }

    #[test]
    fn domain_separation_holds() {
        let a = contribution(1);
        assert_ne!(leaf_hash(&a), node_hash(&a, &a));
        assert_ne!(node_hash(&a, &contribution(2)), node_hash(&contribution(2), &a));
    }

    #[test]
    fn proof_bincode_roundtrip() {
        let mut source = build(11);
        let mmr = Mmr::new(11, key(10));
        let appended = contribution(11);
        let root = mmr.predicted_root(&mut source, &appended).unwrap();
        let proof = mmr.proof(&mut source, 7, &appended).unwrap();

        let encoded = bincode::encode_to_vec(&proof, bincode::config::standard()).unwrap();
        let (decoded, _): (MmrProof, usize) =
            bincode::decode_from_slice(&encoded, bincode::config::standard()).unwrap();
        assert_eq!(proof, decoded);
        assert!(decoded.verify(&root));
    }
}
