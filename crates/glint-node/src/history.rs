//! History MMR materialization and inclusion proofs.
//!
//! Each reachable header row carries the payload of one MMR leaf in its
//! `Mmr` column; the leaf's contribution is the row's parent hash. Payloads
//! are written exactly once, when the row becomes reachable, and read back
//! on demand while building proofs.

use rusqlite::{params, OptionalExtension};

use glint_core::mmr::{Mmr, MmrProof, NodeKey, NodeSource};
use glint_core::types::{Hash256, StateId};

use crate::db::ChainDb;
use crate::error::{ChainDbError, ChainDbResult};

/// Reads leaf payloads out of header rows, memoizing the last row fetched:
/// proof walks revisit the same row repeatedly.
struct RowNodeSource<'a> {
    db: &'a ChainDb,
    cached: Option<(NodeKey, Vec<u8>, Hash256)>,
}

impl<'a> RowNodeSource<'a> {
    fn new(db: &'a ChainDb) -> Self {
        Self { db, cached: None }
    }

    fn load(&mut self, key: NodeKey) -> ChainDbResult<()> {
        if self.cached.as_ref().map_or(true, |c| c.0 != key) {
            let fetched: Option<(Option<Vec<u8>>, Vec<u8>)> = {
                let mut stmt = self
                    .db
                    .conn
                    .prepare_cached("SELECT Mmr, HashPrev FROM States WHERE rowid=?1")?;
                stmt.query_row(params![key], |r| Ok((r.get(0)?, r.get(1)?)))
                    .optional()?
            };
            let (payload, hash_prev) = fetched.ok_or(ChainDbError::NotFound)?;
            self.cached = Some((
                key,
                payload.unwrap_or_default(),
                ChainDb::hash_from_blob(hash_prev)?,
            ));
        }
        Ok(())
    }
}

impl NodeSource for RowNodeSource<'_> {
    type Error = ChainDbError;

    fn node_data(&mut self, key: NodeKey) -> Result<Vec<u8>, ChainDbError> {
        self.load(key)?;
        match &self.cached {
            Some(cached) => Ok(cached.1.clone()),
            None => Err(ChainDbError::NotFound),
        }
    }

    fn node_hash(&mut self, key: NodeKey) -> Result<Hash256, ChainDbError> {
        self.load(key)?;
        match &self.cached {
            Some(cached) => Ok(cached.2),
            None => Err(ChainDbError::NotFound),
        }
    }
}

impl ChainDb {
    /// Materialize the MMR leaf of a row that just became reachable.
    ///
    /// `height` is the leaf index; `row_prev` holds the previous leaf (0 at
    /// genesis). A row whose payload is already present is left untouched,
    /// so re-reaching a header after a regression is free.
    pub(crate) fn build_mmr_node(
        &self,
        row: u64,
        row_prev: u64,
        height: u64,
    ) -> ChainDbResult<()> {
        let fetched: Option<(Option<Vec<u8>>, Vec<u8>)> = {
            let mut stmt = self
                .conn
                .prepare_cached("SELECT Mmr, HashPrev FROM States WHERE rowid=?1")?;
            stmt.query_row(params![row], |r| Ok((r.get(0)?, r.get(1)?)))
                .optional()?
        };
        let (existing, hash_prev) = fetched.ok_or(ChainDbError::NotFound)?;
        if existing.is_some() {
            return Ok(());
        }
        let leaf = Self::hash_from_blob(hash_prev)?;

        let mut source = RowNodeSource::new(self);
        let payload = Mmr::new(height, row_prev).append(&mut source, &leaf)?;

        {
            let mut stmt = self
                .conn
                .prepare_cached("UPDATE States SET Mmr=?1 WHERE rowid=?2")?;
            stmt.execute(params![payload, row])?;
        }
        self.changed_one()
    }

    /// Inclusion proof that the history leaf at `h_prev` belongs to the
    /// range a successor of `sid` commits to. Verifies against
    /// [`get_predicted_states_hash`](Self::get_predicted_states_hash) for
    /// the same `sid`. Requires `h_prev <= sid.height` and a reachable
    /// `sid`.
    pub fn get_proof(&self, sid: &StateId, h_prev: u64) -> ChainDbResult<MmrProof> {
        if h_prev > sid.height {
            return Err(ChainDbError::InvariantViolation(
                "proof height beyond the proven range",
            ));
        }
        let appended = self.get_state(sid.row)?.hash();
        let mut source = RowNodeSource::new(self);
        Ok(Mmr::new(sid.height + 1, sid.row).proof(&mut source, h_prev, &appended)?)
    }

    /// The history root a successor of `sid` would commit to: the full
    /// header at `sid` folded into the range without materializing it.
    pub fn get_predicted_states_hash(&self, sid: &StateId) -> ChainDbResult<Hash256> {
        let appended = self.get_state(sid.row)?.hash();
        let mut source = RowNodeSource::new(self);
        Ok(Mmr::new(sid.height + 1, sid.row).predicted_root(&mut source, &appended)?)
    }
}
