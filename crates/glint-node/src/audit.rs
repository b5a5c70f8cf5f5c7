//! Read-only invariant auditor.
//!
//! Recomputes both child counters and both tip indices from scratch and
//! checks the reachability implications, without touching any row. Run from
//! tests after every mutation batch, or at startup when paranoia is cheap.

use rusqlite::params;

use glint_core::types::state_flags;

use crate::db::ChainDb;
use crate::error::{ChainDbError, ChainDbResult};

impl ChainDb {
    /// Verify that stored counters, flags and tip indices agree with the
    /// graph they summarize. Any divergence is an
    /// [`InvariantViolation`](ChainDbError::InvariantViolation).
    pub fn verify_integrity(&self) -> ChainDbResult<()> {
        let mut tips = 0i64;
        let mut tips_reachable = 0i64;

        // Per-row flags, parent linkage, counter sanity.
        {
            let mut stmt = self.conn.prepare_cached(
                "SELECT s.Height, s.Flags, s.RowPrev, s.CountNext, s.CountNextFunctional, \
                 prv.rowid, prv.Flags \
                 FROM States s LEFT JOIN States prv \
                 ON s.Height=prv.Height+1 AND s.HashPrev=prv.Hash",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(r) = rows.next()? {
                let height: u64 = r.get(0)?;
                let flags: u32 = r.get(1)?;
                let row_prev: Option<u64> = r.get(2)?;
                let count_next: u32 = r.get(3)?;
                let count_next_functional: u32 = r.get(4)?;
                let parent_row: Option<u64> = r.get(5)?;
                let parent_flags: Option<u32> = r.get(6)?;

                if flags & state_flags::REACHABLE != 0 && flags & state_flags::FUNCTIONAL == 0 {
                    return Err(ChainDbError::InvariantViolation(
                        "reachable state is not functional",
                    ));
                }
                if count_next_functional > count_next {
                    return Err(ChainDbError::InvariantViolation(
                        "functional child counter exceeds child counter",
                    ));
                }

                match (row_prev, parent_row) {
                    (Some(linked), Some(derived)) => {
                        if linked != derived {
                            return Err(ChainDbError::InvariantViolation(
                                "parent link does not match the parent row",
                            ));
                        }
                        let parent_flags = parent_flags.unwrap_or(0);
                        let parent_reachable = parent_flags & state_flags::REACHABLE != 0;
                        if flags & state_flags::REACHABLE != 0 && !parent_reachable {
                            return Err(ChainDbError::InvariantViolation(
                                "reachable state under an unreachable parent",
                            ));
                        }
                        if flags & state_flags::REACHABLE == 0
                            && flags & state_flags::FUNCTIONAL != 0
                            && parent_reachable
                        {
                            return Err(ChainDbError::InvariantViolation(
                                "functional state missed reachability",
                            ));
                        }
                    }
                    (None, None) => {
                        if flags & state_flags::REACHABLE != 0 && height != 0 {
                            return Err(ChainDbError::InvariantViolation(
                                "orphan marked reachable",
                            ));
                        }
                    }
                    _ => {
                        return Err(ChainDbError::InvariantViolation(
                            "parent link disagrees with the header keys",
                        ));
                    }
                }

                if count_next == 0 {
                    tips += 1;
                }
                if count_next_functional == 0 && flags & state_flags::REACHABLE != 0 {
                    tips_reachable += 1;
                }
            }
        }

        // Tips index: every entry is a real childless row, and nothing is
        // missing (counted against the sweep above).
        {
            let mut stmt = self.conn.prepare_cached(
                "SELECT t.Height, s.Height, s.CountNext \
                 FROM Tips t LEFT JOIN States s ON t.State=s.rowid",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(r) = rows.next()? {
                let indexed: u64 = r.get(0)?;
                let actual: Option<u64> = r.get(1)?;
                let count_next: Option<u32> = r.get(2)?;
                if actual != Some(indexed) || count_next != Some(0) {
                    return Err(ChainDbError::InvariantViolation(
                        "tip index entry does not match its state row",
                    ));
                }
                tips -= 1;
            }
        }
        if tips != 0 {
            return Err(ChainDbError::InvariantViolation(
                "tip index is missing childless states",
            ));
        }

        // Reachable-tips index, same scheme.
        {
            let mut stmt = self.conn.prepare_cached(
                "SELECT t.Height, s.Height, s.CountNextFunctional, s.Flags \
                 FROM TipsReachable t LEFT JOIN States s ON t.State=s.rowid",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(r) = rows.next()? {
                let indexed: u64 = r.get(0)?;
                let actual: Option<u64> = r.get(1)?;
                let count_next_functional: Option<u32> = r.get(2)?;
                let flags: u32 = r.get::<_, Option<u32>>(3)?.unwrap_or(0);
                if actual != Some(indexed)
                    || count_next_functional != Some(0)
                    || flags & state_flags::REACHABLE == 0
                {
                    return Err(ChainDbError::InvariantViolation(
                        "reachable-tip index entry does not match its state row",
                    ));
                }
                tips_reachable -= 1;
            }
        }
        if tips_reachable != 0 {
            return Err(ChainDbError::InvariantViolation(
                "reachable-tip index is missing reachable tips",
            ));
        }

        // Child counters against the actual child sets.
        {
            let mut stmt = self.conn.prepare_cached(
                "SELECT s.CountNext, COUNT(nxt.rowid) FROM States s \
                 LEFT JOIN States nxt ON s.Height=nxt.Height-1 AND s.Hash=nxt.HashPrev \
                 GROUP BY s.rowid",
            )?;
            let mut rows = stmt.query([])?;
            while let Some(r) = rows.next()? {
                let stored: u32 = r.get(0)?;
                let counted: u32 = r.get(1)?;
                if stored != counted {
                    return Err(ChainDbError::InvariantViolation(
                        "stored child counter diverges from the child set",
                    ));
                }
            }
        }

        {
            let mut stmt = self.conn.prepare_cached(
                "SELECT s.CountNextFunctional, COUNT(nxt.rowid) FROM States s \
                 LEFT JOIN States nxt ON s.Height=nxt.Height-1 AND s.Hash=nxt.HashPrev \
                 AND (nxt.Flags & ?1) \
                 GROUP BY s.rowid",
            )?;
            let mut rows = stmt.query(params![state_flags::FUNCTIONAL])?;
            while let Some(r) = rows.next()? {
                let stored: u32 = r.get(0)?;
                let counted: u32 = r.get(1)?;
                if stored != counted {
                    return Err(ChainDbError::InvariantViolation(
                        "stored functional child counter diverges from the child set",
                    ));
                }
            }
        }

        Ok(())
    }
}
