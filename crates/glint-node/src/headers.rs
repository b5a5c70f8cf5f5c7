//! The header graph: insertion, deletion, flag transitions, child-count
//! maintenance, tip indices, reachability propagation, and the active-chain
//! cursor.
//!
//! Two counters cached on every row drive the tip indices: a row is in
//! `Tips` iff `CountNext == 0`, and in `TipsReachable` iff it is reachable
//! with `CountNextFunctional == 0`. Every mutation below keeps both indices
//! exactly consistent with the counters.

use rusqlite::{params, types::Null, OptionalExtension};

use glint_core::types::{state_flags, Hash256, PeerId, StateHeader, StateId};

use crate::db::{param, ChainDb};
use crate::error::{ChainDbError, ChainDbResult};

/// Block payload attached to a header row.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StateBlock {
    /// Serialized block body; empty when none is stored.
    pub body: Vec<u8>,
    /// Serialized rollback data; empty when none is stored.
    pub rollback: Vec<u8>,
    /// Peer the body was downloaded from, when a body is stored.
    pub peer: Option<PeerId>,
}

impl ChainDb {
    /// Insert a header. The parent link, both child counters and both tip
    /// indices are brought up to date; headers may arrive in any order, so
    /// children already present are adopted.
    ///
    /// Returns the new row id. Flags start clear.
    pub fn insert_state(&self, s: &StateHeader) -> ChainDbResult<u64> {
        let hash = s.hash();

        let parent: Option<(u64, u32)> = if s.height == 0 {
            None
        } else {
            let mut stmt = self.conn.prepare_cached(
                "SELECT rowid, CountNext FROM States WHERE Height=?1 AND Hash=?2",
            )?;
            stmt.query_row(params![s.height - 1, s.prev.as_bytes().as_slice()], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?
        };

        let count_next_functional: u32 = {
            let mut stmt = self.conn.prepare_cached(
                "SELECT COUNT(*) FROM States WHERE Height=?1 AND HashPrev=?2 AND (Flags & ?3)",
            )?;
            stmt.query_row(
                params![s.height + 1, hash.as_bytes().as_slice(), state_flags::FUNCTIONAL],
                |row| row.get(0),
            )?
        };

        {
            let mut stmt = self.conn.prepare_cached(
                "INSERT INTO States (Height, Hash, HashPrev, Difficulty, Timestamp, \
                 LiveObjects, History, Flags, CountNext, CountNextFunctional, RowPrev) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 0, ?8, ?9)",
            )?;
            stmt.execute(params![
                s.height,
                hash.as_bytes().as_slice(),
                s.prev.as_bytes().as_slice(),
                s.difficulty,
                s.timestamp,
                s.live_objects.as_bytes().as_slice(),
                s.history.as_bytes().as_slice(),
                count_next_functional,
                parent.map(|(row, _)| row),
            ])?;
        }
        self.changed_one()?;
        let row = self.conn.last_insert_rowid() as u64;

        if let Some((row_prev, prev_count)) = parent {
            self.set_count_next(row_prev, prev_count + 1)?;
            if prev_count == 0 {
                self.tip_del(row_prev, s.height - 1)?;
            }
        }

        // Adopt children that arrived first.
        let adopted = {
            let mut stmt = self.conn.prepare_cached(
                "UPDATE States SET RowPrev=?1 WHERE Height=?2 AND HashPrev=?3",
            )?;
            stmt.execute(params![row, s.height + 1, hash.as_bytes().as_slice()])? as u32
        };
        if adopted > 0 {
            self.set_count_next(row, adopted)?;
        } else {
            self.tip_add(row, s.height)?;
        }

        Ok(row)
    }

    /// Delete a childless, non-active header, unwinding its parent's
    /// counters and both tip indices.
    ///
    /// Returns the parent row, if the header had one.
    pub fn delete_state(&self, row: u64) -> ChainDbResult<Option<u64>> {
        let fetched: Option<(u64, Option<u64>, u32, Option<u32>, u32, Option<u32>)> = {
            let mut stmt = self.conn.prepare_cached(
                "SELECT s.Height, s.RowPrev, s.CountNext, prv.CountNext, s.Flags, \
                 prv.CountNextFunctional \
                 FROM States s LEFT JOIN States prv ON s.RowPrev=prv.rowid WHERE s.rowid=?1",
            )?;
            stmt.query_row(params![row], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?))
            })
            .optional()?
        };
        let (height, row_prev, count_next, prev_count, flags, prev_count_functional) =
            fetched.ok_or(ChainDbError::NotFound)?;

        if count_next > 0 {
            return Err(ChainDbError::DeleteHasChildren);
        }
        if flags & state_flags::ACTIVE != 0 {
            return Err(ChainDbError::InvariantViolation(
                "attempt to delete an active state",
            ));
        }

        if let Some(parent) = row_prev {
            let count = prev_count.unwrap_or(0);
            if count == 0 {
                return Err(ChainDbError::InvariantViolation("child counter underflow"));
            }
            self.set_count_next(parent, count - 1)?;
            if count == 1 {
                self.tip_add(parent, height - 1)?;
            }

            if flags & state_flags::FUNCTIONAL != 0 {
                let functional = prev_count_functional.unwrap_or(0);
                if functional == 0 {
                    return Err(ChainDbError::InvariantViolation(
                        "functional child counter underflow",
                    ));
                }
                self.set_count_next_functional(parent, functional - 1)?;
                if functional == 1 && flags & state_flags::REACHABLE != 0 {
                    self.tip_reachable_add(parent, height - 1)?;
                }
            }
        }

        self.tip_del(row, height)?;
        if flags & state_flags::REACHABLE != 0 {
            self.tip_reachable_del(row, height)?;
        }

        {
            let mut stmt = self
                .conn
                .prepare_cached("DELETE FROM States WHERE rowid=?1")?;
            stmt.execute(params![row])?;
        }
        self.changed_one()?;

        Ok(row_prev)
    }

    /// Look up a header row by its natural key.
    pub fn find_state(&self, height: u64, hash: &Hash256) -> ChainDbResult<Option<u64>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT rowid FROM States WHERE Height=?1 AND Hash=?2")?;
        Ok(stmt
            .query_row(params![height, hash.as_bytes().as_slice()], |row| row.get(0))
            .optional()?)
    }

    /// Read a header back from its row.
    pub fn get_state(&self, row: u64) -> ChainDbResult<StateHeader> {
        let fetched: Option<(u64, Vec<u8>, u64, u64, Vec<u8>, Vec<u8>)> = {
            let mut stmt = self.conn.prepare_cached(
                "SELECT Height, HashPrev, Difficulty, Timestamp, LiveObjects, History \
                 FROM States WHERE rowid=?1",
            )?;
            stmt.query_row(params![row], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?))
            })
            .optional()?
        };
        let (height, prev, difficulty, timestamp, live_objects, history) =
            fetched.ok_or(ChainDbError::NotFound)?;
        Ok(StateHeader {
            height,
            prev: Self::hash_from_blob(prev)?,
            difficulty,
            timestamp,
            live_objects: Self::hash_from_blob(live_objects)?,
            history: Self::hash_from_blob(history)?,
        })
    }

    /// Read a row's raw flag bitset.
    pub fn get_state_flags(&self, row: u64) -> ChainDbResult<u32> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT Flags FROM States WHERE rowid=?1")?;
        stmt.query_row(params![row], |r| r.get(0))
            .optional()?
            .ok_or(ChainDbError::NotFound)
    }

    /// Parent row of `row`, if the parent header is present.
    pub fn get_prev_row(&self, row: u64) -> ChainDbResult<Option<u64>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT RowPrev FROM States WHERE rowid=?1")?;
        let fetched: Option<Option<u64>> =
            stmt.query_row(params![row], |r| r.get(0)).optional()?;
        fetched.ok_or(ChainDbError::NotFound)
    }

    /// Predecessor of a chain position, one height down.
    pub fn get_prev(&self, sid: &StateId) -> ChainDbResult<Option<StateId>> {
        Ok(self
            .get_prev_row(sid.row)?
            .map(|row| StateId { height: sid.height - 1, row }))
    }

    /// Mark a header functional: its body is validated and available.
    ///
    /// Increments the parent's functional-child counter, derives the
    /// reachable bit from the parent (or from being genesis), and when the
    /// header becomes reachable, floods the bit through every functional
    /// descendant. No-op when already functional.
    pub fn set_functional(&self, row: u64) -> ChainDbResult<()> {
        let fetched: Option<(u64, Option<u64>, u32, Option<u32>, Option<u32>)> = {
            let mut stmt = self.conn.prepare_cached(
                "SELECT s.Height, s.RowPrev, s.Flags, prv.Flags, prv.CountNextFunctional \
                 FROM States s LEFT JOIN States prv ON s.RowPrev=prv.rowid WHERE s.rowid=?1",
            )?;
            stmt.query_row(params![row], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
            })
            .optional()?
        };
        let (height, row_prev, flags, prev_flags, prev_count_functional) =
            fetched.ok_or(ChainDbError::NotFound)?;

        if flags & state_flags::FUNCTIONAL != 0 {
            return Ok(());
        }
        let mut flags = flags | state_flags::FUNCTIONAL;

        let mut walk_prev = 0u64;
        if height > 0 {
            if let Some(parent) = row_prev {
                let parent_flags = prev_flags.unwrap_or(0);
                let functional = prev_count_functional.unwrap_or(0);

                self.set_count_next_functional(parent, functional + 1)?;

                if parent_flags & state_flags::REACHABLE != 0 {
                    flags |= state_flags::REACHABLE;
                    if functional == 0 {
                        self.tip_reachable_del(parent, height - 1)?;
                    }
                }
                walk_prev = parent;
            }
        } else {
            flags |= state_flags::REACHABLE;
        }

        self.set_flags(row, flags)?;

        if flags & state_flags::REACHABLE != 0 {
            self.propagate_reachable(row, walk_prev, height, true)?;
        }
        Ok(())
    }

    /// Revert a header to non-functional, clearing reachability from it and
    /// from every functional descendant. No-op when already clear.
    pub fn clear_functional(&self, row: u64) -> ChainDbResult<()> {
        let fetched: Option<(u64, Option<u64>, u32, Option<u32>)> = {
            let mut stmt = self.conn.prepare_cached(
                "SELECT s.Height, s.RowPrev, s.Flags, prv.CountNextFunctional \
                 FROM States s LEFT JOIN States prv ON s.RowPrev=prv.rowid WHERE s.rowid=?1",
            )?;
            stmt.query_row(params![row], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
            })
            .optional()?
        };
        let (height, row_prev, flags, prev_count_functional) =
            fetched.ok_or(ChainDbError::NotFound)?;

        if flags & state_flags::FUNCTIONAL == 0 {
            return Ok(());
        }
        let mut flags = flags & !state_flags::FUNCTIONAL;

        let reachable = flags & state_flags::REACHABLE != 0;
        if reachable {
            flags &= !state_flags::REACHABLE;
        }

        let mut walk_prev = 0u64;
        if height > 0 {
            if let Some(parent) = row_prev {
                let functional = prev_count_functional.unwrap_or(0);
                if functional == 0 {
                    return Err(ChainDbError::InvariantViolation(
                        "functional child counter underflow",
                    ));
                }
                self.set_count_next_functional(parent, functional - 1)?;
                if functional == 1 && reachable {
                    self.tip_reachable_add(parent, height - 1)?;
                }
                walk_prev = parent;
            }
        }

        self.set_flags(row, flags)?;

        if reachable {
            self.propagate_reachable(row, walk_prev, height, false)?;
        }
        Ok(())
    }

    /// Flood a reachability flip through every functional descendant.
    ///
    /// A fork doubles the frontier, so siblings go on an explicit work
    /// stack instead of the call stack. The first child of each parent is
    /// followed in the straight-line loop.
    fn propagate_reachable(
        &self,
        row: u64,
        row_prev: u64,
        height: u64,
        set: bool,
    ) -> ChainDbResult<()> {
        let mut stack = vec![(row, row_prev, height)];
        while let Some((mut row, mut row_prev, mut height)) = stack.pop() {
            loop {
                if set {
                    self.build_mmr_node(row, row_prev, height)?;
                }
                row_prev = row;

                let children: Vec<(u64, u32)> = {
                    let mut stmt = self.conn.prepare_cached(
                        "SELECT rowid, Flags FROM States \
                         WHERE Height=?1 AND RowPrev=?2 AND (Flags & ?3)",
                    )?;
                    let rows = stmt.query_map(
                        params![height + 1, row, state_flags::FUNCTIONAL],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )?;
                    rows.collect::<Result<_, _>>()?
                };

                if children.is_empty() {
                    if set {
                        self.tip_reachable_add(row, height)?;
                    } else {
                        self.tip_reachable_del(row, height)?;
                    }
                    break;
                }

                for &(child, child_flags) in &children {
                    self.set_flags(child, child_flags ^ state_flags::REACHABLE)?;
                }

                height += 1;
                for &(child, _) in children.iter().skip(1) {
                    stack.push((child, row_prev, height));
                }
                row = children[0].0;
            }
        }
        Ok(())
    }

    /// Attach a block body and its origin peer to a header row.
    ///
    /// An empty `body` clears the stored body and peer; `rollback` is
    /// untouched either way.
    pub fn set_state_block(&self, row: u64, body: &[u8], peer: &PeerId) -> ChainDbResult<()> {
        let mut stmt = self
            .conn
            .prepare_cached("UPDATE States SET Body=?1, Peer=?2 WHERE rowid=?3")?;
        if body.is_empty() {
            stmt.execute(params![Null, Null, row])?;
        } else {
            stmt.execute(params![body, peer.as_bytes().as_slice(), row])?;
        }
        self.changed_one()
    }

    /// Read the block payload of a header row. Fields are empty where
    /// nothing is stored.
    pub fn get_state_block(&self, row: u64) -> ChainDbResult<StateBlock> {
        let fetched: Option<(Option<Vec<u8>>, Option<Vec<u8>>, Option<Vec<u8>>)> = {
            let mut stmt = self
                .conn
                .prepare_cached("SELECT Body, Rollback, Peer FROM States WHERE rowid=?1")?;
            stmt.query_row(params![row], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
                .optional()?
        };
        let (body, rollback, peer) = fetched.ok_or(ChainDbError::NotFound)?;
        let peer = match peer {
            Some(raw) => Some(PeerId(Self::hash_from_blob(raw)?.0)),
            None => None,
        };
        Ok(StateBlock {
            body: body.unwrap_or_default(),
            rollback: rollback.unwrap_or_default(),
            peer,
        })
    }

    /// Attach rollback data to a header row.
    pub fn set_state_rollback(&self, row: u64, rollback: &[u8]) -> ChainDbResult<()> {
        let mut stmt = self
            .conn
            .prepare_cached("UPDATE States SET Rollback=?1 WHERE rowid=?2")?;
        stmt.execute(params![rollback, row])?;
        self.changed_one()
    }

    /// Drop the block body and peer of a header row.
    pub fn del_state_block(&self, row: u64) -> ChainDbResult<()> {
        self.set_state_block(row, &[], &PeerId::ZERO)
    }

    /// All tips (headers without children), lowest first.
    pub fn tips(&self) -> ChainDbResult<Vec<StateId>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT Height, State FROM Tips ORDER BY Height ASC, State ASC")?;
        let rows = stmt.query_map([], |r| Ok(StateId { height: r.get(0)?, row: r.get(1)? }))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// All reachable tips (reachable headers without functional children),
    /// best first.
    pub fn reachable_tips(&self) -> ChainDbResult<Vec<StateId>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT Height, State FROM TipsReachable ORDER BY Height DESC, State DESC",
        )?;
        let rows = stmt.query_map([], |r| Ok(StateId { height: r.get(0)?, row: r.get(1)? }))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// The active chain head, if any chain is active.
    pub fn cursor(&self) -> ChainDbResult<Option<StateId>> {
        let row = self.param_int_or(param::CURSOR_ROW, 0)?;
        let height = self.param_int_or(param::CURSOR_HEIGHT, 0)?;
        Ok((row > 0).then_some(StateId { height, row }))
    }

    /// Persist the active chain head.
    pub fn put_cursor(&self, sid: &StateId) -> ChainDbResult<()> {
        self.set_param_int(param::CURSOR_ROW, sid.row)?;
        self.set_param_int(param::CURSOR_HEIGHT, sid.height)
    }

    /// Advance the active chain onto `sid`: set its active bit and move the
    /// cursor there. Callers advance one height at a time.
    pub fn move_fwd(&self, sid: &StateId) -> ChainDbResult<()> {
        {
            let mut stmt = self
                .conn
                .prepare_cached("UPDATE States SET Flags=Flags|?1 WHERE rowid=?2")?;
            stmt.execute(params![state_flags::ACTIVE, sid.row])?;
        }
        self.changed_one()?;
        self.put_cursor(sid)
    }

    /// Retreat the active chain off `sid`: clear its active bit and move
    /// the cursor to its predecessor (zeroed at genesis).
    ///
    /// Returns the new cursor, `None` once no chain is active.
    pub fn move_back(&self, sid: &StateId) -> ChainDbResult<Option<StateId>> {
        {
            let mut stmt = self
                .conn
                .prepare_cached("UPDATE States SET Flags=Flags&?1 WHERE rowid=?2")?;
            stmt.execute(params![!state_flags::ACTIVE, sid.row])?;
        }
        self.changed_one()?;

        let prev = self.get_prev(sid)?;
        self.put_cursor(&prev.unwrap_or_default())?;
        Ok(prev)
    }

    pub(crate) fn set_flags(&self, row: u64, flags: u32) -> ChainDbResult<()> {
        let mut stmt = self
            .conn
            .prepare_cached("UPDATE States SET Flags=?1 WHERE rowid=?2")?;
        stmt.execute(params![flags, row])?;
        self.changed_one()
    }

    fn set_count_next(&self, row: u64, count: u32) -> ChainDbResult<()> {
        let mut stmt = self
            .conn
            .prepare_cached("UPDATE States SET CountNext=?1 WHERE rowid=?2")?;
        stmt.execute(params![count, row])?;
        self.changed_one()
    }

    fn set_count_next_functional(&self, row: u64, count: u32) -> ChainDbResult<()> {
        let mut stmt = self
            .conn
            .prepare_cached("UPDATE States SET CountNextFunctional=?1 WHERE rowid=?2")?;
        stmt.execute(params![count, row])?;
        self.changed_one()
    }

    fn tip_add(&self, row: u64, height: u64) -> ChainDbResult<()> {
        let mut stmt = self
            .conn
            .prepare_cached("INSERT INTO Tips VALUES (?1, ?2)")?;
        stmt.execute(params![height, row])?;
        Ok(())
    }

    fn tip_del(&self, row: u64, height: u64) -> ChainDbResult<()> {
        let mut stmt = self
            .conn
            .prepare_cached("DELETE FROM Tips WHERE Height=?1 AND State=?2")?;
        stmt.execute(params![height, row])?;
        self.changed_one()
    }

    fn tip_reachable_add(&self, row: u64, height: u64) -> ChainDbResult<()> {
        let mut stmt = self
            .conn
            .prepare_cached("INSERT INTO TipsReachable VALUES (?1, ?2)")?;
        stmt.execute(params![height, row])?;
        Ok(())
    }

    fn tip_reachable_del(&self, row: u64, height: u64) -> ChainDbResult<()> {
        let mut stmt = self
            .conn
            .prepare_cached("DELETE FROM TipsReachable WHERE Height=?1 AND State=?2")?;
        stmt.execute(params![height, row])?;
        self.changed_one()
    }
}
