//! Reference-counted spendable ledger.
//!
//! Each row tracks an opaque object with a total reference count and an
//! unspent count. Deltas are applied in SQL; a row may be deleted only once
//! its reference count reaches zero.

use rusqlite::params;

use crate::db::ChainDb;
use crate::error::{ChainDbError, ChainDbResult};

impl ChainDb {
    /// Insert a spendable object. `refs` must be positive and cover
    /// `unspent`.
    pub fn add_spendable(
        &self,
        key: &[u8],
        body: &[u8],
        refs: u32,
        unspent: u32,
    ) -> ChainDbResult<()> {
        if refs == 0 || unspent > refs {
            return Err(ChainDbError::InvariantViolation(
                "spendable reference counts out of range",
            ));
        }
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO Spendable ([Key], Body, Refs, Unspent) VALUES (?1, ?2, ?3, ?4)",
        )?;
        stmt.execute(params![key, body, refs, unspent])?;
        Ok(())
    }

    /// Apply signed deltas to an object's counts. Exactly one row must
    /// match; a count driven negative raises instead of clamping. With
    /// `maybe_delete`, the row is removed if its reference count reached
    /// zero.
    pub fn modify_spendable(
        &self,
        key: &[u8],
        refs_delta: i32,
        unspent_delta: i32,
        maybe_delete: bool,
    ) -> ChainDbResult<()> {
        {
            let mut stmt = self.conn.prepare_cached(
                "UPDATE Spendable SET Refs=Refs+?1, Unspent=Unspent+?2 WHERE [Key]=?3",
            )?;
            stmt.execute(params![refs_delta, unspent_delta, key])?;
        }
        self.changed_one()?;

        if refs_delta < 0 || unspent_delta < 0 {
            let (refs, unspent): (i64, i64) = {
                let mut stmt = self
                    .conn
                    .prepare_cached("SELECT Refs, Unspent FROM Spendable WHERE [Key]=?1")?;
                stmt.query_row(params![key], |r| Ok((r.get(0)?, r.get(1)?)))?
            };
            if refs < 0 || unspent < 0 {
                return Err(ChainDbError::InvariantViolation(
                    "spendable count went negative",
                ));
            }
        }

        if maybe_delete {
            let mut stmt = self
                .conn
                .prepare_cached("DELETE FROM Spendable WHERE [Key]=?1 AND Refs=0")?;
            stmt.execute(params![key])?;
        }
        Ok(())
    }

    /// Every object with a nonzero unspent count, as `(key, unspent)`.
    pub fn unspent(&self) -> ChainDbResult<Vec<(Vec<u8>, u32)>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT [Key], Unspent FROM Spendable WHERE Unspent!=0")?;
        let rows = stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use crate::db::ChainDb;
    use crate::error::ChainDbError;

    fn temp_db() -> (ChainDb, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = ChainDb::open(dir.path().join("chain.db")).unwrap();
        (db, dir)
    }

    #[test]
    fn add_modify_delete_lifecycle() {
        let (db, _dir) = temp_db();
        db.add_spendable(b"k1", b"obj", 3, 2).unwrap();
        assert_eq!(db.unspent().unwrap(), vec![(b"k1".to_vec(), 2)]);

        db.modify_spendable(b"k1", -1, -1, false).unwrap();
        assert_eq!(db.unspent().unwrap(), vec![(b"k1".to_vec(), 1)]);

        db.modify_spendable(b"k1", -2, -1, true).unwrap();
        assert!(db.unspent().unwrap().is_empty());

        // Row is gone, not merely zeroed.
        let err = db.modify_spendable(b"k1", 1, 0, false).unwrap_err();
        assert!(matches!(err, ChainDbError::InvariantViolation(_)));
    }

    #[test]
    fn delete_waits_for_zero_refs() {
        let (db, _dir) = temp_db();
        db.add_spendable(b"k1", b"obj", 2, 0).unwrap();
        db.modify_spendable(b"k1", -1, 0, true).unwrap();
        // Refs is 1, so the conditional delete left the row alone.
        db.modify_spendable(b"k1", 0, 1, false).unwrap();
        assert_eq!(db.unspent().unwrap(), vec![(b"k1".to_vec(), 1)]);
    }

    #[test]
    fn unspent_skips_fully_spent_rows() {
        let (db, _dir) = temp_db();
        db.add_spendable(b"a", b"x", 2, 0).unwrap();
        db.add_spendable(b"b", b"y", 2, 2).unwrap();
        assert_eq!(db.unspent().unwrap(), vec![(b"b".to_vec(), 2)]);
    }

    #[test]
    fn rejects_bad_initial_counts() {
        let (db, _dir) = temp_db();
        assert!(matches!(
            db.add_spendable(b"a", b"x", 0, 0),
            Err(ChainDbError::InvariantViolation(_))
        ));
        assert!(matches!(
            db.add_spendable(b"a", b"x", 1, 2),
            Err(ChainDbError::InvariantViolation(_))
        ));
    }

    #[test]
    fn negative_count_raises() {
        let (db, _dir) = temp_db();
        db.add_spendable(b"a", b"x", 2, 1).unwrap();
        let err = db.modify_spendable(b"a", 0, -2, false).unwrap_err();
        assert!(matches!(err, ChainDbError::InvariantViolation(_)));
    }
}
