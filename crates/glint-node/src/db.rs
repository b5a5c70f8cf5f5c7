//! SQLite connection ownership: schema, version gate, transactions, and
//! the integer parameter store.
//!
//! The connection is opened in no-mutex mode; callers serialize access.
//! Hot statements stay resident in the connection's prepared-statement
//! cache, keyed by their SQL text.

use std::path::Path;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::debug;

use glint_core::types::Hash256;

use crate::error::{ChainDbError, ChainDbResult};

/// Schema version written at creation and verified on every open.
pub const DB_VER: u64 = 8;

/// Statements kept resident across the connection's lifetime.
const STATEMENT_CACHE_CAPACITY: usize = 64;

/// Recognized parameter ids (`Params.ID`). Other ids are reserved.
pub mod param {
    /// Schema version the file was created with.
    pub const DB_VER: u32 = 1;
    /// Store row of the active chain head. 0 when no chain is active.
    pub const CURSOR_ROW: u32 = 2;
    /// Height of the active chain head.
    pub const CURSOR_HEIGHT: u32 = 3;
}

const SCHEMA: &str = r#"
CREATE TABLE [Params] (
    [ID] INTEGER NOT NULL PRIMARY KEY,
    [ParamInt] INTEGER,
    [ParamBlob] BLOB
);

CREATE TABLE [States] (
    [Height] INTEGER NOT NULL,
    [Hash] BLOB NOT NULL,
    [HashPrev] BLOB NOT NULL,
    [Difficulty] INTEGER NOT NULL,
    [Timestamp] INTEGER NOT NULL,
    [LiveObjects] BLOB NOT NULL,
    [History] BLOB NOT NULL,
    [Flags] INTEGER NOT NULL,
    [RowPrev] INTEGER,
    [CountNext] INTEGER NOT NULL,
    [CountNextFunctional] INTEGER NOT NULL,
    [PoW] BLOB,
    [Mmr] BLOB,
    [Body] BLOB,
    [Rollback] BLOB,
    [Peer] BLOB,
    PRIMARY KEY (Height, Hash),
    FOREIGN KEY (RowPrev) REFERENCES States(OID)
);

CREATE TABLE [Tips] (
    [Height] INTEGER NOT NULL,
    [State] INTEGER NOT NULL,
    PRIMARY KEY (Height, State),
    FOREIGN KEY (State) REFERENCES States(OID)
);

CREATE TABLE [TipsReachable] (
    [Height] INTEGER NOT NULL,
    [State] INTEGER NOT NULL,
    PRIMARY KEY (Height, State),
    FOREIGN KEY (State) REFERENCES States(OID)
);

CREATE TABLE [Spendable] (
    [Key] BLOB NOT NULL,
    [Body] BLOB NOT NULL,
    [Refs] INTEGER NOT NULL,
    [Unspent] INTEGER NOT NULL,
    PRIMARY KEY ([Key])
);
"#;

/// The chain store. Owns the SQLite connection and every cached statement.
#[derive(Debug)]
pub struct ChainDb {
    pub(crate) conn: Connection,
}

impl ChainDb {
    /// Open or create the database file at `path`.
    ///
    /// A fresh file gets the schema and the version parameter; an existing
    /// file must carry the version this build expects.
    pub fn open(path: impl AsRef<Path>) -> ChainDbResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);

        let db = Self { conn };
        let existing: Option<String> = db
            .conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type='table' AND name='Params'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        if existing.is_none() {
            debug!(path = %path.display(), version = DB_VER, "creating chain database");
            let txn = db.transaction()?;
            db.conn.execute_batch(SCHEMA)?;
            db.set_param_int(param::DB_VER, DB_VER)?;
            txn.commit()?;
        } else {
            let found = db.param_int_or(param::DB_VER, 0)?;
            if found != DB_VER {
                return Err(ChainDbError::SchemaMismatch { expected: DB_VER, found });
            }
            debug!(path = %path.display(), "opened chain database");
        }

        Ok(db)
    }

    /// Finalize every cached statement and close the connection.
    ///
    /// Dropping the store closes it too; this surfaces the error instead.
    pub fn close(self) -> ChainDbResult<()> {
        self.conn.close().map_err(|(_, err)| ChainDbError::Store(err))
    }

    /// Begin a transaction. Mutations between here and [`Txn::commit`] are
    /// atomic; dropping the handle rolls them back.
    pub fn transaction(&self) -> ChainDbResult<Txn<'_>> {
        self.conn.execute_batch("BEGIN")?;
        Ok(Txn { db: self, open: true })
    }

    /// Set an integer parameter, inserting the row on first write.
    pub fn set_param_int(&self, id: u32, value: u64) -> ChainDbResult<()> {
        let changed = {
            let mut stmt = self
                .conn
                .prepare_cached("UPDATE Params SET ParamInt=?1 WHERE ID=?2")?;
            stmt.execute(params![value, id])?
        };
        if changed == 0 {
            let mut stmt = self
                .conn
                .prepare_cached("INSERT INTO Params (ID, ParamInt) VALUES (?1, ?2)")?;
            stmt.execute(params![id, value])?;
            self.changed_one()?;
        }
        Ok(())
    }

    /// Read an integer parameter. `None` when the row is absent or NULL.
    pub fn param_int(&self, id: u32) -> ChainDbResult<Option<u64>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT ParamInt FROM Params WHERE ID=?1")?;
        let value: Option<Option<u64>> =
            stmt.query_row(params![id], |row| row.get(0)).optional()?;
        Ok(value.flatten())
    }

    /// Read an integer parameter, falling back to `default`.
    pub fn param_int_or(&self, id: u32, default: u64) -> ChainDbResult<u64> {
        Ok(self.param_int(id)?.unwrap_or(default))
    }

    /// Guard for statements that must touch exactly one row.
    pub(crate) fn changed_one(&self) -> ChainDbResult<()> {
        if self.conn.changes() != 1 {
            return Err(ChainDbError::InvariantViolation(
                "expected exactly one row changed",
            ));
        }
        Ok(())
    }

    /// Convert a stored 32-byte blob, rejecting any other width.
    pub(crate) fn hash_from_blob(raw: Vec<u8>) -> ChainDbResult<Hash256> {
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| ChainDbError::BlobSize { expected: 32, actual: raw.len() })?;
        Ok(Hash256(bytes))
    }
}

/// Scoped transaction over a [`ChainDb`].
///
/// Exactly one of [`commit`](Txn::commit) or drop ends the transaction.
/// Rollback on drop is best effort: if it fails, the store is left in an
/// undefined state and further use carries no guarantees.
#[must_use = "dropping a transaction rolls it back"]
pub struct Txn<'a> {
    db: &'a ChainDb,
    open: bool,
}

impl Txn<'_> {
    /// Make every mutation since [`ChainDb::transaction`] durable.
    pub fn commit(mut self) -> ChainDbResult<()> {
        self.db.conn.execute_batch("COMMIT")?;
        self.open = false;
        Ok(())
    }
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        if self.open {
            let _ = self.db.conn.execute_batch("ROLLBACK");
        }
    }
}
