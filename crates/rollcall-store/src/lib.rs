//! rollcall-store — SQLite-backed student registry.
//!
//! One [`SqliteRegistry`] wraps one connection. Open one per worker thread;
//! SQLite's write lock (taken up front by an immediate transaction) plus the
//! `UNIQUE` constraint on `code` serialise concurrent upserts.

use rollcall_core::registry::{
    RecordSummary, Registry, RegistryError, RegistryRecord, Upsert, UpsertResult, VectorRow,
};
use rollcall_core::Attributes;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    code           TEXT NOT NULL UNIQUE,
    display_name   TEXT,
    course         TEXT,
    branch         TEXT,
    enrolled_image BLOB,
    feature_vector BLOB,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL,
    CHECK ((enrolled_image IS NULL) = (feature_vector IS NULL))
);
";

const RECORD_COLUMNS: &str = "id, code, display_name, course, branch, enrolled_image, \
                              feature_vector, created_at, updated_at";

fn db(err: rusqlite::Error) -> RegistryError {
    RegistryError::backend(err)
}

pub struct SqliteRegistry {
    conn: Connection,
}

impl SqliteRegistry {
    /// Open (creating if needed) the registry database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(RegistryError::backend)?;
        }
        let conn = Connection::open(path).map_err(db)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(db)?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(db)?;
        let registry = Self::init(conn)?;
        tracing::info!(path = %path.display(), journal_mode = %mode, "registry opened");
        Ok(registry)
    }

    /// Private in-memory database, gone when dropped.
    pub fn open_in_memory() -> Result<Self, RegistryError> {
        Self::init(Connection::open_in_memory().map_err(db)?)
    }

    fn init(conn: Connection) -> Result<Self, RegistryError> {
        conn.execute_batch(SCHEMA).map_err(db)?;
        Ok(Self { conn })
    }

    /// Number of stored identities.
    pub fn count(&self) -> Result<usize, RegistryError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM identities", [], |row| row.get(0))
            .map_err(db)?;
        Ok(n as usize)
    }
}

fn attributes_from_row(row: &Row<'_>, first: usize) -> rusqlite::Result<Attributes> {
    Ok(Attributes {
        display_name: row.get(first)?,
        course: row.get(first + 1)?,
        branch: row.get(first + 2)?,
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<RegistryRecord> {
    Ok(RegistryRecord {
        record_id: row.get(0)?,
        code: row.get(1)?,
        attributes: attributes_from_row(row, 2)?,
        enrolled_image: row.get(5)?,
        feature_vector: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

impl Registry for SqliteRegistry {
    fn upsert(&mut self, command: Upsert) -> Result<UpsertResult, RegistryError> {
        let now = chrono::Utc::now().to_rfc3339();
        let Upsert { code, attributes, enrollment } = command;
        let (image, vector) = match enrollment {
            Some(data) => (Some(data.image), Some(data.vector)),
            None => (None, None),
        };

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db)?;

        let existing: Option<i64> = tx
            .query_row("SELECT id FROM identities WHERE code = ?1", params![code], |row| {
                row.get(0)
            })
            .optional()
            .map_err(db)?;

        let result = match existing {
            Some(id) => {
                // Image and vector are either both supplied or both kept.
                tx.execute(
                    "UPDATE identities SET
                        display_name   = COALESCE(?2, display_name),
                        course         = COALESCE(?3, course),
                        branch         = COALESCE(?4, branch),
                        enrolled_image = COALESCE(?5, enrolled_image),
                        feature_vector = COALESCE(?6, feature_vector),
                        updated_at     = ?7
                     WHERE id = ?1",
                    params![
                        id,
                        attributes.display_name,
                        attributes.course,
                        attributes.branch,
                        image,
                        vector,
                        now
                    ],
                )
                .map_err(db)?;
                UpsertResult { record_id: id, created: false }
            }
            None => {
                tx.execute(
                    "INSERT INTO identities
                        (code, display_name, course, branch, enrolled_image, feature_vector,
                         created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                    params![
                        code,
                        attributes.display_name,
                        attributes.course,
                        attributes.branch,
                        image,
                        vector,
                        now
                    ],
                )
                .map_err(db)?;
                UpsertResult { record_id: tx.last_insert_rowid(), created: true }
            }
        };

        tx.commit().map_err(db)?;
        tracing::debug!(code = %code, record_id = result.record_id, created = result.created, "upsert committed");
        Ok(result)
    }

    fn list_with_vectors(&self) -> Result<Vec<VectorRow>, RegistryError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT code, display_name, course, branch, feature_vector FROM identities
                 WHERE feature_vector IS NOT NULL ORDER BY id",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(VectorRow {
                    code: row.get(0)?,
                    attributes: attributes_from_row(row, 1)?,
                    vector: row.get(4)?,
                })
            })
            .map_err(db)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db)
    }

    fn get_by_code(&self, code: &str) -> Result<Option<RegistryRecord>, RegistryError> {
        self.conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM identities WHERE code = ?1"),
                params![code],
                record_from_row,
            )
            .optional()
            .map_err(db)
    }

    fn delete(&mut self, code: &str) -> Result<usize, RegistryError> {
        let removed = self
            .conn
            .execute("DELETE FROM identities WHERE code = ?1", params![code])
            .map_err(db)?;
        if removed > 0 {
            tracing::info!(code = %code, "identity removed");
        }
        Ok(removed)
    }

    fn list(&self) -> Result<Vec<RecordSummary>, RegistryError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, code, display_name, course, branch,
                        enrolled_image IS NOT NULL, feature_vector IS NOT NULL,
                        created_at, updated_at
                 FROM identities ORDER BY id",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RecordSummary {
                    record_id: row.get(0)?,
                    code: row.get(1)?,
                    attributes: attributes_from_row(row, 2)?,
                    has_image: row.get(5)?,
                    has_vector: row.get(6)?,
                    created_at: row.get(7)?,
                    updated_at: row.get(8)?,
                })
            })
            .map_err(db)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db)
    }
}
