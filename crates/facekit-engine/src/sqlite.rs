//! SQLite-backed [`IdentityStore`].
//!
//! Attributes and embeddings are stored as JSON text. The connection sits
//! behind a mutex so the store can be shared across threads.

use crate::store::{Attributes, IdentityStore, StoreError};
use facekit_core::{Embedding, Identity, IdentityId};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    attributes TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS training (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    identity  INTEGER NOT NULL,
    context   TEXT NOT NULL,
    embedding TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS training_identity ON training(identity);
";

pub struct SqliteIdentityStore {
    conn: Mutex<Connection>,
}

impl SqliteIdentityStore {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "opened identity database");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_identity(id: IdentityId, attributes: &str) -> Result<Identity, StoreError> {
        Ok(Identity::new(id, serde_json::from_str(attributes)?))
    }
}

impl IdentityStore for SqliteIdentityStore {
    fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, attributes FROM identities ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|(id, attrs)| Self::row_to_identity(*id, attrs))
            .collect()
    }

    fn add_identity(&self, attributes: &Attributes) -> Result<Identity, StoreError> {
        let json = serde_json::to_string(attributes)?;
        let conn = self.conn.lock();
        conn.execute("INSERT INTO identities (attributes) VALUES (?1)", params![json])?;
        Ok(Identity::new(conn.last_insert_rowid(), attributes.clone()))
    }

    fn update_identity(&self, id: IdentityId, attributes: &Attributes) -> Result<Identity, StoreError> {
        let json = serde_json::to_string(attributes)?;
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE identities SET attributes = ?1 WHERE id = ?2",
            params![json, id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(Identity::new(id, attributes.clone()))
    }

    fn delete_identities(&self, ids: &[IdentityId]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for id in ids {
            tx.execute("DELETE FROM identities WHERE id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(())
    }

    fn find_by_attribute(&self, key: &str, value: &str) -> Result<Option<Identity>, StoreError> {
        // Attribute maps are small JSON blobs; filtering in Rust keeps keys
        // with arbitrary characters out of JSON path syntax.
        Ok(self
            .list_identities()?
            .into_iter()
            .find(|i| i.attribute(key) == Some(value)))
    }

    fn add_training(&self, identity: IdentityId, embeddings: &[Embedding], context: &str) -> Result<(), StoreError> {
        // JSON has no NaN or infinity; they would be written as null.
        if embeddings.iter().any(|e| !e.is_finite()) {
            return Err(StoreError::NonFinite(identity));
        }
        let mut conn = self.conn.lock();
        let exists: Option<i64> = conn
            .query_row("SELECT id FROM identities WHERE id = ?1", params![identity], |row| row.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NotFound(identity));
        }

        let tx = conn.transaction()?;
        for embedding in embeddings {
            tx.execute(
                "INSERT INTO training (identity, context, embedding) VALUES (?1, ?2, ?3)",
                params![identity, context, serde_json::to_string(embedding)?],
            )?;
        }
        tx.commit()?;
        tracing::debug!(identity, count = embeddings.len(), context, "stored training embeddings");
        Ok(())
    }

    /// Rows whose embedding no longer decodes are skipped and logged.
    fn training_data(&self) -> Result<Vec<(IdentityId, Embedding)>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, identity, embedding FROM training ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(row, identity, json)| match serde_json::from_str::<Embedding>(&json) {
                Ok(embedding) => Some((identity, embedding)),
                Err(e) => {
                    tracing::warn!(row, identity, error = %e, "undecodable training row skipped");
                    None
                }
            })
            .collect())
    }

    fn clear_training(&self, ids: &[IdentityId], context: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut removed = 0;
        for id in ids {
            removed += tx.execute("DELETE FROM training WHERE identity = ?1", params![id])?;
        }
        tx.commit()?;
        tracing::debug!(identities = ids.len(), removed, context, "cleared training embeddings");
        Ok(())
    }

    fn clear_all_training(&self, context: &str) -> Result<(), StoreError> {
        let removed = self.conn.lock().execute("DELETE FROM training", [])?;
        tracing::debug!(removed, context, "cleared all training embeddings");
        Ok(())
    }
}
