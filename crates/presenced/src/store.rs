//! SQLite gallery store. Descriptors are sealed before they touch disk.

use crate::seal::{decode_values, encode_values, SealError, Sealer};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use presence_core::{Descriptor, GalleryEntry, GalleryStore, Identity, StoreError};
use rusqlite::params;
use std::path::Path;
use std::sync::Arc;
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS gallery_entries (
    id          TEXT PRIMARY KEY,
    identity    TEXT NOT NULL,
    descriptor  BLOB NOT NULL,
    dimension   INTEGER NOT NULL,
    enrolled_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS gallery_entries_identity ON gallery_entries (identity);
";

/// Raw row as read from disk, before unsealing.
struct Row {
    id: String,
    identity: String,
    descriptor: Vec<u8>,
    dimension: i64,
    enrolled_at: String,
}

pub struct SqliteGalleryStore {
    conn: Connection,
    sealer: Arc<Sealer>,
}

impl SqliteGalleryStore {
    pub async fn open(path: &Path, sealer: Sealer) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Unavailable(format!("{}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path).await.map_err(backend)?;
        Self::init(conn, sealer).await
    }

    pub async fn open_in_memory(sealer: Sealer) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await.map_err(backend)?;
        Self::init(conn, sealer).await
    }

    async fn init(conn: Connection, sealer: Sealer) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .map_err(backend)?;
        Ok(Self {
            conn,
            sealer: Arc::new(sealer),
        })
    }

    fn unseal(&self, row: Row) -> Result<GalleryEntry, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            id: row.id.clone(),
            reason,
        };

        let plain = self
            .sealer
            .open(&row.descriptor)
            .map_err(|e: SealError| corrupt(e.to_string()))?;
        let values =
            decode_values(&plain).ok_or_else(|| corrupt("ragged descriptor bytes".into()))?;
        if values.len() as i64 != row.dimension {
            return Err(corrupt(format!(
                "stored dimension {} but blob holds {}",
                row.dimension,
                values.len()
            )));
        }
        let descriptor = Descriptor::new(values).map_err(|e| corrupt(e.to_string()))?;
        let identity = Identity::new(&row.identity).map_err(|e| corrupt(e.to_string()))?;
        let enrolled_at = DateTime::parse_from_rfc3339(&row.enrolled_at)
            .map_err(|e| corrupt(e.to_string()))?
            .with_timezone(&Utc);

        Ok(GalleryEntry {
            id: row.id,
            identity,
            descriptor,
            enrolled_at,
        })
    }

    async fn query(&self, identity: Option<String>) -> Result<Vec<GalleryEntry>, StoreError> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, identity, descriptor, dimension, enrolled_at
                     FROM gallery_entries
                     WHERE ?1 IS NULL OR identity = ?1
                     ORDER BY enrolled_at, id",
                )?;
                let rows = stmt
                    .query_map(params![identity], |r| {
                        Ok(Row {
                            id: r.get(0)?,
                            identity: r.get(1)?,
                            descriptor: r.get(2)?,
                            dimension: r.get(3)?,
                            enrolled_at: r.get(4)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(backend)?;

        rows.into_iter().map(|row| self.unseal(row)).collect()
    }
}

fn backend(e: tokio_rusqlite::Error) -> StoreError {
    match e {
        tokio_rusqlite::Error::ConnectionClosed => {
            StoreError::Unavailable("database connection closed".into())
        }
        other => StoreError::Backend(other.to_string()),
    }
}

#[async_trait]
impl GalleryStore for SqliteGalleryStore {
    async fn load_all(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        self.query(None).await
    }

    async fn load_for(&self, identity: &Identity) -> Result<Vec<GalleryEntry>, StoreError> {
        self.query(Some(identity.as_str().to_string())).await
    }

    async fn append(&self, entry: GalleryEntry) -> Result<GalleryEntry, StoreError> {
        let blob = self
            .sealer
            .seal(&encode_values(entry.descriptor.as_slice()))
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let id = entry.id.clone();
        let identity = entry.identity.as_str().to_string();
        let dimension = entry.descriptor.len() as i64;
        let enrolled_at = entry.enrolled_at.to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO gallery_entries (id, identity, descriptor, dimension, enrolled_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![id, identity, blob, dimension, enrolled_at],
                )?;
                Ok(())
            })
            .await
            .map_err(backend)?;

        tracing::debug!(id = %entry.id, identity = %entry.identity, "gallery entry stored");
        Ok(entry)
    }

    async fn delete_identity(&self, identity: &Identity) -> Result<usize, StoreError> {
        let identity = identity.as_str().to_string();
        self.conn
            .call(move |conn| {
                let removed = conn.execute(
                    "DELETE FROM gallery_entries WHERE identity = ?1",
                    params![identity],
                )?;
                Ok(removed)
            })
            .await
            .map_err(backend)
    }

    async fn delete_entry(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let removed =
                    conn.execute("DELETE FROM gallery_entries WHERE id = ?1", params![id])?;
                Ok(removed > 0)
            })
            .await
            .map_err(backend)
    }
}
