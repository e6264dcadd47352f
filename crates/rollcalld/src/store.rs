//! Embedding store and attendance ledger, persisted in SQLite.
//!
//! Each registered embedding is one row keyed by scope. Vectors are stored
//! as a versioned little-endian `f32` blob with a SHA-256 checksum, so a
//! damaged row is reported instead of silently dropped. Appends run in a
//! single immediate transaction on the connection's worker thread: readers
//! see all of an append or none of it, and appends never interleave.

use chrono::{NaiveDate, Utc};
use rollcall_core::{Embedding, Identity, ReferenceSet, Scope};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

const SCHEMA_VERSION: i64 = 1;
const BLOB_VERSION: u8 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS reference_embeddings (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    scope         TEXT    NOT NULL,
    identity      TEXT    NOT NULL,
    dim           INTEGER NOT NULL,
    vector        BLOB    NOT NULL,
    checksum      BLOB    NOT NULL,
    model_version TEXT,
    created_at    TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_reference_scope ON reference_embeddings (scope, id);

CREATE TABLE IF NOT EXISTS attendance (
    scope     TEXT NOT NULL,
    date      TEXT NOT NULL,
    identity  TEXT NOT NULL,
    marked_at TEXT NOT NULL,
    PRIMARY KEY (scope, date, identity)
);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("stored data for scope {scope} is corrupt (row {row}): {reason}")]
    Corrupt { scope: String, row: i64, reason: String },
    #[error("database schema version {found} is newer than supported version {SCHEMA_VERSION}")]
    UnsupportedSchema { found: i64 },
    #[error("embedding dimension mismatch for scope {scope}: expected {expected}, got {actual}")]
    DimensionMismatch { scope: String, expected: usize, actual: usize },
}

/// Raw row as read from SQLite, decoded outside the connection thread.
struct StoredRow {
    id: i64,
    identity: String,
    dim: i64,
    vector: Vec<u8>,
    checksum: Vec<u8>,
    model_version: Option<String>,
}

/// Registered identity and how many embeddings it contributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentitySummary {
    pub identity: String,
    pub embeddings: u32,
}

/// Identities marked present in one scope on one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceRecord {
    pub date: NaiveDate,
    pub present: Vec<String>,
}

/// Clone-safe handle to the store; clones share one connection.
#[derive(Clone)]
pub struct EmbeddingStore {
    conn: Connection,
}

impl EmbeddingStore {
    /// Open (creating if needed) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        let found = conn
            .call(|conn| {
                let version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
                if version > SCHEMA_VERSION {
                    return Ok(version);
                }
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |r| r.get::<_, String>(0))?;
                conn.execute_batch(SCHEMA)?;
                conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
                Ok(version)
            })
            .await?;

        if found > SCHEMA_VERSION {
            return Err(StoreError::UnsupportedSchema { found });
        }
        tracing::debug!(schema = SCHEMA_VERSION, "embedding store ready");
        Ok(Self { conn })
    }

    /// Load the full reference set for `scope`, in registration order.
    ///
    /// An unknown scope yields an empty set.
    pub async fn load(&self, scope: &Scope) -> Result<ReferenceSet, StoreError> {
        let key = scope.as_key().to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, identity, dim, vector, checksum, model_version
                     FROM reference_embeddings WHERE scope = ?1 ORDER BY id",
                )?;
                let rows = stmt
                    .query_map([&key], |r| {
                        Ok(StoredRow {
                            id: r.get(0)?,
                            identity: r.get(1)?,
                            dim: r.get(2)?,
                            vector: r.get(3)?,
                            checksum: r.get(4)?,
                            model_version: r.get(5)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut set = ReferenceSet::new();
        for row in rows {
            let corrupt = |reason: String| StoreError::Corrupt {
                scope: scope.to_string(),
                row: row.id,
                reason,
            };
            let values = decode_vector(row.dim, &row.vector, &row.checksum).map_err(&corrupt)?;
            let identity = Identity::new(row.identity).map_err(|e| corrupt(e.to_string()))?;
            let embedding = Embedding {
                values,
                model_version: row.model_version,
            };
            set.push(embedding, identity).map_err(|e| corrupt(e.to_string()))?;
        }

        tracing::debug!(scope = %scope, embeddings = set.len(), "loaded reference set");
        Ok(set)
    }

    /// Append `embeddings`, all labelled `identity`, to the scope's
    /// reference set in one transaction. Returns the number of rows added.
    pub async fn append(
        &self,
        scope: &Scope,
        embeddings: &[Embedding],
        identity: &Identity,
    ) -> Result<usize, StoreError> {
        let Some(first) = embeddings.first() else {
            return Ok(0);
        };
        let dim = first.dimension();
        if let Some(bad) = embeddings.iter().find(|e| e.dimension() != dim || e.dimension() == 0) {
            return Err(StoreError::DimensionMismatch {
                scope: scope.to_string(),
                expected: dim,
                actual: bad.dimension(),
            });
        }

        let key = scope.as_key().to_string();
        let label = identity.as_str().to_string();
        let created_at = Utc::now().to_rfc3339();
        let encoded: Vec<(Vec<u8>, Vec<u8>, Option<String>)> = embeddings
            .iter()
            .map(|e| {
                let blob = encode_vector(&e.values);
                let checksum = Sha256::digest(&blob).to_vec();
                (blob, checksum, e.model_version.clone())
            })
            .collect();

        let existing_dim = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let existing: Option<i64> = tx
                    .query_row(
                        "SELECT dim FROM reference_embeddings WHERE scope = ?1 LIMIT 1",
                        [&key],
                        |r| r.get(0),
                    )
                    .optional()?;
                if let Some(existing) = existing {
                    if existing != dim as i64 {
                        return Ok(Some(existing));
                    }
                }
                {
                    let mut insert = tx.prepare_cached(
                        "INSERT INTO reference_embeddings
                         (scope, identity, dim, vector, checksum, model_version, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    )?;
                    for (blob, checksum, model_version) in &encoded {
                        insert.execute(params![key, label, dim as i64, blob, checksum, model_version, created_at])?;
                    }
                }
                tx.commit()?;
                Ok(None)
            })
            .await?;

        if let Some(existing) = existing_dim {
            return Err(StoreError::DimensionMismatch {
                scope: scope.to_string(),
                expected: existing as usize,
                actual: dim,
            });
        }

        tracing::info!(scope = %scope, identity = %identity, count = embeddings.len(), "appended embeddings");
        Ok(embeddings.len())
    }

    /// Registered identities in the scope, in first-registration order.
    pub async fn identities(&self, scope: &Scope) -> Result<Vec<IdentitySummary>, StoreError> {
        let key = scope.as_key().to_string();
        let summaries = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT identity, COUNT(*) FROM reference_embeddings
                     WHERE scope = ?1 GROUP BY identity ORDER BY MIN(id)",
                )?;
                let rows = stmt
                    .query_map([&key], |r| {
                        Ok(IdentitySummary {
                            identity: r.get(0)?,
                            embeddings: r.get(1)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(summaries)
    }

    /// Mark `identities` present in `scope` on `date`. Re-marking is a no-op.
    /// Returns how many identities were newly marked.
    pub async fn record_attendance(
        &self,
        scope: &Scope,
        date: NaiveDate,
        identities: &[Identity],
    ) -> Result<usize, StoreError> {
        let key = scope.as_key().to_string();
        let day = date.to_string();
        let marked_at = Utc::now().to_rfc3339();
        let labels: Vec<String> = identities.iter().map(|i| i.as_str().to_string()).collect();

        let inserted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let mut inserted = 0;
                {
                    let mut insert = tx.prepare_cached(
                        "INSERT OR IGNORE INTO attendance (scope, date, identity, marked_at)
                         VALUES (?1, ?2, ?3, ?4)",
                    )?;
                    for label in &labels {
                        inserted += insert.execute(params![key, day, label, marked_at])?;
                    }
                }
                tx.commit()?;
                Ok(inserted)
            })
            .await?;

        tracing::info!(scope = %scope, %date, marked = inserted, "recorded attendance");
        Ok(inserted)
    }

    /// Attendance for one date; `None` when nothing was recorded that day.
    pub async fn attendance(
        &self,
        scope: &Scope,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        let key = scope.as_key().to_string();
        let day = date.to_string();
        let present = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT identity FROM attendance WHERE scope = ?1 AND date = ?2
                     ORDER BY marked_at, identity",
                )?;
                let rows = stmt
                    .query_map(params![key, day], |r| r.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        Ok((!present.is_empty()).then_some(AttendanceRecord { date, present }))
    }

    /// Every recorded date for the scope, oldest first.
    pub async fn attendance_history(&self, scope: &Scope) -> Result<Vec<AttendanceRecord>, StoreError> {
        let key = scope.as_key().to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT rowid, date, identity FROM attendance WHERE scope = ?1
                     ORDER BY date, marked_at, identity",
                )?;
                let rows = stmt
                    .query_map([&key], |r| {
                        Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut records: Vec<AttendanceRecord> = Vec::new();
        for (row, day, identity) in rows {
            let date = day.parse::<NaiveDate>().map_err(|e| StoreError::Corrupt {
                scope: scope.to_string(),
                row,
                reason: format!("attendance date {day:?}: {e}"),
            })?;
            match records.last_mut() {
                Some(last) if last.date == date => last.present.push(identity),
                _ => records.push(AttendanceRecord { date, present: vec![identity] }),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
impl EmbeddingStore {
    pub(crate) async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    /// Run arbitrary SQL against the store, for corrupting rows in tests.
    pub(crate) async fn execute_raw(&self, sql: &'static str) {
        self.conn
            .call(move |conn| {
                conn.execute_batch(sql)?;
                Ok(())
            })
            .await
            .unwrap();
    }
}

/// `[version][f32 LE]*`.
fn encode_vector(values: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(1 + values.len() * 4);
    blob.push(BLOB_VERSION);
    for v in values {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

fn decode_vector(dim: i64, blob: &[u8], checksum: &[u8]) -> Result<Vec<f32>, String> {
    if Sha256::digest(blob).as_slice() != checksum {
        return Err("checksum mismatch".into());
    }
    let (&version, payload) = blob.split_first().ok_or("empty vector blob")?;
    if version != BLOB_VERSION {
        return Err(format!("unknown vector encoding version {version}"));
    }
    let dim = usize::try_from(dim).map_err(|_| format!("negative dimension {dim}"))?;
    if dim == 0 || payload.len() != dim * 4 {
        return Err(format!("blob holds {} bytes, expected {dim} f32 values", payload.len()));
    }
    Ok(payload
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
