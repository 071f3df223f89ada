use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AppError;

/// Relational row for one ingested document. Documents are written once at
/// ingestion; re-ingestion creates a new `doc_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentRecord {
    pub doc_id: String,
    pub title: String,
    pub author: Option<String>,
    pub source: String,
    pub summary: String,
    pub strategy: String,
    pub chunk_size_char: usize,
    pub chunk_overlap_char: usize,
    pub ingestion_date: String,
    pub rbac_namespace: String,
    pub metadata_json: String,
    pub chunk_count: usize,
}

/// Relational row for one chunk. Only the healing subsystem mutates
/// `quality_score` and `reindex_count`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkRecord {
    pub chunk_id: String,
    pub doc_id: String,
    pub chunk_index: usize,
    pub embedding_model: String,
    pub quality_score: f64,
    pub reindex_count: i64,
}

/// Aggregates over a document's chunks, feeding the healing agent's state.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkStats {
    pub chunk_count: usize,
    pub avg_reindex_count: f64,
}

/// Aggregates over QUERY history events for a document.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryStats {
    pub query_count: usize,
    pub avg_accuracy: Option<f64>,
    pub avg_cost_tokens: Option<f64>,
    pub avg_user_feedback: Option<f64>,
}

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS document_metadata (
    doc_id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    author TEXT,
    source TEXT NOT NULL,
    summary TEXT NOT NULL,
    strategy TEXT NOT NULL,
    chunk_size_char INTEGER NOT NULL,
    chunk_overlap_char INTEGER NOT NULL,
    ingestion_date TEXT NOT NULL,
    rbac_namespace TEXT NOT NULL,
    metadata_json TEXT NOT NULL,
    chunk_count INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS chunk_embedding_data (
    chunk_id TEXT PRIMARY KEY,
    doc_id TEXT NOT NULL,
    chunk_index INTEGER NOT NULL,
    embedding_model TEXT NOT NULL,
    quality_score REAL NOT NULL DEFAULT 0.5,
    reindex_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS rag_history_and_optimization (
    history_id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    query_text TEXT,
    target_doc_id TEXT,
    target_chunk_id TEXT,
    metrics_json TEXT,
    context_json TEXT,
    reward_signal REAL,
    action_taken TEXT,
    state_before TEXT,
    state_after TEXT,
    agent_id TEXT,
    user_id TEXT,
    session_id TEXT
);

CREATE TABLE IF NOT EXISTS document_tracking (
    tracking_id INTEGER PRIMARY KEY AUTOINCREMENT,
    doc_id TEXT NOT NULL,
    source_path TEXT NOT NULL,
    rbac_namespace TEXT NOT NULL,
    ingestion_status TEXT NOT NULL,
    chunks_saved INTEGER NOT NULL,
    metadata_tags TEXT NOT NULL,
    tracked_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chunk_doc ON chunk_embedding_data (doc_id);
CREATE INDEX IF NOT EXISTS idx_history_doc ON rag_history_and_optimization (target_doc_id);
CREATE INDEX IF NOT EXISTS idx_history_event ON rag_history_and_optimization (event_type);
CREATE INDEX IF NOT EXISTS idx_history_session ON rag_history_and_optimization (session_id);
";

/// The relational tracking store: one SQLite file, connection serialized
/// behind a mutex. The history table's AUTOINCREMENT id is the ordering
/// authority for concurrent writers.
pub struct TrackingStore {
    conn: Mutex<Connection>,
}

impl TrackingStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, AppError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    ) -> Result<T, AppError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| AppError::InternalError("tracking store mutex poisoned".into()))?;
        f(&conn).map_err(AppError::from)
    }

    pub fn upsert_document(&self, record: &DocumentRecord) -> Result<(), AppError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO document_metadata
                 (doc_id, title, author, source, summary, strategy, chunk_size_char,
                  chunk_overlap_char, ingestion_date, rbac_namespace, metadata_json, chunk_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(doc_id) DO UPDATE SET
                    title = excluded.title,
                    author = excluded.author,
                    source = excluded.source,
                    summary = excluded.summary,
                    strategy = excluded.strategy,
                    chunk_size_char = excluded.chunk_size_char,
                    chunk_overlap_char = excluded.chunk_overlap_char,
                    ingestion_date = excluded.ingestion_date,
                    rbac_namespace = excluded.rbac_namespace,
                    metadata_json = excluded.metadata_json,
                    chunk_count = excluded.chunk_count",
                rusqlite::params![
                    record.doc_id,
                    record.title,
                    record.author,
                    record.source,
                    record.summary,
                    record.strategy,
                    record.chunk_size_char,
                    record.chunk_overlap_char,
                    record.ingestion_date,
                    record.rbac_namespace,
                    record.metadata_json,
                    record.chunk_count,
                ],
            )?;
            Ok(())
        })?;

        debug!(doc_id = %record.doc_id, chunks = record.chunk_count, "document record upserted");
        Ok(())
    }

    pub fn upsert_chunk(&self, record: &ChunkRecord) -> Result<(), AppError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO chunk_embedding_data
                 (chunk_id, doc_id, chunk_index, embedding_model, quality_score, reindex_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(chunk_id) DO UPDATE SET
                    embedding_model = excluded.embedding_model,
                    quality_score = excluded.quality_score,
                    reindex_count = excluded.reindex_count",
                rusqlite::params![
                    record.chunk_id,
                    record.doc_id,
                    record.chunk_index,
                    record.embedding_model,
                    record.quality_score,
                    record.reindex_count,
                ],
            )?;
            Ok(())
        })
    }

    pub fn document(&self, doc_id: &str) -> Result<Option<DocumentRecord>, AppError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT doc_id, title, author, source, summary, strategy, chunk_size_char,
                        chunk_overlap_char, ingestion_date, rbac_namespace, metadata_json, chunk_count
                 FROM document_metadata WHERE doc_id = ?1",
                [doc_id],
                |row| {
                    Ok(DocumentRecord {
                        doc_id: row.get(0)?,
                        title: row.get(1)?,
                        author: row.get(2)?,
                        source: row.get(3)?,
                        summary: row.get(4)?,
                        strategy: row.get(5)?,
                        chunk_size_char: row.get(6)?,
                        chunk_overlap_char: row.get(7)?,
                        ingestion_date: row.get(8)?,
                        rbac_namespace: row.get(9)?,
                        metadata_json: row.get(10)?,
                        chunk_count: row.get(11)?,
                    })
                },
            )
            .optional()
        })
    }

    pub fn chunks_for_doc(&self, doc_id: &str) -> Result<Vec<ChunkRecord>, AppError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT chunk_id, doc_id, chunk_index, embedding_model, quality_score, reindex_count
                 FROM chunk_embedding_data WHERE doc_id = ?1 ORDER BY chunk_index",
            )?;
            let rows = stmt.query_map([doc_id], |row| {
                Ok(ChunkRecord {
                    chunk_id: row.get(0)?,
                    doc_id: row.get(1)?,
                    chunk_index: row.get(2)?,
                    embedding_model: row.get(3)?,
                    quality_score: row.get(4)?,
                    reindex_count: row.get(5)?,
                })
            })?;
            rows.collect()
        })
    }

    pub fn chunk_stats(&self, doc_id: &str) -> Result<ChunkStats, AppError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*), COALESCE(AVG(reindex_count), 0.0)
                 FROM chunk_embedding_data WHERE doc_id = ?1",
                [doc_id],
                |row| {
                    Ok(ChunkStats {
                        chunk_count: row.get::<_, i64>(0)? as usize,
                        avg_reindex_count: row.get(1)?,
                    })
                },
            )
        })
    }

    /// Averages the structured metrics of QUERY events targeting a document.
    pub fn query_stats(&self, doc_id: &str) -> Result<QueryStats, AppError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT
                    COUNT(*),
                    AVG(CAST(json_extract(metrics_json, '$.avg_accuracy') AS REAL)),
                    AVG(CAST(json_extract(metrics_json, '$.cost_tokens') AS REAL)),
                    AVG(CAST(json_extract(metrics_json, '$.user_feedback') AS REAL))
                 FROM rag_history_and_optimization
                 WHERE target_doc_id = ?1 AND event_type = 'QUERY'",
                [doc_id],
                |row| {
                    Ok(QueryStats {
                        query_count: row.get::<_, i64>(0)? as usize,
                        avg_accuracy: row.get(1)?,
                        avg_cost_tokens: row.get(2)?,
                        avg_user_feedback: row.get(3)?,
                    })
                },
            )
        })
    }

    /// Marks a healing pass over a document's chunks: bumps reindex counters
    /// and records the new quality score.
    pub fn record_heal_applied(&self, doc_id: &str, quality_score: f64) -> Result<(), AppError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE chunk_embedding_data
                 SET reindex_count = reindex_count + 1, quality_score = ?2
                 WHERE doc_id = ?1",
                rusqlite::params![doc_id, quality_score],
            )?;
            Ok(())
        })
    }

    pub fn record_tracking(
        &self,
        doc_id: &str,
        source_path: &str,
        rbac_namespace: &str,
        status: &str,
        chunks_saved: usize,
        metadata_tags: &str,
    ) -> Result<i64, AppError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO document_tracking
                 (doc_id, source_path, rbac_namespace, ingestion_status, chunks_saved, metadata_tags, tracked_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    doc_id,
                    source_path,
                    rbac_namespace,
                    status,
                    chunks_saved,
                    metadata_tags,
                    chrono::Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn chunks_saved(&self, doc_id: &str) -> Result<Option<usize>, AppError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT chunks_saved FROM document_tracking
                 WHERE doc_id = ?1 ORDER BY tracking_id DESC LIMIT 1",
                [doc_id],
                |row| row.get::<_, i64>(0).map(|v| v as usize),
            )
            .optional()
        })
    }
}
