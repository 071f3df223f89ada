use serde::{Deserialize, Serialize};
use surrealdb::{
    engine::any::{connect, Any},
    Surreal,
};
use tracing::debug;

use crate::error::AppError;

/// Per-chunk metadata stored alongside the embedding and returned with every
/// query hit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkMetadata {
    pub doc_id: String,
    pub chunk_index: usize,
    pub ingestion_date: String,
    pub rbac_namespace: String,
    pub tags: Vec<String>,
    pub embedding_model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorEntry {
    pub chunk_id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: ChunkMetadata,
}

/// A single semantic-search result. `distance` is cosine distance, i.e.
/// `1 - cosine_similarity`, so it lies in [0, 2].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorHit {
    pub text: String,
    pub distance: f32,
    pub metadata: ChunkMetadata,
}

/// Wrapper around the SurrealDB-backed vector store. One table holds all
/// chunks; an HNSW index over the embedding field serves top-k queries.
#[derive(Clone)]
pub struct VectorStore {
    client: Surreal<Any>,
    table: String,
    dimension: usize,
}

impl VectorStore {
    pub async fn connect(
        address: &str,
        namespace: &str,
        database: &str,
        table: &str,
        dimension: usize,
    ) -> Result<Self, AppError> {
        let client = connect(address).await?;
        client.use_ns(namespace).use_db(database).await?;

        let store = Self {
            client,
            table: table.to_string(),
            dimension,
        };
        store.ensure_index().await?;

        Ok(store)
    }

    pub async fn ensure_index(&self) -> Result<(), AppError> {
        self.client
            .query(format!(
                "DEFINE INDEX IF NOT EXISTS idx_embedding_{table} ON TABLE {table} FIELDS embedding HNSW DIMENSION {dim};",
                table = self.table,
                dim = self.dimension
            ))
            .await?
            .check()?;
        Ok(())
    }

    pub const fn dimension(&self) -> usize {
        self.dimension
    }

    /// Batch insert. Chunk ids are record keys, so re-inserting the same
    /// chunk id replaces the row.
    pub async fn add(&self, entries: &[VectorEntry]) -> Result<usize, AppError> {
        for entry in entries {
            if entry.embedding.len() != self.dimension {
                return Err(AppError::Validation(format!(
                    "embedding for chunk {} has dimension {}, expected {}",
                    entry.chunk_id,
                    entry.embedding.len(),
                    self.dimension
                )));
            }

            self.client
                .query(format!(
                    "UPSERT type::thing('{table}', $chunk_id) CONTENT $entry;",
                    table = self.table
                ))
                .bind(("chunk_id", entry.chunk_id.clone()))
                .bind(("entry", entry.clone()))
                .await?
                .check()?;
        }

        debug!(count = entries.len(), table = %self.table, "vector entries stored");

        Ok(entries.len())
    }

    /// Top-k semantic search, optionally filtered to one RBAC namespace.
    pub async fn query(
        &self,
        embedding: Vec<f32>,
        top_k: usize,
        rbac_namespace: Option<&str>,
    ) -> Result<Vec<VectorHit>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            text: String,
            metadata: ChunkMetadata,
            score: f32,
        }

        let namespace_clause = if rbac_namespace.is_some() {
            "WHERE metadata.rbac_namespace = $namespace AND embedding <|{take},100|> $embedding"
        } else {
            "WHERE embedding <|{take},100|> $embedding"
        }
        .replace("{take}", &top_k.to_string());

        let sql = format!(
            r"
            SELECT
                text,
                metadata,
                vector::similarity::cosine(embedding, $embedding) AS score
            FROM {table}
            {namespace_clause}
            ORDER BY score DESC
            LIMIT {top_k};
            ",
            table = self.table,
        );

        let mut query = self.client.query(&sql).bind(("embedding", embedding));
        if let Some(namespace) = rbac_namespace {
            query = query.bind(("namespace", namespace.to_string()));
        }

        let mut response = query.await?;
        let rows: Vec<Row> = response.take::<Vec<Row>>(0).unwrap_or_default();

        Ok(rows
            .into_iter()
            .map(|row| VectorHit {
                text: row.text,
                distance: 1.0 - row.score,
                metadata: row.metadata,
            })
            .collect())
    }

    /// Chunk ids and bodies for one document, in chunk order. Used by the
    /// healing actions that recompute embeddings.
    pub async fn texts_for_doc(&self, doc_id: &str) -> Result<Vec<(String, String)>, AppError> {
        #[derive(Deserialize)]
        struct Row {
            chunk_id: String,
            text: String,
            metadata: ChunkMetadata,
        }

        let mut response = self
            .client
            .query(format!(
                "SELECT chunk_id, text, metadata FROM {table} WHERE metadata.doc_id = $doc_id;",
                table = self.table
            ))
            .bind(("doc_id", doc_id.to_string()))
            .await?;

        let mut rows: Vec<Row> = response.take::<Vec<Row>>(0).unwrap_or_default();
        rows.sort_by_key(|row| row.metadata.chunk_index);

        Ok(rows
            .into_iter()
            .map(|row| (row.chunk_id, row.text))
            .collect())
    }

    pub async fn count_for_doc(&self, doc_id: &str) -> Result<usize, AppError> {
        #[derive(Deserialize)]
        struct CountRow {
            total: usize,
        }

        let mut response = self
            .client
            .query(format!(
                "SELECT count() AS total FROM {table} WHERE metadata.doc_id = $doc_id GROUP ALL;",
                table = self.table
            ))
            .bind(("doc_id", doc_id.to_string()))
            .await?;

        let rows: Vec<CountRow> = response.take::<Vec<CountRow>>(0).unwrap_or_default();
        Ok(rows.first().map_or(0, |row| row.total))
    }

    /// Replaces the stored embedding for one chunk, recording the model that
    /// produced it. Used by the RE_EMBED healing action.
    pub async fn update_embedding(
        &self,
        chunk_id: &str,
        embedding: Vec<f32>,
        embedding_model: &str,
    ) -> Result<(), AppError> {
        if embedding.len() != self.dimension {
            return Err(AppError::Validation(format!(
                "replacement embedding for chunk {chunk_id} has dimension {}, expected {}",
                embedding.len(),
                self.dimension
            )));
        }

        self.client
            .query(format!(
                "UPDATE type::thing('{table}', $chunk_id) SET embedding = $embedding, metadata.embedding_model = $model;",
                table = self.table
            ))
            .bind(("chunk_id", chunk_id.to_string()))
            .bind(("embedding", embedding))
            .bind(("model", embedding_model.to_string()))
            .await?
            .check()?;

        Ok(())
    }

    pub async fn delete_doc(&self, doc_id: &str) -> Result<(), AppError> {
        self.client
            .query(format!(
                "DELETE {table} WHERE metadata.doc_id = $doc_id;",
                table = self.table
            ))
            .bind(("doc_id", doc_id.to_string()))
            .await?
            .check()?;
        Ok(())
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl VectorStore {
    /// In-memory store for tests.
    pub async fn memory(table: &str, dimension: usize) -> Result<Self, AppError> {
        let client = connect("mem://").await?;
        client.use_ns("test_ns").use_db("test_db").await?;

        let store = Self {
            client,
            table: table.to_string(),
            dimension,
        };
        store.ensure_index().await?;

        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn entry(chunk_id: &str, doc_id: &str, namespace: &str, embedding: Vec<f32>) -> VectorEntry {
        VectorEntry {
            chunk_id: chunk_id.to_string(),
            text: format!("text for {chunk_id}"),
            embedding,
            metadata: ChunkMetadata {
                doc_id: doc_id.to_string(),
                chunk_index: 0,
                ingestion_date: "2026-01-01T00:00:00Z".to_string(),
                rbac_namespace: namespace.to_string(),
                tags: vec!["rbac:generic:viewer".to_string()],
                embedding_model: "test-model".to_string(),
            },
        }
    }

    async fn memory_store() -> VectorStore {
        let table = format!("chunk_{}", Uuid::new_v4().simple());
        VectorStore::memory(&table, 3)
            .await
            .expect("failed to start in-memory vector store")
    }

    #[tokio::test]
    async fn query_on_empty_store_returns_no_hits() {
        let store = memory_store().await;

        let hits = store.query(vec![0.1, 0.2, 0.3], 5, None).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn add_and_query_orders_by_similarity() {
        let store = memory_store().await;

        store
            .add(&[
                entry("c1", "doc_a", "general", vec![1.0, 0.0, 0.0]),
                entry("c2", "doc_a", "general", vec![0.0, 1.0, 0.0]),
            ])
            .await
            .expect("add");

        let hits = store.query(vec![0.0, 1.0, 0.0], 2, None).await.unwrap();

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].metadata.doc_id, "doc_a");
        assert!(hits[0].distance < hits[1].distance);
        assert!(hits[0].text.contains("c2"));
    }

    #[tokio::test]
    async fn namespace_filter_hides_other_partitions() {
        let store = memory_store().await;

        store
            .add(&[
                entry("c1", "doc_a", "finance", vec![1.0, 0.0, 0.0]),
                entry("c2", "doc_b", "general", vec![0.9, 0.1, 0.0]),
            ])
            .await
            .expect("add");

        let hits = store
            .query(vec![1.0, 0.0, 0.0], 5, Some("finance"))
            .await
            .unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata.doc_id, "doc_a");
    }

    #[tokio::test]
    async fn texts_for_doc_come_back_in_chunk_order() {
        let store = memory_store().await;

        let mut second = entry("c1", "doc_a", "general", vec![1.0, 0.0, 0.0]);
        second.metadata.chunk_index = 1;
        store
            .add(&[
                second,
                entry("c0", "doc_a", "general", vec![0.0, 1.0, 0.0]),
            ])
            .await
            .expect("add");

        let texts = store.texts_for_doc("doc_a").await.unwrap();
        assert_eq!(texts.len(), 2);
        assert_eq!(texts[0].0, "c0");
        assert_eq!(texts[1].0, "c1");
    }

    #[tokio::test]
    async fn count_for_doc_counts_only_that_document() {
        let store = memory_store().await;

        store
            .add(&[
                entry("c1", "doc_a", "general", vec![1.0, 0.0, 0.0]),
                entry("c2", "doc_a", "general", vec![0.0, 1.0, 0.0]),
                entry("c3", "doc_b", "general", vec![0.0, 0.0, 1.0]),
            ])
            .await
            .expect("add");

        assert_eq!(store.count_for_doc("doc_a").await.unwrap(), 2);
        assert_eq!(store.count_for_doc("doc_b").await.unwrap(), 1);
        assert_eq!(store.count_for_doc("missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rejects_mismatched_dimension() {
        let store = memory_store().await;

        let result = store
            .add(&[entry("c1", "doc_a", "general", vec![1.0, 0.0])])
            .await;

        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn update_embedding_replaces_vector_and_model() {
        let store = memory_store().await;

        store
            .add(&[entry("c1", "doc_a", "general", vec![1.0, 0.0, 0.0])])
            .await
            .expect("add");

        store
            .update_embedding("c1", vec![0.0, 1.0, 0.0], "alternate-model")
            .await
            .expect("update");

        let hits = store.query(vec![0.0, 1.0, 0.0], 1, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metadata.embedding_model, "alternate-model");
        assert!(hits[0].distance < 0.01);
    }
}
