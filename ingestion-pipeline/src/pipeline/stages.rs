use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use common::storage::tracking::{ChunkRecord, DocumentRecord};
use common::storage::vector::{ChunkMetadata, VectorEntry};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::{debug, instrument, warn};
use workflow_engine::NodeError;

use crate::{
    chunking::{chunk_document, Chunk},
    classify::{classify_document, fallback_classification},
    metadata::{extract_metadata, fallback_metadata},
    normalize::normalize_path,
};

use super::{
    state::{IngestionInput, IngestionState},
    IngestionConfig, IngestionServices,
};

const EMBED_RETRY_BASE_MS: u64 = 100;
const EMBED_RETRY_ATTEMPTS: usize = 3;

/// Stage 1: reduce the raw input to normalized text.
#[instrument(level = "trace", skip_all, fields(doc_id = %state.doc_id))]
pub(super) async fn normalize(mut state: IngestionState) -> Result<IngestionState, NodeError> {
    let normalized = match &state.input {
        IngestionInput::Text(text) => Ok(text.clone()),
        IngestionInput::FilePath(path) => normalize_path(Path::new(path)),
    };

    match normalized {
        Ok(text) => {
            debug!(chars = text.chars().count(), "input normalized");
            state.markdown = Some(text);
            state.status = "markdown_converted".to_string();
        }
        Err(err) => {
            state
                .common
                .record_error(format!("Markdown conversion failed: {err}"));
        }
    }

    Ok(state)
}

/// Stage 2: classification into RBAC and meta tags. LLM failure falls back
/// to the generic viewer tag and records the error.
#[instrument(level = "trace", skip_all, fields(doc_id = %state.doc_id))]
pub(super) async fn classify(
    mut state: IngestionState,
    services: Arc<IngestionServices>,
) -> Result<IngestionState, NodeError> {
    let Some(markdown) = state.markdown.clone() else {
        state
            .common
            .record_error("Classification skipped: no normalized text".to_string());
        return Ok(state);
    };

    let title = state
        .metadata
        .as_ref()
        .map_or_else(|| state.doc_id.clone(), |m| m.title.clone());

    match classify_document(&services.llm, &title, &markdown).await {
        Ok(classification) => {
            state.classification = Some(classification);
            state.status = "document_classified".to_string();
        }
        Err(err) => {
            state.classification = Some(fallback_classification());
            state
                .common
                .record_error(format!("Classification failed: {err}"));
        }
    }

    Ok(state)
}

/// Stage 3: semantic metadata. LLM failure produces text-derived defaults.
#[instrument(level = "trace", skip_all, fields(doc_id = %state.doc_id))]
pub(super) async fn metadata(
    mut state: IngestionState,
    services: Arc<IngestionServices>,
) -> Result<IngestionState, NodeError> {
    let Some(markdown) = state.markdown.clone() else {
        state
            .common
            .record_error("Metadata extraction skipped: no normalized text".to_string());
        return Ok(state);
    };

    match extract_metadata(&services.llm, &markdown).await {
        Ok(metadata) => {
            state.metadata = Some(metadata);
            state.status = "metadata_extracted".to_string();
        }
        Err(err) => {
            state.metadata = Some(fallback_metadata(&markdown));
            state
                .common
                .record_error(format!("Metadata extraction failed: {err}"));
        }
    }

    Ok(state)
}

/// Stage 4: recursive character splitting. Empty text yields zero chunks
/// and is not an error.
#[instrument(level = "trace", skip_all, fields(doc_id = %state.doc_id))]
pub(super) async fn chunk(
    mut state: IngestionState,
    config: IngestionConfig,
) -> Result<IngestionState, NodeError> {
    let Some(markdown) = state.markdown.as_deref() else {
        state
            .common
            .record_error("Chunking skipped: no normalized text".to_string());
        return Ok(state);
    };

    state.chunks = chunk_document(&state.doc_id, markdown, &config.chunker);
    state.status = "chunks_created".to_string();
    debug!(chunks = state.chunks.len(), "document chunked");

    Ok(state)
}

/// Stage 5: embed each chunk and write the vector store, then mirror the
/// document and chunk rows into the tracking store. The vector store is
/// authoritative for retrieval; relational failures are logged and do not
/// fail the ingestion.
#[instrument(level = "trace", skip_all, fields(doc_id = %state.doc_id))]
pub(super) async fn embed_and_persist(
    mut state: IngestionState,
    services: Arc<IngestionServices>,
    config: IngestionConfig,
) -> Result<IngestionState, NodeError> {
    if state.chunks.is_empty() {
        state.status = "nothing_to_embed".to_string();
        return Ok(state);
    }

    let tags = state.all_tags();
    let entries = embed_chunks(&services, &state, &tags).await;

    if !entries.is_empty() {
        match services.vector.add(&entries).await {
            Ok(saved) => {
                state.chunks_saved = saved;
                state.status = "saved_to_vector_store".to_string();
            }
            Err(err) => {
                state
                    .common
                    .record_error(format!("Vector store write failed: {err}"));
            }
        }
    }

    if state.chunks_saved > 0 {
        persist_relational(&services, &state, &config);
    }

    Ok(state)
}

async fn embed_chunks(
    services: &Arc<IngestionServices>,
    state: &IngestionState,
    tags: &[String],
) -> Vec<VectorEntry> {
    let ingestion_date = Utc::now().to_rfc3339();
    let mut entries = Vec::with_capacity(state.chunks.len());

    for chunk in &state.chunks {
        let strategy = ExponentialBackoff::from_millis(EMBED_RETRY_BASE_MS)
            .map(jitter)
            .take(EMBED_RETRY_ATTEMPTS);

        match Retry::spawn(strategy, || services.llm.generate_embedding(&chunk.text)).await {
            Ok(embedding) => entries.push(VectorEntry {
                chunk_id: chunk.chunk_id.clone(),
                text: chunk.text.clone(),
                embedding,
                metadata: ChunkMetadata {
                    doc_id: state.doc_id.clone(),
                    chunk_index: chunk.index,
                    ingestion_date: ingestion_date.clone(),
                    rbac_namespace: state.rbac_namespace.clone(),
                    tags: tags.to_vec(),
                    embedding_model: services.llm.model_label().to_string(),
                },
            }),
            Err(err) => {
                warn!(chunk_id = %chunk.chunk_id, error = %err, "embedding failed after retries");
            }
        }
    }

    entries
}

/// Best-effort relational mirror with a single retry per write.
fn persist_relational(
    services: &Arc<IngestionServices>,
    state: &IngestionState,
    config: &IngestionConfig,
) {
    let metadata_json = serde_json::json!({
        "classification": state.classification,
        "metadata": state.metadata,
    })
    .to_string();

    let document = DocumentRecord {
        doc_id: state.doc_id.clone(),
        title: state
            .metadata
            .as_ref()
            .map_or_else(|| state.doc_id.clone(), |m| m.title.clone()),
        author: None,
        source: state.source_label.clone(),
        summary: state
            .metadata
            .as_ref()
            .map_or_else(String::new, |m| m.summary.clone()),
        strategy: "recursive_splitter".to_string(),
        chunk_size_char: config.chunker.chunk_size,
        chunk_overlap_char: config.chunker.overlap,
        ingestion_date: Utc::now().to_rfc3339(),
        rbac_namespace: state.rbac_namespace.clone(),
        metadata_json,
        chunk_count: state.chunks_saved,
    };

    let doc_write = services
        .tracking
        .upsert_document(&document)
        .or_else(|_| services.tracking.upsert_document(&document));
    if let Err(err) = doc_write {
        warn!(doc_id = %state.doc_id, error = %err, "relational document write failed; vector store remains authoritative");
        return;
    }

    for chunk in &state.chunks {
        let record = ChunkRecord {
            chunk_id: chunk.chunk_id.clone(),
            doc_id: state.doc_id.clone(),
            chunk_index: chunk.index,
            embedding_model: services.llm.model_label().to_string(),
            quality_score: 0.5,
            reindex_count: 0,
        };
        let chunk_write = services
            .tracking
            .upsert_chunk(&record)
            .or_else(|_| services.tracking.upsert_chunk(&record));
        if let Err(err) = chunk_write {
            warn!(chunk_id = %chunk.chunk_id, error = %err, "relational chunk write failed");
        }
    }
}

/// Stage 6: audit record in `document_tracking`.
#[instrument(level = "trace", skip_all, fields(doc_id = %state.doc_id))]
pub(super) async fn audit(
    mut state: IngestionState,
    services: Arc<IngestionServices>,
) -> Result<IngestionState, NodeError> {
    let tags_json = serde_json::to_string(&state.all_tags()).unwrap_or_else(|_| "[]".to_string());

    match services.tracking.record_tracking(
        &state.doc_id,
        &state.source_label,
        &state.rbac_namespace,
        "COMPLETED",
        state.chunks_saved,
        &tags_json,
    ) {
        Ok(tracking_id) => {
            state.tracking_id = Some(tracking_id);
            state.status = "completed".to_string();
        }
        Err(err) => {
            state
                .common
                .record_error(format!("Tracking update failed: {err}"));
        }
    }

    Ok(state)
}

/// Shared by the table-ingestion variant: embeds pre-built chunks and runs
/// stages 5 and 6 outside the graph.
pub(crate) async fn persist_synthetic_document(
    services: &Arc<IngestionServices>,
    config: &IngestionConfig,
    state: &mut IngestionState,
    chunks: Vec<Chunk>,
) {
    state.chunks = chunks;
    let Ok(persisted) = embed_and_persist(state.clone(), Arc::clone(services), config.clone()).await
    else {
        return;
    };
    *state = persisted;

    if let Ok(audited) = audit(state.clone(), Arc::clone(services)).await {
        *state = audited;
    }
}
