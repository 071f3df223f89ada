pub(crate) mod stages;
mod state;

pub use state::{IngestionInput, IngestionState};

use std::path::PathBuf;
use std::sync::Arc;

use common::{
    error::AppError,
    llm::LlmService,
    modes::ResponseMode,
    storage::{tracking::TrackingStore, vector::VectorStore},
    workflow::WorkflowCommon,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;
use workflow_engine::{CompiledGraph, StateGraph, END, START};

use crate::{chunking::ChunkerConfig, metadata::DocMetadata};

/// External collaborators the pipeline talks to.
pub struct IngestionServices {
    pub llm: Arc<dyn LlmService>,
    pub vector: Arc<VectorStore>,
    pub tracking: Arc<TrackingStore>,
}

#[derive(Debug, Clone, Default)]
pub struct IngestionConfig {
    pub chunker: ChunkerConfig,
    /// Per-session traces land here when set.
    pub trace_dir: Option<PathBuf>,
    /// Graph diagrams land here when set, once per process.
    pub graph_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct IngestionRequest {
    pub doc_id: String,
    pub source_label: String,
    pub input: IngestionInput,
    pub rbac_namespace: String,
    pub session_id: Option<String>,
    pub response_mode: ResponseMode,
}

impl IngestionRequest {
    pub fn text(doc_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            source_label: "document_ingestion".to_string(),
            input: IngestionInput::Text(text.into()),
            rbac_namespace: "general".to_string(),
            session_id: None,
            response_mode: ResponseMode::Concise,
        }
    }

    pub fn file(doc_id: impl Into<String>, path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            doc_id: doc_id.into(),
            source_label: path.clone(),
            input: IngestionInput::FilePath(path),
            rbac_namespace: "general".to_string(),
            session_id: None,
            response_mode: ResponseMode::Concise,
        }
    }

    pub fn with_namespace(mut self, rbac_namespace: impl Into<String>) -> Self {
        self.rbac_namespace = rbac_namespace.into();
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionReport {
    pub success: bool,
    pub doc_id: String,
    pub chunks_count: usize,
    pub chunks_saved: usize,
    pub metadata: Option<DocMetadata>,
    pub errors: Vec<String>,
}

/// Compiled ingestion workflow:
/// normalize -> classify -> metadata -> chunk -> embed+persist -> audit.
pub struct IngestionPipeline {
    graph: CompiledGraph<IngestionState>,
    config: IngestionConfig,
}

impl IngestionPipeline {
    pub fn new(
        services: Arc<IngestionServices>,
        config: IngestionConfig,
    ) -> Result<Self, AppError> {
        let graph = build_graph(&services, &config)?;
        Ok(Self { graph, config })
    }

    #[tracing::instrument(skip_all, fields(doc_id = %request.doc_id))]
    pub async fn ingest(&self, request: IngestionRequest) -> Result<IngestionReport, AppError> {
        let session_id = request
            .session_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let common = WorkflowCommon::new(session_id, request.response_mode);

        let state = IngestionState::new(
            common,
            request.doc_id,
            request.source_label,
            request.input,
            request.rbac_namespace,
        );

        let (result, trace) = self
            .graph
            .invoke_traced(state)
            .await
            .map_err(|e| AppError::InternalError(format!("ingestion workflow failed: {e}")))?;

        if let Some(dir) = &self.config.trace_dir {
            if let Err(err) = trace.write_to(dir) {
                warn!(error = %err, "failed to persist ingestion trace");
            }
        }
        if let Some(dir) = &self.config.graph_dir {
            persist_diagram(dir, self.graph.name(), self.graph.mermaid());
        }

        info!(
            doc_id = %result.doc_id,
            chunks = result.chunks.len(),
            chunks_saved = result.chunks_saved,
            errors = result.common.errors.len(),
            elapsed_ms = result.common.elapsed_ms(),
            "ingestion finished"
        );

        Ok(IngestionReport {
            success: result.common.success(),
            doc_id: result.doc_id,
            chunks_count: result.chunks.len(),
            chunks_saved: result.chunks_saved,
            metadata: result.metadata,
            errors: result.common.errors,
        })
    }

    pub fn mermaid(&self) -> &str {
        self.graph.mermaid()
    }
}

fn build_graph(
    services: &Arc<IngestionServices>,
    config: &IngestionConfig,
) -> Result<CompiledGraph<IngestionState>, AppError> {
    let mut graph = StateGraph::new("ingestion");

    graph.add_node("normalize_markdown", stages::normalize);

    let classify_services = Arc::clone(services);
    graph.add_node("classify_document", move |state| {
        stages::classify(state, Arc::clone(&classify_services))
    });

    let metadata_services = Arc::clone(services);
    graph.add_node("extract_metadata", move |state| {
        stages::metadata(state, Arc::clone(&metadata_services))
    });

    let chunk_config = config.clone();
    graph.add_node("chunk_document", move |state| {
        stages::chunk(state, chunk_config.clone())
    });

    let persist_services = Arc::clone(services);
    let persist_config = config.clone();
    graph.add_node("embed_and_persist", move |state| {
        stages::embed_and_persist(
            state,
            Arc::clone(&persist_services),
            persist_config.clone(),
        )
    });

    let audit_services = Arc::clone(services);
    graph.add_node("update_tracking", move |state| {
        stages::audit(state, Arc::clone(&audit_services))
    });

    graph.add_edge(START, "normalize_markdown");
    graph.add_edge("normalize_markdown", "classify_document");
    graph.add_edge("classify_document", "extract_metadata");
    graph.add_edge("extract_metadata", "chunk_document");
    graph.add_edge("chunk_document", "embed_and_persist");
    graph.add_edge("embed_and_persist", "update_tracking");
    graph.add_edge("update_tracking", END);

    graph
        .compile()
        .map_err(|e| AppError::InternalError(format!("ingestion graph failed to compile: {e}")))
}

pub(crate) fn persist_diagram(dir: &std::path::Path, graph_name: &str, mermaid: &str) {
    let target = dir.join(format!("{graph_name}.mmd"));
    if target.exists() {
        return;
    }
    if let Err(err) = std::fs::create_dir_all(dir).and_then(|()| std::fs::write(&target, mermaid)) {
        warn!(error = %err, "failed to persist workflow diagram");
    }
}
