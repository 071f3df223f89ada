use common::workflow::WorkflowCommon;
use serde::{Deserialize, Serialize};
use workflow_engine::GraphState;

use crate::{chunking::Chunk, classify::Classification, metadata::DocMetadata};

/// Raw ingestion input before normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IngestionInput {
    FilePath(String),
    Text(String),
}

/// State threaded through the ingestion graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionState {
    pub common: WorkflowCommon,
    pub doc_id: String,
    /// Where the content came from, recorded in the audit trail.
    pub source_label: String,
    pub input: IngestionInput,
    pub rbac_namespace: String,
    pub markdown: Option<String>,
    pub classification: Option<Classification>,
    pub metadata: Option<DocMetadata>,
    pub chunks: Vec<Chunk>,
    pub chunks_saved: usize,
    pub tracking_id: Option<i64>,
    pub status: String,
}

impl IngestionState {
    pub fn new(
        common: WorkflowCommon,
        doc_id: impl Into<String>,
        source_label: impl Into<String>,
        input: IngestionInput,
        rbac_namespace: impl Into<String>,
    ) -> Self {
        Self {
            common,
            doc_id: doc_id.into(),
            source_label: source_label.into(),
            input,
            rbac_namespace: rbac_namespace.into(),
            markdown: None,
            classification: None,
            metadata: None,
            chunks: Vec::new(),
            chunks_saved: 0,
            tracking_id: None,
            status: "started".to_string(),
        }
    }

    /// Combined classification and RBAC/meta tag set for vector metadata.
    pub fn all_tags(&self) -> Vec<String> {
        self.classification
            .as_ref()
            .map(|c| {
                c.rbac_tags
                    .iter()
                    .chain(c.meta_tags.iter())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl GraphState for IngestionState {
    fn record_error(&mut self, error: String) {
        self.common.record_error(error);
    }

    fn errors(&self) -> &[String] {
        &self.common.errors
    }
}
