use common::storage::vector::VectorHit;
use common::workflow::WorkflowCommon;
use healing_agent::{ActionKind, Recommendation};
use serde::{Deserialize, Serialize};
use workflow_engine::GraphState;

use crate::rerank::RankedChunk;

/// Outcome of the conditional optimization stage. The stage records intent
/// and surfaces suggested parameters for a later re-ingestion; it does not
/// re-embed anything in-line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationOutcome {
    pub tokens_before: usize,
    pub suggested_params: serde_json::Value,
    pub improvement_delta: f64,
    pub reward: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSource {
    pub doc_id: String,
    pub chunk_index: usize,
    pub similarity_score: f32,
    pub text_preview: String,
}

/// Provenance record for an answered question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Traceability {
    pub question: String,
    pub sources_used: usize,
    pub documents: Vec<TraceSource>,
}

/// State threaded through the retrieval graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalState {
    pub common: WorkflowCommon,
    pub question: String,
    /// Target document hint; falls back to the top reranked source.
    pub doc_id: Option<String>,
    pub rbac_namespace: Option<String>,
    pub top_k: usize,
    pub context: Vec<VectorHit>,
    pub reranked: Vec<RankedChunk>,
    pub retrieval_quality: f32,
    pub should_optimize: bool,
    pub optimization_reason: String,
    pub rl_action: Option<ActionKind>,
    pub recommendation: Option<Recommendation>,
    pub optimization: Option<OptimizationOutcome>,
    pub answer: String,
    pub guardrails_applied: bool,
    pub is_response_safe: bool,
    pub guardrail_report: Option<guardrails::GuardrailReport>,
    pub traceability: Option<Traceability>,
    pub status: String,
}

impl RetrievalState {
    pub fn new(
        common: WorkflowCommon,
        question: impl Into<String>,
        doc_id: Option<String>,
        rbac_namespace: Option<String>,
        top_k: usize,
    ) -> Self {
        Self {
            common,
            question: question.into(),
            doc_id,
            rbac_namespace,
            top_k: top_k.max(1),
            context: Vec::new(),
            reranked: Vec::new(),
            retrieval_quality: 0.0,
            should_optimize: false,
            optimization_reason: String::new(),
            rl_action: None,
            recommendation: None,
            optimization: None,
            answer: String::new(),
            guardrails_applied: false,
            is_response_safe: true,
            guardrail_report: None,
            traceability: None,
            status: "started".to_string(),
        }
    }

    /// The doc id this query should be attributed to in the history log.
    pub fn target_doc_id(&self) -> String {
        self.doc_id
            .clone()
            .or_else(|| {
                self.reranked
                    .first()
                    .map(|chunk| chunk.metadata.doc_id.clone())
            })
            .unwrap_or_else(|| "unknown".to_string())
    }
}

impl GraphState for RetrievalState {
    fn record_error(&mut self, error: String) {
        self.common.record_error(error);
    }

    fn errors(&self) -> &[String] {
        &self.common.errors
    }
}
