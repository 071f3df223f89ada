//! Response-mode shaping. The same final workflow state renders into three
//! profiles: `concise` for end users, `internal` for system integration,
//! and `verbose` for engineers (full sources, traceability, RL internals,
//! raw answer).

use chrono::Utc;
use common::modes::ResponseMode;
use healing_agent::{ActionKind, Recommendation};
use serde::Serialize;
use workflow_engine::ExecutionTrace;

use crate::pipeline::{OptimizationOutcome, RetrievalState, Traceability};
use crate::rerank::RankedChunk;

#[derive(Debug, Clone, Serialize)]
pub struct SourceDoc {
    pub doc_id: String,
    pub chunk_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConciseResponse {
    pub success: bool,
    pub question: String,
    pub answer: String,
    pub session_id: String,
    pub guardrails_applied: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseMetadata {
    pub session_id: String,
    pub timestamp: String,
    pub model: String,
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InternalResponse {
    pub success: bool,
    pub question: String,
    pub answer: String,
    pub session_id: String,
    pub quality_score: f32,
    pub sources_count: usize,
    pub source_docs: Vec<SourceDoc>,
    pub metadata: ResponseMetadata,
    pub guardrails_applied: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerboseResponse {
    pub success: bool,
    pub question: String,
    pub answer: String,
    pub session_id: String,
    pub quality_score: f32,
    pub sources_count: usize,
    pub source_docs: Vec<SourceDoc>,
    pub sources: Vec<RankedChunk>,
    pub traceability: Option<Traceability>,
    pub optimization_applied: bool,
    pub optimization_reason: String,
    pub rl_action: Option<ActionKind>,
    pub rl_recommendation: Option<Recommendation>,
    pub optimization_result: Option<OptimizationOutcome>,
    pub metadata: ResponseMetadata,
    pub visualization: serde_json::Value,
    pub guardrails_applied: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RagResponse {
    Concise(ConciseResponse),
    Internal(InternalResponse),
    Verbose(VerboseResponse),
}

impl RagResponse {
    pub fn success(&self) -> bool {
        match self {
            Self::Concise(r) => r.success,
            Self::Internal(r) => r.success,
            Self::Verbose(r) => r.success,
        }
    }

    pub fn answer(&self) -> &str {
        match self {
            Self::Concise(r) => &r.answer,
            Self::Internal(r) => &r.answer,
            Self::Verbose(r) => &r.answer,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::Concise(r) => &r.session_id,
            Self::Internal(r) => &r.session_id,
            Self::Verbose(r) => &r.session_id,
        }
    }

    pub fn errors(&self) -> &[String] {
        match self {
            Self::Concise(r) => &r.errors,
            Self::Internal(r) => &r.errors,
            Self::Verbose(r) => &r.errors,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

pub(crate) fn shape_response(
    state: &RetrievalState,
    trace: &ExecutionTrace,
    model: &str,
) -> RagResponse {
    let success = state.common.success();
    let session_id = state.common.session_id.clone();
    let execution_time_ms = state.common.elapsed_ms();

    let source_docs: Vec<SourceDoc> = state
        .reranked
        .iter()
        .map(|chunk| SourceDoc {
            doc_id: chunk.metadata.doc_id.clone(),
            chunk_id: chunk.chunk_id(),
        })
        .collect();

    let metadata = ResponseMetadata {
        session_id: session_id.clone(),
        timestamp: Utc::now().to_rfc3339(),
        model: model.to_string(),
        execution_time_ms,
    };

    match state.common.response_mode {
        ResponseMode::Concise => RagResponse::Concise(ConciseResponse {
            success,
            question: state.question.clone(),
            answer: extract_plain_answer(&state.answer),
            session_id,
            guardrails_applied: state.guardrails_applied,
            errors: state.common.errors.clone(),
        }),
        ResponseMode::Internal => RagResponse::Internal(InternalResponse {
            success,
            question: state.question.clone(),
            answer: extract_plain_answer(&state.answer),
            session_id,
            quality_score: state.retrieval_quality,
            sources_count: state.reranked.len(),
            source_docs,
            metadata,
            guardrails_applied: state.guardrails_applied,
            errors: state.common.errors.clone(),
        }),
        ResponseMode::Verbose => RagResponse::Verbose(VerboseResponse {
            success,
            question: state.question.clone(),
            // Verbose is the raw engineering view: no extraction, no
            // guardrails.
            answer: state.answer.clone(),
            session_id,
            quality_score: state.retrieval_quality,
            sources_count: state.reranked.len(),
            source_docs,
            sources: state.reranked.clone(),
            traceability: state.traceability.clone(),
            optimization_applied: state.should_optimize,
            optimization_reason: state.optimization_reason.clone(),
            rl_action: state.rl_action,
            rl_recommendation: state.recommendation.clone(),
            optimization_result: state.optimization.clone(),
            metadata,
            visualization: trace.to_json(),
            guardrails_applied: false,
            errors: state.common.errors.clone(),
        }),
    }
}

/// Models occasionally wrap the answer in a JSON object; user-facing modes
/// unwrap it back to plain text.
fn extract_plain_answer(answer: &str) -> String {
    let trimmed = answer.trim();
    if trimmed.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
            if let Some(inner) = value.get("answer").and_then(|a| a.as_str()) {
                return inner.to_string();
            }
        }
    }
    answer.to_string()
}
