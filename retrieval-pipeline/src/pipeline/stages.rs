use std::sync::Arc;

use healing_agent::ActionKind;
use tracing::{debug, instrument, warn};
use workflow_engine::NodeError;

use crate::rerank::rerank_hits;

use super::{
    state::{OptimizationOutcome, RetrievalState, TraceSource, Traceability},
    RetrievalServices,
};

const RAG_AGENT_ID: &str = "rag_agent";
/// Placeholder estimates until healing outcomes are measured; see the
/// reward derivation note in DESIGN.md.
const OPTIMIZE_IMPROVEMENT_DELTA: f64 = 0.15;
const OPTIMIZE_PLACEHOLDER_REWARD: f64 = 0.12;
/// Rough chars-per-token ratio used for context cost estimates.
const CHARS_PER_TOKEN: usize = 4;

pub(super) const NO_CONTEXT_ANSWER: &str = "No context available to answer the question.";

/// Stage 1: embed the question and query the vector store.
#[instrument(level = "trace", skip_all, fields(session_id = %state.common.session_id))]
pub(super) async fn retrieve(
    mut state: RetrievalState,
    services: Arc<RetrievalServices>,
) -> Result<RetrievalState, NodeError> {
    let embedded = services.llm.generate_embedding(&state.question).await;

    let hits = match embedded {
        Ok(embedding) => {
            services
                .vector
                .query(embedding, state.top_k, state.rbac_namespace.as_deref())
                .await
        }
        Err(err) => Err(err),
    };

    match hits {
        Ok(hits) => {
            state.retrieval_quality = quality_of(hits.len(), state.top_k);
            debug!(
                hits = hits.len(),
                quality = state.retrieval_quality,
                "context retrieved"
            );
            state.context = hits;
            state.status = "context_retrieved".to_string();
        }
        Err(err) => {
            state.retrieval_quality = 0.0;
            state
                .common
                .record_error(format!("Context retrieval failed: {err}"));
        }
    }

    Ok(state)
}

/// Stage 2: local relevance rerank.
#[instrument(level = "trace", skip_all, fields(session_id = %state.common.session_id))]
pub(super) async fn rerank(mut state: RetrievalState) -> Result<RetrievalState, NodeError> {
    state.reranked = rerank_hits(state.context.clone());
    state.status = "context_reranked".to_string();
    Ok(state)
}

/// Stage 3: healing decision. The agent recommends an action for the target
/// document; without an agent a quality heuristic decides.
#[instrument(level = "trace", skip_all, fields(session_id = %state.common.session_id))]
pub(super) async fn check_optimization(
    mut state: RetrievalState,
    services: Arc<RetrievalServices>,
) -> Result<RetrievalState, NodeError> {
    let num_results = state.reranked.len();
    let quality = quality_of(num_results, state.top_k);
    state.retrieval_quality = quality;

    let agent_decision = services.agent.as_ref().and_then(|agent| {
        match agent.recommend(&state.target_doc_id(), f64::from(quality)) {
            Ok(recommendation) => Some(recommendation),
            Err(err) => {
                warn!(error = %err, "healing agent failed; falling back to heuristic");
                None
            }
        }
    });

    match agent_decision {
        Some(recommendation) => {
            state.should_optimize = recommendation.action.action != ActionKind::Skip;
            state.optimization_reason = recommendation.reasoning.clone();
            state.rl_action = Some(recommendation.action.action);
            state.recommendation = Some(recommendation);
        }
        None => {
            state.should_optimize = quality < 0.6 || num_results < 3;
            state.optimization_reason = format!("Quality={quality:.2}, Results={num_results}");
            state.rl_action = state.should_optimize.then_some(ActionKind::Optimize);
        }
    }

    state.status = "optimization_checked".to_string();
    Ok(state)
}

pub(super) fn route_optimization(state: &RetrievalState) -> String {
    if state.should_optimize {
        "optimize_context".to_string()
    } else {
        "answer_question".to_string()
    }
}

/// Stage 4 (conditional): record healing intent. Suggested chunking
/// parameters are surfaced for downstream re-ingestion; nothing is
/// re-embedded here.
#[instrument(level = "trace", skip_all, fields(session_id = %state.common.session_id))]
pub(super) async fn optimize(
    mut state: RetrievalState,
    services: Arc<RetrievalServices>,
) -> Result<RetrievalState, NodeError> {
    let total_chars: usize = state.reranked.iter().map(|c| c.text_length).sum();
    let tokens_before = total_chars / CHARS_PER_TOKEN;

    let suggested_params = state
        .recommendation
        .as_ref()
        .filter(|r| r.action.action == ActionKind::Optimize)
        .map(|r| r.action.params.clone())
        .unwrap_or_else(|| {
            let chunk_size: usize = if state.retrieval_quality < 0.6 { 256 } else { 384 };
            serde_json::json!({
                "new_chunk_size": chunk_size,
                "new_overlap": chunk_size / 10,
                "strategy": "recursive_splitter",
            })
        });

    let action = state.rl_action.unwrap_or(ActionKind::Optimize);
    let quality = f64::from(state.retrieval_quality);

    let metrics = serde_json::json!({
        "strategy": action.as_str(),
        "before_metrics": { "avg_quality": quality, "total_chunks": state.reranked.len() },
        "after_metrics": { "avg_quality": (quality + OPTIMIZE_IMPROVEMENT_DELTA).min(1.0) },
        "improvement_delta": OPTIMIZE_IMPROVEMENT_DELTA,
        "cost_tokens": tokens_before,
        "duration_ms": 0,
    });
    let context = serde_json::json!({
        "reason": state.optimization_reason,
        "alternatives_considered": ActionKind::ALL
            .iter()
            .filter(|k| **k != action)
            .map(|k| k.as_str())
            .collect::<Vec<_>>(),
        "expected_reward": state
            .recommendation
            .as_ref()
            .map_or(0.0, |r| r.action.estimated_improvement),
    });

    let target_chunk = state
        .reranked
        .first()
        .map(crate::rerank::RankedChunk::chunk_id);
    if let Err(err) = services.history.log_heal(
        &state.target_doc_id(),
        target_chunk.as_deref(),
        &metrics.to_string(),
        &context.to_string(),
        action.as_str(),
        OPTIMIZE_PLACEHOLDER_REWARD,
        RAG_AGENT_ID,
        Some(&state.common.session_id),
    ) {
        warn!(error = %err, "failed to log healing intent");
    }

    // Close the learning loop: the agent that recommended the action sees
    // the placeholder reward and decays its exploration rate.
    if let Some(agent) = &services.agent {
        let observed = state.recommendation.as_ref().map_or_else(
            || {
                healing_agent::HealingAction {
                    action,
                    params: suggested_params.clone(),
                    estimated_improvement: OPTIMIZE_IMPROVEMENT_DELTA,
                    estimated_cost: 0.0,
                    confidence: 0.5,
                }
            },
            |r| r.action.clone(),
        );
        if let Err(err) = agent.observe_reward(
            &observed,
            OPTIMIZE_PLACEHOLDER_REWARD,
            Some(&state.common.session_id),
        ) {
            warn!(error = %err, "failed to record reward observation");
        }
    }

    state.optimization = Some(OptimizationOutcome {
        tokens_before,
        suggested_params,
        improvement_delta: OPTIMIZE_IMPROVEMENT_DELTA,
        reward: OPTIMIZE_PLACEHOLDER_REWARD,
    });
    state.status = "optimized".to_string();

    Ok(state)
}

/// Stage 5: synthesize the answer from the top reranked chunks and log the
/// QUERY event.
#[instrument(level = "trace", skip_all, fields(session_id = %state.common.session_id))]
pub(super) async fn answer(
    mut state: RetrievalState,
    services: Arc<RetrievalServices>,
) -> Result<RetrievalState, NodeError> {
    if state.reranked.is_empty() {
        state.answer = NO_CONTEXT_ANSWER.to_string();
    } else {
        let context_text = state
            .reranked
            .iter()
            .map(|chunk| format!("[Source: {}]\n{}", chunk.metadata.doc_id, chunk.text))
            .collect::<Vec<_>>()
            .join("\n\n");

        let prompt = format!(
            "Based on the following context, answer the question concisely.\n\n\
             Context:\n{context_text}\n\nQuestion: {}\n\nAnswer:",
            state.question
        );

        match services.llm.generate_response(&prompt).await {
            Ok(answer) => {
                state.answer = answer;
                state.status = "answer_generated".to_string();
            }
            Err(err) => {
                state.answer = "Failed to generate answer".to_string();
                state
                    .common
                    .record_error(format!("Answer generation failed: {err}"));
            }
        }
    }

    log_query_event(&state, &services);

    Ok(state)
}

fn log_query_event(state: &RetrievalState, services: &Arc<RetrievalServices>) {
    let quality = f64::from(state.retrieval_quality);
    let metrics = serde_json::json!({
        "frequency": 1,
        "avg_accuracy": quality,
        "cost_tokens": state.question.split_whitespace().count() * 10,
        "latency_ms": 0,
        "user_feedback": 0.7,
        "quality_category": if quality > 0.6 { "warm" } else { "cold" },
        "sources_count": state.reranked.len(),
        "response_mode": state.common.response_mode,
    });
    let context = serde_json::json!({
        "retrieval_quality": quality,
        "sources": state.reranked.len(),
        "answer_length": state.answer.split_whitespace().count(),
        "response_mode": state.common.response_mode,
    });

    if let Err(err) = services.history.log_query(
        &state.question,
        &state.target_doc_id(),
        &metrics.to_string(),
        &context.to_string(),
        RAG_AGENT_ID,
        state.common.user_id.as_deref(),
        Some(&state.common.session_id),
    ) {
        warn!(error = %err, "failed to log query event");
    }
}

/// Stage 6: guardrail validation. Verbose mode skips validation entirely;
/// concise and internal run the pattern sweep and accept redactions.
#[instrument(level = "trace", skip_all, fields(session_id = %state.common.session_id))]
pub(super) async fn validate_guardrails(
    mut state: RetrievalState,
    services: Arc<RetrievalServices>,
) -> Result<RetrievalState, NodeError> {
    if !state.common.response_mode.validates_output() {
        state.guardrails_applied = false;
        state.is_response_safe = true;
        state.status = "guardrails_skipped".to_string();
        return Ok(state);
    }

    let report = services
        .guardrails
        .process_request(&state.question, &state.answer);

    if let Some(filtered) = &report.filtered_output {
        state.answer = filtered.clone();
    }
    state.guardrails_applied = true;
    state.is_response_safe = report.is_safe;

    if let Err(err) = services.history.log_guardrail_check(
        &state.target_doc_id(),
        &report.to_json().to_string(),
        report.is_safe,
        RAG_AGENT_ID,
        Some(&state.common.session_id),
    ) {
        warn!(error = %err, "failed to log guardrail check");
    }

    state.guardrail_report = Some(report);
    state.status = "guardrails_validated".to_string();

    Ok(state)
}

/// Stage 7: provenance record over the reranked sources.
#[instrument(level = "trace", skip_all, fields(session_id = %state.common.session_id))]
pub(super) async fn traceability(mut state: RetrievalState) -> Result<RetrievalState, NodeError> {
    let documents = state
        .reranked
        .iter()
        .map(|chunk| TraceSource {
            doc_id: chunk.metadata.doc_id.clone(),
            chunk_index: chunk.metadata.chunk_index,
            similarity_score: chunk.similarity,
            text_preview: preview(&chunk.text, 100),
        })
        .collect::<Vec<_>>();

    state.traceability = Some(Traceability {
        question: state.question.clone(),
        sources_used: documents.len(),
        documents,
    });
    state.status = "completed".to_string();

    Ok(state)
}

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{truncated}...")
}

fn quality_of(num_results: usize, top_k: usize) -> f32 {
    (num_results as f32 / top_k.max(1) as f32).min(1.0)
}
