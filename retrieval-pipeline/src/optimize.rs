//! Standalone optimization workflow: derive suggested retrieval parameters
//! from recorded performance history, then stage the configuration change.
//! Parameter changes are recorded as healing intent; re-ingestion applies
//! them.

use std::sync::Arc;

use common::{
    error::AppError, modes::ResponseMode, storage::history::HistoryLog, workflow::WorkflowCommon,
};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;
use workflow_engine::{CompiledGraph, GraphState, NodeError, StateGraph, END, START};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceEntry {
    pub params: serde_json::Value,
    pub metrics: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationState {
    pub common: WorkflowCommon,
    pub performance_history: Vec<PerformanceEntry>,
    pub config_updates: serde_json::Value,
    pub optimization_result: Option<serde_json::Value>,
    pub config_result: Option<serde_json::Value>,
    pub status: String,
}

impl GraphState for OptimizationState {
    fn record_error(&mut self, error: String) {
        self.common.record_error(error);
    }

    fn errors(&self) -> &[String] {
        &self.common.errors
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub success: bool,
    pub optimization: serde_json::Value,
    pub config_applied: serde_json::Value,
    pub errors: Vec<String>,
}

/// Compiled optimization workflow: suggest_params -> apply_config.
pub struct OptimizationPipeline {
    graph: CompiledGraph<OptimizationState>,
}

impl OptimizationPipeline {
    pub fn new(history: HistoryLog) -> Result<Self, AppError> {
        let history = Arc::new(history);

        let mut graph = StateGraph::new("optimization");
        graph.add_node("suggest_params", suggest_params);

        let apply_history = Arc::clone(&history);
        graph.add_node("apply_config", move |state| {
            apply_config(state, Arc::clone(&apply_history))
        });

        graph.add_edge(START, "suggest_params");
        graph.add_edge("suggest_params", "apply_config");
        graph.add_edge("apply_config", END);

        let graph = graph.compile().map_err(|e| {
            AppError::InternalError(format!("optimization graph failed to compile: {e}"))
        })?;

        Ok(Self { graph })
    }

    pub async fn run(
        &self,
        performance_history: Vec<PerformanceEntry>,
        config_updates: serde_json::Value,
        session_id: Option<String>,
    ) -> Result<OptimizationReport, AppError> {
        let state = OptimizationState {
            common: WorkflowCommon::new(
                session_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                ResponseMode::Internal,
            ),
            performance_history,
            config_updates,
            optimization_result: None,
            config_result: None,
            status: "started".to_string(),
        };

        let result = self
            .graph
            .invoke(state)
            .await
            .map_err(|e| AppError::InternalError(format!("optimization workflow failed: {e}")))?;

        Ok(OptimizationReport {
            success: result.common.success(),
            optimization: result
                .optimization_result
                .unwrap_or(serde_json::Value::Null),
            config_applied: result.config_result.unwrap_or(serde_json::Value::Null),
            errors: result.common.errors,
        })
    }
}

/// Picks the lowest-cost entry in the performance history and suggests its
/// parameters, bounded to sane chunk sizes.
async fn suggest_params(mut state: OptimizationState) -> Result<OptimizationState, NodeError> {
    let best = state
        .performance_history
        .iter()
        .min_by(|a, b| {
            cost_of(a)
                .partial_cmp(&cost_of(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|entry| entry.params.clone());

    let suggested = match best {
        Some(params) => {
            let chunk_size = params
                .get("chunk_size")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(512)
                .clamp(256, 512);
            let top_k = params
                .get("k")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(5)
                .clamp(3, 10);
            serde_json::json!({ "chunk_size": chunk_size, "k": top_k })
        }
        None => serde_json::json!({ "chunk_size": 512, "k": 5 }),
    };

    state.optimization_result = Some(serde_json::json!({
        "suggested_params": suggested,
        "history_entries": state.performance_history.len(),
    }));
    state.status = "optimization_complete".to_string();

    Ok(state)
}

fn cost_of(entry: &PerformanceEntry) -> f64 {
    entry
        .metrics
        .get("cost")
        .and_then(serde_json::Value::as_f64)
        .unwrap_or(f64::MAX)
}

/// Stages the configuration change and records the intent as a HEAL event.
/// There is no live configuration service to push to, so the updates are
/// returned to the caller unapplied.
async fn apply_config(
    mut state: OptimizationState,
    history: Arc<HistoryLog>,
) -> Result<OptimizationState, NodeError> {
    let suggested = state
        .optimization_result
        .as_ref()
        .and_then(|r| r.get("suggested_params").cloned())
        .unwrap_or(serde_json::Value::Null);

    let metrics = serde_json::json!({
        "strategy": "OPTIMIZE",
        "suggested_params": suggested,
        "config_updates": state.config_updates,
    });
    if let Err(err) = history.log_heal(
        "system",
        None,
        &metrics.to_string(),
        "{}",
        "OPTIMIZE",
        0.0,
        "optimization_workflow",
        Some(&state.common.session_id),
    ) {
        warn!(error = %err, "failed to log optimization outcome");
    }

    state.config_result = Some(serde_json::json!({
        "applied": false,
        "staged_updates": state.config_updates,
    }));
    state.status = "completed".to_string();

    Ok(state)
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
