mod stages;
mod state;

pub use state::{OptimizationOutcome, RetrievalState, TraceSource, Traceability};

use std::path::PathBuf;
use std::sync::Arc;

use common::{
    error::AppError,
    llm::LlmService,
    modes::ResponseMode,
    storage::{history::HistoryLog, vector::VectorStore},
    workflow::WorkflowCommon,
};
use guardrails::GuardrailEngine;
use healing_agent::HealingAgent;
use tracing::{info, warn};
use uuid::Uuid;
use workflow_engine::{CompiledGraph, ExecutionTrace, StateGraph, END, START};

use crate::response::{shape_response, RagResponse};

/// External collaborators for retrieval. The healing agent is optional;
/// without it a quality heuristic drives the optimization decision.
pub struct RetrievalServices {
    pub llm: Arc<dyn LlmService>,
    pub vector: Arc<VectorStore>,
    pub history: HistoryLog,
    pub agent: Option<Arc<HealingAgent>>,
    pub guardrails: Arc<GuardrailEngine>,
}

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub trace_dir: Option<PathBuf>,
    pub graph_dir: Option<PathBuf>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            trace_dir: None,
            graph_dir: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AskRequest {
    pub question: String,
    pub doc_id: Option<String>,
    pub rbac_namespace: Option<String>,
    pub response_mode: ResponseMode,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
}

impl AskRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            doc_id: None,
            rbac_namespace: None,
            response_mode: ResponseMode::Concise,
            session_id: None,
            user_id: None,
        }
    }

    pub fn with_mode(mut self, mode: ResponseMode) -> Self {
        self.response_mode = mode;
        self
    }

    pub fn with_doc_id(mut self, doc_id: impl Into<String>) -> Self {
        self.doc_id = Some(doc_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Shaped response plus the raw state and trace, for callers that need the
/// internals (health probes, tests, the verbose renderer itself).
pub struct AskOutcome {
    pub response: RagResponse,
    pub state: RetrievalState,
    pub trace: ExecutionTrace,
}

/// Compiled retrieval workflow:
/// retrieve -> rerank -> check_optimization -> (optimize) -> answer ->
/// guardrails -> traceability.
pub struct RetrievalPipeline {
    graph: CompiledGraph<RetrievalState>,
    config: RetrievalConfig,
    model_label: String,
}

impl RetrievalPipeline {
    pub fn new(
        services: Arc<RetrievalServices>,
        config: RetrievalConfig,
    ) -> Result<Self, AppError> {
        let model_label = services.llm.model_label().to_string();
        let graph = build_graph(&services)?;
        Ok(Self {
            graph,
            config,
            model_label,
        })
    }

    pub async fn ask(&self, request: AskRequest) -> Result<RagResponse, AppError> {
        Ok(self.ask_detailed(request).await?.response)
    }

    #[tracing::instrument(skip_all, fields(mode = %request.response_mode))]
    pub async fn ask_detailed(&self, request: AskRequest) -> Result<AskOutcome, AppError> {
        let session_id = request
            .session_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut common = WorkflowCommon::new(session_id, request.response_mode);
        if let Some(user_id) = request.user_id {
            common = common.with_user(user_id);
        }

        let state = RetrievalState::new(
            common,
            request.question,
            request.doc_id,
            request.rbac_namespace,
            self.config.top_k,
        );

        let (state, trace) = self
            .graph
            .invoke_traced(state)
            .await
            .map_err(|e| AppError::InternalError(format!("retrieval workflow failed: {e}")))?;

        if let Some(dir) = &self.config.trace_dir {
            if let Err(err) = trace.write_to(dir) {
                warn!(error = %err, "failed to persist retrieval trace");
            }
        }
        if let Some(dir) = &self.config.graph_dir {
            crate::optimize::persist_diagram(dir, self.graph.name(), self.graph.mermaid());
        }

        info!(
            quality = state.retrieval_quality,
            sources = state.reranked.len(),
            optimized = state.should_optimize,
            errors = state.common.errors.len(),
            elapsed_ms = state.common.elapsed_ms(),
            "retrieval finished"
        );

        let response = shape_response(&state, &trace, &self.model_label);
        Ok(AskOutcome {
            response,
            state,
            trace,
        })
    }

    pub fn mermaid(&self) -> &str {
        self.graph.mermaid()
    }
}

fn build_graph(
    services: &Arc<RetrievalServices>,
) -> Result<CompiledGraph<RetrievalState>, AppError> {
    let mut graph = StateGraph::new("retrieval");

    let retrieve_services = Arc::clone(services);
    graph.add_node("retrieve_context", move |state| {
        stages::retrieve(state, Arc::clone(&retrieve_services))
    });

    graph.add_node("rerank_context", stages::rerank);

    let check_services = Arc::clone(services);
    graph.add_node("check_optimization", move |state| {
        stages::check_optimization(state, Arc::clone(&check_services))
    });

    let optimize_services = Arc::clone(services);
    graph.add_node("optimize_context", move |state| {
        stages::optimize(state, Arc::clone(&optimize_services))
    });

    let answer_services = Arc::clone(services);
    graph.add_node("answer_question", move |state| {
        stages::answer(state, Arc::clone(&answer_services))
    });

    let guardrail_services = Arc::clone(services);
    graph.add_node("validate_guardrails", move |state| {
        stages::validate_guardrails(state, Arc::clone(&guardrail_services))
    });

    graph.add_node("traceability", stages::traceability);

    graph.add_edge(START, "retrieve_context");
    graph.add_edge("retrieve_context", "rerank_context");
    graph.add_edge("rerank_context", "check_optimization");
    graph.add_conditional_edges(
        "check_optimization",
        stages::route_optimization,
        vec![
            ("optimize_context", "optimize_context"),
            ("answer_question", "answer_question"),
        ],
    );
    graph.add_edge("optimize_context", "answer_question");
    graph.add_edge("answer_question", "validate_guardrails");
    graph.add_edge("validate_guardrails", "traceability");
    graph.add_edge("traceability", END);

    graph
        .compile()
        .map_err(|e| AppError::InternalError(format!("retrieval graph failed to compile: {e}")))
}
