//! Directed-graph executor for the ingestion, retrieval and optimization
//! workflows. A graph is a set of named nodes (async functions over a typed
//! state), unconditional edges, and conditional edges routed by a predicate
//! over the state. Compilation validates connectivity; invocation runs nodes
//! to completion one at a time, capturing a per-node trace.

mod diagram;
mod trace;

pub use trace::{ExecutionTrace, NodeStatus, NodeTrace};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use futures::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Sentinel anchoring graph entry.
pub const START: &str = "__start__";
/// Sentinel anchoring graph exit.
pub const END: &str = "__end__";

/// Upper bound on node executions per invocation, a backstop against cyclic
/// conditional routing.
const MAX_STEPS: usize = 128;

/// Errors raised by node bodies. Nodes are expected to catch their own
/// domain failures and record them on the state; anything returned here is
/// still captured, appended to the state's error list, and execution
/// continues with the pre-node state.
pub type NodeError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("edge references unknown node '{name}' (from '{referenced_by}')")]
    UnknownNode { name: String, referenced_by: String },
    #[error("no entry edge from START")]
    MissingEntry,
    #[error("node '{0}' is unreachable from START")]
    Unreachable(String),
    #[error("node '{0}' has no path to END")]
    NoPathToEnd(String),
    #[error("node '{0}' has no outgoing transition")]
    NoOutgoing(String),
    #[error("router at '{node}' produced label '{label}' with no mapping")]
    UnknownRoute { node: String, label: String },
    #[error("step limit of {0} exceeded; conditional routing is likely cyclic")]
    StepLimitExceeded(usize),
}

/// State carried through a graph invocation. Each graph defines its own
/// struct; errors accumulate on it and define overall success.
pub trait GraphState: Clone + Serialize + Send + Sync + 'static {
    fn record_error(&mut self, error: String);
    fn errors(&self) -> &[String];
}

type NodeFn<S> = Arc<dyn Fn(S) -> BoxFuture<'static, Result<S, NodeError>> + Send + Sync>;
type RouterFn<S> = Arc<dyn Fn(&S) -> String + Send + Sync>;

struct ConditionalEdges<S> {
    router: RouterFn<S>,
    mapping: Vec<(String, String)>,
}

/// Builder for a workflow graph.
pub struct StateGraph<S> {
    name: String,
    nodes: HashMap<String, NodeFn<S>>,
    node_order: Vec<String>,
    edges: Vec<(String, String)>,
    conditional: HashMap<String, ConditionalEdges<S>>,
}

impl<S: GraphState> StateGraph<S> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: HashMap::new(),
            node_order: Vec::new(),
            edges: Vec::new(),
            conditional: HashMap::new(),
        }
    }

    /// Registers a node. Re-registering a name replaces the previous body.
    pub fn add_node<F, Fut>(&mut self, name: impl Into<String>, node: F) -> &mut Self
    where
        F: Fn(S) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<S, NodeError>> + Send + 'static,
    {
        let name = name.into();
        let wrapped: NodeFn<S> = Arc::new(move |state| {
            let fut: BoxFuture<'static, Result<S, NodeError>> = Box::pin(node(state));
            fut
        });
        if self.nodes.insert(name.clone(), wrapped).is_none() {
            self.node_order.push(name);
        }
        self
    }

    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.edges.push((from.into(), to.into()));
        self
    }

    /// Registers conditional routing out of `from`: the router maps the
    /// state to a label, resolved against `mapping` for the destination.
    pub fn add_conditional_edges<F>(
        &mut self,
        from: impl Into<String>,
        router: F,
        mapping: Vec<(&str, &str)>,
    ) -> &mut Self
    where
        F: Fn(&S) -> String + Send + Sync + 'static,
    {
        self.conditional.insert(
            from.into(),
            ConditionalEdges {
                router: Arc::new(router),
                mapping: mapping
                    .into_iter()
                    .map(|(label, dest)| (label.to_string(), dest.to_string()))
                    .collect(),
            },
        );
        self
    }

    /// Validates connectivity and returns the executable graph: every edge
    /// endpoint must exist, every node must be reachable from START, have an
    /// outgoing transition, and reach END.
    pub fn compile(self) -> Result<CompiledGraph<S>, WorkflowError> {
        let known = |name: &str| name == START || name == END || self.nodes.contains_key(name);

        for (from, to) in &self.edges {
            if !known(from) {
                return Err(WorkflowError::UnknownNode {
                    name: from.clone(),
                    referenced_by: to.clone(),
                });
            }
            if !known(to) {
                return Err(WorkflowError::UnknownNode {
                    name: to.clone(),
                    referenced_by: from.clone(),
                });
            }
        }
        for (from, cond) in &self.conditional {
            if !self.nodes.contains_key(from) {
                return Err(WorkflowError::UnknownNode {
                    name: from.clone(),
                    referenced_by: "conditional".to_string(),
                });
            }
            for (_, dest) in &cond.mapping {
                if !known(dest) {
                    return Err(WorkflowError::UnknownNode {
                        name: dest.clone(),
                        referenced_by: from.clone(),
                    });
                }
            }
        }

        // Successor map used for both traversals.
        let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
        for (from, to) in &self.edges {
            successors.entry(from.as_str()).or_default().push(to.as_str());
        }
        for (from, cond) in &self.conditional {
            let entry = successors.entry(from.as_str()).or_default();
            for (_, dest) in &cond.mapping {
                entry.push(dest.as_str());
            }
        }

        if !successors.contains_key(START) {
            return Err(WorkflowError::MissingEntry);
        }

        // Forward reachability from START.
        let mut reachable: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([START]);
        while let Some(current) = queue.pop_front() {
            if !reachable.insert(current) {
                continue;
            }
            if let Some(next) = successors.get(current) {
                for dest in next {
                    queue.push_back(*dest);
                }
            }
        }
        for name in &self.node_order {
            if !reachable.contains(name.as_str()) {
                return Err(WorkflowError::Unreachable(name.clone()));
            }
        }

        // Every node needs a way out, and a path to END.
        let mut reaches_end: HashSet<&str> = HashSet::from([END]);
        loop {
            let mut changed = false;
            for (from, next) in &successors {
                if !reaches_end.contains(from) && next.iter().any(|dest| reaches_end.contains(dest))
                {
                    reaches_end.insert(*from);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        for name in &self.node_order {
            if !successors.contains_key(name.as_str()) {
                return Err(WorkflowError::NoOutgoing(name.clone()));
            }
            if !reaches_end.contains(name.as_str()) {
                return Err(WorkflowError::NoPathToEnd(name.clone()));
            }
        }

        Ok(CompiledGraph {
            name: self.name,
            nodes: self.nodes,
            node_order: self.node_order,
            edges: self.edges,
            conditional: self.conditional,
            diagram: OnceLock::new(),
        })
    }
}

/// An executable graph. Invocations are single-threaded internally; separate
/// invocations of the same compiled graph may run concurrently.
pub struct CompiledGraph<S> {
    name: String,
    nodes: HashMap<String, NodeFn<S>>,
    node_order: Vec<String>,
    edges: Vec<(String, String)>,
    conditional: HashMap<String, ConditionalEdges<S>>,
    diagram: OnceLock<String>,
}

impl<S: GraphState> CompiledGraph<S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs the graph and returns the final state.
    pub async fn invoke(&self, state: S) -> Result<S, WorkflowError> {
        self.run(state, None).await
    }

    /// Runs the graph, capturing a per-node trace.
    pub async fn invoke_traced(&self, state: S) -> Result<(S, ExecutionTrace), WorkflowError> {
        let mut trace = ExecutionTrace::new(&self.name);
        let started = Instant::now();
        let state = self.run(state, Some(&mut trace)).await?;
        trace.total_duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok((state, trace))
    }

    async fn run(&self, mut state: S, mut trace: Option<&mut ExecutionTrace>) -> Result<S, WorkflowError> {
        let mut current = self.next_from(START, &state)?;
        let mut steps = 0usize;

        while current != END {
            steps += 1;
            if steps > MAX_STEPS {
                return Err(WorkflowError::StepLimitExceeded(MAX_STEPS));
            }

            // compile() guarantees every routed-to name is registered.
            let node = self
                .nodes
                .get(&current)
                .ok_or_else(|| WorkflowError::UnknownNode {
                    name: current.clone(),
                    referenced_by: "invoke".to_string(),
                })?;

            let before = snapshot(&state);
            let node_started = Instant::now();
            let result = node(state.clone()).await;
            let duration_ms =
                u64::try_from(node_started.elapsed().as_millis()).unwrap_or(u64::MAX);

            match result {
                Ok(next_state) => {
                    state = next_state;
                    debug!(graph = %self.name, node = %current, duration_ms, "node completed");
                    if let Some(recorder) = trace.as_deref_mut() {
                        recorder.push(NodeTrace {
                            node: current.clone(),
                            started_at: chrono::Utc::now(),
                            duration_ms,
                            status: NodeStatus::Completed,
                            state_before: before,
                            state_after: snapshot(&state),
                            error: None,
                        });
                    }
                }
                Err(err) => {
                    // Failed nodes do not halt the graph: the failure joins
                    // the state's error list and downstream nodes degrade.
                    let message = format!("{current} failed: {err}");
                    warn!(graph = %self.name, node = %current, error = %err, "node failed");
                    state.record_error(message.clone());
                    if let Some(recorder) = trace.as_deref_mut() {
                        recorder.push(NodeTrace {
                            node: current.clone(),
                            started_at: chrono::Utc::now(),
                            duration_ms,
                            status: NodeStatus::Failed,
                            state_before: before,
                            state_after: snapshot(&state),
                            error: Some(message),
                        });
                    }
                }
            }

            current = self.next_from(&current, &state)?;
        }

        Ok(state)
    }

    fn next_from(&self, from: &str, state: &S) -> Result<String, WorkflowError> {
        if let Some(cond) = self.conditional.get(from) {
            let label = (cond.router)(state);
            return cond
                .mapping
                .iter()
                .find(|(candidate, _)| candidate == &label)
                .map(|(_, dest)| dest.clone())
                .ok_or_else(|| WorkflowError::UnknownRoute {
                    node: from.to_string(),
                    label,
                });
        }

        self.edges
            .iter()
            .find(|(candidate, _)| candidate == from)
            .map(|(_, to)| to.clone())
            .ok_or_else(|| WorkflowError::NoOutgoing(from.to_string()))
    }

    /// Mermaid source for this graph, generated once per compile.
    pub fn mermaid(&self) -> &str {
        self.diagram.get_or_init(|| {
            diagram::mermaid(
                &self.name,
                &self.node_order,
                &self.edges,
                self.conditional
                    .iter()
                    .map(|(from, cond)| (from.as_str(), &cond.mapping))
                    .collect(),
            )
        })
    }
}

fn snapshot<S: Serialize>(state: &S) -> serde_json::Value {
    serde_json::to_value(state).unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Debug, Clone, Serialize, Default)]
    struct TestState {
        visited: Vec<String>,
        value: i64,
        errors: Vec<String>,
    }

    impl GraphState for TestState {
        fn record_error(&mut self, error: String) {
            self.errors.push(error);
        }

        fn errors(&self) -> &[String] {
            &self.errors
        }
    }

    fn visit(name: &'static str) -> impl Fn(TestState) -> futures::future::Ready<Result<TestState, NodeError>> {
        move |mut state: TestState| {
            state.visited.push(name.to_string());
            futures::future::ready(Ok(state))
        }
    }

    #[tokio::test]
    async fn linear_graph_runs_nodes_in_order() {
        let mut graph = StateGraph::new("linear");
        graph.add_node("a", visit("a"));
        graph.add_node("b", visit("b"));
        graph.add_edge(START, "a");
        graph.add_edge("a", "b");
        graph.add_edge("b", END);

        let compiled = graph.compile().unwrap();
        let result = compiled.invoke(TestState::default()).await.unwrap();

        assert_eq!(result.visited, vec!["a", "b"]);
        assert!(result.errors().is_empty());
    }

    #[tokio::test]
    async fn conditional_edges_route_on_state() {
        let mut graph = StateGraph::new("conditional");
        graph.add_node("check", |state: TestState| futures::future::ready(Ok(state)));
        graph.add_node("high", visit("high"));
        graph.add_node("low", visit("low"));
        graph.add_edge(START, "check");
        graph.add_conditional_edges(
            "check",
            |state: &TestState| {
                if state.value > 0 {
                    "high".to_string()
                } else {
                    "low".to_string()
                }
            },
            vec![("high", "high"), ("low", "low")],
        );
        graph.add_edge("high", END);
        graph.add_edge("low", END);

        let compiled = graph.compile().unwrap();

        let result = compiled
            .invoke(TestState {
                value: 3,
                ..TestState::default()
            })
            .await
            .unwrap();
        assert_eq!(result.visited, vec!["high"]);

        let result = compiled.invoke(TestState::default()).await.unwrap();
        assert_eq!(result.visited, vec!["low"]);
    }

    #[tokio::test]
    async fn failing_node_records_error_and_execution_continues() {
        let mut graph = StateGraph::new("failing");
        graph.add_node("boom", |_state: TestState| {
            futures::future::ready(Err::<TestState, NodeError>("deliberate failure".into()))
        });
        graph.add_node("after", visit("after"));
        graph.add_edge(START, "boom");
        graph.add_edge("boom", "after");
        graph.add_edge("after", END);

        let compiled = graph.compile().unwrap();
        let result = compiled.invoke(TestState::default()).await.unwrap();

        assert_eq!(result.visited, vec!["after"]);
        assert_eq!(result.errors().len(), 1);
        assert!(result.errors()[0].contains("deliberate failure"));
    }

    #[tokio::test]
    async fn trace_captures_status_and_durations() {
        let mut graph = StateGraph::new("traced");
        graph.add_node("ok", visit("ok"));
        graph.add_node("bad", |_state: TestState| {
            futures::future::ready(Err::<TestState, NodeError>("nope".into()))
        });
        graph.add_edge(START, "ok");
        graph.add_edge("ok", "bad");
        graph.add_edge("bad", END);

        let compiled = graph.compile().unwrap();
        let (_, trace) = compiled.invoke_traced(TestState::default()).await.unwrap();

        assert_eq!(trace.nodes.len(), 2);
        assert_eq!(trace.nodes[0].status, NodeStatus::Completed);
        assert_eq!(trace.nodes[1].status, NodeStatus::Failed);
        assert!(trace.nodes[1].error.as_deref().unwrap().contains("nope"));
        assert_eq!(trace.path(), vec!["ok", "bad"]);
    }

    #[test]
    fn compile_rejects_unreachable_node() {
        let mut graph = StateGraph::new("orphan");
        graph.add_node("a", visit("a"));
        graph.add_node("island", visit("island"));
        graph.add_edge(START, "a");
        graph.add_edge("a", END);
        graph.add_edge("island", END);

        assert!(matches!(
            graph.compile(),
            Err(WorkflowError::Unreachable(name)) if name == "island"
        ));
    }

    #[test]
    fn compile_rejects_dead_end() {
        let mut graph = StateGraph::new("dead-end");
        graph.add_node("a", visit("a"));
        graph.add_edge(START, "a");

        assert!(matches!(
            graph.compile(),
            Err(WorkflowError::NoOutgoing(name)) if name == "a"
        ));
    }

    #[test]
    fn compile_rejects_unknown_edge_target() {
        let mut graph = StateGraph::new("bad-edge");
        graph.add_node("a", visit("a"));
        graph.add_edge(START, "a");
        graph.add_edge("a", "ghost");

        assert!(matches!(
            graph.compile(),
            Err(WorkflowError::UnknownNode { name, .. }) if name == "ghost"
        ));
    }

    #[tokio::test]
    async fn unknown_route_label_is_fatal() {
        let mut graph = StateGraph::new("bad-route");
        graph.add_node("check", |state: TestState| futures::future::ready(Ok(state)));
        graph.add_node("only", visit("only"));
        graph.add_edge(START, "check");
        graph.add_conditional_edges(
            "check",
            |_: &TestState| "elsewhere".to_string(),
            vec![("known", "only")],
        );
        graph.add_edge("only", END);

        let compiled = graph.compile().unwrap();
        let result = compiled.invoke(TestState::default()).await;

        assert!(matches!(
            result,
            Err(WorkflowError::UnknownRoute { label, .. }) if label == "elsewhere"
        ));
    }

    #[tokio::test]
    async fn cyclic_routing_hits_step_limit() {
        let mut graph = StateGraph::new("cycle");
        graph.add_node("loop", |state: TestState| futures::future::ready(Ok(state)));
        graph.add_edge(START, "loop");
        graph.add_conditional_edges(
            "loop",
            |_: &TestState| "again".to_string(),
            vec![("again", "loop"), ("done", END)],
        );

        let compiled = graph.compile().unwrap();
        let result = compiled.invoke(TestState::default()).await;

        assert!(matches!(result, Err(WorkflowError::StepLimitExceeded(_))));
    }

    #[test]
    fn mermaid_is_cached_and_lists_nodes() {
        let mut graph = StateGraph::new("diagram");
        graph.add_node("a", visit("a"));
        graph.add_node("b", visit("b"));
        graph.add_edge(START, "a");
        graph.add_conditional_edges(
            "a",
            |_: &TestState| "go".to_string(),
            vec![("go", "b"), ("stop", END)],
        );
        graph.add_edge("b", END);

        let compiled = graph.compile().unwrap();
        let first = compiled.mermaid();
        assert!(first.contains("flowchart TD"));
        assert!(first.contains("a"));
        assert!(first.contains("b"));
        assert!(first.contains("-. go .->"));
        assert!(std::ptr::eq(first, compiled.mermaid()));
    }
}
