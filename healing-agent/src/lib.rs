//! Reinforcement-learning healing agent. Chooses among four corrective
//! actions with an ε-greedy policy: explore uniformly with probability ε,
//! otherwise exploit the action whose historical average reward plus a
//! state-conditional adjustment scores highest. Rewards decay ε toward a
//! floor of 0.05.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use common::{
    error::AppError,
    storage::{history::HistoryLog, tracking::TrackingStore},
};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const AGENT_ID: &str = "healing_agent";
const EPSILON_FLOOR: f64 = 0.05;
const EPSILON_DECAY: f64 = 0.995;
const DEFAULT_EPSILON: f64 = 0.3;

/// The finite action space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    Skip,
    Optimize,
    Reindex,
    ReEmbed,
}

impl ActionKind {
    pub const ALL: [Self; 4] = [Self::Skip, Self::Optimize, Self::Reindex, Self::ReEmbed];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Skip => "SKIP",
            Self::Optimize => "OPTIMIZE",
            Self::Reindex => "REINDEX",
            Self::ReEmbed => "RE_EMBED",
        }
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SKIP" => Ok(Self::Skip),
            "OPTIMIZE" => Ok(Self::Optimize),
            "REINDEX" => Ok(Self::Reindex),
            "RE_EMBED" => Ok(Self::ReEmbed),
            other => Err(format!("unknown healing action: {other}")),
        }
    }
}

/// System state the agent conditions its choice on, assembled from the
/// tracking database for the target document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RlState {
    pub quality_score: f64,
    pub query_accuracy: f64,
    pub chunk_count: usize,
    pub avg_token_cost: f64,
    pub reindex_count: i64,
    pub last_healing_delta: f64,
    pub query_frequency: usize,
    pub user_feedback: f64,
}

impl RlState {
    pub fn defaults_for(quality_score: f64) -> Self {
        Self {
            quality_score,
            query_accuracy: 0.7,
            chunk_count: 0,
            avg_token_cost: 1000.0,
            reindex_count: 0,
            last_healing_delta: 0.1,
            query_frequency: 0,
            user_feedback: 0.7,
        }
    }
}

/// A chosen action with its parameters and estimates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingAction {
    pub action: ActionKind,
    pub params: serde_json::Value,
    pub estimated_improvement: f64,
    pub estimated_cost: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ActionStats {
    pub count: u64,
    pub total_reward: f64,
    pub avg_reward: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionReport {
    pub count: u64,
    pub percentage: f64,
    pub avg_reward: f64,
    pub total_reward: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningStats {
    pub total_decisions: u64,
    pub epsilon: f64,
    pub actions: BTreeMap<String, ActionReport>,
    pub best_action: Option<ActionKind>,
}

/// Full recommendation returned for a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub doc_id: String,
    pub current_quality: f64,
    pub action: HealingAction,
    pub reasoning: String,
    pub learning_stats: LearningStats,
}

struct Learning {
    stats: BTreeMap<ActionKind, ActionStats>,
    epsilon: f64,
}

/// Per-process agent; the action history and ε live behind one mutex, the
/// history log is the only cross-process coordination point.
pub struct HealingAgent {
    learning: Mutex<Learning>,
    tracking: Arc<TrackingStore>,
    history: HistoryLog,
    alternate_embedding_model: String,
}

impl HealingAgent {
    pub fn new(
        tracking: Arc<TrackingStore>,
        history: HistoryLog,
        alternate_embedding_model: impl Into<String>,
    ) -> Self {
        Self::with_epsilon(
            tracking,
            history,
            alternate_embedding_model,
            DEFAULT_EPSILON,
        )
    }

    pub fn with_epsilon(
        tracking: Arc<TrackingStore>,
        history: HistoryLog,
        alternate_embedding_model: impl Into<String>,
        initial_epsilon: f64,
    ) -> Self {
        Self {
            learning: Mutex::new(Learning {
                stats: ActionKind::ALL
                    .into_iter()
                    .map(|kind| (kind, ActionStats::default()))
                    .collect(),
                epsilon: initial_epsilon.clamp(0.0, 1.0),
            }),
            tracking,
            history,
            alternate_embedding_model: alternate_embedding_model.into(),
        }
    }

    fn learning(&self) -> Result<std::sync::MutexGuard<'_, Learning>, AppError> {
        self.learning
            .lock()
            .map_err(|_| AppError::InternalError("healing agent mutex poisoned".into()))
    }

    pub fn epsilon(&self) -> f64 {
        self.learning().map(|l| l.epsilon).unwrap_or(EPSILON_FLOOR)
    }

    /// ε-greedy selection over the action space.
    pub fn decide_action(&self, state: &RlState) -> Result<HealingAction, AppError> {
        let (epsilon, kind) = {
            let learning = self.learning()?;
            let mut rng = rand::thread_rng();
            if rng.gen::<f64>() < learning.epsilon {
                let kind = *ActionKind::ALL
                    .choose(&mut rng)
                    .unwrap_or(&ActionKind::Skip);
                (learning.epsilon, kind)
            } else {
                (learning.epsilon, Self::best_of(&learning.stats, state))
            }
        };

        debug!(action = kind.as_str(), epsilon, "healing action selected");
        Ok(self.action_details(kind, state))
    }

    /// Greedy (ε = 0) choice, exposed for evaluation.
    pub fn best_action(&self, state: &RlState) -> Result<ActionKind, AppError> {
        Ok(Self::best_of(&self.learning()?.stats, state))
    }

    fn best_of(stats: &BTreeMap<ActionKind, ActionStats>, state: &RlState) -> ActionKind {
        let mut best = ActionKind::Skip;
        let mut best_score = f64::NEG_INFINITY;
        for kind in ActionKind::ALL {
            let score = match stats.get(&kind) {
                // Cold start: neutral score, no state adjustment.
                None => 0.5,
                Some(s) if s.count == 0 => 0.5,
                Some(s) => s.avg_reward + Self::adjustment(kind, state),
            };
            if score > best_score {
                best_score = score;
                best = kind;
            }
        }
        best
    }

    fn adjustment(kind: ActionKind, state: &RlState) -> f64 {
        match kind {
            ActionKind::Skip => {
                if state.quality_score > 0.75 {
                    1.0
                } else {
                    -1.0
                }
            }
            ActionKind::Optimize => {
                if state.quality_score < 0.6 && state.avg_token_cost < 2000.0 {
                    1.5
                } else if state.quality_score < 0.6 {
                    0.8
                } else {
                    -0.5
                }
            }
            ActionKind::Reindex => {
                if state.reindex_count < 3 {
                    if state.quality_score < 0.65 {
                        1.0
                    } else {
                        -0.5
                    }
                } else {
                    -1.0
                }
            }
            ActionKind::ReEmbed => {
                if state.quality_score < 0.5 {
                    2.0
                } else if state.avg_token_cost < 1000.0 {
                    0.5
                } else {
                    -1.5
                }
            }
        }
    }

    /// Parameters and estimates for a chosen action.
    pub fn action_details(&self, kind: ActionKind, state: &RlState) -> HealingAction {
        match kind {
            ActionKind::Skip => HealingAction {
                action: kind,
                params: serde_json::json!({}),
                estimated_improvement: 0.0,
                estimated_cost: 0.0,
                confidence: if state.quality_score > 0.75 { 0.95 } else { 0.5 },
            },
            ActionKind::Optimize => {
                let (suggested_size, improvement, confidence) = if state.quality_score < 0.6 {
                    (256usize, 0.15, 0.82)
                } else {
                    (384usize, 0.08, 0.70)
                };
                HealingAction {
                    action: kind,
                    params: serde_json::json!({
                        "new_chunk_size": suggested_size,
                        "new_overlap": suggested_size / 10,
                        "strategy": "recursive_splitter",
                    }),
                    estimated_improvement: improvement,
                    estimated_cost: 500.0,
                    confidence,
                }
            }
            ActionKind::Reindex => HealingAction {
                action: kind,
                params: serde_json::json!({
                    "clear_cache": true,
                    "recompute_embeddings": true,
                }),
                estimated_improvement: if state.reindex_count < 2 { 0.12 } else { 0.05 },
                estimated_cost: 300.0,
                confidence: if state.reindex_count < 2 { 0.75 } else { 0.55 },
            },
            ActionKind::ReEmbed => HealingAction {
                action: kind,
                params: serde_json::json!({
                    "new_model": self.alternate_embedding_model,
                    "preserve_old_embeddings": true,
                }),
                estimated_improvement: 0.25,
                estimated_cost: 800.0,
                confidence: 0.68,
            },
        }
    }

    /// Updates the action history with an observed reward, decays ε, and
    /// appends a HEAL event carrying the learning snapshot.
    pub fn observe_reward(
        &self,
        action: &HealingAction,
        reward: f64,
        session_id: Option<&str>,
    ) -> Result<(), AppError> {
        let (snapshot, epsilon) = {
            let mut learning = self.learning()?;
            {
                let stats = learning.stats.entry(action.action).or_default();
                stats.count += 1;
                stats.total_reward += reward;
                stats.avg_reward = stats.total_reward / stats.count as f64;
            }
            learning.epsilon = EPSILON_FLOOR.max(learning.epsilon * EPSILON_DECAY);
            (learning.stats.clone(), learning.epsilon)
        };

        let metrics = serde_json::json!({
            "action": action.action,
            "params": action.params,
            "estimated_improvement": action.estimated_improvement,
            "confidence": action.confidence,
        });
        let context = serde_json::json!({
            "reward_achieved": reward,
            "q_values": snapshot
                .iter()
                .map(|(kind, stats)| (kind.as_str().to_string(), stats))
                .collect::<BTreeMap<_, _>>(),
            "epsilon": epsilon,
        });

        if let Err(err) = self.history.log_heal(
            "system",
            None,
            &metrics.to_string(),
            &context.to_string(),
            action.action.as_str(),
            reward,
            AGENT_ID,
            session_id,
        ) {
            warn!(error = %err, "failed to log reward observation");
        }

        Ok(())
    }

    pub fn learning_stats(&self) -> LearningStats {
        let Ok(learning) = self.learning() else {
            return LearningStats {
                total_decisions: 0,
                epsilon: EPSILON_FLOOR,
                actions: BTreeMap::new(),
                best_action: None,
            };
        };

        let total: u64 = learning.stats.values().map(|s| s.count).sum();
        let actions = learning
            .stats
            .iter()
            .map(|(kind, stats)| {
                (
                    kind.as_str().to_string(),
                    ActionReport {
                        count: stats.count,
                        percentage: if total > 0 {
                            stats.count as f64 / total as f64 * 100.0
                        } else {
                            0.0
                        },
                        avg_reward: stats.avg_reward,
                        total_reward: stats.total_reward,
                    },
                )
            })
            .collect();

        let best_action = learning
            .stats
            .iter()
            .filter(|(_, stats)| stats.count > 0)
            .max_by(|a, b| {
                a.1.avg_reward
                    .partial_cmp(&b.1.avg_reward)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(kind, _)| *kind);

        LearningStats {
            total_decisions: total,
            epsilon: learning.epsilon,
            actions,
            best_action,
        }
    }

    /// Healing recommendation for one document: builds the state from the
    /// tracking database, picks an action, and attaches reasoning plus the
    /// current learning statistics.
    pub fn recommend(&self, doc_id: &str, current_quality: f64) -> Result<Recommendation, AppError> {
        let state = self.build_state(doc_id, current_quality);
        let action = self.decide_action(&state)?;
        let reasoning = reasoning_for(action.action).to_string();

        Ok(Recommendation {
            doc_id: doc_id.to_string(),
            current_quality,
            action,
            reasoning,
            learning_stats: self.learning_stats(),
        })
    }

    /// Joins document, chunk and query-history aggregates; falls back to a
    /// neutral state when the document has no footprint yet.
    pub fn build_state(&self, doc_id: &str, current_quality: f64) -> RlState {
        let chunk_stats = self.tracking.chunk_stats(doc_id).unwrap_or_default();
        let query_stats = self.tracking.query_stats(doc_id).unwrap_or_default();

        RlState {
            quality_score: current_quality,
            query_accuracy: query_stats.avg_accuracy.unwrap_or(0.7),
            chunk_count: chunk_stats.chunk_count,
            avg_token_cost: query_stats.avg_cost_tokens.unwrap_or(1000.0),
            reindex_count: chunk_stats.avg_reindex_count.round() as i64,
            last_healing_delta: 0.1,
            query_frequency: query_stats.query_count,
            user_feedback: query_stats.avg_user_feedback.unwrap_or(0.7),
        }
    }
}

const fn reasoning_for(kind: ActionKind) -> &'static str {
    match kind {
        ActionKind::Skip => "System quality is good. No action needed.",
        ActionKind::Optimize => {
            "Quality is below target. Optimizing chunk parameters for better retrieval."
        }
        ActionKind::Reindex => "Regenerating embeddings to refresh semantic understanding.",
        ActionKind::ReEmbed => "Switching embedding model for better quality understanding.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::history::EventType;

    fn test_agent() -> HealingAgent {
        let tracking = Arc::new(TrackingStore::in_memory().unwrap());
        let history = HistoryLog::new(Arc::clone(&tracking));
        HealingAgent::new(tracking, history, "alternate-embedder")
    }

    fn observe(agent: &HealingAgent, kind: ActionKind, reward: f64, times: usize) {
        let state = RlState::defaults_for(0.5);
        let action = agent.action_details(kind, &state);
        for _ in 0..times {
            agent.observe_reward(&action, reward, Some("test")).unwrap();
        }
    }

    #[test]
    fn converges_to_optimize_after_rewards() {
        let agent = test_agent();

        observe(&agent, ActionKind::Optimize, 0.2, 25);
        observe(&agent, ActionKind::ReEmbed, -0.1, 25);
        observe(&agent, ActionKind::Skip, 0.0, 25);
        observe(&agent, ActionKind::Reindex, -0.05, 25);

        let state = RlState {
            quality_score: 0.55,
            avg_token_cost: 1500.0,
            reindex_count: 0,
            ..RlState::defaults_for(0.55)
        };

        assert_eq!(agent.best_action(&state).unwrap(), ActionKind::Optimize);

        let epsilon = agent.epsilon();
        assert!(epsilon >= EPSILON_FLOOR);
        assert!(epsilon <= DEFAULT_EPSILON * EPSILON_DECAY.powi(100) + 1e-9);
    }

    #[test]
    fn epsilon_never_falls_below_floor_and_never_increases() {
        let agent = test_agent();
        let mut previous = agent.epsilon();

        let state = RlState::defaults_for(0.5);
        let action = agent.action_details(ActionKind::Skip, &state);
        for _ in 0..1000 {
            agent.observe_reward(&action, 0.0, None).unwrap();
            let current = agent.epsilon();
            assert!(current <= previous);
            assert!(current >= EPSILON_FLOOR);
            previous = current;
        }
        assert!((previous - EPSILON_FLOOR).abs() < 1e-9);
    }

    #[test]
    fn cold_start_scores_all_actions_neutrally() {
        let agent = test_agent();
        // Every action sits at 0.5, so the first in declaration order wins
        // regardless of how bad the state looks.
        let state = RlState::defaults_for(0.1);
        assert_eq!(agent.best_action(&state).unwrap(), ActionKind::Skip);
    }

    #[test]
    fn optimize_suggests_smaller_chunks_for_low_quality() {
        let agent = test_agent();

        let low = agent.action_details(ActionKind::Optimize, &RlState::defaults_for(0.4));
        assert_eq!(low.params["new_chunk_size"], 256);
        assert_eq!(low.params["new_overlap"], 25);
        assert!((low.estimated_improvement - 0.15).abs() < f64::EPSILON);

        let mid = agent.action_details(ActionKind::Optimize, &RlState::defaults_for(0.7));
        assert_eq!(mid.params["new_chunk_size"], 384);
        assert!((mid.confidence - 0.70).abs() < f64::EPSILON);
    }

    #[test]
    fn re_embed_switches_to_alternate_model_preserving_old_vectors() {
        let agent = test_agent();
        let action = agent.action_details(ActionKind::ReEmbed, &RlState::defaults_for(0.4));

        assert_eq!(action.params["new_model"], "alternate-embedder");
        assert_eq!(action.params["preserve_old_embeddings"], true);
    }

    #[test]
    fn observe_reward_appends_heal_event_with_snapshot() {
        let tracking = Arc::new(TrackingStore::in_memory().unwrap());
        let history = HistoryLog::new(Arc::clone(&tracking));
        let agent = HealingAgent::new(Arc::clone(&tracking), history.clone(), "alt");

        let action = agent.action_details(ActionKind::Reindex, &RlState::defaults_for(0.5));
        agent.observe_reward(&action, 0.12, Some("sess_1")).unwrap();

        let events = history.get_by_event_type(EventType::Heal, 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action_taken.as_deref(), Some("REINDEX"));
        assert_eq!(events[0].reward_signal, Some(0.12));
        let context = events[0].context();
        assert!(context["q_values"]["REINDEX"]["count"].as_u64() == Some(1));
        assert!(context["epsilon"].as_f64().unwrap() < DEFAULT_EPSILON);
    }

    #[test]
    fn recommendation_uses_tracking_state_and_reports_reasoning() {
        let agent = test_agent();
        let recommendation = agent.recommend("unknown_doc", 0.55).unwrap();

        assert_eq!(recommendation.doc_id, "unknown_doc");
        assert!(!recommendation.reasoning.is_empty());
        assert_eq!(recommendation.learning_stats.total_decisions, 0);
    }

    #[test]
    fn learning_stats_track_percentages_and_best_action() {
        let agent = test_agent();
        observe(&agent, ActionKind::Optimize, 0.3, 3);
        observe(&agent, ActionKind::Skip, 0.1, 1);

        let stats = agent.learning_stats();
        assert_eq!(stats.total_decisions, 4);
        assert_eq!(stats.best_action, Some(ActionKind::Optimize));
        let optimize = &stats.actions["OPTIMIZE"];
        assert!((optimize.percentage - 75.0).abs() < 1e-9);
        assert!((optimize.avg_reward - 0.3).abs() < 1e-9);
    }
}
