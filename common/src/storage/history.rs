use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

use super::tracking::TrackingStore;

/// The unified historical log over queries, healing operations, synthetic
/// tests and guardrail checks. Strictly append-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Query,
    Heal,
    SyntheticTest,
    GuardrailCheck,
}

impl EventType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Query => "QUERY",
            Self::Heal => "HEAL",
            Self::SyntheticTest => "SYNTHETIC_TEST",
            Self::GuardrailCheck => "GUARDRAIL_CHECK",
        }
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUERY" => Ok(Self::Query),
            "HEAL" => Ok(Self::Heal),
            "SYNTHETIC_TEST" => Ok(Self::SyntheticTest),
            "GUARDRAIL_CHECK" => Ok(Self::GuardrailCheck),
            other => Err(format!("unknown event type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub history_id: i64,
    pub event_type: String,
    pub timestamp: String,
    pub query_text: Option<String>,
    pub target_doc_id: Option<String>,
    pub target_chunk_id: Option<String>,
    pub metrics_json: Option<String>,
    pub context_json: Option<String>,
    pub reward_signal: Option<f64>,
    pub action_taken: Option<String>,
    pub agent_id: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

impl HistoryEvent {
    /// Parsed metrics payload; empty object when absent or malformed.
    pub fn metrics(&self) -> serde_json::Value {
        parse_payload(self.metrics_json.as_deref())
    }

    pub fn context(&self) -> serde_json::Value {
        parse_payload(self.context_json.as_deref())
    }
}

fn parse_payload(raw: Option<&str>) -> serde_json::Value {
    raw.and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_else(|| serde_json::json!({}))
}

/// Writer/reader over `rag_history_and_optimization`. Shares the tracking
/// store's connection, so appends serialize at the log boundary and
/// `history_id` increases monotonically.
#[derive(Clone)]
pub struct HistoryLog {
    store: Arc<TrackingStore>,
}

const EVENT_COLUMNS: &str = "history_id, event_type, timestamp, query_text, target_doc_id, \
     target_chunk_id, metrics_json, context_json, reward_signal, action_taken, \
     agent_id, user_id, session_id";

impl HistoryLog {
    pub fn new(store: Arc<TrackingStore>) -> Self {
        Self { store }
    }

    pub fn log_query(
        &self,
        query_text: &str,
        target_doc_id: &str,
        metrics_json: &str,
        context_json: &str,
        agent_id: &str,
        user_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<i64, AppError> {
        self.append(
            EventType::Query,
            Some(query_text),
            Some(target_doc_id),
            None,
            Some(metrics_json),
            Some(context_json),
            None,
            None,
            agent_id,
            user_id,
            session_id,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_heal(
        &self,
        target_doc_id: &str,
        target_chunk_id: Option<&str>,
        metrics_json: &str,
        context_json: &str,
        action_taken: &str,
        reward_signal: f64,
        agent_id: &str,
        session_id: Option<&str>,
    ) -> Result<i64, AppError> {
        self.append(
            EventType::Heal,
            None,
            Some(target_doc_id),
            target_chunk_id,
            Some(metrics_json),
            Some(context_json),
            Some(reward_signal),
            Some(action_taken),
            agent_id,
            None,
            session_id,
        )
    }

    pub fn log_synthetic_test(
        &self,
        query_text: &str,
        target_doc_id: &str,
        metrics_json: &str,
        context_json: &str,
        agent_id: &str,
        session_id: Option<&str>,
    ) -> Result<i64, AppError> {
        self.append(
            EventType::SyntheticTest,
            Some(query_text),
            Some(target_doc_id),
            None,
            Some(metrics_json),
            Some(context_json),
            None,
            None,
            agent_id,
            None,
            session_id,
        )
    }

    pub fn log_guardrail_check(
        &self,
        target_doc_id: &str,
        checks_json: &str,
        is_safe: bool,
        agent_id: &str,
        session_id: Option<&str>,
    ) -> Result<i64, AppError> {
        let context = serde_json::json!({ "is_safe": is_safe }).to_string();
        self.append(
            EventType::GuardrailCheck,
            None,
            Some(target_doc_id),
            None,
            Some(checks_json),
            Some(&context),
            None,
            None,
            agent_id,
            None,
            session_id,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn append(
        &self,
        event_type: EventType,
        query_text: Option<&str>,
        target_doc_id: Option<&str>,
        target_chunk_id: Option<&str>,
        metrics_json: Option<&str>,
        context_json: Option<&str>,
        reward_signal: Option<f64>,
        action_taken: Option<&str>,
        agent_id: &str,
        user_id: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<i64, AppError> {
        let timestamp = Utc::now().to_rfc3339();
        let id = self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO rag_history_and_optimization
                 (event_type, timestamp, query_text, target_doc_id, target_chunk_id,
                  metrics_json, context_json, reward_signal, action_taken, agent_id,
                  user_id, session_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                rusqlite::params![
                    event_type.as_str(),
                    timestamp,
                    query_text,
                    target_doc_id,
                    target_chunk_id,
                    metrics_json,
                    context_json,
                    reward_signal,
                    action_taken,
                    agent_id,
                    user_id,
                    session_id,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;

        Ok(id)
    }

    pub fn get_by_id(&self, history_id: i64) -> Result<Option<HistoryEvent>, AppError> {
        let mut events = self.select(
            &format!("SELECT {EVENT_COLUMNS} FROM rag_history_and_optimization WHERE history_id = ?1"),
            rusqlite::params![history_id],
        )?;
        Ok(events.pop())
    }

    pub fn get_by_event_type(
        &self,
        event_type: EventType,
        limit: usize,
    ) -> Result<Vec<HistoryEvent>, AppError> {
        self.select(
            &format!(
                "SELECT {EVENT_COLUMNS} FROM rag_history_and_optimization
                 WHERE event_type = ?1 ORDER BY history_id DESC LIMIT ?2"
            ),
            rusqlite::params![event_type.as_str(), limit as i64],
        )
    }

    pub fn get_by_doc_id(&self, doc_id: &str, limit: usize) -> Result<Vec<HistoryEvent>, AppError> {
        self.select(
            &format!(
                "SELECT {EVENT_COLUMNS} FROM rag_history_and_optimization
                 WHERE target_doc_id = ?1 ORDER BY history_id DESC LIMIT ?2"
            ),
            rusqlite::params![doc_id, limit as i64],
        )
    }

    pub fn get_session_history(&self, session_id: &str) -> Result<Vec<HistoryEvent>, AppError> {
        self.select(
            &format!(
                "SELECT {EVENT_COLUMNS} FROM rag_history_and_optimization
                 WHERE session_id = ?1 ORDER BY history_id ASC"
            ),
            rusqlite::params![session_id],
        )
    }

    /// All events with metrics and context parsed, oldest first.
    pub fn get_metrics(&self) -> Result<Vec<(HistoryEvent, serde_json::Value, serde_json::Value)>, AppError> {
        let events = self.select(
            &format!("SELECT {EVENT_COLUMNS} FROM rag_history_and_optimization ORDER BY history_id ASC"),
            rusqlite::params![],
        )?;
        Ok(events
            .into_iter()
            .map(|event| {
                let metrics = event.metrics();
                let context = event.context();
                (event, metrics, context)
            })
            .collect())
    }

    /// Per-event-type counts plus a total.
    pub fn get_statistics(&self) -> Result<HashMap<String, usize>, AppError> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT event_type, COUNT(*) FROM rag_history_and_optimization GROUP BY event_type",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
            })?;

            let mut stats: HashMap<String, usize> = HashMap::new();
            let mut total = 0usize;
            for row in rows {
                let (event_type, count) = row?;
                total += count;
                stats.insert(event_type, count);
            }
            stats.insert("total".to_string(), total);
            Ok(stats)
        })
    }

    fn select(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<HistoryEvent>, AppError> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params, |row| {
                Ok(HistoryEvent {
                    history_id: row.get(0)?,
                    event_type: row.get(1)?,
                    timestamp: row.get(2)?,
                    query_text: row.get(3)?,
                    target_doc_id: row.get(4)?,
                    target_chunk_id: row.get(5)?,
                    metrics_json: row.get(6)?,
                    context_json: row.get(7)?,
                    reward_signal: row.get(8)?,
                    action_taken: row.get(9)?,
                    agent_id: row.get(10)?,
                    user_id: row.get(11)?,
                    session_id: row.get(12)?,
                })
            })?;
            rows.collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_log() -> HistoryLog {
        HistoryLog::new(Arc::new(TrackingStore::in_memory().unwrap()))
    }

    #[test]
    fn history_ids_increase_monotonically() {
        let log = test_log();

        let first = log
            .log_query("q1", "doc_1", "{}", "{}", "rag_agent", None, Some("s1"))
            .unwrap();
        let second = log
            .log_heal("doc_1", None, "{}", "{}", "OPTIMIZE", 0.12, "healing_agent", Some("s1"))
            .unwrap();
        let third = log
            .log_synthetic_test("probe", "doc_1", "{}", "{}", "rag_agent", Some("s1"))
            .unwrap();

        assert!(first < second && second < third);
    }

    #[test]
    fn events_filter_by_type_and_doc() {
        let log = test_log();

        log.log_query("q1", "doc_a", "{}", "{}", "rag_agent", None, None)
            .unwrap();
        log.log_query("q2", "doc_b", "{}", "{}", "rag_agent", None, None)
            .unwrap();
        log.log_heal("doc_a", None, "{}", "{}", "REINDEX", 0.1, "healing_agent", None)
            .unwrap();

        let queries = log.get_by_event_type(EventType::Query, 10).unwrap();
        assert_eq!(queries.len(), 2);

        let doc_a = log.get_by_doc_id("doc_a", 10).unwrap();
        assert_eq!(doc_a.len(), 2);
        assert!(doc_a.iter().any(|e| e.event_type == "HEAL"));
    }

    #[test]
    fn session_history_is_oldest_first() {
        let log = test_log();

        log.log_query("first", "doc", "{}", "{}", "rag_agent", None, Some("sess"))
            .unwrap();
        log.log_query("second", "doc", "{}", "{}", "rag_agent", None, Some("sess"))
            .unwrap();
        log.log_query("other", "doc", "{}", "{}", "rag_agent", None, Some("elsewhere"))
            .unwrap();

        let history = log.get_session_history("sess").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].query_text.as_deref(), Some("first"));
        assert_eq!(history[1].query_text.as_deref(), Some("second"));
    }

    #[test]
    fn metrics_payloads_parse_with_fallback() {
        let log = test_log();

        log.log_query(
            "q",
            "doc",
            r#"{"avg_accuracy": 0.8}"#,
            "not valid json",
            "rag_agent",
            None,
            None,
        )
        .unwrap();

        let parsed = log.get_metrics().unwrap();
        assert_eq!(parsed.len(), 1);
        let (_, metrics, context) = &parsed[0];
        assert_eq!(metrics["avg_accuracy"], 0.8);
        assert_eq!(context, &serde_json::json!({}));
    }

    #[test]
    fn statistics_count_per_event_type() {
        let log = test_log();

        log.log_query("q", "doc", "{}", "{}", "rag_agent", None, None)
            .unwrap();
        log.log_guardrail_check("doc", "{}", false, "rag_agent", None)
            .unwrap();
        log.log_guardrail_check("doc", "{}", true, "rag_agent", None)
            .unwrap();

        let stats = log.get_statistics().unwrap();
        assert_eq!(stats.get("QUERY"), Some(&1));
        assert_eq!(stats.get("GUARDRAIL_CHECK"), Some(&2));
        assert_eq!(stats.get("total"), Some(&3));
    }

    #[test]
    fn event_type_round_trips() {
        for event in [
            EventType::Query,
            EventType::Heal,
            EventType::SyntheticTest,
            EventType::GuardrailCheck,
        ] {
            assert_eq!(event.as_str().parse::<EventType>().unwrap(), event);
        }
        assert!("AUDIT".parse::<EventType>().is_err());
    }
}
