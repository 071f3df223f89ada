//! Per-conversation session state: identity, chat mode, response mode,
//! message and command histories, a small context cache, and automatic
//! doc-id generation with collision handling.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{LazyLock, Mutex};

use chrono::{DateTime, Utc};
use common::{error::AppError, modes::ResponseMode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

static NON_TAG_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9_\-.]").expect("sanitize pattern"));
static EXTENSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.[^.]*$").expect("extension pattern"));
static UNDERSCORE_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_+").expect("underscore pattern"));

const DOC_ID_SOURCE_CHARS: usize = 30;

/// Chat privilege mode. Elevation from user to admin is forbidden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    #[default]
    User,
    Admin,
}

impl ChatMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }
}

impl FromStr for ChatMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "user" => Ok(Self::User),
            "admin" => Ok(Self::Admin),
            other => Err(format!("Invalid chat mode: {other}")),
        }
    }
}

/// Source type driving the doc-id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocSource {
    File,
    Text,
    Table,
    Url,
}

impl DocSource {
    const fn prefix(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Text => "text_user_input",
            Self::Table => "table",
            Self::Url => "url",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub timestamp: DateTime<Utc>,
    pub sender: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestedFile {
    pub source: String,
    pub doc_id: String,
    pub ingested_at: DateTime<Utc>,
}

/// Short-term cache carried by a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionContext {
    pub last_doc_id: Option<String>,
    pub last_query: Option<String>,
    pub ingested_files: Vec<IngestedFile>,
    pub healed_docs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub session_id: String,
    pub user_id: String,
    pub department: String,
    pub role: String,
    pub mode: ChatMode,
    pub response_mode: ResponseMode,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub messages: Vec<ChatMessage>,
    pub commands: Vec<String>,
    pub context: SessionContext,
}

impl ChatSession {
    pub const fn is_admin(&self) -> bool {
        matches!(self.mode, ChatMode::Admin)
    }

    pub fn add_message(&mut self, sender: &str, content: &str) {
        self.messages.push(ChatMessage {
            timestamp: Utc::now(),
            sender: sender.to_string(),
            content: content.to_string(),
        });
        self.last_activity = Utc::now();
    }

    /// Clears histories and the context cache, keeping identity and modes.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.commands.clear();
        self.context = SessionContext::default();
    }
}

/// Process-wide session registry, guarded on create and lookup. The doc-id
/// cache spans sessions so concurrent ingestions never collide.
#[derive(Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<String, ChatSession>>,
    doc_ids: Mutex<HashMap<String, String>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_session(
        &self,
        user_id: &str,
        department: &str,
        role: &str,
        mode: ChatMode,
    ) -> Result<ChatSession, AppError> {
        let session = ChatSession {
            session_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            department: department.to_string(),
            role: role.to_string(),
            mode,
            response_mode: ResponseMode::Concise,
            created_at: Utc::now(),
            last_activity: Utc::now(),
            messages: Vec::new(),
            commands: Vec::new(),
            context: SessionContext::default(),
        };

        self.sessions()?
            .insert(session.session_id.clone(), session.clone());
        Ok(session)
    }

    pub fn get(&self, session_id: &str) -> Result<Option<ChatSession>, AppError> {
        Ok(self.sessions()?.get(session_id).cloned())
    }

    pub fn with_session<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut ChatSession) -> T,
    ) -> Result<T, AppError> {
        let mut sessions = self.sessions()?;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| AppError::NotFound(format!("Session not found: {session_id}")))?;
        Ok(f(session))
    }

    pub fn remove(&self, session_id: &str) -> Result<(), AppError> {
        self.sessions()?.remove(session_id);
        Ok(())
    }

    /// Generates a unique doc id of the form
    /// `{prefix}_{sanitized_source}_{yyyymmdd_hhmmss}`, resolving cache
    /// collisions with a `_{microseconds}_{counter}` suffix.
    pub fn generate_doc_id(&self, source: DocSource, source_name: &str) -> Result<String, AppError> {
        let sanitized = sanitize_source_name(source_name);
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let base = format!("{}_{sanitized}_{timestamp}", source.prefix());

        let mut cache = self
            .doc_ids
            .lock()
            .map_err(|_| AppError::InternalError("doc-id cache mutex poisoned".into()))?;

        let mut doc_id = base.clone();
        let mut counter = 0u32;
        while cache.contains_key(&doc_id) {
            counter += 1;
            let microseconds = Utc::now().timestamp_subsec_micros();
            doc_id = format!("{base}_{microseconds}_{counter}");
        }

        cache.insert(doc_id.clone(), Utc::now().to_rfc3339());
        Ok(doc_id)
    }

    fn sessions(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, ChatSession>>, AppError> {
        self.sessions
            .lock()
            .map_err(|_| AppError::InternalError("session mutex poisoned".into()))
    }
}

/// Lowercases, strips the extension, replaces awkward characters with
/// underscores, collapses repeats, and caps the length.
fn sanitize_source_name(source_name: &str) -> String {
    let lowered = source_name.to_lowercase();
    let replaced = NON_TAG_CHARS.replace_all(&lowered, "_");
    let without_extension = EXTENSION.replace(&replaced, "");
    let collapsed = UNDERSCORE_RUNS.replace_all(&without_extension, "_");
    collapsed.chars().take(DOC_ID_SOURCE_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn sanitization_normalizes_awkward_names() {
        assert_eq!(
            sanitize_source_name("Budget Report (Final).PDF"),
            "budget_report_final_"
        );
        assert_eq!(sanitize_source_name("notes.txt"), "notes");
        let long = sanitize_source_name(&"a".repeat(100));
        assert_eq!(long.chars().count(), DOC_ID_SOURCE_CHARS);
    }

    #[test]
    fn doc_ids_carry_prefix_and_timestamp_shape() {
        let manager = SessionManager::new();
        let doc_id = manager
            .generate_doc_id(DocSource::File, "budget.pdf")
            .unwrap();

        assert!(doc_id.starts_with("file_budget_"));
        let text_id = manager
            .generate_doc_id(DocSource::Text, "user_input")
            .unwrap();
        assert!(text_id.starts_with("text_user_input_"));
    }

    #[test]
    fn same_second_collisions_get_distinct_ids() {
        let manager = SessionManager::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let doc_id = manager
                .generate_doc_id(DocSource::Text, "user_input")
                .unwrap();
            assert!(seen.insert(doc_id), "duplicate doc id generated");
        }
    }

    #[test]
    fn concurrent_generation_is_collision_free() {
        let manager = Arc::new(SessionManager::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            handles.push(std::thread::spawn(move || {
                (0..125)
                    .map(|_| {
                        manager
                            .generate_doc_id(DocSource::Text, "user_input")
                            .unwrap()
                    })
                    .collect::<Vec<_>>()
            }));
        }

        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            for doc_id in handle.join().unwrap() {
                assert!(seen.insert(doc_id), "duplicate doc id across threads");
            }
        }
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn sessions_are_created_and_cleared() {
        let manager = SessionManager::new();
        let session = manager
            .create_session("alice", "finance", "analyst", ChatMode::User)
            .unwrap();

        manager
            .with_session(&session.session_id, |s| {
                s.add_message("user", "hello");
                s.commands.push("query: hello".to_string());
                s.context.last_doc_id = Some("doc_1".to_string());
            })
            .unwrap();

        manager
            .with_session(&session.session_id, ChatSession::clear)
            .unwrap();

        let cleared = manager.get(&session.session_id).unwrap().unwrap();
        assert!(cleared.messages.is_empty());
        assert!(cleared.commands.is_empty());
        assert!(cleared.context.last_doc_id.is_none());
        assert_eq!(cleared.user_id, "alice");
    }

    #[test]
    fn unknown_session_lookup_errors() {
        let manager = SessionManager::new();
        assert!(matches!(
            manager.with_session("missing", |_| ()),
            Err(AppError::NotFound(_))
        ));
    }
}
