use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::modes::ResponseMode;

/// Fields shared by every workflow state. Each graph's state struct embeds
/// one of these; the errors list is the accumulation point for node
/// failures, and `success` is defined as the list being empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowCommon {
    pub session_id: String,
    pub user_id: Option<String>,
    pub response_mode: ResponseMode,
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
}

impl WorkflowCommon {
    pub fn new(session_id: impl Into<String>, response_mode: ResponseMode) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: None,
            response_mode,
            errors: Vec::new(),
            started_at: Utc::now(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn elapsed_ms(&self) -> u64 {
        let elapsed = Utc::now().signed_duration_since(self.started_at);
        u64::try_from(elapsed.num_milliseconds()).unwrap_or(0)
    }
}
