//! In-memory chat sessions. Each session's log sits behind an async mutex so
//! turns on one session run one at a time.

use analyst_llm::ChatMessage;
use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

struct SessionRecord {
    model: String,
    created_at: DateTime<Utc>,
    last_active: DateTime<Utc>,
    messages: usize,
    history: Arc<Mutex<Vec<ChatMessage>>>,
}

impl SessionRecord {
    fn summary(&self, id: Uuid) -> SessionSummary {
        SessionSummary {
            id,
            model: self.model.clone(),
            created_at: self.created_at,
            last_active: self.last_active,
            messages: self.messages,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub messages: usize,
}

/// Exclusive access to one session's log for the length of a turn.
pub struct SessionTurn {
    pub id: Uuid,
    pub model: String,
    history: OwnedMutexGuard<Vec<ChatMessage>>,
}

impl SessionTurn {
    pub fn history(&self) -> Vec<ChatMessage> {
        self.history.clone()
    }
}

pub struct SessionManager {
    sessions: DashMap<Uuid, SessionRecord>,
    default_model: String,
}

impl SessionManager {
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            sessions: DashMap::new(),
            default_model: default_model.into(),
        }
    }

    pub fn create(&self, model: Option<String>) -> SessionSummary {
        let model = model
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| self.default_model.clone());
        let now = Utc::now();
        let id = Uuid::new_v4();
        let record = SessionRecord {
            model,
            created_at: now,
            last_active: now,
            messages: 0,
            history: Arc::new(Mutex::new(Vec::new())),
        };
        let summary = record.summary(id);
        self.sessions.insert(id, record);
        tracing::info!(session_id = %id, model = %summary.model, "session created");
        summary
    }

    pub fn get(&self, id: Uuid) -> Option<SessionSummary> {
        self.sessions.get(&id).map(|r| r.summary(id))
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let mut out: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| entry.value().summary(*entry.key()))
            .collect();
        out.sort_by_key(|s| s.last_active);
        out.reverse();
        out
    }

    pub fn delete(&self, id: Uuid) -> bool {
        let removed = self.sessions.remove(&id).is_some();
        if removed {
            tracing::info!(session_id = %id, "session deleted");
        }
        removed
    }

    /// Applies a `{provider, model}` settings update.
    pub fn set_model(&self, id: Uuid, provider: &str, model: &str) -> Result<Option<SessionSummary>> {
        let provider = provider.trim();
        let model = model.trim();
        if provider.is_empty() || model.is_empty() {
            return Err(anyhow::anyhow!("provider and model must both be non-empty"));
        }
        let Some(mut record) = self.sessions.get_mut(&id) else {
            return Ok(None);
        };
        record.model = format!("{provider}:{model}");
        record.last_active = Utc::now();
        tracing::info!(session_id = %id, model = %record.model, "session model updated");
        Ok(Some(record.summary(id)))
    }

    /// Waits for any turn already running on the session.
    pub async fn begin_turn(&self, id: Uuid) -> Option<SessionTurn> {
        let history = self.sessions.get(&id).map(|r| r.history.clone())?;
        let guard = history.lock_owned().await;
        // The model may have changed while waiting.
        let model = self.sessions.get(&id)?.model.clone();
        Some(SessionTurn {
            id,
            model,
            history: guard,
        })
    }

    /// Stores the turn's log and releases the session.
    pub fn finish_turn(&self, mut turn: SessionTurn, messages: Vec<ChatMessage>) {
        let count = messages.len();
        *turn.history = messages;
        if let Some(mut record) = self.sessions.get_mut(&turn.id) {
            record.messages = count;
            record.last_active = Utc::now();
        }
        tracing::debug!(session_id = %turn.id, messages = count, "session turn stored");
    }
}
