use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_GREETING: &str = "Hello. How may I assist you today?";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Bot,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Bot => "bot",
        }
    }
}

/// Outcome of the persistence call for an optimistically appended message.
/// A message starts `Pending` and is promoted or failed once the backend
/// write resolves; it is never silently left ambiguous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Delivery {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub sender: Sender,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub delivery: Delivery,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            sender: Sender::User,
            text: text.into(),
            created_at: Utc::now(),
            delivery: Delivery::Pending,
        }
    }

    pub fn bot(text: impl Into<String>) -> Self {
        Self {
            sender: Sender::Bot,
            text: text.into(),
            created_at: Utc::now(),
            delivery: Delivery::Confirmed,
        }
    }

    /// Wall-clock time as shown next to a chat bubble.
    pub fn display_time(&self) -> String {
        self.created_at.format("%H:%M").to_string()
    }
}

/// The questionnaire item whose answer is expected from the very next
/// user submission. At most one is active at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingQuestion {
    pub id: i64,
    pub text: String,
}

/// Per-session conversation state. Mutated only by full-field replacement
/// after a backend round trip; the message log is never patched in place
/// once fetched.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: String,
    /// Bumped on every reset; in-flight work captures the value at entry
    /// and discards its results when the counter has moved on.
    pub generation: u64,
    pub messages: Vec<Message>,
    pub pending_question: Option<PendingQuestion>,
    pub asked_question_ids: BTreeSet<i64>,
    pub summaries: Vec<String>,
    pub ended: bool,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            generation: 0,
            messages: vec![Message::bot(DEFAULT_GREETING)],
            pending_question: None,
            asked_question_ids: BTreeSet::new(),
            summaries: Vec::new(),
            ended: false,
        }
    }

    /// "New Chat": fresh identifier, greeting-only log, cleared questionnaire
    /// state. The generation bump invalidates any turn still in flight
    /// against the previous identifier.
    pub fn reset(&mut self, new_session_id: impl Into<String>) {
        self.session_id = new_session_id.into();
        self.generation += 1;
        self.messages = vec![Message::bot(DEFAULT_GREETING)];
        self.pending_question = None;
        self.asked_question_ids.clear();
        self.summaries.clear();
        self.ended = false;
    }

    /// "End Session": the local state is discarded, not persisted.
    pub fn end(&mut self) {
        self.generation += 1;
        self.messages.clear();
        self.pending_question = None;
        self.ended = true;
    }

    /// Records a freshly asked questionnaire item. The id set de-duplicates;
    /// the collaborator is trusted not to repeat ids, but a repeat must not
    /// grow the set twice.
    pub fn mark_question_asked(&mut self, id: i64, text: impl Into<String>) {
        self.asked_question_ids.insert(id);
        self.pending_question = Some(PendingQuestion { id, text: text.into() });
    }

    /// Consumes the pending question, if any. The caller treats the current
    /// user input as its answer.
    pub fn take_pending_question(&mut self) -> Option<PendingQuestion> {
        self.pending_question.take()
    }

    pub fn asked_ids(&self) -> Vec<i64> {
        self.asked_question_ids.iter().copied().collect()
    }
}
