//! Utterances and the per-call conversation history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::signaling::CallId;

/// Who spoke an utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Caller,
    Agent,
}

/// One unit of spoken content. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utterance {
    seq: u32,
    role: Role,
    text: String,
    at: DateTime<Utc>,
}

impl Utterance {
    pub fn new(seq: u32, role: Role, text: impl Into<String>) -> Self {
        Self {
            seq,
            role,
            text: text.into(),
            at: Utc::now(),
        }
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn at(&self) -> DateTime<Utc> {
        self.at
    }
}

/// Ordered, append-only utterances of one call.
///
/// Only the turn loop appends (through `ConversationSession`); planners get a cloned snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationHistory {
    call_id: CallId,
    utterances: Vec<Utterance>,
}

impl ConversationHistory {
    pub fn new(call_id: CallId) -> Self {
        Self {
            call_id,
            utterances: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, utterance: Utterance) {
        self.utterances.push(utterance);
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn utterances(&self) -> &[Utterance] {
        &self.utterances
    }

    pub fn len(&self) -> usize {
        self.utterances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utterances.is_empty()
    }

    pub fn last(&self) -> Option<&Utterance> {
        self.utterances.last()
    }

    /// Most recent caller utterance, if any.
    pub fn last_caller(&self) -> Option<&Utterance> {
        self.utterances.iter().rev().find(|u| u.role == Role::Caller)
    }

    /// Number of caller utterances (completed caller turns).
    pub fn caller_turns(&self) -> usize {
        self.utterances
            .iter()
            .filter(|u| u.role == Role::Caller)
            .count()
    }
}
