//! Per-call session state and the end-of-call signal.
//!
//! The signaling observer and the turn loop run concurrently. The only thing they share is a
//! [`SessionSignal`]: one atomic state word plus a `Notify` used to wake a stage that is
//! waiting on I/O. The observer may only move the state to `Ending`; everything else is
//! written by the turn loop.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::conversation::{ConversationHistory, Role, Utterance};
use crate::signaling::CallId;

/// Lifecycle of one conversation: `Idle → Active → Ending → Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Active = 1,
    Ending = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Idle,
            1 => SessionState::Active,
            2 => SessionState::Ending,
            _ => SessionState::Closed,
        }
    }
}

#[derive(Debug)]
struct SignalInner {
    state: AtomicU8,
    remote_gone: AtomicBool,
    notify: Notify,
}

/// Cloneable handle to a session's lifecycle state.
#[derive(Debug, Clone)]
pub struct SessionSignal {
    inner: Arc<SignalInner>,
}

impl Default for SessionSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                state: AtomicU8::new(SessionState::Idle as u8),
                remote_gone: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// True only while the conversation is running.
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Ask the conversation to end. Idempotent; returns `true` only for the call that moved
    /// the session into `Ending`.
    pub fn request_end(&self) -> bool {
        let mut current = self.inner.state.load(Ordering::SeqCst);
        loop {
            match SessionState::from_u8(current) {
                SessionState::Idle | SessionState::Active => {}
                SessionState::Ending | SessionState::Closed => return false,
            }
            match self.inner.state.compare_exchange(
                current,
                SessionState::Ending as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    self.inner.notify.notify_waiters();
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// The far end hung up: end the conversation and skip the terminate request on close.
    pub fn notify_disconnected(&self) -> bool {
        self.inner.remote_gone.store(true, Ordering::SeqCst);
        self.request_end()
    }

    /// Whether the signaling layer already reported the call as disconnected.
    pub fn remote_gone(&self) -> bool {
        self.inner.remote_gone.load(Ordering::SeqCst)
    }

    /// Resolves once the session is no longer active. Used to cut a waiting stage short;
    /// stage boundaries still check `is_active()` themselves.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if matches!(self.state(), SessionState::Ending | SessionState::Closed) {
                return;
            }
            notified.await;
        }
    }

    /// `Idle → Active`. Fails if an end was requested before the loop started.
    pub(crate) fn activate(&self) -> bool {
        self.inner
            .state
            .compare_exchange(
                SessionState::Idle as u8,
                SessionState::Active as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Move to `Closed`. Returns `true` only for the first close.
    pub(crate) fn close(&self) -> bool {
        let previous = self
            .inner
            .state
            .swap(SessionState::Closed as u8, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        previous != SessionState::Closed as u8
    }
}

/// History and lifecycle state of one call.
#[derive(Debug)]
pub struct ConversationSession {
    history: ConversationHistory,
    next_seq: u32,
    signal: SessionSignal,
}

impl ConversationSession {
    pub fn new(call_id: CallId) -> Self {
        Self::with_signal(call_id, SessionSignal::new())
    }

    /// Build a session around a signal the observer already holds.
    pub fn with_signal(call_id: CallId, signal: SessionSignal) -> Self {
        Self {
            history: ConversationHistory::new(call_id),
            next_seq: 0,
            signal,
        }
    }

    pub fn call_id(&self) -> CallId {
        self.history.call_id()
    }

    /// Record one utterance and return it.
    pub fn append_turn(&mut self, role: Role, text: impl Into<String>) -> &Utterance {
        let utterance = Utterance::new(self.next_seq, role, text);
        self.next_seq += 1;
        self.history.push(utterance);
        &self.history.utterances()[self.history.len() - 1]
    }

    /// Read-only copy of the history for the planner.
    pub fn snapshot(&self) -> ConversationHistory {
        self.history.clone()
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn request_end(&self) -> bool {
        self.signal.request_end()
    }

    pub fn is_active(&self) -> bool {
        self.signal.is_active()
    }

    pub fn state(&self) -> SessionState {
        self.signal.state()
    }

    pub fn signal(&self) -> SessionSignal {
        self.signal.clone()
    }
}
