//! Interface to the signaling/media stack.
//!
//! The SIP stack lives outside this crate. It reports call and media state changes as
//! [`SignalingEvent`]s on a channel and accepts `terminate` requests through [`CallControl`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::audio::AudioChannel;
use crate::error::VoiceResult;

/// Opaque call identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state reported by the signaling stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Ringing,
    Connected,
    MediaActive,
    Disconnected,
}

/// A call as seen by the engine: id plus the remote party.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallHandle {
    id: CallId,
    remote_uri: String,
}

impl CallHandle {
    pub fn new(remote_uri: impl Into<String>) -> Self {
        Self::with_id(CallId::new(), remote_uri)
    }

    pub fn with_id(id: CallId, remote_uri: impl Into<String>) -> Self {
        Self {
            id,
            remote_uri: remote_uri.into(),
        }
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn remote_uri(&self) -> &str {
        &self.remote_uri
    }
}

/// Events pushed by the signaling stack into the engine.
pub enum SignalingEvent {
    CallStateChanged {
        call: CallHandle,
        state: CallState,
    },
    /// Audio is flowing; the engine takes ownership of the channel.
    MediaActive {
        call: CallHandle,
        channel: Box<dyn AudioChannel>,
    },
}

impl SignalingEvent {
    pub fn call(&self) -> &CallHandle {
        match self {
            SignalingEvent::CallStateChanged { call, .. } => call,
            SignalingEvent::MediaActive { call, .. } => call,
        }
    }
}

impl fmt::Debug for SignalingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalingEvent::CallStateChanged { call, state } => f
                .debug_struct("CallStateChanged")
                .field("call", call)
                .field("state", state)
                .finish(),
            SignalingEvent::MediaActive { call, .. } => f
                .debug_struct("MediaActive")
                .field("call", call)
                .finish_non_exhaustive(),
        }
    }
}

pub type SignalingTx = mpsc::Sender<SignalingEvent>;
pub type SignalingRx = mpsc::Receiver<SignalingEvent>;

/// Channel carrying signaling events into a [`CallDispatcher`](crate::dispatcher::CallDispatcher).
pub fn signaling_channel(capacity: usize) -> (SignalingTx, SignalingRx) {
    mpsc::channel(capacity)
}

/// Commands the engine sends back to the signaling stack.
#[async_trait]
pub trait CallControl: Send + Sync {
    /// Hang up the call (BYE/CANCEL). Must tolerate calls that are already gone.
    async fn terminate(&self, call: CallId) -> VoiceResult<()>;
}
