//! Transcript sinks: one-way, best-effort delivery of call transcript lines.
//!
//! No acknowledgment is expected. The turn loop bounds every push with the sink timeout and
//! only logs failures.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

use crate::config::BotConfig;
use crate::conversation::{Role, Utterance};
use crate::error::{VoiceError, VoiceResult};
use crate::signaling::CallId;

/// One transcript line as pushed to the external consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub call_id: CallId,
    pub seq: u32,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptEvent {
    pub fn from_utterance(call_id: CallId, utterance: &Utterance) -> Self {
        Self {
            call_id,
            seq: utterance.seq(),
            role: utterance.role(),
            text: utterance.text().to_string(),
            timestamp: utterance.at(),
        }
    }
}

#[async_trait]
pub trait TranscriptSink: Send + Sync {
    async fn push(&self, event: &TranscriptEvent) -> VoiceResult<()>;
}

/// Writes transcript lines to the log. Default when no dashboard is configured.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl TranscriptSink for LogSink {
    async fn push(&self, event: &TranscriptEvent) -> VoiceResult<()> {
        info!(
            call_id = %event.call_id,
            seq = event.seq,
            role = ?event.role,
            text = %event.text,
            "Transcript"
        );
        Ok(())
    }
}

/// POSTs each line as JSON to a dashboard endpoint.
pub struct HttpSink {
    url: String,
    client: reqwest::Client,
}

impl HttpSink {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| VoiceError::Sink(e.to_string()))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl TranscriptSink for HttpSink {
    async fn push(&self, event: &TranscriptEvent) -> VoiceResult<()> {
        let res = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| VoiceError::Sink(e.to_string()))?;
        if !res.status().is_success() {
            return Err(VoiceError::Sink(format!("sink responded {}", res.status())));
        }
        Ok(())
    }
}

/// Forwards lines to an in-process consumer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TranscriptEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TranscriptEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TranscriptSink for ChannelSink {
    async fn push(&self, event: &TranscriptEvent) -> VoiceResult<()> {
        self.tx
            .send(event.clone())
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))
    }
}

/// HTTP sink when `sink.url` is set, log sink otherwise.
pub fn create_sink(config: &BotConfig) -> VoiceResult<Arc<dyn TranscriptSink>> {
    match config.sink.url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => {
            info!(url = %url, "Transcripts go to HTTP sink");
            Ok(Arc::new(HttpSink::new(url, config.timeouts.sink())?))
        }
        _ => Ok(Arc::new(LogSink)),
    }
}
