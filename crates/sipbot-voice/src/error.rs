//! Error types for the sipbot voice engine

use std::time::Duration;
use thiserror::Error;

use crate::turn_loop::TurnStage;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while driving a call
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Audio channel error: {0}")]
    AudioChannel(String),

    #[error("Audio capture error: {0}")]
    Capture(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("STT error: {0}")]
    Stt(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("Transcript sink error: {0}")]
    Sink(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{stage:?} timed out after {after:?}")]
    Timeout { stage: TurnStage, after: Duration },

    #[error("Call terminated")]
    CallTerminated,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// True for `ServiceTimeout`-class failures (as opposed to hard service failures).
    pub fn is_timeout(&self) -> bool {
        matches!(self, VoiceError::Timeout { .. })
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::AudioChannel(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::AudioChannel(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::AudioChannel(err.to_string())
    }
}
