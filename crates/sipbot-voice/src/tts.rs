//! **Text-to-Speech (TTS)**: turn an agent utterance into playback-ready audio.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::audio::{AudioContainer, SynthesizedAudio};
use crate::config::BotConfig;
use crate::error::{VoiceError, VoiceResult};

/// Backend that turns text into audio. Empty audio means "nothing to play".
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> VoiceResult<SynthesizedAudio>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// Placeholder TTS: returns empty audio so nothing plays.
#[derive(Debug, Default)]
pub struct PlaceholderTts;

#[async_trait]
impl SpeechSynthesizer for PlaceholderTts {
    async fn synthesize(&self, _text: &str) -> VoiceResult<SynthesizedAudio> {
        Ok(SynthesizedAudio::empty())
    }

    fn name(&self) -> &'static str {
        "placeholder"
    }
}

/// Production TTS backend: OpenAI-compatible `/audio/speech`.
#[derive(Debug, Clone)]
pub struct OpenAiTts {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    pub api_key: String,
    /// TTS model: tts-1 (fast) or tts-1-hd (higher quality).
    pub model: String,
    /// alloy, echo, fable, onyx, nova, shimmer, ...
    pub voice: String,
    /// 0.25 ..= 4.0
    pub speed: f32,
    pub container: AudioContainer,
    client: reqwest::Client,
}

impl OpenAiTts {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        request_timeout: Duration,
    ) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            voice: "nova".to_string(),
            speed: 1.0,
            container: AudioContainer::Mp3,
            client,
        })
    }

    /// Set a fixed voice (e.g. "nova").
    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }

    pub fn with_speed(mut self, speed: f32) -> Self {
        self.speed = speed;
        self
    }

    pub fn with_container(mut self, container: AudioContainer) -> Self {
        self.container = container;
        self
    }

    pub fn from_config(config: &BotConfig) -> VoiceResult<Self> {
        let key = config.openai.tts_key().ok_or_else(|| {
            VoiceError::Config(
                "TTS requires SIPBOT_API_KEY, OPENAI_API_KEY or TTS_API_KEY".to_string(),
            )
        })?;
        let container = AudioContainer::from_name(&config.openai.tts_format).ok_or_else(|| {
            VoiceError::Config(format!(
                "unsupported openai.tts_format {:?}",
                config.openai.tts_format
            ))
        })?;
        Ok(Self::new(
            config.openai.base_url.clone(),
            key,
            config.openai.tts_model.clone(),
            config.timeouts.synthesize(),
        )?
        .with_voice(config.openai.voice.clone())
        .with_speed(config.openai.speed)
        .with_container(container))
    }

    fn request_body(&self, text: &str) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": self.voice,
            "speed": self.speed,
            "response_format": self.container.response_format(),
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiTts {
    async fn synthesize(&self, text: &str) -> VoiceResult<SynthesizedAudio> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(SynthesizedAudio::empty());
        }
        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(text))
            .send()
            .await
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Tts(format!("TTS API error {}: {}", status, body)));
        }
        let bytes = res.bytes().await.map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(SynthesizedAudio::new(bytes.to_vec(), self.container))
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

/// Create the best available TTS backend: OpenAiTts if a key is configured, else PlaceholderTts.
pub fn create_best_tts(config: &BotConfig) -> Arc<dyn SpeechSynthesizer> {
    match OpenAiTts::from_config(config) {
        Ok(tts) => {
            info!(model = %tts.model, voice = %tts.voice, "Using OpenAI-compatible TTS");
            Arc::new(tts)
        }
        Err(e) => {
            warn!(error = %e, "Falling back to placeholder TTS (silent)");
            Arc::new(PlaceholderTts)
        }
    }
}
