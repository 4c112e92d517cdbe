//! **Speech-to-Text (STT)**: turn one captured [`AudioWindow`] into caller text.
//!
//! Implement [`SpeechTranscriber`] for a remote OpenAI-compatible API or local Whisper.
//! Backends report "nothing intelligible" as [`Transcription::NoSpeech`]; only real service
//! failures are errors. Timeouts and retries are the turn loop's business.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::audio::AudioWindow;
use crate::config::BotConfig;
use crate::error::{VoiceError, VoiceResult};

/// Outcome of one successful transcription call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transcription {
    Text(String),
    /// The service answered but recognised nothing usable.
    NoSpeech,
}

/// Classify raw service output. Text without any alphanumeric character (empty, whitespace,
/// lone punctuation such as "..." ) counts as no speech.
pub fn classify_transcript(raw: &str) -> Transcription {
    let text = raw.trim();
    if text.chars().any(char::is_alphanumeric) {
        Transcription::Text(text.to_string())
    } else {
        Transcription::NoSpeech
    }
}

/// Backend converting an audio window to text.
#[async_trait]
pub trait SpeechTranscriber: Send + Sync {
    /// Transcribe `window`; `language` is an ISO-639-1 hint such as `de`.
    async fn transcribe(&self, window: &AudioWindow, language: &str)
        -> VoiceResult<Transcription>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// Placeholder STT: returns a fixed string. Use for testing the voice loop without Whisper/API.
#[derive(Debug, Default)]
pub struct PlaceholderStt {
    /// If set, return this instead of the default message.
    pub response: Option<String>,
}

impl PlaceholderStt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(s: impl Into<String>) -> Self {
        Self {
            response: Some(s.into()),
        }
    }
}

#[async_trait]
impl SpeechTranscriber for PlaceholderStt {
    async fn transcribe(
        &self,
        window: &AudioWindow,
        _language: &str,
    ) -> VoiceResult<Transcription> {
        if let Some(ref r) = self.response {
            return Ok(classify_transcript(r));
        }
        Ok(Transcription::Text(format!(
            "[STT placeholder: {} samples, {:.1}s]",
            window.samples().len(),
            window.duration().as_secs_f32()
        )))
    }

    fn name(&self) -> &'static str {
        "placeholder"
    }
}

/// Production STT backend: OpenAI-compatible `/audio/transcriptions` (OpenAI Whisper, etc.).
#[derive(Debug, Clone)]
pub struct OpenAiStt {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    pub api_key: String,
    /// Model: whisper-1 or gpt-4o-transcribe, etc.
    pub model: String,
    client: reqwest::Client,
}

impl OpenAiStt {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        request_timeout: Duration,
    ) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        })
    }

    /// Build from the `openai` section. Fails when no STT key is configured.
    pub fn from_config(config: &BotConfig) -> VoiceResult<Self> {
        let key = config.openai.stt_key().ok_or_else(|| {
            VoiceError::Config(
                "STT requires SIPBOT_API_KEY, OPENAI_API_KEY or STT_API_KEY".to_string(),
            )
        })?;
        Self::new(
            config.openai.base_url.clone(),
            key,
            config.openai.stt_model.clone(),
            config.timeouts.transcribe(),
        )
    }
}

#[async_trait]
impl SpeechTranscriber for OpenAiStt {
    async fn transcribe(
        &self,
        window: &AudioWindow,
        language: &str,
    ) -> VoiceResult<Transcription> {
        let url = format!("{}/audio/transcriptions", self.base_url.trim_end_matches('/'));
        let part = reqwest::multipart::Part::bytes(window.to_wav())
            .file_name("speech.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());
        if !language.is_empty() {
            form = form.text("language", language.to_string());
        }
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Stt(format!("STT API error {}: {}", status, body)));
        }
        let json: serde_json::Value = res
            .json()
            .await
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        let text = json.get("text").and_then(|t| t.as_str()).unwrap_or("");
        Ok(classify_transcript(text))
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

// -----------------------------------------------------------------------------
// Local Whisper STT (optional feature). Requires whisper.cpp/ggml.
// -----------------------------------------------------------------------------
#[cfg(feature = "whisper")]
mod whisper_stt {
    use super::*;
    use std::sync::Mutex;
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

    struct WhisperInner {
        #[allow(dead_code)]
        context: WhisperContext,
        state: Mutex<whisper_rs::WhisperState>,
    }

    /// Local Whisper STT: loads a ggml model (e.g. ggml-base.bin) and runs inference
    /// on a blocking thread.
    pub struct WhisperStt {
        inner: Arc<WhisperInner>,
    }

    impl WhisperStt {
        pub fn new(model_path: &str) -> VoiceResult<Self> {
            let params = WhisperContextParameters::default();
            let context = WhisperContext::new_with_params(model_path, params)
                .map_err(|e| VoiceError::Stt(format!("Whisper load failed: {}", e)))?;
            let state = context
                .create_state()
                .map_err(|e| VoiceError::Stt(format!("Whisper state init failed: {}", e)))?;
            Ok(Self {
                inner: Arc::new(WhisperInner {
                    context,
                    state: Mutex::new(state),
                }),
            })
        }
    }

    #[async_trait]
    impl SpeechTranscriber for WhisperStt {
        async fn transcribe(
            &self,
            window: &AudioWindow,
            language: &str,
        ) -> VoiceResult<Transcription> {
            let inner = Arc::clone(&self.inner);
            let samples = window.samples_f32();
            let language = language.to_string();
            let text = tokio::task::spawn_blocking(move || -> VoiceResult<String> {
                let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
                params.set_print_progress(false);
                params.set_print_realtime(false);
                params.set_no_timestamps(true);
                if !language.is_empty() {
                    params.set_language(Some(&language));
                }
                let mut state = inner
                    .state
                    .lock()
                    .map_err(|e| VoiceError::Stt(format!("Whisper lock poisoned: {}", e)))?;
                state
                    .full(params, &samples)
                    .map_err(|e| VoiceError::Stt(format!("Whisper inference failed: {}", e)))?;
                Ok(state
                    .as_iter()
                    .filter_map(|seg| seg.to_str().ok().map(str::to_string))
                    .collect::<Vec<_>>()
                    .join(" "))
            })
            .await
            .map_err(|e| VoiceError::Stt(format!("Whisper task failed: {}", e)))??;
            Ok(classify_transcript(&text))
        }

        fn name(&self) -> &'static str {
            "whisper"
        }
    }
}

#[cfg(feature = "whisper")]
pub use whisper_stt::WhisperStt;

/// Create the best available STT backend from configuration.
/// Priority: (1) WhisperStt if `whisper_model_path` is set and the model loads (requires the
/// `whisper` feature), (2) OpenAiStt if an API key is configured, (3) PlaceholderStt.
pub fn create_best_stt(config: &BotConfig) -> Arc<dyn SpeechTranscriber> {
    #[cfg(feature = "whisper")]
    {
        if let Some(path) = config.whisper_model_path.as_deref().map(str::trim) {
            if !path.is_empty() {
                match whisper_stt::WhisperStt::new(path) {
                    Ok(w) => {
                        info!(model = %path, "Using local Whisper STT");
                        return Arc::new(w);
                    }
                    Err(e) => warn!(error = %e, "Whisper model failed to load"),
                }
            }
        }
    }
    match OpenAiStt::from_config(config) {
        Ok(stt) => {
            info!(model = %stt.model, "Using OpenAI-compatible STT");
            Arc::new(stt)
        }
        Err(e) => {
            warn!(error = %e, "Falling back to placeholder STT");
            Arc::new(PlaceholderStt::new())
        }
    }
}
