//! Bot configuration: defaults, optional TOML file, `SIPBOT_*` environment overrides.
//!
//! ```text
//! SIPBOT_MODE=agent
//! SIPBOT_CONVERSATION__WINDOW_MS=8000
//! SIPBOT_TIMEOUTS__GENERATE_MS=15000
//! SIPBOT_SINK__URL=http://dashboard.local/transcripts
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::audio::AudioContainer;
use crate::error::{VoiceError, VoiceResult};
use crate::turn_loop::{StageTimeouts, TurnLoopConfig};

/// Operating mode of the bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotMode {
    /// Listen and forward transcripts; never speaks.
    #[default]
    Transcription,
    /// Answer the caller with generated speech.
    Agent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Capture window. Unset: 10 s in agent mode, 2 s in transcription mode.
    pub window_ms: Option<u64>,
    /// Consecutive empty turns before a re-prompt. 0 disables re-prompts.
    pub silence_reprompt_threshold: u32,
    /// Extra transcription attempts for the same window.
    pub transcription_retry_budget: u32,
    /// ISO-639-1 hint for the STT service.
    pub language: String,
    pub persona: String,
    /// Opening line in agent mode. Empty disables the greeting.
    pub greeting: String,
    pub apology: String,
    pub reprompt_no_audio: String,
    pub reprompt_no_speech: String,
    pub end_sentinel: String,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            window_ms: None,
            silence_reprompt_threshold: 1,
            transcription_retry_budget: 1,
            language: "de".to_string(),
            persona: "Du bist ein freundlicher Mitarbeiter beim Stadtwerk. Antworte kurz und \
                      hilfsbereit. Wenn das Anliegen erledigt ist oder der Anrufer sich \
                      verabschiedet, beende deine Antwort mit [ENDE]."
                .to_string(),
            greeting: "Guten Tag. Willkommen beim Stadtwerk. Wie kann ich Ihnen helfen?"
                .to_string(),
            apology: "Es tut mir leid, es gab einen technischen Fehler.".to_string(),
            reprompt_no_audio: "Ich habe Sie nicht verstanden. Bitte wiederholen Sie."
                .to_string(),
            reprompt_no_speech: "Entschuldigung, ich habe Sie nicht verstanden.".to_string(),
            end_sentinel: "[ENDE]".to_string(),
        }
    }
}

/// Per-stage timeouts in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Added to the window length for the capture deadline.
    pub capture_grace_ms: u64,
    pub transcribe_ms: u64,
    pub generate_ms: u64,
    pub synthesize_ms: u64,
    /// Upper bound for one playback, whatever the audio length.
    pub playback_ms: u64,
    pub sink_ms: u64,
    pub terminate_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            capture_grace_ms: 2_000,
            transcribe_ms: 30_000,
            generate_ms: 20_000,
            synthesize_ms: 30_000,
            playback_ms: 60_000,
            sink_ms: 5_000,
            terminate_ms: 5_000,
        }
    }
}

impl TimeoutConfig {
    pub fn capture_grace(&self) -> Duration {
        Duration::from_millis(self.capture_grace_ms)
    }
    pub fn transcribe(&self) -> Duration {
        Duration::from_millis(self.transcribe_ms)
    }
    pub fn generate(&self) -> Duration {
        Duration::from_millis(self.generate_ms)
    }
    pub fn synthesize(&self) -> Duration {
        Duration::from_millis(self.synthesize_ms)
    }
    pub fn playback(&self) -> Duration {
        Duration::from_millis(self.playback_ms)
    }
    pub fn sink(&self) -> Duration {
        Duration::from_millis(self.sink_ms)
    }
    pub fn terminate(&self) -> Duration {
        Duration::from_millis(self.terminate_ms)
    }
}

/// OpenAI-compatible service settings (STT, chat, TTS share one base URL).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Overrides `api_key` for transcription only.
    pub stt_api_key: Option<String>,
    /// Overrides `api_key` for speech synthesis only.
    pub tts_api_key: Option<String>,
    pub stt_model: String,
    pub chat_model: String,
    pub tts_model: String,
    pub voice: String,
    pub speed: f32,
    /// mp3, wav or pcm.
    pub tts_format: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            stt_api_key: None,
            tts_api_key: None,
            stt_model: "whisper-1".to_string(),
            chat_model: "gpt-4o-mini".to_string(),
            tts_model: "tts-1".to_string(),
            voice: "nova".to_string(),
            speed: 1.0,
            tts_format: "mp3".to_string(),
            temperature: 0.8,
            max_tokens: 200,
        }
    }
}

fn non_empty(v: Option<&String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl OpenAiConfig {
    pub fn api_key(&self) -> Option<String> {
        non_empty(self.api_key.as_ref())
    }

    pub fn stt_key(&self) -> Option<String> {
        non_empty(self.stt_api_key.as_ref()).or_else(|| self.api_key())
    }

    pub fn tts_key(&self) -> Option<String> {
        non_empty(self.tts_api_key.as_ref()).or_else(|| self.api_key())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Dashboard endpoint receiving transcript lines as JSON POSTs.
    pub url: Option<String>,
}

/// Top-level configuration of the bot process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub mode: BotMode,
    pub conversation: ConversationConfig,
    pub timeouts: TimeoutConfig,
    pub openai: OpenAiConfig,
    pub sink: SinkConfig,
    /// Local ggml Whisper model (used with the `whisper` feature).
    pub whisper_model_path: Option<String>,
}

impl BotConfig {
    /// Load config from file and environment. Precedence: `SIPBOT_*` env > file at
    /// `SIPBOT_CONFIG` (default `config/sipbot[.toml]`) > defaults.
    pub fn load() -> VoiceResult<Self> {
        let config_path =
            std::env::var("SIPBOT_CONFIG").unwrap_or_else(|_| "config/sipbot".to_string());
        let mut cfg = Self::load_from(&config_path)?;
        cfg.apply_key_fallbacks(|name| std::env::var(name).ok());
        Ok(cfg)
    }

    /// Load with an explicit file path (extension optional, file optional).
    pub fn load_from(path: &str) -> VoiceResult<Self> {
        let built = config::Config::builder()
            .set_default("mode", "transcription")?
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("SIPBOT")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(built.try_deserialize()?)
    }

    /// Fill missing credentials: `SIPBOT_API_KEY`, then `OPENAI_API_KEY`; `STT_API_KEY` and
    /// `TTS_API_KEY` override per service.
    fn apply_key_fallbacks(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let found = |names: &[&str]| {
            names
                .iter()
                .filter_map(|&n| lookup(n))
                .map(|v| v.trim().to_string())
                .find(|v| !v.is_empty())
        };
        if self.openai.api_key().is_none() {
            self.openai.api_key = found(&["SIPBOT_API_KEY", "OPENAI_API_KEY"]);
        }
        if non_empty(self.openai.stt_api_key.as_ref()).is_none() {
            self.openai.stt_api_key = found(&["STT_API_KEY"]);
        }
        if non_empty(self.openai.tts_api_key.as_ref()).is_none() {
            self.openai.tts_api_key = found(&["TTS_API_KEY"]);
        }
    }

    /// Reject values the turn loop cannot work with.
    pub fn validate(&self) -> VoiceResult<()> {
        if self.conversation.window_ms == Some(0) {
            return Err(VoiceError::Config("conversation.window_ms must be > 0".to_string()));
        }
        if self.conversation.end_sentinel.trim().is_empty() {
            return Err(VoiceError::Config(
                "conversation.end_sentinel must not be empty".to_string(),
            ));
        }
        if !(0.25..=4.0).contains(&self.openai.speed) {
            return Err(VoiceError::Config(format!(
                "openai.speed {} outside 0.25..=4.0",
                self.openai.speed
            )));
        }
        if AudioContainer::from_name(&self.openai.tts_format).is_none() {
            return Err(VoiceError::Config(format!(
                "openai.tts_format {:?} is not one of mp3, wav, pcm",
                self.openai.tts_format
            )));
        }
        let t = &self.timeouts;
        for (name, ms) in [
            ("transcribe_ms", t.transcribe_ms),
            ("generate_ms", t.generate_ms),
            ("synthesize_ms", t.synthesize_ms),
            ("playback_ms", t.playback_ms),
            ("sink_ms", t.sink_ms),
            ("terminate_ms", t.terminate_ms),
        ] {
            if ms == 0 {
                return Err(VoiceError::Config(format!("timeouts.{name} must be > 0")));
            }
        }
        Ok(())
    }

    /// Capture window for the configured mode.
    pub fn window(&self) -> Duration {
        let default_ms = match self.mode {
            BotMode::Agent => 10_000,
            BotMode::Transcription => 2_000,
        };
        Duration::from_millis(self.conversation.window_ms.unwrap_or(default_ms))
    }

    /// Turn loop settings derived from this configuration.
    pub fn turn_loop_config(&self) -> TurnLoopConfig {
        let c = &self.conversation;
        let greeting = match self.mode {
            BotMode::Agent if !c.greeting.trim().is_empty() => Some(c.greeting.clone()),
            _ => None,
        };
        TurnLoopConfig {
            window: self.window(),
            silence_reprompt_threshold: c.silence_reprompt_threshold,
            transcription_retry_budget: c.transcription_retry_budget,
            language: c.language.clone(),
            greeting,
            reprompt_no_audio: c.reprompt_no_audio.clone(),
            reprompt_no_speech: c.reprompt_no_speech.clone(),
            timeouts: StageTimeouts {
                capture_grace: self.timeouts.capture_grace(),
                transcribe: self.timeouts.transcribe(),
                synthesize: self.timeouts.synthesize(),
                playback: self.timeouts.playback(),
                sink: self.timeouts.sink(),
                terminate: self.timeouts.terminate(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults_follow_mode() {
        let mut cfg = BotConfig::default();
        assert_eq!(cfg.window(), Duration::from_secs(2));
        assert!(cfg.turn_loop_config().greeting.is_none());

        cfg.mode = BotMode::Agent;
        assert_eq!(cfg.window(), Duration::from_secs(10));
        assert!(cfg.turn_loop_config().greeting.is_some());
        assert_eq!(cfg.conversation.language, "de");
        assert_eq!(cfg.conversation.end_sentinel, "[ENDE]");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
mode = "agent"

[conversation]
window_ms = 4000
silence_reprompt_threshold = 2

[openai]
voice = "alloy"
"#
        )
        .unwrap();

        let path = file.path().to_string_lossy().to_string();
        let cfg = BotConfig::load_from(&path).unwrap();
        assert_eq!(cfg.mode, BotMode::Agent);
        assert_eq!(cfg.window(), Duration::from_millis(4000));
        assert_eq!(cfg.conversation.silence_reprompt_threshold, 2);
        assert_eq!(cfg.openai.voice, "alloy");
        // untouched fields keep their defaults
        assert_eq!(cfg.openai.tts_model, "tts-1");
        assert_eq!(cfg.conversation.transcription_retry_budget, 1);
    }

    #[test]
    fn missing_file_is_fine() {
        let cfg = BotConfig::load_from("/definitely/not/here/sipbot").unwrap();
        assert_eq!(cfg.openai.chat_model, "gpt-4o-mini");
    }

    #[test]
    fn key_fallback_chain() {
        let env: HashMap<&str, &str> = [("OPENAI_API_KEY", "sk-openai"), ("TTS_API_KEY", " ")]
            .into_iter()
            .collect();
        let mut cfg = BotConfig::default();
        cfg.apply_key_fallbacks(|n| env.get(n).map(|v| v.to_string()));

        assert_eq!(cfg.openai.api_key().as_deref(), Some("sk-openai"));
        assert_eq!(cfg.openai.stt_key().as_deref(), Some("sk-openai"));
        // blank override is ignored
        assert_eq!(cfg.openai.tts_key().as_deref(), Some("sk-openai"));
    }

    #[test]
    fn explicit_key_wins_over_env() {
        let mut cfg = BotConfig::default();
        cfg.openai.api_key = Some("from-file".to_string());
        cfg.apply_key_fallbacks(|_| Some("from-env".to_string()));
        assert_eq!(cfg.openai.api_key().as_deref(), Some("from-file"));
        assert_eq!(cfg.openai.stt_key().as_deref(), Some("from-env"));
    }

    #[test]
    fn validate_rejects_nonsense() {
        let mut cfg = BotConfig::default();
        cfg.conversation.window_ms = Some(0);
        assert!(cfg.validate().is_err());

        let mut cfg = BotConfig::default();
        cfg.conversation.end_sentinel = " ".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = BotConfig::default();
        cfg.openai.speed = 5.0;
        assert!(cfg.validate().is_err());

        let mut cfg = BotConfig::default();
        cfg.timeouts.transcribe_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_formats_playback_cannot_decode() {
        let mut cfg = BotConfig::default();
        cfg.openai.tts_format = "opus".to_string();
        assert!(matches!(cfg.validate(), Err(VoiceError::Config(_))));

        cfg.openai.tts_format = "flac".to_string();
        assert!(cfg.validate().is_err());

        cfg.openai.tts_format = "PCM".to_string();
        assert!(cfg.validate().is_ok());
    }
}
