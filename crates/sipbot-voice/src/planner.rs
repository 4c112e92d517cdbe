//! Response planning: what (if anything) the agent says after a caller turn.
//!
//! One turn loop serves both operating modes; the planner decides the behaviour.
//! [`IdentityPlanner`] relays the caller's words (transcription mode) and stays silent,
//! [`GenerativePlanner`] asks a [`TextGenerator`] for a reply (agent mode).

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{BotConfig, BotMode};
use crate::conversation::ConversationHistory;
use crate::error::VoiceResult;
use crate::llm::{build_messages, OpenAiChat, TextGenerator};

/// Where a plan's text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    /// Caller text passed through unchanged.
    Relay,
    /// Reply produced by the text generator.
    Generated,
    /// Fixed apology after a generation failure.
    Fallback,
}

/// Reply text plus the end-of-conversation decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub reply: String,
    pub should_end: bool,
    pub source: PlanSource,
}

/// Produces the next agent utterance from the conversation so far.
///
/// `plan` never fails: a planner that cannot produce a reply returns its fallback.
#[async_trait]
pub trait ResponsePlanner: Send + Sync {
    async fn plan(&self, history: &ConversationHistory) -> Plan;

    /// Whether the reply is spoken to the caller. Passive planners only record.
    fn speaks_reply(&self) -> bool;
}

/// Transcription mode: relay the last caller text, never end, never speak.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityPlanner;

#[async_trait]
impl ResponsePlanner for IdentityPlanner {
    async fn plan(&self, history: &ConversationHistory) -> Plan {
        Plan {
            reply: history
                .last_caller()
                .map(|u| u.text().to_string())
                .unwrap_or_default(),
            should_end: false,
            source: PlanSource::Relay,
        }
    }

    fn speaks_reply(&self) -> bool {
        false
    }
}

/// Agent mode: persona + history through a text generator, end on the sentinel marker.
pub struct GenerativePlanner {
    generator: Arc<dyn TextGenerator>,
    persona: String,
    sentinel: String,
    apology: String,
    timeout: Duration,
}

impl GenerativePlanner {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        persona: impl Into<String>,
        sentinel: impl Into<String>,
        apology: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            generator,
            persona: persona.into(),
            sentinel: sentinel.into(),
            apology: apology.into(),
            timeout,
        }
    }

    fn fallback(&self) -> Plan {
        Plan {
            reply: self.apology.clone(),
            should_end: true,
            source: PlanSource::Fallback,
        }
    }
}

/// Remove every occurrence of `sentinel` and report whether one was present.
pub fn strip_sentinel(text: &str, sentinel: &str) -> (String, bool) {
    if sentinel.is_empty() || !text.contains(sentinel) {
        return (text.trim().to_string(), false);
    }
    let mut cleaned = text.replace(sentinel, "");
    // Removing one marker can splice the halves of another back together.
    while cleaned.contains(sentinel) {
        cleaned = cleaned.replace(sentinel, "");
    }
    // Collapse the double spaces a mid-sentence marker leaves behind.
    let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    (cleaned, true)
}

#[async_trait]
impl ResponsePlanner for GenerativePlanner {
    async fn plan(&self, history: &ConversationHistory) -> Plan {
        let messages = build_messages(&self.persona, history);
        let generation = self.generator.generate(&messages);
        let raw = match tokio::time::timeout(self.timeout, generation).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                warn!(
                    call_id = %history.call_id(),
                    error = %e,
                    "Generation failed; using apology"
                );
                return self.fallback();
            }
            Err(_) => {
                warn!(
                    call_id = %history.call_id(),
                    timeout = ?self.timeout,
                    "Generation timed out; using apology"
                );
                return self.fallback();
            }
        };

        let (reply, should_end) = strip_sentinel(&raw, &self.sentinel);
        if reply.is_empty() && !should_end {
            warn!(
                call_id = %history.call_id(),
                "Generator returned an empty reply; using apology"
            );
            return self.fallback();
        }
        debug!(call_id = %history.call_id(), should_end, "Reply planned");
        Plan {
            reply,
            should_end,
            source: PlanSource::Generated,
        }
    }

    fn speaks_reply(&self) -> bool {
        true
    }
}

/// Planner for the configured mode. Agent mode uses `generator`, or an [`OpenAiChat`] built
/// from the config when none is given.
pub fn create_planner(
    config: &BotConfig,
    generator: Option<Arc<dyn TextGenerator>>,
) -> VoiceResult<Arc<dyn ResponsePlanner>> {
    match config.mode {
        BotMode::Transcription => Ok(Arc::new(IdentityPlanner)),
        BotMode::Agent => {
            let generator: Arc<dyn TextGenerator> = match generator {
                Some(g) => g,
                None => {
                    let chat = OpenAiChat::from_config(config)?;
                    info!(model = %chat.model(), "Using OpenAI-compatible chat");
                    Arc::new(chat)
                }
            };
            let c = &config.conversation;
            Ok(Arc::new(GenerativePlanner::new(
                generator,
                c.persona.clone(),
                c.end_sentinel.clone(),
                c.apology.clone(),
                config.timeouts.generate(),
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{Role, Utterance};
    use crate::error::{VoiceError, VoiceResult};
    use crate::llm::ChatMessage;
    use crate::signaling::CallId;

    struct Canned(VoiceResult<String>);

    #[async_trait]
    impl TextGenerator for Canned {
        async fn generate(&self, _messages: &[ChatMessage]) -> VoiceResult<String> {
            match &self.0 {
                Ok(s) => Ok(s.clone()),
                Err(e) => Err(VoiceError::Llm(e.to_string())),
            }
        }
    }

    struct Stalled;

    #[async_trait]
    impl TextGenerator for Stalled {
        async fn generate(&self, _messages: &[ChatMessage]) -> VoiceResult<String> {
            std::future::pending().await
        }
    }

    fn planner(generator: Arc<dyn TextGenerator>) -> GenerativePlanner {
        GenerativePlanner::new(
            generator,
            "Du bist ein freundlicher Mitarbeiter.",
            "[ENDE]",
            "Es tut mir leid, es gab einen technischen Fehler.",
            Duration::from_millis(50),
        )
    }

    fn history() -> ConversationHistory {
        let mut h = ConversationHistory::new(CallId::new());
        h.push(Utterance::new(0, Role::Caller, "Hallo"));
        h
    }

    #[tokio::test]
    async fn sentinel_ends_and_is_stripped() {
        let p = planner(Arc::new(Canned(Ok("Auf Wiederhören. [ENDE]".to_string()))));
        let plan = p.plan(&history()).await;
        assert_eq!(plan.reply, "Auf Wiederhören.");
        assert!(plan.should_end);
        assert_eq!(plan.source, PlanSource::Generated);
    }

    #[test]
    fn every_sentinel_occurrence_is_removed() {
        let (text, end) = strip_sentinel("[ENDE] Tschüss [ENDE] und danke.[ENDE]", "[ENDE]");
        assert!(end);
        assert_eq!(text, "Tschüss und danke.");
    }

    #[test]
    fn spliced_sentinel_does_not_survive() {
        let (text, end) = strip_sentinel("Tschüss [EN[ENDE]DE]", "[ENDE]");
        assert!(end);
        assert_eq!(text, "Tschüss");

        let (text, end) = strip_sentinel("[[ENDE]ENDE]ENDE] Bis bald", "[ENDE]");
        assert!(end);
        assert_eq!(text, "ENDE] Bis bald");
    }

    #[tokio::test]
    async fn plain_reply_continues() {
        let p = planner(Arc::new(Canned(Ok("Wie ist Ihre Kundennummer?".to_string()))));
        let plan = p.plan(&history()).await;
        assert!(!plan.should_end);
        assert_eq!(plan.reply, "Wie ist Ihre Kundennummer?");
    }

    #[tokio::test]
    async fn generator_error_yields_apology_and_end() {
        let p = planner(Arc::new(Canned(Err(VoiceError::Llm("503".to_string())))));
        for _ in 0..2 {
            let plan = p.plan(&history()).await;
            assert_eq!(plan.reply, "Es tut mir leid, es gab einen technischen Fehler.");
            assert!(plan.should_end);
            assert_eq!(plan.source, PlanSource::Fallback);
        }
    }

    #[tokio::test]
    async fn generator_timeout_yields_apology() {
        let plan = planner(Arc::new(Stalled)).plan(&history()).await;
        assert_eq!(plan.source, PlanSource::Fallback);
        assert!(plan.should_end);
    }

    #[tokio::test]
    async fn empty_reply_is_a_failure() {
        let plan = planner(Arc::new(Canned(Ok("   ".to_string()))))
            .plan(&history())
            .await;
        assert_eq!(plan.source, PlanSource::Fallback);
    }

    #[test]
    fn planner_follows_mode() {
        let mut config = BotConfig::default();
        let planner = create_planner(&config, None).unwrap();
        assert!(!planner.speaks_reply());

        config.mode = BotMode::Agent;
        let generator: Arc<dyn TextGenerator> = Arc::new(Canned(Ok("Ja.".to_string())));
        let planner = create_planner(&config, Some(generator)).unwrap();
        assert!(planner.speaks_reply());
    }

    #[tokio::test]
    async fn identity_relays_last_caller_text() {
        let plan = IdentityPlanner.plan(&history()).await;
        assert_eq!(plan.reply, "Hallo");
        assert!(!plan.should_end);
        assert!(!IdentityPlanner.speaks_reply());
    }
}
