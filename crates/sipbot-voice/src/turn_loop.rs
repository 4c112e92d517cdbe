//! **TurnLoop**: the per-call conversation state machine.
//!
//! ```text
//! Greeting ─► Listening ─► Transcribing ─► Planning ─► Speaking ─► CheckEnd ─► Closed
//!                 ▲  │ NoAudio      │ NoSpeech / retry                   │
//!                 └──┴──────────────┴────────────────────────────────────┘
//! ```
//!
//! One loop per call, one stage at a time. Every transition checks the session signal first;
//! a stage that is waiting on I/O is additionally raced against the signal so a hang-up cuts
//! it short. All paths end in `Closed`, which releases the audio channel exactly once.

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::audio::{AudioChannel, AudioWindow, Capture, ChannelGuard};
use crate::conversation::Role;
use crate::error::{VoiceError, VoiceResult};
use crate::planner::ResponsePlanner;
use crate::session::{ConversationSession, SessionSignal};
use crate::signaling::{CallControl, CallHandle, CallId};
use crate::sink::{TranscriptEvent, TranscriptSink};
use crate::stt::{SpeechTranscriber, Transcription};
use crate::tts::SpeechSynthesizer;

/// Observable stage of the turn loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStage {
    Greeting,
    Listening,
    Transcribing,
    Planning,
    Speaking,
    CheckEnd,
    Closed,
}

/// Why a turn did not produce a normal continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnErrorKind {
    /// The channel yielded no audio for the window.
    NoAudio,
    /// Audio arrived but nothing was recognised.
    NoSpeech,
    /// Transcription failed with the retry budget exhausted.
    TranscriptionFailed,
    /// The audio channel failed or timed out.
    ResourceAcquisitionFailure,
    /// The session was ended mid-turn.
    CallTerminated,
}

/// Result of one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    Continue,
    EndRequested,
    Error(TurnErrorKind),
}

/// Which re-prompt was played.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepromptKind {
    NoAudio,
    NoSpeech,
}

/// Why the conversation reached `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The planner decided to end the conversation.
    Completed,
    /// The far end hung up.
    RemoteHangup,
    /// `request_end()` from outside (shutdown, operator).
    EndRequested,
    TranscriptionFailed,
    ResourceFailure,
}

/// Stage and lifecycle notifications for observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LoopEvent {
    StageChanged {
        call_id: CallId,
        stage: TurnStage,
    },
    Reprompted {
        call_id: CallId,
        kind: RepromptKind,
    },
    TurnCompleted {
        call_id: CallId,
        turn: u32,
        outcome: TurnOutcome,
    },
    Closed {
        call_id: CallId,
        reason: CloseReason,
    },
}

/// What a finished call looked like.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSummary {
    pub call_id: CallId,
    /// Turns that ran to an outcome, silent ones included.
    pub turns: u32,
    pub caller_utterances: usize,
    pub reprompts: u32,
    pub reason: CloseReason,
}

/// Deadlines for each external step.
#[derive(Debug, Clone)]
pub struct StageTimeouts {
    /// Added to the window length for the capture deadline.
    pub capture_grace: Duration,
    pub transcribe: Duration,
    pub synthesize: Duration,
    pub playback: Duration,
    pub sink: Duration,
    pub terminate: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            capture_grace: Duration::from_secs(2),
            transcribe: Duration::from_secs(30),
            synthesize: Duration::from_secs(30),
            playback: Duration::from_secs(60),
            sink: Duration::from_secs(5),
            terminate: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TurnLoopConfig {
    pub window: Duration,
    /// Consecutive empty turns before a re-prompt; 0 disables re-prompts.
    pub silence_reprompt_threshold: u32,
    pub transcription_retry_budget: u32,
    pub language: String,
    /// Spoken once before the first turn (agent mode).
    pub greeting: Option<String>,
    pub reprompt_no_audio: String,
    pub reprompt_no_speech: String,
    pub timeouts: StageTimeouts,
}

impl Default for TurnLoopConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(2),
            silence_reprompt_threshold: 1,
            transcription_retry_budget: 1,
            language: "de".to_string(),
            greeting: None,
            reprompt_no_audio: "Ich habe Sie nicht verstanden. Bitte wiederholen Sie.".to_string(),
            reprompt_no_speech: "Entschuldigung, ich habe Sie nicht verstanden.".to_string(),
            timeouts: StageTimeouts::default(),
        }
    }
}

/// Stateless service clients shared by every call.
#[derive(Clone)]
pub struct VoiceServices {
    pub transcriber: Arc<dyn SpeechTranscriber>,
    pub planner: Arc<dyn ResponsePlanner>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub sink: Option<Arc<dyn TranscriptSink>>,
}

impl VoiceServices {
    pub fn new(
        transcriber: Arc<dyn SpeechTranscriber>,
        planner: Arc<dyn ResponsePlanner>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
    ) -> Self {
        Self {
            transcriber,
            planner,
            synthesizer,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn TranscriptSink>) -> Self {
        self.sink = Some(sink);
        self
    }
}

/// Internal step, carrying the data the next stage needs.
enum Step {
    Greeting,
    Listening,
    Transcribing { window: AudioWindow, attempt: u32 },
    Planning,
    Speaking { text: Option<String>, should_end: bool },
    CheckEnd { should_end: bool },
    Closed(CloseReason),
}

impl Step {
    fn stage(&self) -> TurnStage {
        match self {
            Step::Greeting => TurnStage::Greeting,
            Step::Listening => TurnStage::Listening,
            Step::Transcribing { .. } => TurnStage::Transcribing,
            Step::Planning => TurnStage::Planning,
            Step::Speaking { .. } => TurnStage::Speaking,
            Step::CheckEnd { .. } => TurnStage::CheckEnd,
            Step::Closed(_) => TurnStage::Closed,
        }
    }

    /// A turn is in flight once audio has been captured.
    fn mid_turn(&self) -> bool {
        !matches!(self, Step::Greeting | Step::Listening | Step::Closed(_))
    }
}

/// Run `fut` unless the session ends first.
async fn cancellable<T>(signal: &SessionSignal, fut: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        biased;
        _ = signal.cancelled() => None,
        out = fut => Some(out),
    }
}

/// Run `fut` with a deadline, cut short by the session ending.
async fn guarded<T>(
    signal: &SessionSignal,
    stage: TurnStage,
    limit: Duration,
    fut: impl Future<Output = VoiceResult<T>>,
) -> VoiceResult<T> {
    match cancellable(signal, tokio::time::timeout(limit, fut)).await {
        None => Err(VoiceError::CallTerminated),
        Some(Ok(res)) => res,
        Some(Err(_)) => Err(VoiceError::Timeout {
            stage,
            after: limit,
        }),
    }
}

/// Drives one call from media activation to `Closed`.
pub struct TurnLoop {
    call: CallHandle,
    session: ConversationSession,
    signal: SessionSignal,
    channel: ChannelGuard,
    services: VoiceServices,
    config: TurnLoopConfig,
    control: Arc<dyn CallControl>,
    event_tx: Option<mpsc::UnboundedSender<LoopEvent>>,
    silent_turns: u32,
    turns: u32,
    reprompts: u32,
}

impl TurnLoop {
    pub fn new(
        call: CallHandle,
        channel: Box<dyn AudioChannel>,
        signal: SessionSignal,
        services: VoiceServices,
        config: TurnLoopConfig,
        control: Arc<dyn CallControl>,
    ) -> Self {
        let session = ConversationSession::with_signal(call.id(), signal.clone());
        Self {
            call,
            session,
            signal,
            channel: ChannelGuard::new(channel),
            services,
            config,
            control,
            event_tx: None,
            silent_turns: 0,
            turns: 0,
            reprompts: 0,
        }
    }

    /// Emit [`LoopEvent`]s on `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<LoopEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Handle for ending this conversation from outside.
    pub fn signal(&self) -> SessionSignal {
        self.signal.clone()
    }

    fn call_id(&self) -> CallId {
        self.call.id()
    }

    /// Run the conversation to completion.
    pub async fn run(mut self) -> CallSummary {
        let mut step = if self.signal.activate() {
            info!(
                call_id = %self.call_id(),
                remote = %self.call.remote_uri(),
                window = ?self.config.window,
                "Conversation started"
            );
            if self.config.greeting.is_some() && self.services.planner.speaks_reply() {
                Step::Greeting
            } else {
                Step::Listening
            }
        } else {
            debug!(call_id = %self.call_id(), "Session ended before media handling started");
            Step::Closed(self.cancel_reason())
        };

        loop {
            if !matches!(step, Step::Closed(_)) && !self.signal.is_active() {
                if step.mid_turn() {
                    self.finish_turn(TurnOutcome::Error(TurnErrorKind::CallTerminated));
                }
                step = Step::Closed(self.cancel_reason());
            }
            self.emit(LoopEvent::StageChanged {
                call_id: self.call_id(),
                stage: step.stage(),
            });

            step = match step {
                Step::Greeting => self.greet().await,
                Step::Listening => self.listen().await,
                Step::Transcribing { window, attempt } => self.transcribe(window, attempt).await,
                Step::Planning => self.plan().await,
                Step::Speaking { text, should_end } => self.speak(text, should_end).await,
                Step::CheckEnd { should_end } => self.check_end(should_end),
                Step::Closed(reason) => return self.close(reason).await,
            };
        }
    }

    async fn greet(&mut self) -> Step {
        let Some(text) = self.config.greeting.clone() else {
            return Step::Listening;
        };
        self.record(Role::Agent, &text).await;
        match self.say(&text).await {
            Ok(()) => Step::Listening,
            Err(_) => self.terminated(),
        }
    }

    async fn listen(&mut self) -> Step {
        let window = self.config.window;
        let limit = window + self.config.timeouts.capture_grace;
        let captured = guarded(
            &self.signal,
            TurnStage::Listening,
            limit,
            self.channel.capture(window),
        )
        .await;

        match captured {
            Ok(Capture::Window(audio)) => Step::Transcribing {
                window: audio,
                attempt: 0,
            },
            Ok(Capture::NoAudio) => {
                debug!(call_id = %self.call_id(), "No audio in window");
                self.on_silence(RepromptKind::NoAudio).await
            }
            Err(VoiceError::CallTerminated) => self.terminated(),
            Err(e) => {
                error!(call_id = %self.call_id(), error = %e, "Audio capture failed; closing call");
                self.finish_turn(TurnOutcome::Error(
                    TurnErrorKind::ResourceAcquisitionFailure,
                ));
                Step::Closed(CloseReason::ResourceFailure)
            }
        }
    }

    async fn transcribe(&mut self, window: AudioWindow, attempt: u32) -> Step {
        let transcriber = Arc::clone(&self.services.transcriber);
        let result = guarded(
            &self.signal,
            TurnStage::Transcribing,
            self.config.timeouts.transcribe,
            transcriber.transcribe(&window, &self.config.language),
        )
        .await;

        match result {
            Ok(Transcription::Text(text)) => {
                self.silent_turns = 0;
                info!(call_id = %self.call_id(), text = %text, "Caller");
                self.record(Role::Caller, &text).await;
                Step::Planning
            }
            Ok(Transcription::NoSpeech) => {
                debug!(call_id = %self.call_id(), "No speech recognised");
                self.on_silence(RepromptKind::NoSpeech).await
            }
            Err(VoiceError::CallTerminated) => self.terminated(),
            Err(e) if attempt < self.config.transcription_retry_budget => {
                warn!(
                    call_id = %self.call_id(),
                    error = %e,
                    timeout = e.is_timeout(),
                    attempt = attempt + 1,
                    backend = transcriber.name(),
                    "Transcription failed; retrying window"
                );
                Step::Transcribing {
                    window,
                    attempt: attempt + 1,
                }
            }
            Err(e) => {
                error!(
                    call_id = %self.call_id(),
                    error = %e,
                    attempts = attempt + 1,
                    "Transcription failed; retry budget exhausted"
                );
                self.finish_turn(TurnOutcome::Error(TurnErrorKind::TranscriptionFailed));
                Step::Closed(CloseReason::TranscriptionFailed)
            }
        }
    }

    async fn plan(&mut self) -> Step {
        let planner = Arc::clone(&self.services.planner);
        let snapshot = self.session.snapshot();
        let Some(plan) = cancellable(&self.signal, planner.plan(&snapshot)).await else {
            return self.terminated();
        };
        debug!(
            call_id = %self.call_id(),
            source = ?plan.source,
            should_end = plan.should_end,
            "Plan ready"
        );

        let text = if planner.speaks_reply() && !plan.reply.is_empty() {
            info!(call_id = %self.call_id(), text = %plan.reply, "Agent");
            self.record(Role::Agent, &plan.reply).await;
            Some(plan.reply)
        } else {
            None
        };
        Step::Speaking {
            text,
            should_end: plan.should_end,
        }
    }

    async fn speak(&mut self, text: Option<String>, should_end: bool) -> Step {
        if let Some(text) = text {
            if self.say(&text).await.is_err() {
                return self.terminated();
            }
        }
        Step::CheckEnd { should_end }
    }

    fn check_end(&mut self, should_end: bool) -> Step {
        if should_end {
            self.signal.request_end();
            self.finish_turn(TurnOutcome::EndRequested);
            return Step::Closed(CloseReason::Completed);
        }
        if !self.signal.is_active() {
            return self.terminated();
        }
        self.finish_turn(TurnOutcome::Continue);
        Step::Listening
    }

    /// Empty turn: count it, re-prompt at the threshold, keep listening.
    async fn on_silence(&mut self, kind: RepromptKind) -> Step {
        let error = match kind {
            RepromptKind::NoAudio => TurnErrorKind::NoAudio,
            RepromptKind::NoSpeech => TurnErrorKind::NoSpeech,
        };
        self.finish_turn(TurnOutcome::Error(error));
        self.silent_turns += 1;

        let threshold = self.config.silence_reprompt_threshold;
        if threshold == 0 || self.silent_turns < threshold {
            return Step::Listening;
        }
        self.silent_turns = 0;

        if !self.services.planner.speaks_reply() {
            debug!(call_id = %self.call_id(), kind = ?kind, "Silence threshold reached (passive)");
            return Step::Listening;
        }

        let text = match kind {
            RepromptKind::NoAudio => self.config.reprompt_no_audio.clone(),
            RepromptKind::NoSpeech => self.config.reprompt_no_speech.clone(),
        };
        self.reprompts += 1;
        info!(call_id = %self.call_id(), kind = ?kind, "Re-prompting caller");
        self.emit(LoopEvent::Reprompted {
            call_id: self.call_id(),
            kind,
        });
        match self.say(&text).await {
            Ok(()) => Step::Listening,
            Err(_) => self.terminated(),
        }
    }

    /// Synthesize and play `text`. Synthesis and playback failures are logged and skipped;
    /// the only error returned is `CallTerminated`.
    async fn say(&self, text: &str) -> VoiceResult<()> {
        let synthesizer = Arc::clone(&self.services.synthesizer);
        let audio = match guarded(
            &self.signal,
            TurnStage::Speaking,
            self.config.timeouts.synthesize,
            synthesizer.synthesize(text),
        )
        .await
        {
            Ok(audio) => audio,
            Err(VoiceError::CallTerminated) => return Err(VoiceError::CallTerminated),
            Err(e) => {
                warn!(
                    call_id = %self.call_id(),
                    error = %e,
                    timeout = e.is_timeout(),
                    backend = synthesizer.name(),
                    "Synthesis failed; skipping playback"
                );
                return Ok(());
            }
        };
        if audio.is_empty() {
            debug!(call_id = %self.call_id(), "Nothing to play");
            return Ok(());
        }

        match guarded(
            &self.signal,
            TurnStage::Speaking,
            self.config.timeouts.playback,
            self.channel.play(&audio),
        )
        .await
        {
            Ok(report) => {
                debug!(call_id = %self.call_id(), played = ?report.played, "Playback finished");
                Ok(())
            }
            Err(VoiceError::CallTerminated) => Err(VoiceError::CallTerminated),
            Err(e) => {
                warn!(call_id = %self.call_id(), error = %e, "Playback failed");
                Ok(())
            }
        }
    }

    /// Append to the history and push to the transcript sink, best effort.
    async fn record(&mut self, role: Role, text: &str) {
        let call_id = self.call_id();
        let event = TranscriptEvent::from_utterance(call_id, self.session.append_turn(role, text));
        let Some(sink) = self.services.sink.as_ref() else {
            return;
        };
        match tokio::time::timeout(self.config.timeouts.sink, sink.push(&event)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(call_id = %call_id, error = %e, "Transcript sink push failed"),
            Err(_) => warn!(call_id = %call_id, "Transcript sink push timed out"),
        }
    }

    fn terminated(&mut self) -> Step {
        debug!(call_id = %self.call_id(), "Session ended mid-turn");
        self.finish_turn(TurnOutcome::Error(TurnErrorKind::CallTerminated));
        Step::Closed(self.cancel_reason())
    }

    fn cancel_reason(&self) -> CloseReason {
        if self.signal.remote_gone() {
            CloseReason::RemoteHangup
        } else {
            CloseReason::EndRequested
        }
    }

    fn finish_turn(&mut self, outcome: TurnOutcome) {
        self.turns += 1;
        self.emit(LoopEvent::TurnCompleted {
            call_id: self.call_id(),
            turn: self.turns,
            outcome,
        });
    }

    async fn close(self, reason: CloseReason) -> CallSummary {
        let call_id = self.call_id();
        self.channel.release();
        self.signal.close();

        if !self.signal.remote_gone() {
            match tokio::time::timeout(
                self.config.timeouts.terminate,
                self.control.terminate(call_id),
            )
            .await
            {
                Ok(Ok(())) => debug!(call_id = %call_id, "Terminate requested"),
                Ok(Err(e)) => warn!(call_id = %call_id, error = %e, "Terminate failed"),
                Err(_) => warn!(call_id = %call_id, "Terminate timed out"),
            }
        }

        let summary = CallSummary {
            call_id,
            turns: self.turns,
            caller_utterances: self.session.history().caller_turns(),
            reprompts: self.reprompts,
            reason,
        };
        self.emit(LoopEvent::Closed { call_id, reason });
        info!(
            call_id = %call_id,
            turns = summary.turns,
            reprompts = summary.reprompts,
            reason = ?reason,
            "Conversation closed"
        );
        summary
    }

    /// Best-effort: a dropped receiver is logged once per event and ignored.
    fn emit(&self, event: LoopEvent) {
        if let Some(tx) = &self.event_tx {
            if tx.send(event).is_err() {
                debug!(call_id = %self.call_id(), "Loop event receiver dropped");
            }
        }
    }
}
