//! # sipbot-voice - per-call voice conversation engine
//!
//! Answers a call's media path with a turn-based spoken conversation: capture a window of
//! caller audio, transcribe it, optionally plan a reply, synthesize it and play it back.
//! Transcription mode only listens and forwards text; agent mode also answers and decides
//! when the conversation is over.
//!
//! ## Architecture
//!
//! ```text
//!  signaling/media stack
//!        │ SignalingEvent (mpsc)             ▲ CallControl::terminate
//!        ▼                                   │
//! ┌──────────────────┐  one task per call  ┌─┴──────────────────────────────────────────┐
//! │  CallDispatcher  │ ──────────────────► │ TurnLoop                                    │
//! │  (call registry) │  SessionSignal      │  AudioChannel ─► SpeechTranscriber          │
//! └──────────────────┘  (hang-up → end)    │        ▲              │                     │
//!                                          │        │              ▼                     │
//!                                          │  SpeechSynthesizer ◄─ ResponsePlanner      │
//!                                          │                        (Identity|Generative)│
//!                                          │  ConversationSession ─► TranscriptSink      │
//!                                          └─────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod conversation;
pub mod dispatcher;
pub mod error;
pub mod llm;
pub mod local;
pub mod planner;
pub mod session;
pub mod signaling;
pub mod sink;
pub mod stt;
pub mod tts;
pub mod turn_loop;

pub use audio::{
    AudioChannel, AudioContainer, AudioWindow, Capture, ChannelGuard, PlaybackReport,
    SynthesizedAudio,
};
pub use config::{BotConfig, BotMode};
pub use conversation::{ConversationHistory, Role, Utterance};
pub use dispatcher::CallDispatcher;
pub use error::{VoiceError, VoiceResult};
pub use llm::{ChatMessage, ChatRole, OpenAiChat, TextGenerator};
pub use local::LocalAudioChannel;
pub use planner::{
    create_planner, GenerativePlanner, IdentityPlanner, Plan, PlanSource, ResponsePlanner,
};
pub use session::{ConversationSession, SessionSignal, SessionState};
pub use signaling::{
    signaling_channel, CallControl, CallHandle, CallId, CallState, SignalingEvent, SignalingRx,
    SignalingTx,
};
pub use sink::{create_sink, ChannelSink, HttpSink, LogSink, TranscriptEvent, TranscriptSink};
pub use stt::{create_best_stt, OpenAiStt, PlaceholderStt, SpeechTranscriber, Transcription};
#[cfg(feature = "whisper")]
pub use stt::WhisperStt;
pub use tts::{create_best_tts, OpenAiTts, PlaceholderTts, SpeechSynthesizer};
pub use turn_loop::{
    CallSummary, CloseReason, LoopEvent, RepromptKind, StageTimeouts, TurnErrorKind, TurnLoop,
    TurnLoopConfig, TurnOutcome, TurnStage, VoiceServices,
};
