//! Scripted mock channel and backends shared by the integration tests.
//!
//! Nothing here touches audio hardware or the network: captures, transcripts, replies and
//! playback are all driven from in-memory scripts, and everything the engine does is
//! recorded for assertions.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sipbot_voice::llm::ChatMessage;
use sipbot_voice::{
    AudioChannel, AudioContainer, AudioWindow, CallControl, CallId, Capture, LoopEvent,
    PlaybackReport, SpeechSynthesizer, SpeechTranscriber, SynthesizedAudio, TextGenerator,
    Transcription, VoiceError, VoiceResult,
};
use tokio::sync::mpsc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("sipbot_voice=debug")
        .with_test_writer()
        .try_init();
}

// ── Audio channel ──────────────────────────────────────────────────

/// What the next `capture` call does.
#[derive(Debug, Clone, Copy)]
pub enum CaptureStep {
    /// A 100 ms window of low-level noise.
    Audio,
    /// Nothing arrived.
    Silence,
    /// The channel fails.
    Fail,
    /// Never returns (only cancellation gets the loop out).
    Hang,
    /// Panics inside the call task.
    Panic,
}

/// Everything the engine did to a [`ScriptedChannel`].
#[derive(Default)]
pub struct ChannelRecord {
    pub captures: AtomicUsize,
    pub releases: AtomicUsize,
    pub played: Mutex<Vec<String>>,
}

impl ChannelRecord {
    pub fn played(&self) -> Vec<String> {
        self.played.lock().unwrap().clone()
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

/// Capture follows the script, then hangs. Playback records the text the mock TTS encoded.
pub struct ScriptedChannel {
    script: Mutex<VecDeque<CaptureStep>>,
    record: Arc<ChannelRecord>,
    stall_playback: bool,
}

impl ScriptedChannel {
    pub fn new(script: impl IntoIterator<Item = CaptureStep>) -> (Self, Arc<ChannelRecord>) {
        let record = Arc::new(ChannelRecord::default());
        (
            Self {
                script: Mutex::new(script.into_iter().collect()),
                record: Arc::clone(&record),
                stall_playback: false,
            },
            record,
        )
    }

    /// Playback records its text and then never finishes.
    pub fn with_stalled_playback(mut self) -> Self {
        self.stall_playback = true;
        self
    }
}

#[async_trait]
impl AudioChannel for ScriptedChannel {
    async fn capture(&self, window: Duration) -> VoiceResult<Capture> {
        self.record.captures.fetch_add(1, Ordering::SeqCst);
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(CaptureStep::Hang);
        match step {
            CaptureStep::Audio => {
                tokio::task::yield_now().await;
                Ok(Capture::from_samples(vec![120; 1_600], window))
            }
            CaptureStep::Silence => {
                tokio::task::yield_now().await;
                Ok(Capture::NoAudio)
            }
            CaptureStep::Fail => Err(VoiceError::Capture("rtp socket closed".to_string())),
            CaptureStep::Hang => std::future::pending().await,
            CaptureStep::Panic => panic!("media stack exploded"),
        }
    }

    async fn play(&self, audio: &SynthesizedAudio) -> VoiceResult<PlaybackReport> {
        let text = String::from_utf8_lossy(&audio.bytes).to_string();
        self.record.played.lock().unwrap().push(text);
        if self.stall_playback {
            std::future::pending::<()>().await;
        }
        Ok(PlaybackReport {
            played: Duration::from_millis(1),
        })
    }

    fn release(&self) {
        self.record.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// A channel whose every capture hangs until the session ends.
pub fn idle_channel() -> (ScriptedChannel, Arc<ChannelRecord>) {
    ScriptedChannel::new(Vec::<CaptureStep>::new())
}

// ── Transcriber ────────────────────────────────────────────────────

/// One scripted transcription result. `None` is a service failure.
pub type SttStep = Option<Transcription>;

pub fn text(s: &str) -> SttStep {
    Some(Transcription::Text(s.to_string()))
}

#[derive(Default)]
pub struct SttRecord {
    /// Capture timestamp of every window handed to the transcriber.
    pub windows: Mutex<Vec<DateTime<Utc>>>,
    pub languages: Mutex<Vec<String>>,
}

impl SttRecord {
    pub fn windows(&self) -> Vec<DateTime<Utc>> {
        self.windows.lock().unwrap().clone()
    }
}

/// Answers from the script; `NoSpeech` once it runs out.
pub struct ScriptedStt {
    script: Mutex<VecDeque<SttStep>>,
    record: Arc<SttRecord>,
}

impl ScriptedStt {
    pub fn new(script: impl IntoIterator<Item = SttStep>) -> (Self, Arc<SttRecord>) {
        let record = Arc::new(SttRecord::default());
        (
            Self {
                script: Mutex::new(script.into_iter().collect()),
                record: Arc::clone(&record),
            },
            record,
        )
    }
}

#[async_trait]
impl SpeechTranscriber for ScriptedStt {
    async fn transcribe(
        &self,
        window: &AudioWindow,
        language: &str,
    ) -> VoiceResult<Transcription> {
        self.record.windows.lock().unwrap().push(window.captured_at());
        self.record
            .languages
            .lock()
            .unwrap()
            .push(language.to_string());
        match self.script.lock().unwrap().pop_front() {
            Some(Some(t)) => Ok(t),
            Some(None) => Err(VoiceError::Stt("STT API error 502".to_string())),
            None => Ok(Transcription::NoSpeech),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// A transcriber with an empty script: every window is `NoSpeech`.
pub fn idle_stt() -> ScriptedStt {
    ScriptedStt::new(Vec::<SttStep>::new()).0
}

/// A transcriber that never answers.
pub struct StalledStt;

#[async_trait]
impl SpeechTranscriber for StalledStt {
    async fn transcribe(
        &self,
        _window: &AudioWindow,
        _language: &str,
    ) -> VoiceResult<Transcription> {
        std::future::pending().await
    }

    fn name(&self) -> &'static str {
        "stalled"
    }
}

// ── Text generator ────────────────────────────────────────────────

/// Replies from the script (`None` = service failure) and keeps every request.
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Option<String>>>,
    pub requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedGenerator {
    pub fn new<'a>(script: impl IntoIterator<Item = Option<&'a str>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(
                script
                    .into_iter()
                    .map(|s| s.map(str::to_string))
                    .collect(),
            ),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, messages: &[ChatMessage]) -> VoiceResult<String> {
        self.requests.lock().unwrap().push(messages.to_vec());
        match self.script.lock().unwrap().pop_front() {
            Some(Some(reply)) => Ok(reply),
            _ => Err(VoiceError::Llm("chat API error 500".to_string())),
        }
    }
}

/// A generator that fails every request.
pub fn failing_generator() -> Arc<ScriptedGenerator> {
    ScriptedGenerator::new(Vec::<Option<&str>>::new())
}

/// A generator that never replies.
pub struct StalledGenerator;

#[async_trait]
impl TextGenerator for StalledGenerator {
    async fn generate(&self, _messages: &[ChatMessage]) -> VoiceResult<String> {
        std::future::pending().await
    }
}

// ── Synthesizer ───────────────────────────────────────────────────

/// Encodes the text itself as the "audio", so the channel can record what was said.
pub struct EchoTts {
    pub fail: bool,
}

#[async_trait]
impl SpeechSynthesizer for EchoTts {
    async fn synthesize(&self, text: &str) -> VoiceResult<SynthesizedAudio> {
        if self.fail {
            return Err(VoiceError::Tts("TTS API error 503".to_string()));
        }
        Ok(SynthesizedAudio::new(
            text.as_bytes().to_vec(),
            AudioContainer::Wav,
        ))
    }

    fn name(&self) -> &'static str {
        "echo"
    }
}

/// A synthesizer that never returns audio.
pub struct StalledTts;

#[async_trait]
impl SpeechSynthesizer for StalledTts {
    async fn synthesize(&self, _text: &str) -> VoiceResult<SynthesizedAudio> {
        std::future::pending().await
    }

    fn name(&self) -> &'static str {
        "stalled"
    }
}

// ── Call control ──────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingControl {
    pub terminated: Mutex<Vec<CallId>>,
}

impl RecordingControl {
    pub fn terminated(&self) -> Vec<CallId> {
        self.terminated.lock().unwrap().clone()
    }
}

#[async_trait]
impl CallControl for RecordingControl {
    async fn terminate(&self, call: CallId) -> VoiceResult<()> {
        self.terminated.lock().unwrap().push(call);
        Ok(())
    }
}

// ── Event helpers ─────────────────────────────────────────────────

/// Receive events until `pred` matches, returning everything seen (matching event last).
pub async fn wait_for(
    rx: &mut mpsc::UnboundedReceiver<LoopEvent>,
    mut pred: impl FnMut(&LoopEvent) -> bool,
) -> Vec<LoopEvent> {
    let mut seen = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = rx.recv().await {
            let hit = pred(&event);
            seen.push(event);
            if hit {
                return true;
            }
        }
        false
    })
    .await;
    assert!(
        matches!(result, Ok(true)),
        "expected event never arrived; saw {seen:?}"
    );
    seen
}

/// Drain whatever is already queued.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<LoopEvent>) -> Vec<LoopEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
