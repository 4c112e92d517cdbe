//! Audio channel abstraction for one call's bidirectional media path.
//!
//! The turn loop only ever needs two things from the media stack: "capture a window of
//! caller audio" and "play this audio to the caller". Everything else (RTP, codecs, jitter
//! buffers) stays behind [`AudioChannel`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::error::VoiceResult;

/// Sample rate of every [`AudioWindow`] (Hz).
pub const SAMPLE_RATE: u32 = 16_000;

/// Channel count of every [`AudioWindow`] (mono).
pub const CHANNELS: u16 = 1;

/// Bits per sample of every [`AudioWindow`] (signed 16-bit).
pub const BITS_PER_SAMPLE: u16 = 16;

/// Sample rate of headerless [`AudioContainer::Pcm16`] speech (OpenAI `pcm` output).
pub const PCM16_PLAYBACK_RATE: u32 = 24_000;

/// A fixed-format block of caller audio: mono, 16-bit signed, 16 kHz.
///
/// A window is never empty. A capture that produced nothing is [`Capture::NoAudio`], so the
/// loop can tell "silence" apart from "capture failed" (which is an error).
#[derive(Debug, Clone)]
pub struct AudioWindow {
    samples: Vec<i16>,
    duration: Duration,
    captured_at: DateTime<Utc>,
}

impl AudioWindow {
    /// PCM samples.
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// The configured window length this block was captured for.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// When capture of this window finished.
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Encode as a RIFF/WAV file for upload to a transcription API.
    pub fn to_wav(&self) -> Vec<u8> {
        pcm16_to_wav(&self.samples, SAMPLE_RATE)
    }

    /// Samples converted to f32 (-1.0..1.0), for local inference engines.
    pub fn samples_f32(&self) -> Vec<f32> {
        self.samples
            .iter()
            .map(|&s| f32::from(s) / f32::from(i16::MAX))
            .collect()
    }
}

/// Result of one capture request.
#[derive(Debug, Clone)]
pub enum Capture {
    /// Audio was captured for the full window.
    Window(AudioWindow),
    /// The channel yielded nothing. Expected outcome, not an error.
    NoAudio,
}

impl Capture {
    /// Build a capture result from raw samples; an empty buffer becomes `NoAudio`.
    pub fn from_samples(samples: Vec<i16>, window: Duration) -> Self {
        if samples.is_empty() {
            return Capture::NoAudio;
        }
        Capture::Window(AudioWindow {
            samples,
            duration: window,
            captured_at: Utc::now(),
        })
    }
}

/// Container of synthesized audio handed to [`AudioChannel::play`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioContainer {
    Mp3,
    Wav,
    /// Headerless 16-bit little-endian mono PCM at [`PCM16_PLAYBACK_RATE`].
    Pcm16,
}

impl AudioContainer {
    /// Value for the `response_format` field of OpenAI-compatible speech APIs.
    pub fn response_format(&self) -> &'static str {
        match self {
            AudioContainer::Mp3 => "mp3",
            AudioContainer::Wav => "wav",
            AudioContainer::Pcm16 => "pcm",
        }
    }

    /// Parse a configured format name (case-insensitive). `None` for anything playback
    /// cannot decode.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "mp3" => Some(AudioContainer::Mp3),
            "wav" => Some(AudioContainer::Wav),
            "pcm" | "pcm16" => Some(AudioContainer::Pcm16),
            _ => None,
        }
    }
}

/// Playback-ready audio produced by a speech synthesizer.
#[derive(Clone)]
pub struct SynthesizedAudio {
    pub bytes: Vec<u8>,
    pub container: AudioContainer,
}

impl SynthesizedAudio {
    pub fn new(bytes: Vec<u8>, container: AudioContainer) -> Self {
        Self { bytes, container }
    }

    /// Empty audio means "nothing to play".
    pub fn empty() -> Self {
        Self::new(Vec::new(), AudioContainer::Mp3)
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for SynthesizedAudio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynthesizedAudio")
            .field("bytes", &self.bytes.len())
            .field("container", &self.container)
            .finish()
    }
}

/// What the channel reports once playback has actually finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackReport {
    /// Measured time from start of playback to the end-of-playback event.
    pub played: Duration,
}

/// Bidirectional audio path of one call.
///
/// Implementations must be half-duplex friendly: the loop never calls `capture` and `play`
/// concurrently, and `play` must only return once the audio has really finished playing
/// (end-of-playback event or exact duration accounting, never an estimate).
#[async_trait]
pub trait AudioChannel: Send + Sync {
    /// Capture caller audio for `window`. Returns `Capture::NoAudio` when nothing arrived.
    async fn capture(&self, window: Duration) -> VoiceResult<Capture>;

    /// Play `audio` to the caller and resolve when playback has completed.
    async fn play(&self, audio: &SynthesizedAudio) -> VoiceResult<PlaybackReport>;

    /// Release the media path. Called at most once, by [`ChannelGuard`].
    fn release(&self);
}

/// Scoped ownership of an [`AudioChannel`]: released exactly once, explicitly or on drop.
pub struct ChannelGuard {
    channel: Box<dyn AudioChannel>,
    released: AtomicBool,
}

impl ChannelGuard {
    pub fn new(channel: Box<dyn AudioChannel>) -> Self {
        Self {
            channel,
            released: AtomicBool::new(false),
        }
    }

    pub async fn capture(&self, window: Duration) -> VoiceResult<Capture> {
        self.channel.capture(window).await
    }

    pub async fn play(&self, audio: &SynthesizedAudio) -> VoiceResult<PlaybackReport> {
        self.channel.play(audio).await
    }

    /// Release the channel. Returns `true` only for the call that actually released it.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.channel.release();
        debug!("Audio channel released");
        true
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Encode 16-bit mono PCM as a 44-byte-header WAV file.
pub fn pcm16_to_wav(samples: &[i16], sample_rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let block_align = CHANNELS * BITS_PER_SAMPLE / 8;
    let byte_rate = sample_rate * u32::from(block_align);

    let mut buf = Vec::with_capacity(44 + data_len as usize);
    // RIFF header
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_len).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    // fmt subchunk
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&CHANNELS.to_le_bytes());
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&byte_rate.to_le_bytes());
    buf.extend_from_slice(&block_align.to_le_bytes());
    buf.extend_from_slice(&BITS_PER_SAMPLE.to_le_bytes());
    // data subchunk
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    for &s in samples {
        buf.extend_from_slice(&s.to_le_bytes());
    }
    buf
}
