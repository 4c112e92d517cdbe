//! Local softphone: an [`AudioChannel`] over the host's default microphone and speaker.
//!
//! `cpal::Stream` and `rodio::OutputStream` are `!Send` on some platforms, so both live on a
//! dedicated OS thread and every operation is a command sent to it. Playback completion is
//! the sink draining (`Sink::sleep_until_end`), measured on a blocking task.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use rubato::{FftFixedIn, Resampler as _};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::audio::{
    AudioChannel, AudioContainer, Capture, PlaybackReport, SynthesizedAudio,
    PCM16_PLAYBACK_RATE, SAMPLE_RATE,
};
use crate::error::{VoiceError, VoiceResult};

enum AudioCommand {
    /// Clear the buffer and start keeping microphone samples.
    StartCapture {
        reply: oneshot::Sender<VoiceResult<()>>,
    },
    /// Stop keeping samples; reply with 16 kHz mono PCM.
    StopCapture {
        reply: oneshot::Sender<VoiceResult<Vec<i16>>>,
    },
    /// Decode and start playing; reply with the sink so the caller can wait for the end.
    Play {
        audio: SynthesizedAudio,
        reply: oneshot::Sender<VoiceResult<Sink>>,
    },
    Shutdown,
}

/// Microphone state shared with the cpal callback.
struct InputState {
    buffer: Arc<Mutex<Vec<f32>>>,
    recording: Arc<AtomicBool>,
    sample_rate: u32,
    channels: u16,
}

/// `Send + Sync` handle to the audio thread.
pub struct LocalAudioChannel {
    cmd_tx: mpsc::Sender<AudioCommand>,
    current: Mutex<Option<Arc<Sink>>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl LocalAudioChannel {
    /// Spawn the audio thread on the default input and output devices.
    pub fn open() -> VoiceResult<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel::<AudioCommand>();
        let (init_tx, init_rx) = mpsc::channel::<VoiceResult<()>>();

        let thread = thread::Builder::new()
            .name("sipbot-audio".into())
            .spawn(move || run_audio_thread(cmd_rx, init_tx))?;

        init_rx
            .recv()
            .map_err(|_| VoiceError::AudioChannel("audio thread died during init".to_string()))??;

        Ok(Self {
            cmd_tx,
            current: Mutex::new(None),
            thread: Some(thread),
        })
    }

    /// Names of the host's input devices (for diagnostics).
    pub fn input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        Ok(host
            .input_devices()?
            .filter_map(|d| d.name().ok())
            .collect())
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<VoiceResult<T>>) -> AudioCommand,
    ) -> VoiceResult<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .map_err(|_| VoiceError::AudioChannel("audio thread stopped".to_string()))?;
        rx.await
            .map_err(|_| VoiceError::AudioChannel("audio thread dropped request".to_string()))?
    }

    fn set_current(&self, sink: Option<Arc<Sink>>) {
        if let Ok(mut current) = self.current.lock() {
            *current = sink;
        }
    }
}

#[async_trait]
impl AudioChannel for LocalAudioChannel {
    async fn capture(&self, window: Duration) -> VoiceResult<Capture> {
        self.request(|reply| AudioCommand::StartCapture { reply })
            .await
            .map_err(|e| VoiceError::Capture(e.to_string()))?;
        tokio::time::sleep(window).await;
        let samples = self
            .request(|reply| AudioCommand::StopCapture { reply })
            .await?;
        debug!(samples = samples.len(), "Local capture window done");
        Ok(Capture::from_samples(samples, window))
    }

    async fn play(&self, audio: &SynthesizedAudio) -> VoiceResult<PlaybackReport> {
        if audio.is_empty() {
            return Ok(PlaybackReport {
                played: Duration::ZERO,
            });
        }
        let sink = Arc::new(
            self.request(|reply| AudioCommand::Play {
                audio: audio.clone(),
                reply,
            })
            .await?,
        );
        self.set_current(Some(Arc::clone(&sink)));

        let started = Instant::now();
        let waiter = Arc::clone(&sink);
        let waited = tokio::task::spawn_blocking(move || waiter.sleep_until_end()).await;
        self.set_current(None);
        waited.map_err(|e| VoiceError::Playback(format!("playback wait failed: {}", e)))?;

        Ok(PlaybackReport {
            played: started.elapsed(),
        })
    }

    fn release(&self) {
        if let Ok(mut current) = self.current.lock() {
            if let Some(sink) = current.take() {
                sink.stop();
            }
        }
        if self.cmd_tx.send(AudioCommand::Shutdown).is_err() {
            debug!("Audio thread already stopped");
        }
    }
}

impl Drop for LocalAudioChannel {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(AudioCommand::Shutdown);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("Audio thread panicked");
            }
        }
    }
}

fn run_audio_thread(cmd_rx: mpsc::Receiver<AudioCommand>, init_tx: mpsc::Sender<VoiceResult<()>>) {
    let (input, _stream, _output, output_handle) = match open_devices() {
        Ok(devices) => {
            let _ = init_tx.send(Ok(()));
            devices
        }
        Err(e) => {
            let _ = init_tx.send(Err(e));
            return;
        }
    };

    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            AudioCommand::StartCapture { reply } => {
                if let Ok(mut buf) = input.buffer.lock() {
                    buf.clear();
                }
                input.recording.store(true, Ordering::SeqCst);
                let _ = reply.send(Ok(()));
            }
            AudioCommand::StopCapture { reply } => {
                input.recording.store(false, Ordering::SeqCst);
                let raw = match input.buffer.lock() {
                    Ok(mut buf) => std::mem::take(&mut *buf),
                    Err(e) => {
                        let _ = reply.send(Err(VoiceError::Capture(e.to_string())));
                        continue;
                    }
                };
                let _ = reply.send(to_window_pcm(&raw, input.channels, input.sample_rate));
            }
            AudioCommand::Play { audio, reply } => {
                let _ = reply.send(start_playback(&output_handle, audio));
            }
            AudioCommand::Shutdown => break,
        }
    }
    info!("Local audio thread stopped");
}

type Devices = (InputState, Stream, OutputStream, OutputStreamHandle);

fn open_devices() -> VoiceResult<Devices> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| VoiceError::AudioChannel("no default input device".to_string()))?;
    let config = device
        .default_input_config()
        .map_err(|e| VoiceError::AudioChannel(e.to_string()))?;

    let input = InputState {
        buffer: Arc::new(Mutex::new(Vec::new())),
        recording: Arc::new(AtomicBool::new(false)),
        sample_rate: config.sample_rate().0,
        channels: config.channels(),
    };
    let stream = build_input_stream(&device, &config, &input)?;
    stream.play()?;

    let (output, output_handle) =
        OutputStream::try_default().map_err(|e| VoiceError::Playback(e.to_string()))?;

    info!(
        device = %device.name().unwrap_or_default(),
        rate = input.sample_rate,
        channels = input.channels,
        "Local softphone audio ready"
    );
    Ok((input, stream, output, output_handle))
}

fn build_input_stream(
    device: &cpal::Device,
    config: &cpal::SupportedStreamConfig,
    input: &InputState,
) -> VoiceResult<Stream> {
    let stream_config: StreamConfig = config.clone().into();
    let err_fn = |err: cpal::StreamError| {
        error!(%err, "Audio input stream error");
    };

    let stream = match config.sample_format() {
        SampleFormat::F32 => {
            let buffer = Arc::clone(&input.buffer);
            let recording = Arc::clone(&input.recording);
            device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if !recording.load(Ordering::Relaxed) {
                        return;
                    }
                    if let Ok(mut buf) = buffer.lock() {
                        buf.extend_from_slice(data);
                    }
                },
                err_fn,
                None,
            )?
        }
        SampleFormat::I16 => {
            let buffer = Arc::clone(&input.buffer);
            let recording = Arc::clone(&input.recording);
            device.build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    if !recording.load(Ordering::Relaxed) {
                        return;
                    }
                    if let Ok(mut buf) = buffer.lock() {
                        buf.extend(data.iter().map(|&s| f32::from(s) / 32768.0));
                    }
                },
                err_fn,
                None,
            )?
        }
        other => {
            return Err(VoiceError::AudioChannel(format!(
                "unsupported input sample format {:?}",
                other
            )))
        }
    };
    Ok(stream)
}

fn start_playback(handle: &OutputStreamHandle, audio: SynthesizedAudio) -> VoiceResult<Sink> {
    let sink = Sink::try_new(handle).map_err(|e| VoiceError::Playback(e.to_string()))?;
    match audio.container {
        AudioContainer::Pcm16 => {
            let samples = pcm16_le_samples(&audio.bytes);
            sink.append(rodio::buffer::SamplesBuffer::new(1, PCM16_PLAYBACK_RATE, samples));
        }
        AudioContainer::Mp3 | AudioContainer::Wav => {
            let source = rodio::Decoder::new(Cursor::new(audio.bytes))
                .map_err(|e| VoiceError::Playback(format!("Decode failed: {}", e)))?;
            sink.append(source.convert_samples::<f32>());
        }
    }
    Ok(sink)
}

fn pcm16_le_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let channels = usize::from(channels);
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Device-rate interleaved f32 to the window format (16 kHz mono i16).
fn to_window_pcm(raw: &[f32], channels: u16, rate: u32) -> VoiceResult<Vec<i16>> {
    let mono = downmix(raw, channels);
    let resampled = if rate == SAMPLE_RATE {
        mono
    } else {
        resample(&mono, rate, SAMPLE_RATE)?
    };
    Ok(resampled
        .into_iter()
        .map(|s| (s.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16)
        .collect())
}

fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> VoiceResult<Vec<f32>> {
    if samples.is_empty() {
        return Ok(Vec::new());
    }
    let chunk_size = 1024;
    let mut resampler = FftFixedIn::<f32>::new(
        from_rate as usize,
        to_rate as usize,
        chunk_size,
        2,
        1,
    )
    .map_err(|e| VoiceError::Capture(format!("resampler init failed: {}", e)))?;

    let mut output = Vec::with_capacity(samples.len() * to_rate as usize / from_rate as usize + 1);
    for chunk in samples.chunks(chunk_size) {
        let take = if chunk.len() == chunk_size {
            None
        } else {
            Some((chunk.len() as f64 * f64::from(to_rate) / f64::from(from_rate)).ceil() as usize)
        };
        let mut padded;
        let input = if chunk.len() == chunk_size {
            chunk
        } else {
            padded = vec![0.0f32; chunk_size];
            padded[..chunk.len()].copy_from_slice(chunk);
            &padded[..]
        };
        let result = resampler
            .process(&[input], None)
            .map_err(|e| VoiceError::Capture(format!("resample failed: {}", e)))?;
        if let Some(channel) = result.first() {
            let n = take.unwrap_or(channel.len()).min(channel.len());
            output.extend_from_slice(&channel[..n]);
        }
    }
    Ok(output)
}
