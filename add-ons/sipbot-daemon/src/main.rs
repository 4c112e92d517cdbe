//! sipbot daemon: answers one local softphone call with the voice conversation engine.
//!
//! The microphone and speakers stand in for the RTP media path, and this binary plays the
//! part of the signaling stack: it announces the call, hands the audio channel to the
//! dispatcher, and hangs up on Ctrl-C or when the bot ends the conversation.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use sipbot_voice::{
    create_best_stt, create_best_tts, create_planner, create_sink, signaling_channel, BotConfig,
    CallControl, CallDispatcher, CallHandle, CallId, CallState, LocalAudioChannel,
    SignalingEvent, VoiceResult, VoiceServices,
};
use tokio::sync::Notify;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Hang-up requests from the engine; the local "call" simply ends.
#[derive(Default)]
struct LocalCallControl {
    hung_up: Notify,
}

#[async_trait]
impl CallControl for LocalCallControl {
    async fn terminate(&self, call: CallId) -> VoiceResult<()> {
        tracing::info!(call_id = %call, "Bot hung up");
        self.hung_up.notify_one();
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[sipbot-daemon] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = BotConfig::load().context("load sipbot configuration")?;
    config.validate().context("invalid sipbot configuration")?;

    let services = VoiceServices::new(
        create_best_stt(&config),
        create_planner(&config, None).context("create response planner")?,
        create_best_tts(&config),
    )
    .with_sink(create_sink(&config).context("create transcript sink")?);

    let control = Arc::new(LocalCallControl::default());
    let (tx, rx) = signaling_channel(16);
    let dispatcher = CallDispatcher::new(services, config.turn_loop_config(), control.clone());
    let dispatcher = tokio::spawn(dispatcher.run(rx));

    tracing::info!(mode = ?config.mode, window = ?config.window(), "sipbot daemon started");

    let call = CallHandle::new("local:softphone");
    for state in [CallState::Ringing, CallState::Connected] {
        tx.send(SignalingEvent::CallStateChanged {
            call: call.clone(),
            state,
        })
        .await
        .context("dispatcher stopped")?;
    }
    match LocalAudioChannel::input_devices() {
        Ok(devices) => tracing::info!(devices = ?devices, "Input devices"),
        Err(e) => tracing::warn!(error = %e, "Could not list input devices"),
    }
    let channel = LocalAudioChannel::open().context("open local audio devices")?;
    tx.send(SignalingEvent::MediaActive {
        call: call.clone(),
        channel: Box::new(channel),
    })
    .await
    .context("dispatcher stopped")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("CTRL-C received; hanging up");
            tx.send(SignalingEvent::CallStateChanged {
                call: call.clone(),
                state: CallState::Disconnected,
            })
            .await
            .context("dispatcher stopped")?;
        }
        _ = control.hung_up.notified() => {}
    }

    drop(tx);
    let handled = dispatcher.await.context("dispatcher task failed")?;
    tracing::info!(calls = handled, "sipbot daemon stopped");
    Ok(())
}
