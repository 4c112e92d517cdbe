//! Call lifecycle through the `CallDispatcher`: signaling events in, summaries out.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use sipbot_voice::{
    signaling_channel, CallDispatcher, CallHandle, CallState, CallSummary, CloseReason,
    IdentityPlanner, LoopEvent, SignalingEvent, SignalingTx, TurnLoopConfig, TurnStage,
    VoiceServices,
};
use tokio::sync::mpsc;

fn services() -> VoiceServices {
    VoiceServices::new(
        Arc::new(idle_stt()),
        Arc::new(IdentityPlanner),
        Arc::new(EchoTts { fail: false }),
    )
}

fn config() -> TurnLoopConfig {
    TurnLoopConfig {
        window: Duration::from_millis(50),
        silence_reprompt_threshold: 0,
        ..TurnLoopConfig::default()
    }
}

struct Running {
    tx: SignalingTx,
    control: Arc<RecordingControl>,
    events: mpsc::UnboundedReceiver<LoopEvent>,
    summaries: mpsc::UnboundedReceiver<CallSummary>,
    dispatcher: tokio::task::JoinHandle<usize>,
}

fn spawn_dispatcher() -> Running {
    init_tracing();
    let control = Arc::new(RecordingControl::default());
    let (tx, rx) = signaling_channel(16);
    let (event_tx, events) = mpsc::unbounded_channel();
    let (summary_tx, summaries) = mpsc::unbounded_channel();
    let dispatcher = CallDispatcher::new(services(), config(), control.clone())
        .with_events(event_tx)
        .with_summaries(summary_tx);
    Running {
        tx,
        control,
        events,
        summaries,
        dispatcher: tokio::spawn(dispatcher.run(rx)),
    }
}

async fn announce(tx: &SignalingTx, call: &CallHandle) {
    for state in [CallState::Ringing, CallState::Connected] {
        tx.send(SignalingEvent::CallStateChanged {
            call: call.clone(),
            state,
        })
        .await
        .unwrap();
    }
}

async fn media(tx: &SignalingTx, call: &CallHandle, channel: ScriptedChannel) {
    tx.send(SignalingEvent::MediaActive {
        call: call.clone(),
        channel: Box::new(channel),
    })
    .await
    .unwrap();
}

async fn next_summary(rx: &mut mpsc::UnboundedReceiver<CallSummary>) -> CallSummary {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no summary")
        .expect("summary channel closed")
}

#[tokio::test]
async fn remote_hangup_ends_call_without_terminate() {
    let mut r = spawn_dispatcher();
    let call = CallHandle::new("sip:alice@example.org");
    let (channel, record) = ScriptedChannel::new([CaptureStep::Audio]);

    announce(&r.tx, &call).await;
    media(&r.tx, &call, channel).await;
    wait_for(&mut r.events, |e| {
        matches!(e, LoopEvent::StageChanged { stage: TurnStage::Listening, .. })
    })
    .await;
    r.tx.send(SignalingEvent::CallStateChanged {
        call: call.clone(),
        state: CallState::Disconnected,
    })
    .await
    .unwrap();

    let summary = next_summary(&mut r.summaries).await;
    assert_eq!(summary.call_id, call.id());
    assert_eq!(summary.reason, CloseReason::RemoteHangup);
    assert!(r.control.terminated().is_empty());
    assert_eq!(record.releases(), 1);

    drop(r.tx);
    assert_eq!(r.dispatcher.await.unwrap(), 1);
}

#[tokio::test]
async fn closing_signaling_ends_every_call() {
    let mut r = spawn_dispatcher();
    let calls: Vec<CallHandle> = (0..3)
        .map(|i| CallHandle::new(format!("sip:caller{i}@example.org")))
        .collect();
    let mut records = Vec::new();
    for call in &calls {
        let (channel, record) = idle_channel();
        records.push(record);
        announce(&r.tx, call).await;
        media(&r.tx, call, channel).await;
    }
    let mut listening = 0;
    wait_for(&mut r.events, |e| {
        if matches!(e, LoopEvent::StageChanged { stage: TurnStage::Listening, .. }) {
            listening += 1;
        }
        listening == 3
    })
    .await;

    drop(r.tx);
    let handled = tokio::time::timeout(Duration::from_secs(5), r.dispatcher)
        .await
        .expect("dispatcher did not stop")
        .unwrap();
    assert_eq!(handled, 3);

    let mut reasons = Vec::new();
    while let Ok(summary) = r.summaries.try_recv() {
        reasons.push(summary.reason);
    }
    assert_eq!(reasons, vec![CloseReason::EndRequested; 3]);

    let mut terminated = r.control.terminated();
    let mut expected: Vec<_> = calls.iter().map(CallHandle::id).collect();
    terminated.sort_by_key(|id| id.to_string());
    expected.sort_by_key(|id| id.to_string());
    assert_eq!(terminated, expected);
    assert!(records.iter().all(|p| p.releases() == 1));
}

#[tokio::test]
async fn duplicate_media_releases_the_second_channel() {
    let mut r = spawn_dispatcher();
    let call = CallHandle::new("sip:bob@example.org");
    let (first, first_record) = idle_channel();
    let (second, second_record) = idle_channel();

    announce(&r.tx, &call).await;
    media(&r.tx, &call, first).await;
    media(&r.tx, &call, second).await;
    wait_for(&mut r.events, |e| {
        matches!(e, LoopEvent::StageChanged { stage: TurnStage::Listening, .. })
    })
    .await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while second_record.releases() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("duplicate channel never released");
    assert_eq!(second_record.captures(), 0);
    assert_eq!(first_record.releases(), 0);

    drop(r.tx);
    assert_eq!(r.dispatcher.await.unwrap(), 1);
    assert_eq!(first_record.releases(), 1);
    assert_eq!(second_record.releases(), 1);
}

#[tokio::test]
async fn hangup_before_media_never_starts_a_loop() {
    let r = spawn_dispatcher();
    let call = CallHandle::new("sip:carol@example.org");

    announce(&r.tx, &call).await;
    r.tx.send(SignalingEvent::CallStateChanged {
        call: call.clone(),
        state: CallState::Disconnected,
    })
    .await
    .unwrap();

    drop(r.tx);
    assert_eq!(r.dispatcher.await.unwrap(), 0);
    assert!(r.control.terminated().is_empty());
}

#[tokio::test]
async fn media_after_hangup_is_released_without_a_loop() {
    let r = spawn_dispatcher();
    let call = CallHandle::new("sip:frank@example.org");
    let (channel, record) = ScriptedChannel::new([CaptureStep::Silence, CaptureStep::Silence]);

    announce(&r.tx, &call).await;
    r.tx.send(SignalingEvent::CallStateChanged {
        call: call.clone(),
        state: CallState::Disconnected,
    })
    .await
    .unwrap();
    media(&r.tx, &call, channel).await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while record.releases() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("late channel never released");
    assert_eq!(record.captures(), 0);
    assert!(record.played().is_empty());

    drop(r.tx);
    assert_eq!(r.dispatcher.await.unwrap(), 0);
    assert!(r.control.terminated().is_empty());
    assert_eq!(record.releases(), 1);
}

#[tokio::test]
async fn panicking_call_is_terminated_and_released() {
    let mut r = spawn_dispatcher();
    let call = CallHandle::new("sip:dave@example.org");
    let (channel, record) = ScriptedChannel::new([CaptureStep::Panic]);

    announce(&r.tx, &call).await;
    media(&r.tx, &call, channel).await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while r.control.terminated().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("supervisor never terminated the call");

    assert_eq!(r.control.terminated(), vec![call.id()]);
    assert_eq!(record.releases(), 1);
    assert!(r.summaries.try_recv().is_err(), "a panicked call has no summary");

    // the dispatcher keeps serving other calls
    let next = CallHandle::new("sip:erin@example.org");
    let (channel, _) = idle_channel();
    announce(&r.tx, &next).await;
    media(&r.tx, &next, channel).await;
    wait_for(&mut r.events, |e| {
        matches!(
            e,
            LoopEvent::StageChanged { call_id, stage: TurnStage::Listening }
                if *call_id == next.id()
        )
    })
    .await;

    drop(r.tx);
    assert_eq!(r.dispatcher.await.unwrap(), 2);
}
