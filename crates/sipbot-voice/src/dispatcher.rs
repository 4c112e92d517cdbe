//! Per-process call registry: signaling events in, one [`TurnLoop`] task per call out.
//!
//! Call and media state changes arrive as messages on a channel. The dispatcher owns the
//! only map of live calls; everything call-specific lives in the call's own task. A hang-up
//! reaches a running loop through its [`SessionSignal`], never by aborting the task.

use futures::future::join_all;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audio::{AudioChannel, ChannelGuard};
use crate::session::SessionSignal;
use crate::signaling::{CallControl, CallHandle, CallId, CallState, SignalingEvent, SignalingRx};
use crate::turn_loop::{CallSummary, LoopEvent, TurnLoop, TurnLoopConfig, VoiceServices};

/// Calls remembered before (or instead of) media; the oldest entry is evicted at capacity.
const MAX_TRACKED_CALLS: usize = 1024;

/// Insertion-ordered set of call ids with a fixed capacity.
#[derive(Debug, Default)]
struct TrackedCalls {
    ids: HashSet<CallId>,
    order: VecDeque<CallId>,
}

impl TrackedCalls {
    fn insert(&mut self, id: CallId) {
        if !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > MAX_TRACKED_CALLS {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn remove(&mut self, id: &CallId) -> bool {
        if !self.ids.remove(id) {
            return false;
        }
        self.order.retain(|other| other != id);
        true
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

struct ActiveCall {
    signal: SessionSignal,
    supervisor: JoinHandle<()>,
}

/// Routes signaling events to per-call turn loops.
pub struct CallDispatcher {
    services: VoiceServices,
    config: TurnLoopConfig,
    control: Arc<dyn CallControl>,
    event_tx: Option<mpsc::UnboundedSender<LoopEvent>>,
    summary_tx: Option<mpsc::UnboundedSender<CallSummary>>,
    pending: TrackedCalls,
    /// Calls that hung up before their media arrived.
    disconnected: TrackedCalls,
    active: HashMap<CallId, ActiveCall>,
    handled: usize,
}

impl CallDispatcher {
    pub fn new(
        services: VoiceServices,
        config: TurnLoopConfig,
        control: Arc<dyn CallControl>,
    ) -> Self {
        Self {
            services,
            config,
            control,
            event_tx: None,
            summary_tx: None,
            pending: TrackedCalls::default(),
            disconnected: TrackedCalls::default(),
            active: HashMap::new(),
            handled: 0,
        }
    }

    /// Forward every call's [`LoopEvent`]s to `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<LoopEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Send a [`CallSummary`] to `tx` when a call finishes.
    pub fn with_summaries(mut self, tx: mpsc::UnboundedSender<CallSummary>) -> Self {
        self.summary_tx = Some(tx);
        self
    }

    /// Process events until the signaling channel closes, then end all calls and wait for
    /// them. Returns the number of calls that got a turn loop.
    pub async fn run(mut self, mut events: SignalingRx) -> usize {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<CallId>();
        info!("Call dispatcher running");

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event, &done_tx),
                    None => break,
                },
                Some(call_id) = done_rx.recv() => {
                    if self.active.remove(&call_id).is_some() {
                        debug!(call_id = %call_id, active = self.active.len(), "Call reaped");
                    }
                }
            }
        }

        info!(active = self.active.len(), "Signaling closed; ending active calls");
        for call in self.active.values() {
            call.signal.request_end();
        }
        join_all(self.active.drain().map(|(_, call)| call.supervisor)).await;
        info!(handled = self.handled, "Call dispatcher stopped");
        self.handled
    }

    fn handle(&mut self, event: SignalingEvent, done_tx: &mpsc::UnboundedSender<CallId>) {
        let call_id = event.call().id();
        match event {
            SignalingEvent::CallStateChanged { call, state } => match state {
                CallState::Ringing | CallState::Connected => {
                    info!(
                        call_id = %call_id,
                        remote = %call.remote_uri(),
                        state = ?state,
                        "Call state"
                    );
                    if !self.active.contains_key(&call_id) {
                        self.pending.insert(call_id);
                    }
                }
                CallState::MediaActive => {
                    debug!(call_id = %call_id, "Media state without channel; waiting for channel");
                }
                CallState::Disconnected => {
                    info!(call_id = %call_id, "Call disconnected");
                    self.pending.remove(&call_id);
                    match self.active.get(&call_id) {
                        Some(active) => {
                            active.signal.notify_disconnected();
                        }
                        None => self.disconnected.insert(call_id),
                    }
                }
            },
            SignalingEvent::MediaActive { call, channel } => {
                if self.disconnected.remove(&call_id) {
                    warn!(call_id = %call_id, "Media for a disconnected call; releasing channel");
                    ChannelGuard::new(channel).release();
                    return;
                }
                if self.active.contains_key(&call_id) {
                    warn!(call_id = %call_id, "Duplicate media activation; releasing new channel");
                    ChannelGuard::new(channel).release();
                    return;
                }
                if !self.pending.remove(&call_id) {
                    debug!(call_id = %call_id, "Media for unannounced call; registering it");
                }
                self.spawn_call(call, channel, done_tx.clone());
            }
        }
    }

    fn spawn_call(
        &mut self,
        call: CallHandle,
        channel: Box<dyn AudioChannel>,
        done_tx: mpsc::UnboundedSender<CallId>,
    ) {
        let call_id = call.id();
        let signal = SessionSignal::new();
        let mut turn_loop = TurnLoop::new(
            call,
            channel,
            signal.clone(),
            self.services.clone(),
            self.config.clone(),
            Arc::clone(&self.control),
        );
        if let Some(tx) = &self.event_tx {
            turn_loop = turn_loop.with_events(tx.clone());
        }

        let inner = tokio::spawn(turn_loop.run());
        let control = Arc::clone(&self.control);
        let summaries = self.summary_tx.clone();
        let terminate_timeout = self.config.timeouts.terminate;
        let watched = signal.clone();

        let supervisor = tokio::spawn(async move {
            match inner.await {
                Ok(summary) => {
                    if let Some(tx) = summaries {
                        if tx.send(summary).is_err() {
                            debug!(call_id = %call_id, "Summary receiver dropped");
                        }
                    }
                }
                Err(e) => {
                    // The channel guard released on unwind; the call itself may still be up.
                    error!(call_id = %call_id, error = %e, "Call task failed");
                    if !watched.remote_gone() {
                        match tokio::time::timeout(terminate_timeout, control.terminate(call_id))
                            .await
                        {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => warn!(call_id = %call_id, error = %e, "Terminate failed"),
                            Err(_) => warn!(call_id = %call_id, "Terminate timed out"),
                        }
                    }
                }
            }
            let _ = done_tx.send(call_id);
        });

        self.handled += 1;
        info!(
            call_id = %call_id,
            active = self.active.len() + 1,
            pending = self.pending.len(),
            "Media active; conversation task started"
        );
        self.active.insert(call_id, ActiveCall { signal, supervisor });
    }
}
