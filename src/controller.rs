//! Session controller
//!
//! One event-loop task owns everything mutable about a session: the
//! reducer state, the active transport/capture/output handles, the
//! transcript and the playback scheduler. Callers talk to it through a
//! cloneable `SessionController` handle; every request is acknowledged
//! after the loop has processed it.
//!
//! ```text
//! commands ─┐
//! internal ─┼──▶ run loop ──▶ reduce() ──▶ effects (connect / teardown / reset / status)
//! inbound  ─┤        │
//! ended    ─┘        ├──▶ TranscriptAssembler ──▶ SessionUpdate::LineUpdated
//!                    └──▶ PlaybackScheduler
//! ```
//!
//! Capture frames never pass through the loop: a pump task encodes them and
//! hands them to the transport with a non-blocking send, gated by the mute
//! flag.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::{
    AudioFrame, AudioOutput, BufferId, CaptureError, CaptureHandle, CaptureSource, FrameEncoder,
    OutputError, PlaybackScheduler, PlaybackSink,
};
use crate::config::SessionConfig;
use crate::metrics::{MetricsCollector, MetricsSummary, PacketCounters};
use crate::state_machine::{reduce, Effect, Event, State};
use crate::streaming::{
    Connector, Fact, InboundEvent, LineId, MuteGate, PacketSender, RealtimeSession, SendOutcome,
    StreamingError, TranscriptAssembler, TranscriptLine,
};
use crate::translation::Translator;
use crate::{status_from_state, SessionStatus};

const COMMAND_CHANNEL_CAPACITY: usize = 32;
const UPDATE_CHANNEL_CAPACITY: usize = 256;
/// Capture → pump handoff; a full channel drops frames in the audio callback
const CAPTURE_CHANNEL_CAPACITY: usize = 8;
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Errors surfaced to callers of the controller
///
/// The `Display` text is what ends up in `SessionStatus::Errored`.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Microphone unavailable: {0}")]
    PermissionDenied(String),
    #[error("Microphone error: {0}")]
    Capture(String),
    #[error("{0}")]
    Connection(String),
    #[error("Speaker unavailable: {0}")]
    Output(String),
    #[error("Session controller is not running")]
    ControllerClosed,
}

impl From<CaptureError> for SessionError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::PermissionDenied(msg) => SessionError::PermissionDenied(msg),
            other => SessionError::Capture(other.to_string()),
        }
    }
}

impl From<StreamingError> for SessionError {
    fn from(err: StreamingError) -> Self {
        SessionError::Connection(err.to_string())
    }
}

impl From<OutputError> for SessionError {
    fn from(err: OutputError) -> Self {
        SessionError::Output(err.to_string())
    }
}

/// Everything the surrounding UI can observe
#[derive(Debug, Clone)]
pub enum SessionUpdate {
    Status(SessionStatus),
    /// A line was created, extended, finalized or got its translation
    LineUpdated(TranscriptLine),
    TranscriptCleared,
    /// Facts tagged in a finished assistant turn
    FactsExtracted(Vec<Fact>),
    PlaybackInterrupted { dropped: usize },
}

/// External collaborators, injected so tests can substitute fakes
#[derive(Clone)]
pub struct ControllerDeps {
    pub connector: Arc<dyn Connector>,
    pub capture: Arc<dyn CaptureSource>,
    pub output: Arc<dyn AudioOutput>,
    pub translator: Arc<dyn Translator>,
}

enum Command {
    Start(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
    Mute(bool, oneshot::Sender<()>),
    ChangeConfig(SessionConfig, oneshot::Sender<bool>),
    Config(oneshot::Sender<SessionConfig>),
    Transcript(oneshot::Sender<Vec<TranscriptLine>>),
    Metrics(oneshot::Sender<MetricsSummary>),
    Shutdown(oneshot::Sender<()>),
}

/// Handles produced by a successful connect
struct SessionResources {
    session: RealtimeSession,
    capture: CaptureHandle,
    sink: Box<dyn PlaybackSink>,
    frames_rx: mpsc::Receiver<AudioFrame>,
    ended_rx: mpsc::UnboundedReceiver<BufferId>,
}

impl SessionResources {
    async fn release(mut self) {
        self.capture.stop();
        self.session.disconnect().await;
    }
}

/// Results posted back to the loop by spawned tasks
enum Internal {
    Connected {
        id: Uuid,
        resources: SessionResources,
    },
    ConnectFailed {
        id: Uuid,
        error: SessionError,
    },
    Translated {
        epoch: u64,
        line_id: LineId,
        translation: String,
    },
}

struct PendingConnect {
    id: Uuid,
    task: JoinHandle<()>,
}

/// The live connection and the handles that belong to it
struct ActiveSession {
    id: Uuid,
    session: RealtimeSession,
    capture: CaptureHandle,
    scheduler: PlaybackScheduler,
    inbound: mpsc::Receiver<InboundEvent>,
    ended_rx: mpsc::UnboundedReceiver<BufferId>,
    pump: JoinHandle<()>,
    pump_cancel: CancellationToken,
    packets: Arc<PacketCounters>,
}

enum ActiveSignal {
    /// `None` means the inbound stream ended
    Inbound(Option<InboundEvent>),
    Ended(BufferId),
}

enum Step {
    Command(Command),
    /// All handles dropped
    Orphaned,
    Internal(Internal),
    Active(ActiveSignal),
    Tick,
}

/// Cloneable handle to a running session controller
#[derive(Clone)]
pub struct SessionController {
    commands: mpsc::Sender<Command>,
    status_rx: watch::Receiver<SessionStatus>,
    updates: broadcast::Sender<SessionUpdate>,
    muted: MuteGate,
}

impl SessionController {
    /// Spawn the controller loop on the current tokio runtime
    pub fn spawn(config: SessionConfig, deps: ControllerDeps) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus::Idle);
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let muted = MuteGate::default();

        let controller = Controller {
            state: State::default(),
            config: clamped(config),
            deps,
            muted: muted.clone(),
            transcript: TranscriptAssembler::new(),
            metrics: MetricsCollector::new(),
            active: None,
            pending: None,
            translation_cancel: CancellationToken::new(),
            epoch: 0,
            internal_tx,
            status_tx,
            updates: updates.clone(),
        };
        tokio::spawn(controller.run(command_rx, internal_rx));

        Self {
            commands: command_tx,
            status_rx,
            updates,
            muted,
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SessionError::ControllerClosed)?;
        rx.await.map_err(|_| SessionError::ControllerClosed)
    }

    /// Begin connecting; progress is reported through status updates
    pub async fn start(&self) -> Result<(), SessionError> {
        self.request(Command::Start).await
    }

    /// Universal teardown; safe to call in any state, any number of times
    pub async fn stop(&self) -> Result<(), SessionError> {
        self.request(Command::Stop).await
    }

    /// Gate outbound audio; capture keeps running while muted
    pub async fn mute(&self, muted: bool) -> Result<(), SessionError> {
        self.request(|tx| Command::Mute(muted, tx)).await
    }

    pub fn is_muted(&self) -> bool {
        self.muted.is_muted()
    }

    /// Replace the session config
    ///
    /// Returns true if the change forced a reconnect (which also clears the
    /// transcript).
    pub async fn change_config(&self, config: SessionConfig) -> Result<bool, SessionError> {
        self.request(|tx| Command::ChangeConfig(config, tx)).await
    }

    pub async fn config(&self) -> Result<SessionConfig, SessionError> {
        self.request(Command::Config).await
    }

    pub async fn transcript(&self) -> Result<Vec<TranscriptLine>, SessionError> {
        self.request(Command::Transcript).await
    }

    pub async fn metrics(&self) -> Result<MetricsSummary, SessionError> {
        self.request(Command::Metrics).await
    }

    pub fn status(&self) -> SessionStatus {
        self.status_rx.borrow().clone()
    }

    pub fn status_receiver(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    /// Stop and end the controller loop
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.request(Command::Shutdown).await
    }
}

struct Controller {
    state: State,
    config: SessionConfig,
    deps: ControllerDeps,
    muted: MuteGate,
    transcript: TranscriptAssembler,
    metrics: MetricsCollector,
    active: Option<ActiveSession>,
    pending: Option<PendingConnect>,
    /// Cancels in-flight translations on teardown/reset
    translation_cancel: CancellationToken,
    /// Bumped on every teardown/reset so late translations are dropped
    epoch: u64,
    internal_tx: mpsc::UnboundedSender<Internal>,
    status_tx: watch::Sender<SessionStatus>,
    updates: broadcast::Sender<SessionUpdate>,
}

impl Controller {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
    ) {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        self.emit_status();
        log::info!("Session controller started");

        loop {
            let step = tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => Step::Command(cmd),
                    None => Step::Orphaned,
                },
                Some(msg) = internal_rx.recv() => Step::Internal(msg),
                signal = next_active_signal(&mut self.active) => Step::Active(signal),
                _ = tick.tick() => Step::Tick,
            };

            match step {
                Step::Command(Command::Shutdown(ack)) => {
                    log::info!("Shutdown requested, stopping session controller");
                    self.stop().await;
                    let _ = ack.send(());
                    break;
                }
                Step::Command(cmd) => self.handle_command(cmd).await,
                Step::Orphaned => {
                    log::info!("All controller handles dropped, shutting down");
                    self.stop().await;
                    break;
                }
                Step::Internal(msg) => self.handle_internal(msg).await,
                Step::Active(ActiveSignal::Inbound(event)) => self.handle_inbound(event).await,
                Step::Active(ActiveSignal::Ended(id)) => {
                    if let Some(active) = self.active.as_mut() {
                        active.scheduler.on_ended(id);
                    }
                }
                Step::Tick => {
                    if let Some(active) = &self.active {
                        self.metrics.update_packets(active.packets.snapshot());
                    }
                    if let State::Live { session_id, .. } = self.state {
                        self.dispatch(Event::Tick { id: session_id }).await;
                    }
                }
            }
        }

        log::info!("Session controller ended");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start(ack) => {
                self.dispatch(Event::Start).await;
                let _ = ack.send(());
            }
            Command::Stop(ack) => {
                self.stop().await;
                let _ = ack.send(());
            }
            Command::Mute(muted, ack) => {
                // Returns only after any in-flight send has finished
                let was = self.muted.set(muted);
                if was != muted {
                    log::info!("Microphone {}", if muted { "muted" } else { "unmuted" });
                    self.emit_status();
                }
                let _ = ack.send(());
            }
            Command::ChangeConfig(config, ack) => {
                let config = clamped(config);
                let reconnect = self.config.requires_reconnect(&config);
                if reconnect {
                    log::info!(
                        "Config change (persona {}, voice {}, accent {}) requires reconnect",
                        config.persona_id,
                        config.voice_id,
                        config.accent_intensity
                    );
                }
                self.config = config;
                if reconnect {
                    self.dispatch(Event::Reconfigure).await;
                }
                let _ = ack.send(reconnect);
            }
            Command::Config(reply) => {
                let _ = reply.send(self.config.clone());
            }
            Command::Transcript(reply) => {
                let _ = reply.send(self.transcript.lines().to_vec());
            }
            Command::Metrics(reply) => {
                if let Some(active) = &self.active {
                    self.metrics.update_packets(active.packets.snapshot());
                }
                let _ = reply.send(self.metrics.get_summary());
            }
            Command::Shutdown(ack) => {
                self.stop().await;
                let _ = ack.send(());
            }
        }
    }

    async fn stop(&mut self) {
        self.dispatch(Event::Stop).await;
        if matches!(self.state, State::Closing) {
            self.dispatch(Event::TeardownComplete).await;
        }
    }

    async fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::Connected { id, resources } => {
                if self.pending.as_ref().map(|p| p.id) == Some(id) {
                    self.pending = None;
                }
                if self.state.session_id() != Some(id) {
                    log::info!("Releasing resources from stale connect {}", id);
                    resources.release().await;
                    return;
                }
                self.activate(id, resources);
                self.metrics.session_connected();
                self.dispatch(Event::ConnectOk { id }).await;
            }
            Internal::ConnectFailed { id, error } => {
                if self.pending.as_ref().map(|p| p.id) == Some(id) {
                    self.pending = None;
                }
                self.dispatch(Event::ConnectFail {
                    id,
                    err: error.to_string(),
                })
                .await;
            }
            Internal::Translated {
                epoch,
                line_id,
                translation,
            } => {
                if epoch != self.epoch {
                    log::debug!("Dropping translation for line {} from a previous conversation", line_id);
                    return;
                }
                if let Some(line) = self.transcript.attach_translation(line_id, &translation) {
                    let line = line.clone();
                    self.metrics.translation_attached();
                    self.publish(SessionUpdate::LineUpdated(line));
                }
            }
        }
    }

    async fn handle_inbound(&mut self, event: Option<InboundEvent>) {
        let Some(id) = self.active.as_ref().map(|a| a.id) else {
            return;
        };

        let event = match event {
            Some(event) => event,
            None => {
                self.dispatch(Event::TransportFailed {
                    id,
                    err: "Connection closed by server".to_string(),
                })
                .await;
                return;
            }
        };

        match event {
            InboundEvent::PartialTranscript { role, text } => {
                if let Some(line) = self.transcript.push_delta(role, &text) {
                    let line = line.clone();
                    self.publish(SessionUpdate::LineUpdated(line));
                }
            }
            InboundEvent::AudioChunk { bytes, sample_rate } => {
                let Some(active) = self.active.as_mut() else {
                    return;
                };
                match active.scheduler.enqueue_pcm16(&bytes, sample_rate) {
                    Ok(_) => self.metrics.chunk_scheduled(),
                    Err(e) => {
                        log::warn!("Dropping reply audio chunk: {}", e);
                        self.metrics.decode_error();
                    }
                }
            }
            InboundEvent::TurnComplete { role } => {
                let Some(done) = self.transcript.complete_turn(role) else {
                    return;
                };
                self.metrics.turn_completed(role);
                if !done.facts.is_empty() {
                    log::info!("Extracted {} facts from reply", done.facts.len());
                    self.publish(SessionUpdate::FactsExtracted(done.facts));
                }
                if !done.line.text.is_empty() {
                    self.spawn_translation(done.line.id, done.line.text.clone());
                }
                self.publish(SessionUpdate::LineUpdated(done.line));
            }
            InboundEvent::Interrupted => {
                let Some(active) = self.active.as_mut() else {
                    return;
                };
                let dropped = active.scheduler.interrupt();
                self.metrics.interruption();
                self.publish(SessionUpdate::PlaybackInterrupted { dropped });
            }
            InboundEvent::Error { detail } => {
                self.dispatch(Event::TransportFailed { id, err: detail }).await;
            }
        }
    }

    /// Run one event through the reducer and execute its effects in order
    async fn dispatch(&mut self, event: Event) {
        log::debug!("Session event: {:?}", event);

        let old_discriminant = std::mem::discriminant(&self.state);
        let (next, effects) = reduce(&self.state, event);
        if old_discriminant != std::mem::discriminant(&next) {
            log::info!("State transition: {:?} -> {:?}", self.state, next);
        }
        self.state = next;

        for effect in effects {
            match effect {
                Effect::Connect { id } => self.begin_connect(id),
                Effect::Teardown => self.teardown().await,
                Effect::ResetConversation => self.reset_conversation(),
                Effect::EmitStatus => self.emit_status(),
            }
        }
    }

    /// Acquire transport, capture and output concurrently in a background task
    fn begin_connect(&mut self, id: Uuid) {
        self.metrics.start_session(id);

        let deps = self.deps.clone();
        let config = self.config.clone();
        let tx = self.internal_tx.clone();
        let task = tokio::spawn(async move {
            let msg = match acquire(deps, config).await {
                Ok(resources) => Internal::Connected { id, resources },
                Err(error) => {
                    log::error!("Session {} failed to start: {}", id, error);
                    Internal::ConnectFailed { id, error }
                }
            };
            let _ = tx.send(msg);
        });

        self.pending = Some(PendingConnect { id, task });
    }

    fn activate(&mut self, id: Uuid, resources: SessionResources) {
        let SessionResources {
            mut session,
            capture,
            sink,
            frames_rx,
            ended_rx,
        } = resources;

        // A session always has a receiver unless someone already took it
        let inbound = session.take_incoming_receiver().unwrap_or_else(|| {
            log::warn!("Session {} has no inbound stream", session.session_id());
            mpsc::channel(1).1
        });

        let packets = Arc::new(PacketCounters::default());
        let pump_cancel = CancellationToken::new();
        let pump = tokio::spawn(run_capture_pump(
            frames_rx,
            session.sender(),
            self.muted.clone(),
            packets.clone(),
            pump_cancel.clone(),
        ));

        log::info!("Session {} live (transport {})", id, session.session_id());

        self.active = Some(ActiveSession {
            id,
            session,
            capture,
            scheduler: PlaybackScheduler::new(sink),
            inbound,
            ended_rx,
            pump,
            pump_cancel,
            packets,
        });
    }

    /// Release every session resource; no callbacks fire afterwards
    async fn teardown(&mut self) {
        let aborted_connect = match self.pending.take() {
            Some(pending) => {
                log::debug!("Aborting pending connect {}", pending.id);
                pending.task.abort();
                true
            }
            None => false,
        };

        self.cancel_translations();

        let was_live = self.active.is_some();
        if let Some(active) = self.active.take() {
            let ActiveSession {
                id,
                session,
                mut capture,
                mut scheduler,
                pump,
                pump_cancel,
                packets,
                ..
            } = active;

            capture.stop();
            pump_cancel.cancel();
            if let Err(e) = pump.await {
                log::warn!("Capture pump ended abnormally: {}", e);
            }
            session.disconnect().await;
            let cut = scheduler.clear();
            drop(scheduler);

            self.metrics.update_packets(packets.snapshot());
            log::info!("Session {} torn down ({} buffers cut)", id, cut);
        }

        match &self.state {
            State::Errored { message } => self.metrics.session_ended(Some(message.clone())),
            _ if aborted_connect && !was_live => self.metrics.session_cancelled(),
            _ => self.metrics.session_ended(None),
        }
    }

    fn reset_conversation(&mut self) {
        self.cancel_translations();
        self.transcript.clear();
        if let Some(active) = self.active.as_mut() {
            active.scheduler.clear();
        }
        self.publish(SessionUpdate::TranscriptCleared);
    }

    fn cancel_translations(&mut self) {
        self.translation_cancel.cancel();
        self.translation_cancel = CancellationToken::new();
        self.epoch += 1;
    }

    /// Fire-and-forget translation; the result comes back as `Internal::Translated`
    fn spawn_translation(&self, line_id: LineId, text: String) {
        let translator = self.deps.translator.clone();
        let cancel = self.translation_cancel.clone();
        let tx = self.internal_tx.clone();
        let epoch = self.epoch;

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                translation = translator.translate(&text) => {
                    let _ = tx.send(Internal::Translated { epoch, line_id, translation });
                }
            }
        });
    }

    fn emit_status(&self) {
        let status = status_from_state(&self.state, self.muted.is_muted());
        log::debug!("Emitting status: {:?}", status);
        self.status_tx.send_replace(status.clone());
        self.publish(SessionUpdate::Status(status));
    }

    fn publish(&self, update: SessionUpdate) {
        // No subscribers is fine
        let _ = self.updates.send(update);
    }
}

/// Wait for the next signal from the active session, or forever if none
async fn next_active_signal(active: &mut Option<ActiveSession>) -> ActiveSignal {
    match active {
        Some(active) => tokio::select! {
            biased;
            Some(id) = active.ended_rx.recv() => ActiveSignal::Ended(id),
            event = active.inbound.recv() => ActiveSignal::Inbound(event),
        },
        None => std::future::pending().await,
    }
}

/// Open transport, microphone and speaker at the same time
///
/// Whatever succeeded is released if anything failed. A capture failure is
/// reported first since it needs user action.
async fn acquire(deps: ControllerDeps, config: SessionConfig) -> Result<SessionResources, SessionError> {
    let (frames_tx, frames_rx) = mpsc::channel(CAPTURE_CHANNEL_CAPACITY);
    let (ended_tx, ended_rx) = mpsc::unbounded_channel();

    let capture_source = deps.capture.clone();
    let output = deps.output.clone();

    let (transport, capture, sink) = tokio::join!(
        deps.connector.connect(&config),
        tokio::task::spawn_blocking(move || capture_source.start(frames_tx)),
        tokio::task::spawn_blocking(move || output.open(ended_tx)),
    );

    let transport = transport.map_err(SessionError::from);
    let capture = match capture {
        Ok(result) => result.map_err(SessionError::from),
        Err(e) => Err(SessionError::Capture(format!("capture task failed: {}", e))),
    };
    let sink = match sink {
        Ok(result) => result.map_err(SessionError::from),
        Err(e) => Err(SessionError::Output(format!("output task failed: {}", e))),
    };

    match (capture, transport, sink) {
        (Ok(capture), Ok(session), Ok(sink)) => Ok(SessionResources {
            session,
            capture,
            sink,
            frames_rx,
            ended_rx,
        }),
        // Remaining handles drop here, which releases them
        (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => Err(e),
    }
}

/// Callers can build a `SessionConfig` by hand; keep intensity in range
fn clamped(config: SessionConfig) -> SessionConfig {
    let intensity = config.accent_intensity;
    config.with_accent_intensity(intensity)
}

/// Capture → encoder → transport, off the controller loop
async fn run_capture_pump(
    mut frames: mpsc::Receiver<AudioFrame>,
    sender: PacketSender,
    muted: MuteGate,
    counters: Arc<PacketCounters>,
    cancel: CancellationToken,
) {
    let encoder = FrameEncoder::default();

    // Frames captured while the connection was still opening are stale
    while frames.try_recv().is_ok() {
        counters.record(SendOutcome::NotReady);
    }

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let outcome = match muted.permit() {
            Some(_permit) => {
                let outcome = sender.send(encoder.encode(&frame));
                counters.record(outcome);
                outcome
            }
            None => {
                counters.record(SendOutcome::Muted);
                continue;
            }
        };
        if outcome == SendOutcome::Closed {
            log::debug!("Transport closed, capture pump exiting");
            break;
        }
    }

    let stats = counters.snapshot();
    log::debug!(
        "Capture pump exiting ({} packets sent, {} dropped)",
        stats.sent,
        stats.dropped()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFormat;
    use crate::streaming::OUTBOUND_QUEUE_CAPACITY;

    fn frame() -> AudioFrame {
        AudioFrame {
            samples: vec![0.1; 480],
            sample_rate: 48_000,
            channels: 1,
        }
    }

    fn session() -> (RealtimeSession, mpsc::Receiver<crate::audio::OutboundPacket>) {
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (_in_tx, in_rx) = mpsc::channel(4);
        (
            RealtimeSession::from_channels("pump", out_tx, in_rx, CancellationToken::new()),
            out_rx,
        )
    }

    #[tokio::test]
    async fn test_pump_drops_everything_while_muted() {
        let (session, mut out_rx) = session();
        let (frames_tx, frames_rx) = mpsc::channel(8);
        let counters = Arc::new(PacketCounters::default());
        let cancel = CancellationToken::new();

        let pump = tokio::spawn(run_capture_pump(
            frames_rx,
            session.sender(),
            MuteGate::new(true),
            counters.clone(),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(10)).await;

        for _ in 0..5 {
            frames_tx.send(frame()).await.unwrap();
        }
        drop(frames_tx);
        pump.await.unwrap();

        assert!(out_rx.try_recv().is_err());
        assert_eq!(counters.snapshot().sent, 0);
        assert_eq!(counters.snapshot().dropped_muted + counters.snapshot().dropped_not_ready, 5);
    }

    #[tokio::test]
    async fn test_pump_encodes_16k_packets() {
        let (session, mut out_rx) = session();
        let (frames_tx, frames_rx) = mpsc::channel(8);
        let counters = Arc::new(PacketCounters::default());

        let pump = tokio::spawn(run_capture_pump(
            frames_rx,
            session.sender(),
            MuteGate::default(),
            counters.clone(),
            CancellationToken::new(),
        ));
        tokio::time::sleep(Duration::from_millis(10)).await;

        frames_tx.send(frame()).await.unwrap();
        let packet = out_rx.recv().await.unwrap();
        assert_eq!(
            packet.format,
            AudioFormat {
                sample_rate: 16_000,
                channels: 1
            }
        );
        assert_eq!(packet.sample_count, 160);

        drop(frames_tx);
        pump.await.unwrap();
    }

    #[test]
    fn test_capture_permission_error_maps_to_permission_denied() {
        let err: SessionError = CaptureError::PermissionDenied("denied by user".to_string()).into();
        assert!(matches!(err, SessionError::PermissionDenied(_)));
        assert_eq!(err.to_string(), "Microphone unavailable: denied by user");
    }

    #[test]
    fn test_connection_error_keeps_transport_message() {
        let err: SessionError = StreamingError::ConnectionFailed("timeout".to_string()).into();
        assert!(err.to_string().contains("timeout"));
    }
}
