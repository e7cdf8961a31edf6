//! Gemini Live API WebSocket client
//!
//! Manages one duplex connection per session.
//!
//! # Connection Flow
//!
//! 1. `LiveConnector::connect()` - Establish WebSocket, send `setup`, wait for `setupComplete`
//! 2. `PacketSender::send()` - Queue encoded audio (never blocks, drops when full or not ready)
//! 3. `take_incoming_receiver()` - Ordered `InboundEvent`s from the background reader
//! 4. `disconnect()` - Clean shutdown
//!
//! # Retry Strategy
//!
//! None. A failed or dropped connection is reported once (as an error or an
//! `InboundEvent::Error`) and the caller decides whether to connect again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, protocol::frame::coding::CloseCode, Message},
};
use tokio_util::sync::CancellationToken;

use super::protocol::{
    ClientMessage, EventMapper, InboundEvent, ServerMessage, DEFAULT_LIVE_MODEL, LIVE_API_URL,
};
use super::StreamingError;
use crate::audio::OutboundPacket;
use crate::config::SessionConfig;

/// Connection timeout for initial WebSocket handshake
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for waiting for setupComplete
const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `disconnect()` waits for the socket tasks to finish
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Outbound packets waiting for the socket; more than this and packets drop
pub const OUTBOUND_QUEUE_CAPACITY: usize = 32;

const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// Result of a non-blocking packet send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// Connection not ready (still negotiating or already gone)
    NotReady,
    /// Outbound queue full; packet dropped
    Backpressure,
    /// Session closed; packet dropped
    Closed,
    /// Microphone muted at send time; packet dropped
    Muted,
}

/// Shared mute flag for the send gate
///
/// Senders hold a `SendPermit` across encode and send; `set` takes the
/// write lock, so once it returns no send that saw the old value is still
/// in flight.
#[derive(Debug, Clone, Default)]
pub struct MuteGate {
    muted: Arc<RwLock<bool>>,
}

/// Proof the gate was open; keep it alive until the packet is queued
pub struct SendPermit<'a> {
    _guard: RwLockReadGuard<'a, bool>,
}

impl MuteGate {
    pub fn new(muted: bool) -> Self {
        Self {
            muted: Arc::new(RwLock::new(muted)),
        }
    }

    /// Returns the previous value
    pub fn set(&self, muted: bool) -> bool {
        let mut guard = self.muted.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, muted)
    }

    pub fn is_muted(&self) -> bool {
        *self.muted.read().unwrap_or_else(|e| e.into_inner())
    }

    /// `None` while muted
    pub fn permit(&self) -> Option<SendPermit<'_>> {
        let guard = self.muted.read().unwrap_or_else(|e| e.into_inner());
        if *guard {
            None
        } else {
            Some(SendPermit { _guard: guard })
        }
    }
}

/// Cloneable, non-blocking handle for outbound audio
#[derive(Debug, Clone)]
pub struct PacketSender {
    tx: mpsc::Sender<OutboundPacket>,
    ready: Arc<AtomicBool>,
}

impl PacketSender {
    /// Fire-and-forget send; never waits
    pub fn send(&self, packet: OutboundPacket) -> SendOutcome {
        if !self.ready.load(Ordering::Acquire) {
            return SendOutcome::NotReady;
        }
        match self.tx.try_send(packet) {
            Ok(()) => SendOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::Backpressure,
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }
}

/// Handle to an active Live API session
///
/// The socket itself is owned by two background tasks (writer and reader);
/// the session holds their channels and a cancellation token.
pub struct RealtimeSession {
    session_id: String,
    outbound_tx: mpsc::Sender<OutboundPacket>,
    /// Wrapped in Option so it can be taken for concurrent processing
    incoming_rx: Option<mpsc::Receiver<InboundEvent>>,
    ready: Arc<AtomicBool>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RealtimeSession {
    /// Build a session from raw channels (no socket)
    ///
    /// The session counts as ready immediately. `cancel` fires on
    /// `disconnect()` or drop, which lets the other side observe teardown.
    pub fn from_channels(
        session_id: impl Into<String>,
        outbound_tx: mpsc::Sender<OutboundPacket>,
        incoming_rx: mpsc::Receiver<InboundEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            outbound_tx,
            incoming_rx: Some(incoming_rx),
            ready: Arc::new(AtomicBool::new(true)),
            cancel,
            tasks: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire) && !self.cancel.is_cancelled()
    }

    /// Handle for the capture pump
    pub fn sender(&self) -> PacketSender {
        PacketSender {
            tx: self.outbound_tx.clone(),
            ready: self.ready.clone(),
        }
    }

    pub fn send(&self, packet: OutboundPacket) -> SendOutcome {
        self.sender().send(packet)
    }

    /// Take ownership of the inbound event receiver
    ///
    /// Returns `None` if already taken. The stream ends when the connection
    /// closes; an abnormal close is preceded by `InboundEvent::Error`.
    pub fn take_incoming_receiver(&mut self) -> Option<mpsc::Receiver<InboundEvent>> {
        self.incoming_rx.take()
    }

    /// Gracefully disconnect
    ///
    /// Sends a close frame and waits briefly for the socket tasks to exit.
    pub async fn disconnect(mut self) {
        log::info!("Disconnecting session {}...", self.session_id);
        self.ready.store(false, Ordering::Release);
        self.cancel.cancel();

        for task in self.tasks.drain(..) {
            if timeout(SHUTDOWN_TIMEOUT, task).await.is_err() {
                log::warn!("Socket task did not stop in time");
            }
        }
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        // Ensure socket tasks stop if the session is dropped without disconnect()
        self.ready.store(false, Ordering::Release);
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for RealtimeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeSession")
            .field("session_id", &self.session_id)
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// Opens sessions against the remote speech service
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, config: &SessionConfig) -> Result<RealtimeSession, StreamingError>;
}

/// Connector for the Gemini Live API
#[derive(Clone)]
pub struct LiveConnector {
    api_key: String,
    model: String,
    url: String,
}

impl LiveConnector {
    pub fn new(api_key: impl Into<String>, model: Option<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.unwrap_or_else(|| DEFAULT_LIVE_MODEL.to_string()),
            url: LIVE_API_URL.to_string(),
        }
    }

    /// Connector using the API key from the environment
    pub fn from_env(model: Option<String>) -> Result<Self, StreamingError> {
        let api_key = get_api_key().ok_or(StreamingError::MissingApiKey)?;
        Ok(Self::new(api_key, model))
    }

    /// Point at a different endpoint (proxies, local test servers)
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl std::fmt::Debug for LiveConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveConnector")
            .field("model", &self.model)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for LiveConnector {
    async fn connect(&self, config: &SessionConfig) -> Result<RealtimeSession, StreamingError> {
        let request = format!("{}?key={}", self.url, self.api_key)
            .into_client_request()
            .map_err(|e| StreamingError::ConnectionFailed(e.to_string()))?;

        log::info!(
            "Connecting to Live API (model {}, voice {})...",
            self.model,
            config.voice_id
        );

        // Connect with timeout
        let (ws_stream, _response) = timeout(
            CONNECTION_TIMEOUT,
            connect_async_with_config(
                request, None, true, // disable_nagle (we want low latency)
            ),
        )
        .await
        .map_err(|_| StreamingError::ConnectionFailed("Connection timeout".to_string()))?
        .map_err(|e| StreamingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let setup = serde_json::to_string(&ClientMessage::setup(config, &self.model))
            .map_err(|e| StreamingError::ProtocolError(e.to_string()))?;
        write
            .send(Message::Text(setup))
            .await
            .map_err(|e| StreamingError::SendFailed(e.to_string()))?;

        log::info!("WebSocket connected, waiting for setupComplete...");

        timeout(SETUP_TIMEOUT, async {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (f.code, f.reason.into_owned()))
                            .unwrap_or((CloseCode::Normal, String::new()));
                        return Err(if code == CloseCode::Policy {
                            StreamingError::AuthenticationFailed(reason)
                        } else {
                            StreamingError::Disconnected(format!(
                                "Connection closed during setup: {} ({})",
                                reason, code
                            ))
                        });
                    }
                    Ok(msg) => match parse_frame(msg) {
                        Some(server) if server.is_setup_complete() => return Ok(()),
                        Some(_) => log::debug!("Ignoring message while waiting for setupComplete"),
                        None => {}
                    },
                    Err(e) => return Err(StreamingError::ProtocolError(e.to_string())),
                }
            }
            Err(StreamingError::Disconnected("Stream ended".to_string()))
        })
        .await
        .map_err(|_| StreamingError::ConnectionFailed("Session setup timeout".to_string()))??;

        let session_id = uuid::Uuid::new_v4().to_string();
        log::info!("Session {} ready", session_id);

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundPacket>(OUTBOUND_QUEUE_CAPACITY);
        let (incoming_tx, incoming_rx) = mpsc::channel::<InboundEvent>(INBOUND_CHANNEL_CAPACITY);
        let ready = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();

        let writer_cancel = cancel.clone();
        let writer_ready = ready.clone();
        let writer = tokio::spawn(async move {
            let mut sent: u64 = 0;
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    packet = outbound_rx.recv() => {
                        let Some(packet) = packet else { break };
                        let json = match serde_json::to_string(&ClientMessage::audio(&packet)) {
                            Ok(json) => json,
                            Err(e) => {
                                log::warn!("Failed to serialize audio packet: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = write.send(Message::Text(json)).await {
                            log::warn!("WebSocket send failed: {}", e);
                            break;
                        }
                        sent += 1;
                    }
                }
            }
            writer_ready.store(false, Ordering::Release);
            if let Err(e) = write.close().await {
                log::debug!("Error closing WebSocket: {}", e);
            }
            log::debug!("Writer task exiting ({} packets sent)", sent);
        });

        let reader_cancel = cancel.clone();
        let reader_ready = ready.clone();
        let reader = tokio::spawn(async move {
            let mut mapper = EventMapper::new();
            loop {
                let msg_result = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    next = read.next() => match next {
                        Some(result) => result,
                        None => break,
                    },
                };

                let events = match msg_result {
                    Ok(Message::Close(frame)) => {
                        let abnormal = frame.as_ref().filter(|f| f.code != CloseCode::Normal);
                        match abnormal {
                            Some(f) => {
                                log::warn!("WebSocket closed by server: {} ({})", f.reason, f.code);
                                vec![InboundEvent::Error {
                                    detail: format!("Connection closed: {} ({})", f.reason, f.code),
                                }]
                            }
                            None => {
                                log::info!("WebSocket closed by server");
                                Vec::new()
                            }
                        }
                    }
                    Ok(msg) => match parse_frame(msg) {
                        Some(server) => mapper.map(server),
                        None => continue,
                    },
                    Err(e) => {
                        log::warn!("WebSocket error: {}", e);
                        vec![InboundEvent::Error {
                            detail: format!("Connection error: {}", e),
                        }]
                    }
                };

                let terminal = events
                    .iter()
                    .any(|e| matches!(e, InboundEvent::Error { .. }));
                for event in events {
                    if incoming_tx.send(event).await.is_err() {
                        log::debug!("Receiver channel closed");
                        break;
                    }
                }
                if terminal || incoming_tx.is_closed() {
                    break;
                }
            }
            reader_ready.store(false, Ordering::Release);
            log::debug!("Reader task exiting");
        });

        Ok(RealtimeSession {
            session_id,
            outbound_tx,
            incoming_rx: Some(incoming_rx),
            ready,
            cancel,
            tasks: vec![writer, reader],
        })
    }
}

/// Decode a text or binary JSON frame; other frame types yield `None`
fn parse_frame(msg: Message) -> Option<ServerMessage> {
    let parsed = match msg {
        Message::Text(text) => serde_json::from_str::<ServerMessage>(&text),
        Message::Binary(bytes) => serde_json::from_slice::<ServerMessage>(&bytes),
        _ => return None, // Ignore ping/pong/close
    };
    match parsed {
        Ok(server) => Some(server),
        Err(e) => {
            log::warn!("Failed to parse message: {}", e);
            None
        }
    }
}

/// Get the Gemini API key from environment
pub fn get_api_key() -> Option<String> {
    ["GEMINI_API_KEY", "GOOGLE_API_KEY"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|k| !k.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFormat;

    fn packet() -> OutboundPacket {
        OutboundPacket {
            data: "AAAA".to_string(),
            format: AudioFormat {
                sample_rate: 16_000,
                channels: 1,
            },
            sample_count: 2,
        }
    }

    fn session(capacity: usize) -> (RealtimeSession, mpsc::Receiver<OutboundPacket>, CancellationToken) {
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (_in_tx, in_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        (
            RealtimeSession::from_channels("test", out_tx, in_rx, cancel.clone()),
            out_rx,
            cancel,
        )
    }

    #[test]
    fn test_get_api_key_missing() {
        // Depends on environment; just verify it doesn't panic
        let _ = get_api_key();
    }

    #[tokio::test]
    async fn test_send_drops_on_backpressure() {
        let (session, mut out_rx, _cancel) = session(1);

        assert_eq!(session.send(packet()), SendOutcome::Queued);
        assert_eq!(session.send(packet()), SendOutcome::Backpressure);

        assert!(out_rx.recv().await.is_some());
        assert_eq!(session.send(packet()), SendOutcome::Queued);
    }

    #[tokio::test]
    async fn test_send_after_disconnect_is_not_ready() {
        let (session, _out_rx, cancel) = session(4);
        let sender = session.sender();

        session.disconnect().await;

        assert!(cancel.is_cancelled());
        assert_eq!(sender.send(packet()), SendOutcome::NotReady);
    }

    #[tokio::test]
    async fn test_send_to_closed_queue() {
        let (session, out_rx, _cancel) = session(4);
        drop(out_rx);
        assert_eq!(session.send(packet()), SendOutcome::Closed);
    }

    #[test]
    fn test_gate_refuses_permit_while_muted() {
        let gate = MuteGate::new(true);
        assert!(gate.permit().is_none());

        assert!(gate.set(false));
        assert!(gate.permit().is_some());
        assert!(!gate.is_muted());
    }

    #[test]
    fn test_mute_waits_for_send_in_flight() {
        let gate = MuteGate::default();
        let permit = gate.permit();
        assert!(permit.is_some());

        let setter = gate.clone();
        let handle = std::thread::spawn(move || setter.set(true));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());

        drop(permit);
        assert!(!handle.join().unwrap());
        assert!(gate.permit().is_none());
    }

    #[test]
    fn test_drop_cancels() {
        let (session, _out_rx, cancel) = session(4);
        drop(session);
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_incoming_receiver_taken_once() {
        let (mut session, _out_rx, _cancel) = session(4);
        assert!(session.take_incoming_receiver().is_some());
        assert!(session.take_incoming_receiver().is_none());
    }

    #[test]
    fn test_parse_binary_frame() {
        let msg = parse_frame(Message::Binary(br#"{"setupComplete":{}}"#.to_vec()));
        assert!(msg.unwrap().is_setup_complete());
        assert!(parse_frame(Message::Ping(Vec::new())).is_none());
        assert!(parse_frame(Message::Text("not json".to_string())).is_none());
    }

    #[tokio::test]
    #[ignore] // Requires valid API key
    async fn test_live_connection() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let connector = LiveConnector::from_env(None).expect("GEMINI_API_KEY required");

        let session = connector.connect(&SessionConfig::default()).await;
        assert!(session.is_ok(), "Connection failed: {:?}", session.err());

        let session = session.unwrap();
        assert!(session.is_ready());
        session.disconnect().await;
    }
}
