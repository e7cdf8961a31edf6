//! Live session streaming against the Gemini Live API
//!
//! This module owns the duplex WebSocket session: outbound microphone audio,
//! inbound transcription deltas, reply audio and turn markers.
//!
//! # Architecture
//!
//! ```text
//! AudioFrame ──▶ FrameEncoder ──▶ PacketSender ──▶ writer task ──▶ WebSocket
//!                                                                   │
//!              InboundEvent ◀── EventMapper ◀── reader task ◀───────┘
//!                   │
//!                   ├──▶ TranscriptAssembler (+ tag extraction)
//!                   └──▶ PlaybackScheduler
//! ```
//!
//! # Failure Strategy
//!
//! - No automatic reconnection; a dropped connection ends the session in error
//! - Outbound audio is dropped, never queued unboundedly, when the socket lags

mod protocol;
mod realtime_client;
mod tags;
mod transcript_assembler;

pub use protocol::{
    sample_rate_from_mime, ClientMessage, EventMapper, InboundEvent, Role, ServerMessage,
    DEFAULT_LIVE_MODEL, LIVE_API_URL,
};
pub use realtime_client::{
    get_api_key, Connector, LiveConnector, MuteGate, PacketSender, RealtimeSession, SendOutcome,
    SendPermit, OUTBOUND_QUEUE_CAPACITY,
};
pub use tags::{extract_tags, Fact};
pub use transcript_assembler::{FinalizedTurn, LineId, TranscriptAssembler, TranscriptLine};

use thiserror::Error;

/// Errors that can occur while opening or running a live session
#[derive(Debug, Clone, Error)]
pub enum StreamingError {
    #[error("Gemini API key not configured. Set GEMINI_API_KEY environment variable.")]
    MissingApiKey,
    #[error("Failed to connect to Gemini Live API: {0}")]
    ConnectionFailed(String),
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("WebSocket protocol error: {0}")]
    ProtocolError(String),
    #[error("WebSocket disconnected: {0}")]
    Disconnected(String),
    #[error("Failed to send message: {0}")]
    SendFailed(String),
}
