//! Gemini Live API protocol types
//!
//! JSON message types for the `BidiGenerateContent` WebSocket session, plus
//! the mapping from raw server messages to `InboundEvent`s.
//!
//! # Protocol Overview
//!
//! 1. Connect to `LIVE_API_URL?key=<API key>`
//! 2. Send `setup` (model, voice, system prompt, transcription on both sides)
//! 3. Receive `setupComplete`
//! 4. Stream microphone audio via `realtimeInput.audio`
//! 5. Receive `serverContent`: transcription deltas, reply audio, turn markers

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::audio::{OutboundPacket, OUTPUT_SAMPLE_RATE};
use crate::config::SessionConfig;
use crate::persona;

/// Gemini Live API endpoint (API key goes in the `key` query parameter)
pub const LIVE_API_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Model used when settings don't name one
pub const DEFAULT_LIVE_MODEL: &str = "models/gemini-2.0-flash-live-001";

// ============================================================================
// Shared content types
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

/// Base64 payload with its MIME type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

// ============================================================================
// Client Messages (sent TO Gemini)
// ============================================================================

/// Messages sent from client to the Live API
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    /// First message on every connection
    Setup(Setup),
    /// Streamed microphone audio
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
    /// Empty object enables transcription of the learner's speech
    pub input_audio_transcription: TranscriptionConfig,
    /// Empty object enables transcription of the reply audio
    pub output_audio_transcription: TranscriptionConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TranscriptionConfig {}

#[derive(Debug, Clone, Serialize)]
pub struct RealtimeInput {
    pub audio: Blob,
}

impl ClientMessage {
    /// Build the setup message for a session config
    pub fn setup(config: &SessionConfig, model: &str) -> Self {
        Self::Setup(Setup {
            model: model.to_string(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice_id.clone(),
                        },
                    },
                },
            },
            system_instruction: Content {
                parts: vec![Part {
                    text: Some(persona::system_prompt(config)),
                    inline_data: None,
                }],
            },
            input_audio_transcription: TranscriptionConfig::default(),
            output_audio_transcription: TranscriptionConfig::default(),
        })
    }

    /// Wrap an encoded packet as realtime audio input
    pub fn audio(packet: &OutboundPacket) -> Self {
        Self::RealtimeInput(RealtimeInput {
            audio: Blob {
                mime_type: packet.format.mime_type(),
                data: packet.data.clone(),
            },
        })
    }
}

// ============================================================================
// Server Messages (received FROM Gemini)
// ============================================================================

/// One message from the Live API
///
/// Exactly one field is normally set; unknown fields are ignored so newer
/// server messages never fail to parse.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

impl ServerMessage {
    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: Option<String>,
}

/// Server notice that the connection will be closed soon
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

// ============================================================================
// Inbound events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// What the rest of the session sees of the remote service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    PartialTranscript { role: Role, text: String },
    /// Raw PCM16 mono bytes
    AudioChunk { bytes: Vec<u8>, sample_rate: u32 },
    TurnComplete { role: Role },
    Interrupted,
    Error { detail: String },
}

/// Parse the sample rate out of `audio/pcm;rate=24000`
pub fn sample_rate_from_mime(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse().ok())
}

/// Turns server messages into ordered `InboundEvent`s
///
/// The service never marks the end of the learner's turn explicitly, so the
/// mapper closes it just before the first reply output that follows user
/// speech (or at the reply's `turnComplete`).
#[derive(Debug, Default)]
pub struct EventMapper {
    user_turn_open: bool,
    assistant_turn_open: bool,
}

impl EventMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(&mut self, msg: ServerMessage) -> Vec<InboundEvent> {
        let mut events = Vec::new();

        if let Some(go_away) = &msg.go_away {
            log::warn!(
                "Live API will close the connection soon (time left: {})",
                go_away.time_left.as_deref().unwrap_or("unknown")
            );
        }

        let Some(content) = msg.server_content else {
            return events;
        };

        if let Some(text) = non_empty(content.input_transcription) {
            self.user_turn_open = true;
            events.push(InboundEvent::PartialTranscript {
                role: Role::User,
                text,
            });
        }

        if let Some(text) = non_empty(content.output_transcription) {
            self.open_assistant_turn(&mut events);
            events.push(InboundEvent::PartialTranscript {
                role: Role::Assistant,
                text,
            });
        }

        let parts = content.model_turn.map(|turn| turn.parts).unwrap_or_default();
        for blob in parts.into_iter().filter_map(|p| p.inline_data) {
            if !blob.mime_type.starts_with("audio/") {
                log::debug!("Ignoring inline data of type {}", blob.mime_type);
                continue;
            }
            let bytes = match STANDARD.decode(blob.data.as_bytes()) {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::warn!("Dropping audio chunk with invalid base64: {}", e);
                    continue;
                }
            };
            self.open_assistant_turn(&mut events);
            events.push(InboundEvent::AudioChunk {
                bytes,
                sample_rate: sample_rate_from_mime(&blob.mime_type).unwrap_or(OUTPUT_SAMPLE_RATE),
            });
        }

        if content.interrupted {
            events.push(InboundEvent::Interrupted);
            self.close_assistant_turn(&mut events);
        }

        if content.turn_complete {
            self.close_user_turn(&mut events);
            self.close_assistant_turn(&mut events);
        }

        events
    }

    fn open_assistant_turn(&mut self, events: &mut Vec<InboundEvent>) {
        self.close_user_turn(events);
        self.assistant_turn_open = true;
    }

    fn close_user_turn(&mut self, events: &mut Vec<InboundEvent>) {
        if std::mem::take(&mut self.user_turn_open) {
            events.push(InboundEvent::TurnComplete { role: Role::User });
        }
    }

    fn close_assistant_turn(&mut self, events: &mut Vec<InboundEvent>) {
        if std::mem::take(&mut self.assistant_turn_open) {
            events.push(InboundEvent::TurnComplete {
                role: Role::Assistant,
            });
        }
    }
}

fn non_empty(transcription: Option<Transcription>) -> Option<String> {
    transcription
        .and_then(|t| t.text)
        .filter(|text| !text.is_empty())
}
