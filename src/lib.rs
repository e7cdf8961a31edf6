//! parla-live: real-time spoken Italian practice over the Gemini Live API
//!
//! A `SessionController` owns one conversation at a time: it streams the
//! microphone to the model, plays the spoken reply gaplessly, assembles
//! both sides of the transcript and translates finished lines.

pub mod audio;
pub mod config;
pub mod controller;
pub mod metrics;
pub mod persona;
pub mod settings;
pub mod state_machine;
pub mod streaming;
pub mod translation;

use serde::Serialize;

use state_machine::State;

pub use config::{ConversationMode, SessionConfig};
pub use controller::{ControllerDeps, SessionController, SessionError, SessionUpdate};
pub use persona::Persona;

/// Session status published to subscribers.
/// Uses tagged union format: { "status": "idle" } or { "status": "live", "muted": false, "elapsedSecs": 5 }
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SessionStatus {
    Idle,
    Connecting,
    Live {
        muted: bool,
        #[serde(rename = "elapsedSecs")]
        elapsed_secs: u64,
    },
    Reconnecting,
    Closing,
    Closed,
    Errored {
        message: String,
    },
}

impl SessionStatus {
    pub fn is_live(&self) -> bool {
        matches!(self, SessionStatus::Live { .. })
    }
}

/// Convert internal State to the published status
pub fn status_from_state(state: &State, muted: bool) -> SessionStatus {
    match state {
        State::Idle => SessionStatus::Idle,
        State::Connecting { .. } => SessionStatus::Connecting,
        State::Live { connected_at, .. } => SessionStatus::Live {
            muted,
            elapsed_secs: connected_at.elapsed().as_secs(),
        },
        State::Reconnecting { .. } => SessionStatus::Reconnecting,
        State::Closing => SessionStatus::Closing,
        State::Closed => SessionStatus::Closed,
        State::Errored { message } => SessionStatus::Errored {
            message: message.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use uuid::Uuid;

    #[test]
    fn test_live_status_serialization() {
        let state = State::Live {
            session_id: Uuid::new_v4(),
            connected_at: Instant::now(),
        };
        let json = serde_json::to_value(status_from_state(&state, true)).unwrap();
        assert_eq!(json["status"], "live");
        assert_eq!(json["muted"], true);
        assert_eq!(json["elapsedSecs"], 0);
    }

    #[test]
    fn test_errored_status_carries_message() {
        let state = State::Errored {
            message: "Microphone unavailable: denied".to_string(),
        };
        let json = serde_json::to_value(status_from_state(&state, false)).unwrap();
        assert_eq!(json["status"], "errored");
        assert_eq!(json["message"], "Microphone unavailable: denied");
    }

    #[test]
    fn test_simple_statuses() {
        assert_eq!(status_from_state(&State::Idle, false), SessionStatus::Idle);
        assert_eq!(
            serde_json::to_string(&status_from_state(&State::Closing, false)).unwrap(),
            r#"{"status":"closing"}"#
        );
        let reconnecting = State::Reconnecting {
            session_id: Uuid::new_v4(),
        };
        assert_eq!(status_from_state(&reconnecting, false), SessionStatus::Reconnecting);
    }
}
