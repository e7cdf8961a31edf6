//! Session state machine for parla-live
//!
//! This module implements the session lifecycle using a single-writer pattern.
//! All state transitions go through the `reduce()` function, which returns
//! a new state and a list of effects for the controller to execute.

use std::time::Instant;
use uuid::Uuid;

/// Internal state of one controller's session lifecycle.
/// This is the authoritative state - all transitions go through the reducer.
#[derive(Debug, Clone, Default)]
pub enum State {
    #[default]
    Idle,
    Connecting {
        session_id: Uuid,
    },
    Live {
        session_id: Uuid,
        connected_at: Instant,
    },
    /// Tearing down the old connection and opening one with a new config
    Reconnecting {
        session_id: Uuid,
    },
    Closing,
    Closed,
    Errored {
        message: String,
    },
}

impl State {
    /// Id of the connection attempt this state belongs to
    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            State::Connecting { session_id }
            | State::Live { session_id, .. }
            | State::Reconnecting { session_id } => Some(*session_id),
            _ => None,
        }
    }

    /// True while a connection is being opened or is open
    pub fn is_active(&self) -> bool {
        self.session_id().is_some()
    }
}

/// Events that can trigger state transitions.
/// Sent by the controller's command handlers, connect tasks and inbound stream.
#[derive(Debug, Clone)]
pub enum Event {
    /// Caller asked to start a session
    Start,
    /// Caller asked to stop (universal teardown)
    Stop,
    /// Session config changed in a way that needs a fresh connection
    Reconfigure,

    // Connection events (carry the attempt id to drop stale results)
    ConnectOk {
        id: Uuid,
    },
    ConnectFail {
        id: Uuid,
        err: String,
    },
    /// Live connection failed or was dropped by the remote side
    TransportFailed {
        id: Uuid,
        err: String,
    },

    /// Teardown started by `Stop` has finished
    TeardownComplete,
    /// Once-per-second tick while live (refreshes elapsed time)
    Tick {
        id: Uuid,
    },
}

/// Effects to be executed after a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Acquire capture, output and transport concurrently for attempt `id`
    Connect { id: Uuid },
    /// Release capture, output and transport; cancel in-flight tasks
    Teardown,
    /// Drop transcript lines and scheduler state
    ResetConversation,
    /// Publish the current status to subscribers
    EmitStatus,
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Ignore connection events with stale attempt IDs
/// - No automatic retry: fatal failures land in `Errored`
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    let current_id = state.session_id();
    let matches_current = |eid: Uuid| current_id == Some(eid);

    match (state, event) {
        // -----------------
        // Start
        // -----------------
        (Idle | Closed | Errored { .. }, Start) => {
            let id = Uuid::new_v4();
            (Connecting { session_id: id }, vec![Connect { id }, EmitStatus])
        }
        (_, Start) => (state.clone(), vec![]),

        // -----------------
        // Connection results
        // -----------------
        (Connecting { .. } | Reconnecting { .. }, ConnectOk { id }) if matches_current(id) => (
            Live {
                session_id: id,
                connected_at: Instant::now(),
            },
            vec![EmitStatus],
        ),
        (Connecting { .. } | Reconnecting { .. }, ConnectFail { id, err }) if matches_current(id) => {
            log::warn!("Session {} failed to connect: {}", id, err);
            (Errored { message: err }, vec![Teardown, EmitStatus])
        }
        (Connecting { .. } | Reconnecting { .. } | Live { .. }, TransportFailed { id, err })
            if matches_current(id) =>
        {
            log::warn!("Session {} transport failed: {}", id, err);
            (Errored { message: err }, vec![Teardown, EmitStatus])
        }

        // -----------------
        // Reconfigure
        // -----------------
        (Connecting { .. } | Live { .. } | Reconnecting { .. } | Errored { .. }, Reconfigure) => {
            let id = Uuid::new_v4();
            (
                Reconnecting { session_id: id },
                vec![Teardown, ResetConversation, Connect { id }, EmitStatus],
            )
        }
        // Not connected: new config applies on the next start
        (Idle | Closed, Reconfigure) => (state.clone(), vec![ResetConversation, EmitStatus]),
        (Closing, Reconfigure) => (Closing, vec![ResetConversation]),

        // -----------------
        // Stop
        // -----------------
        (Connecting { .. } | Live { .. } | Reconnecting { .. }, Stop) => {
            (Closing, vec![Teardown, EmitStatus])
        }
        // Idempotent: teardown again, no transition
        (_, Stop) => (state.clone(), vec![Teardown]),
        (Closing, TeardownComplete) => (Closed, vec![EmitStatus]),

        // -----------------
        // Live tick
        // -----------------
        (Live { .. }, Tick { id }) if matches_current(id) => (state.clone(), vec![EmitStatus]),

        // -----------------
        // Stale or unhandled: no transition
        // -----------------
        _ => (state.clone(), vec![]),
    }
}
