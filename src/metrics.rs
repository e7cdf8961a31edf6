//! Metrics collection for parla-live
//!
//! Tracks per-session counters (packets, reply audio, turns) and error
//! history. Used for diagnostics; nothing here affects session behavior.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::streaming::{Role, SendOutcome};

/// Maximum number of finished sessions to retain in history
const MAX_SESSION_HISTORY: usize = 50;

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Lock-free outbound packet counters, shared with the capture pump
#[derive(Debug, Default)]
pub struct PacketCounters {
    sent: AtomicU64,
    dropped_muted: AtomicU64,
    dropped_not_ready: AtomicU64,
    dropped_backpressure: AtomicU64,
}

impl PacketCounters {
    pub fn record(&self, outcome: SendOutcome) {
        let counter = match outcome {
            SendOutcome::Queued => &self.sent,
            SendOutcome::NotReady | SendOutcome::Closed => &self.dropped_not_ready,
            SendOutcome::Backpressure => &self.dropped_backpressure,
            SendOutcome::Muted => &self.dropped_muted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PacketStats {
        PacketStats {
            sent: self.sent.load(Ordering::Relaxed),
            dropped_muted: self.dropped_muted.load(Ordering::Relaxed),
            dropped_not_ready: self.dropped_not_ready.load(Ordering::Relaxed),
            dropped_backpressure: self.dropped_backpressure.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of `PacketCounters`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketStats {
    pub sent: u64,
    pub dropped_muted: u64,
    pub dropped_not_ready: u64,
    pub dropped_backpressure: u64,
}

impl PacketStats {
    pub fn dropped(&self) -> u64 {
        self.dropped_muted + self.dropped_not_ready + self.dropped_backpressure
    }
}

/// Metrics for one connection (finished or in progress)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetrics {
    pub session_id: String,
    /// Unix timestamp when the connection attempt started (seconds)
    pub started_at: u64,
    /// Time from start to live, if the session got there
    pub connect_duration_ms: Option<u64>,
    pub live_duration_ms: u64,
    pub packets: PacketStats,
    pub chunks_scheduled: u64,
    pub decode_errors: u64,
    pub interruptions: u64,
    pub user_turns: u64,
    pub assistant_turns: u64,
    pub translations: u64,
    pub success: bool,
    pub error_message: Option<String>,
}

/// Summary statistics across all sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub total_sessions: u64,
    pub successful_sessions: u64,
    pub failed_sessions: u64,
    /// Connection attempts stopped before they went live
    pub cancelled_sessions: u64,
    /// Average time to reach live (ms) across sessions that connected
    pub avg_connect_ms: u64,
    /// Snapshot of the session in progress, if any
    pub current: Option<SessionMetrics>,
    pub last_error: Option<ErrorRecord>,
}

/// Record of an error that occurred during operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    /// Unix timestamp when error occurred (seconds)
    pub timestamp: u64,
    /// Category of error (e.g., "capture", "transport", "output")
    pub error_type: String,
    pub message: String,
    pub session_id: Option<String>,
}

/// Internal state for tracking an in-progress session
struct SessionInProgress {
    session_id: Uuid,
    started_at: Instant,
    started_at_unix: u64,
    connect_duration_ms: Option<u64>,
    live_since: Option<Instant>,
    packets: PacketStats,
    chunks_scheduled: u64,
    decode_errors: u64,
    interruptions: u64,
    user_turns: u64,
    assistant_turns: u64,
    translations: u64,
}

impl SessionInProgress {
    fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            started_at: Instant::now(),
            started_at_unix: unix_now(),
            connect_duration_ms: None,
            live_since: None,
            packets: PacketStats::default(),
            chunks_scheduled: 0,
            decode_errors: 0,
            interruptions: 0,
            user_turns: 0,
            assistant_turns: 0,
            translations: 0,
        }
    }

    fn to_metrics(&self, success: bool, error_message: Option<String>) -> SessionMetrics {
        SessionMetrics {
            session_id: self.session_id.to_string(),
            started_at: self.started_at_unix,
            connect_duration_ms: self.connect_duration_ms,
            live_duration_ms: self
                .live_since
                .map(|t| t.elapsed().as_millis() as u64)
                .unwrap_or(0),
            packets: self.packets,
            chunks_scheduled: self.chunks_scheduled,
            decode_errors: self.decode_errors,
            interruptions: self.interruptions,
            user_turns: self.user_turns,
            assistant_turns: self.assistant_turns,
            translations: self.translations,
            success,
            error_message,
        }
    }
}

/// Collects and stores metrics for live sessions
pub struct MetricsCollector {
    /// History of finished sessions (newest first)
    history: VecDeque<SessionMetrics>,
    /// History of errors (newest first)
    errors: VecDeque<ErrorRecord>,
    current: Option<SessionInProgress>,
    total_sessions: u64,
    successful_sessions: u64,
    failed_sessions: u64,
    cancelled_sessions: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(MAX_SESSION_HISTORY),
            errors: VecDeque::with_capacity(MAX_ERROR_HISTORY),
            current: None,
            total_sessions: 0,
            successful_sessions: 0,
            failed_sessions: 0,
            cancelled_sessions: 0,
        }
    }

    /// Start tracking a new connection attempt
    ///
    /// A session still in progress is closed out as successful (it was
    /// replaced, not failed).
    pub fn start_session(&mut self, session_id: Uuid) {
        if self.current.is_some() {
            self.session_ended(None);
        }
        log::debug!("Metrics: starting session {}", session_id);
        self.current = Some(SessionInProgress::new(session_id));
        self.total_sessions += 1;
    }

    pub fn session_connected(&mut self) {
        if let Some(ref mut session) = self.current {
            let elapsed = session.started_at.elapsed().as_millis() as u64;
            session.connect_duration_ms = Some(elapsed);
            session.live_since = Some(Instant::now());
            log::info!("Metrics: session {} live after {}ms", session.session_id, elapsed);
        }
    }

    /// Latest packet counters for the current session
    pub fn update_packets(&mut self, packets: PacketStats) {
        if let Some(ref mut session) = self.current {
            session.packets = packets;
        }
    }

    pub fn chunk_scheduled(&mut self) {
        if let Some(ref mut session) = self.current {
            session.chunks_scheduled += 1;
        }
    }

    pub fn decode_error(&mut self) {
        if let Some(ref mut session) = self.current {
            session.decode_errors += 1;
        }
    }

    pub fn interruption(&mut self) {
        if let Some(ref mut session) = self.current {
            session.interruptions += 1;
        }
    }

    pub fn turn_completed(&mut self, role: Role) {
        if let Some(ref mut session) = self.current {
            match role {
                Role::User => session.user_turns += 1,
                Role::Assistant => session.assistant_turns += 1,
            }
        }
    }

    pub fn translation_attached(&mut self) {
        if let Some(ref mut session) = self.current {
            session.translations += 1;
        }
    }

    /// Close out the current session; `error` marks it failed
    pub fn session_ended(&mut self, error: Option<String>) {
        let Some(session) = self.current.take() else {
            return;
        };
        let success = error.is_none();
        let metrics = session.to_metrics(success, error.clone());

        log::info!(
            "Metrics: session {} ended - live {}ms, {} packets sent, {} dropped, {} chunks, {} interruptions",
            metrics.session_id,
            metrics.live_duration_ms,
            metrics.packets.sent,
            metrics.packets.dropped(),
            metrics.chunks_scheduled,
            metrics.interruptions
        );

        let session_id = metrics.session_id.clone();
        self.add_to_history(metrics);

        match error {
            None => self.successful_sessions += 1,
            Some(message) => {
                self.failed_sessions += 1;
                self.record_error("session".to_string(), message, Some(session_id));
            }
        }
    }

    /// Close out a connection attempt that was stopped before going live
    ///
    /// Neither a success nor a failure; kept in history as unsuccessful.
    pub fn session_cancelled(&mut self) {
        let Some(session) = self.current.take() else {
            return;
        };
        log::info!("Metrics: session {} cancelled while connecting", session.session_id);
        self.add_to_history(session.to_metrics(false, None));
        self.cancelled_sessions += 1;
    }

    /// Record an error (not necessarily tied to a session)
    pub fn record_error(&mut self, error_type: String, message: String, session_id: Option<String>) {
        let error = ErrorRecord {
            timestamp: unix_now(),
            error_type,
            message,
            session_id,
        };

        log::debug!("Metrics: recording error - {:?}", error);

        self.errors.push_front(error);
        while self.errors.len() > MAX_ERROR_HISTORY {
            self.errors.pop_back();
        }
    }

    pub fn get_summary(&self) -> MetricsSummary {
        let connected: Vec<u64> = self
            .history
            .iter()
            .filter_map(|s| s.connect_duration_ms)
            .collect();
        let avg_connect_ms = if connected.is_empty() {
            0
        } else {
            connected.iter().sum::<u64>() / connected.len() as u64
        };

        MetricsSummary {
            total_sessions: self.total_sessions,
            successful_sessions: self.successful_sessions,
            failed_sessions: self.failed_sessions,
            cancelled_sessions: self.cancelled_sessions,
            avg_connect_ms,
            current: self.current.as_ref().map(|s| s.to_metrics(true, None)),
            last_error: self.errors.front().cloned(),
        }
    }

    /// Finished sessions (newest first)
    pub fn get_history(&self) -> Vec<SessionMetrics> {
        self.history.iter().cloned().collect()
    }

    /// Error history (newest first)
    pub fn get_errors(&self) -> Vec<ErrorRecord> {
        self.errors.iter().cloned().collect()
    }

    fn add_to_history(&mut self, metrics: SessionMetrics) {
        self.history.push_front(metrics);
        while self.history.len() > MAX_SESSION_HISTORY {
            self.history.pop_back();
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
