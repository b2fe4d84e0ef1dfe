use std::time::Instant;

use chrono::{DateTime, Utc};

/// Per-session state: id, resume target, and the last seen sequence.
///
/// Mutated only from the driver task; exactly one in-flight connection
/// attempt touches it at a time.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub session_id: Option<String>,
    pub resume_url: Option<String>,
    pub sequence: u64,
    pub ready_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Capture the identifiers announced by the session-established event.
    pub fn establish(&mut self, session_id: String, resume_url: Option<String>) {
        self.session_id = Some(session_id);
        self.resume_url = resume_url;
        self.ready_at = Some(Utc::now());
    }

    /// Advance the stored sequence from a numbered dispatch payload.
    ///
    /// Stale (lower or equal) numbers are ignored; the stored value is
    /// non-decreasing for the life of the session.
    pub fn record_sequence(&mut self, sequence: u64) {
        if sequence > self.sequence {
            self.sequence = sequence;
        } else if sequence < self.sequence {
            tracing::trace!(
                received = sequence,
                stored = self.sequence,
                "ignoring stale sequence number"
            );
        }
    }

    /// Resume is legal only when id, resume URL and a positive sequence all
    /// hold simultaneously.
    #[must_use]
    pub fn can_resume(&self) -> bool {
        self.session_id.is_some() && self.resume_url.is_some() && self.sequence > 0
    }

    /// Discard all session state; called on clean or non-recoverable
    /// disconnects.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Ephemeral bookkeeping for the current run of connection attempts.
#[derive(Debug, Clone)]
pub struct ConnectionAttempt {
    pub started_at: Instant,
    /// Consecutive retryable failures; indexes the backoff schedule
    pub attempts: u32,
}

impl ConnectionAttempt {
    #[must_use]
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            attempts: 0,
        }
    }

    pub fn begin(&mut self) {
        self.started_at = Instant::now();
    }

    /// Next 1-based attempt number after a retryable failure.
    pub fn record_failure(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    pub fn record_success(&mut self) {
        self.attempts = 0;
    }
}

impl Default for ConnectionAttempt {
    fn default() -> Self {
        Self::new()
    }
}
