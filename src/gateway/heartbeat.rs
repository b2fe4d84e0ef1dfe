use std::time::{Duration, Instant};

use rand::Rng as _;

/// What the driver should do on a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    /// Send a heartbeat carrying the current sequence
    Send,
    /// The previous beat was never acknowledged; the connection is a zombie
    /// and must be cycled instead of beating again
    Zombie,
}

/// Liveness state machine for one connection.
///
/// The manager holds no timers itself; the driver's select loop owns the
/// jittered first delay and the recurring interval, and feeds ticks in. This
/// is the sole liveness detector: no transport-level ping/pong is assumed,
/// and at most one unacknowledged beat is tolerated.
#[derive(Debug)]
pub struct HeartbeatManager {
    interval: Option<Duration>,
    awaiting_ack: bool,
    last_beat: Option<Instant>,
    latency: Option<Duration>,
}

impl HeartbeatManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            interval: None,
            awaiting_ack: false,
            last_beat: None,
            latency: None,
        }
    }

    /// Arm the manager with the server-announced interval. Returns the delay
    /// before the first beat, drawn uniformly from `[0, interval)` so a fleet
    /// of clients does not beat in lockstep.
    pub fn start(&mut self, interval: Duration) -> Duration {
        self.interval = Some(interval);
        self.awaiting_ack = false;
        self.last_beat = None;

        let jitter = rand::rng().random_range(0.0..1.0_f64);
        interval.mul_f64(jitter)
    }

    #[must_use]
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Decide what a timer tick should do. Checks the prior beat's ack
    /// before permitting another send.
    pub fn tick(&mut self) -> Beat {
        if self.awaiting_ack {
            return Beat::Zombie;
        }
        Beat::Send
    }

    /// Record that a heartbeat was put on the wire.
    pub fn sent(&mut self) {
        self.awaiting_ack = true;
        self.last_beat = Some(Instant::now());
    }

    /// Record the server's acknowledgement.
    pub fn ack(&mut self) {
        self.awaiting_ack = false;
        if let Some(sent) = self.last_beat {
            self.latency = Some(sent.elapsed());
        }
    }

    /// Round-trip time of the most recent acknowledged beat.
    #[must_use]
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    /// Disarm; idempotent. Recreated state on each reconnect starts from
    /// [`HeartbeatManager::start`].
    pub fn reset(&mut self) {
        self.interval = None;
        self.awaiting_ack = false;
        self.last_beat = None;
    }
}

impl Default for HeartbeatManager {
    fn default() -> Self {
        Self::new()
    }
}
