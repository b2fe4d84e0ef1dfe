use std::time::Duration;

use serde_json::Value;

/// Lifecycle and dispatch notifications fanned out to subscribers.
///
/// The gateway is the single producer; every subscriber gets its own
/// broadcast receiver, so ordering within one receiver matches frame
/// arrival order.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// A connection attempt is starting (1-based attempt number)
    Connecting { attempt: u32 },
    /// The socket opened and the handshake is underway
    Connected,
    /// A connection attempt failed before session establishment
    ConnectionFailed { attempt: u32 },
    /// A brand-new session was established
    SessionStarted { session_id: String, shard_id: u32 },
    /// A dropped session was resumed; missed events replay as dispatches
    SessionResumed { session_id: String },
    /// A reconnect was scheduled after a recoverable failure
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// A shard's connection dropped
    ShardDisconnected { shard_id: u32, code: u16 },
    /// The connection is gone for good: clean disconnect, fatal close, or
    /// destroy
    Terminated { code: Option<u16> },
    /// A numbered event, forwarded verbatim; the sole hand-off to the
    /// cache collaborator
    Dispatch { event: String, payload: Value },
}
