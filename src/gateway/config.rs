use std::time::Duration;

use secrecy::SecretString;
use serde_json::Value;

use crate::gateway::compression::CompressionFormat;
use crate::gateway::encoding::EncodingFormat;
use crate::gateway::payload::ConnectionProperties;
use crate::intents::Intents;

/// Protocol version negotiated in the wire URL.
pub const PROTOCOL_VERSION: u8 = 10;

const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_BACKOFF_SCHEDULE_MS: [u64; 5] = [1_000, 5_000, 10_000, 30_000, 60_000];

/// Configuration for a gateway connection.
#[non_exhaustive]
#[derive(Clone)]
pub struct Config {
    /// Bot token used for Identify and Resume
    pub token: SecretString,
    /// Event-group subscription mask
    pub intents: Intents,
    /// Wire format, fixed for the life of the gateway
    pub encoding: EncodingFormat,
    /// Negotiate a shared compressed stream in the given format
    pub compress: Option<CompressionFormat>,
    /// Platform metadata sent with Identify
    pub properties: ConnectionProperties,
    /// Member-list threshold above which a guild is sent as "large"
    pub large_threshold: Option<u16>,
    /// Initial presence forwarded verbatim in Identify
    pub presence: Option<Value>,
    /// Shard count override; takes precedence over the server recommendation
    pub shard_count: Option<u32>,
    /// Shard id this connection identifies as (when sharding is enabled)
    pub shard_id: u32,
    /// Bounded wait for the socket to open
    pub open_timeout: Duration,
    /// Bounded wait for session establishment after the socket opens
    pub ready_timeout: Duration,
    /// Whether connection loss schedules automatic reconnects
    pub auto_reconnect: bool,
    /// Delay schedule between reconnect attempts
    pub reconnect: ReconnectPolicy,
}

impl Config {
    #[must_use]
    pub fn new(token: SecretString, intents: Intents) -> Self {
        Self {
            token,
            intents,
            encoding: EncodingFormat::Json,
            compress: None,
            properties: ConnectionProperties::default(),
            large_threshold: None,
            presence: None,
            shard_count: None,
            shard_id: 0,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            auto_reconnect: true,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Token is deliberately absent.
        f.debug_struct("Config")
            .field("intents", &self.intents)
            .field("encoding", &self.encoding)
            .field("compress", &self.compress)
            .field("shard_count", &self.shard_count)
            .field("shard_id", &self.shard_id)
            .field("open_timeout", &self.open_timeout)
            .field("ready_timeout", &self.ready_timeout)
            .field("auto_reconnect", &self.auto_reconnect)
            .finish_non_exhaustive()
    }
}

/// Ordered delay schedule applied between reconnect attempts.
///
/// Attempt `n` (1-based) waits `schedule[n - 1]`; attempts beyond the
/// schedule length repeat the last entry.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub schedule: Vec<Duration>,
}

impl ReconnectPolicy {
    #[must_use]
    pub fn new(schedule: Vec<Duration>) -> Self {
        Self { schedule }
    }

    /// Delay before the given 1-based attempt number.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        if self.schedule.is_empty() {
            return Duration::ZERO;
        }
        let index = (attempt.max(1) as usize - 1).min(self.schedule.len() - 1);
        self.schedule[index]
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            schedule: DEFAULT_BACKOFF_SCHEDULE_MS
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        }
    }
}
