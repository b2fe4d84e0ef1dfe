use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::intents::Intents;

/// Protocol operation codes carried in the `op` field of every envelope.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum Opcode {
    /// Numbered event pushed by the server
    Dispatch = 0,
    Heartbeat = 1,
    Identify = 2,
    PresenceUpdate = 3,
    VoiceStateUpdate = 4,
    Resume = 6,
    /// Server instruction to disconnect and resume
    Reconnect = 7,
    RequestGuildMembers = 8,
    InvalidSession = 9,
    Hello = 10,
    HeartbeatAck = 11,
}

/// The in-memory form of every wire frame.
///
/// `s` and `t` are only populated on [`Opcode::Dispatch`] payloads. Never
/// persisted; produced by decode and consumed by the opcode dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadEnvelope {
    pub op: Opcode,
    #[serde(default)]
    pub d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl PayloadEnvelope {
    #[must_use]
    pub fn new(op: Opcode, d: Value) -> Self {
        Self {
            op,
            d,
            s: None,
            t: None,
        }
    }
}

/// Client platform metadata sent with Identify.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_owned(),
            browser: env!("CARGO_PKG_NAME").to_owned(),
            device: env!("CARGO_PKG_NAME").to_owned(),
        }
    }
}

/// Builds the Identify (opcode 2) data payload.
#[must_use]
pub fn identify(
    token: &str,
    intents: Intents,
    properties: &ConnectionProperties,
    shard: Option<[u32; 2]>,
    presence: Option<&Value>,
    large_threshold: Option<u16>,
) -> Value {
    let mut d = json!({
        "token": token,
        "intents": intents.bits(),
        "properties": {
            "os": properties.os,
            "browser": properties.browser,
            "device": properties.device,
        },
    });
    if let Some(shard) = shard {
        d["shard"] = json!(shard);
    }
    if let Some(presence) = presence {
        d["presence"] = presence.clone();
    }
    if let Some(threshold) = large_threshold {
        d["large_threshold"] = json!(threshold);
    }
    d
}

/// Builds the Resume (opcode 6) data payload.
#[must_use]
pub fn resume(token: &str, session_id: &str, sequence: u64) -> Value {
    json!({
        "token": token,
        "session_id": session_id,
        "seq": sequence,
    })
}

/// Builds a RequestGuildMembers (opcode 8) data payload for a whole guild.
#[must_use]
pub fn request_guild_members(guild_id: u64, query: &str, limit: u32) -> Value {
    json!({
        "guild_id": guild_id.to_string(),
        "query": query,
        "limit": limit,
    })
}

/// Close-code classification used by the reconnect path.
pub mod close {
    /// Normal closure; discards session state.
    pub const NORMAL: u16 = 1000;
    /// Going away; also clean.
    pub const GOING_AWAY: u16 = 1001;
    /// Abnormal closure (no close frame); always resumable.
    pub const ABNORMAL: u16 = 1006;

    pub const AUTHENTICATION_FAILED: u16 = 4004;
    pub const INVALID_SHARD: u16 = 4010;
    pub const SHARDING_REQUIRED: u16 = 4011;
    pub const INVALID_API_VERSION: u16 = 4012;
    pub const INVALID_INTENTS: u16 = 4013;
    pub const DISALLOWED_INTENTS: u16 = 4014;

    /// Internal code used when the client itself cycles the socket to
    /// resume; never treated as clean.
    pub const RECONNECT_REQUESTED: u16 = 4900;

    /// What the close handler should do with the session.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Disposition {
        /// Deliberate shutdown; session state is discarded, no reconnect.
        Clean,
        /// Recoverable; reconnect (resuming when session state allows).
        Resumable,
        /// Non-recoverable protocol rejection; surface a terminal error.
        Fatal,
    }

    /// Classify a close code per the protocol contract.
    #[must_use]
    pub fn disposition(code: u16) -> Disposition {
        match code {
            NORMAL | GOING_AWAY => Disposition::Clean,
            AUTHENTICATION_FAILED | INVALID_SHARD | SHARDING_REQUIRED | INVALID_API_VERSION
            | INVALID_INTENTS | DISALLOWED_INTENTS => Disposition::Fatal,
            _ => Disposition::Resumable,
        }
    }
}
