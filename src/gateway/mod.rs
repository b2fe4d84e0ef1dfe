//! Persistent real-time connection to the push gateway.
//!
//! The gateway is the sole source of real-time events: a WebSocket carrying
//! versioned payload envelopes, kept alive by application-level heartbeats
//! and recovered through resume or re-identify when the socket drops.
//!
//! # Architecture
//!
//! - [`Gateway`]: clonable handle over a spawned driver task that owns the
//!   socket and all protocol state
//! - [`HeartbeatManager`]: liveness state machine fed by the driver's timers
//! - [`ShardManager`]: shard provisioning, identify pacing and guild routing
//! - [`CompressionService`]: incremental decompressor for the shared zlib
//!   or zstd stream
//! - [`EncodingService`]: wire codec, JSON or the binary term format
//!
//! # Example
//!
//! ```ignore
//! let config = Config::new(token, Intents::GUILDS | Intents::GUILD_MESSAGES);
//! let gateway = Gateway::new(config, Arc::new(bootstrap));
//! let mut events = gateway.subscribe();
//!
//! gateway.connect().await?;
//! while let Ok(event) = events.recv().await {
//!     /* ... */
//! }
//! ```

pub mod compression;
pub mod config;
pub mod connection;
pub mod encoding;
pub mod error;
pub mod etf;
pub mod event;
pub mod heartbeat;
pub mod payload;
pub mod session;
pub mod shard;

pub use compression::{CompressionFormat, CompressionService};
pub use config::{Config, ReconnectPolicy};
pub use connection::{Gateway, GatewayState};
pub use encoding::{EncodingFormat, EncodingService};
#[expect(
    clippy::module_name_repetitions,
    reason = "GatewayError and GatewayEvent keep the module name for clarity at call sites"
)]
pub use error::GatewayError;
pub use event::GatewayEvent;
pub use heartbeat::HeartbeatManager;
pub use payload::{Opcode, PayloadEnvelope};
pub use session::Session;
pub use shard::{ShardManager, ShardStatus};
