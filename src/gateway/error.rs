use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

/// Gateway failure variants, spanning the four-way taxonomy: transport,
/// protocol, session, and caller misuse.
#[non_exhaustive]
#[derive(Debug)]
pub enum GatewayError {
    /// Transport error from the WebSocket layer
    Connection(tokio_tungstenite::tungstenite::Error),
    /// Server closed the connection
    Closed {
        code: u16,
        reason: String,
    },
    /// Server rejected the connection with a non-resumable close code
    Fatal {
        code: u16,
        reason: String,
    },
    /// Socket open or session establishment exceeded its bounded wait
    HandshakeTimeout {
        phase: &'static str,
        waited: Duration,
    },
    /// Transport open but protocol unresponsive: a heartbeat went
    /// unacknowledged for a full interval
    Zombie,
    /// The shared compressed stream reported a stream error
    Decompression(Box<dyn StdError + Send + Sync + 'static>),
    /// Inbound frame could not be decoded in the active format
    Decode {
        format: &'static str,
        source: Box<dyn StdError + Send + Sync + 'static>,
    },
    /// Outbound envelope could not be encoded in the active format
    Encode {
        format: &'static str,
        source: Box<dyn StdError + Send + Sync + 'static>,
    },
    /// Server invalidated the session and resume is not possible
    InvalidSession,
    /// Caller asked to resume without complete session state
    NotResumable,
    /// Operation on a gateway that was destroyed
    Destroyed,
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "gateway connection error: {e}"),
            Self::Closed { code, reason } => {
                write!(f, "gateway closed with code {code}: {reason}")
            }
            Self::Fatal { code, reason } => {
                write!(f, "gateway rejected connection with code {code}: {reason}")
            }
            Self::HandshakeTimeout { phase, waited } => {
                write!(f, "timed out after {waited:?} waiting for {phase}")
            }
            Self::Zombie => write!(f, "zombie connection: heartbeat was never acknowledged"),
            Self::Decompression(e) => write!(f, "compressed stream error: {e}"),
            Self::Decode { format, source } => {
                write!(f, "failed to decode {format} payload: {source}")
            }
            Self::Encode { format, source } => {
                write!(f, "failed to encode {format} payload: {source}")
            }
            Self::InvalidSession => write!(f, "session invalidated by server"),
            Self::NotResumable => {
                write!(f, "resume requires session id, resume url and sequence > 0")
            }
            Self::Destroyed => write!(f, "gateway has been destroyed"),
        }
    }
}

impl StdError for GatewayError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            Self::Decompression(source)
            | Self::Decode { source, .. }
            | Self::Encode { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<GatewayError> for crate::error::Error {
    fn from(e: GatewayError) -> Self {
        let kind = match &e {
            GatewayError::Connection(_)
            | GatewayError::Closed { .. }
            | GatewayError::Fatal { .. }
            | GatewayError::HandshakeTimeout { .. }
            | GatewayError::Zombie => crate::error::Kind::WebSocket,
            GatewayError::Decompression(_)
            | GatewayError::Decode { .. }
            | GatewayError::Encode { .. } => crate::error::Kind::Protocol,
            GatewayError::InvalidSession => crate::error::Kind::Session,
            GatewayError::NotResumable | GatewayError::Destroyed => crate::error::Kind::Validation,
        };
        crate::error::Error::with_source(kind, e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for crate::error::Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        GatewayError::Connection(e).into()
    }
}
