use serde_json::Value;
use strum_macros::Display;

use crate::gateway::error::GatewayError;
use crate::gateway::etf;
use crate::gateway::payload::PayloadEnvelope;

/// Wire format, selected once at construction and immutable after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
#[strum(serialize_all = "lowercase")]
pub enum EncodingFormat {
    #[default]
    Json,
    /// Compact binary term format
    Etf,
}

/// Encoded frame ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodedFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// Stateless per-call serializer between wire bytes and
/// [`PayloadEnvelope`].
#[derive(Debug, Clone, Copy)]
pub struct EncodingService {
    format: EncodingFormat,
}

impl EncodingService {
    #[must_use]
    pub fn new(format: EncodingFormat) -> Self {
        Self { format }
    }

    #[must_use]
    pub fn format(&self) -> EncodingFormat {
        self.format
    }

    /// Parse an inbound frame (text frames arrive as their UTF-8 bytes).
    pub fn decode(&self, bytes: &[u8]) -> Result<PayloadEnvelope, GatewayError> {
        match self.format {
            EncodingFormat::Json => {
                serde_json::from_slice(bytes).map_err(|e| GatewayError::Decode {
                    format: "json",
                    source: Box::new(e),
                })
            }
            EncodingFormat::Etf => {
                let value = etf::decode(bytes).map_err(|e| GatewayError::Decode {
                    format: "etf",
                    source: Box::new(e),
                })?;
                serde_json::from_value::<PayloadEnvelope>(value).map_err(|e| {
                    GatewayError::Decode {
                        format: "etf",
                        source: Box::new(e),
                    }
                })
            }
        }
    }

    /// Serialize an envelope for the wire.
    pub fn encode(&self, envelope: &PayloadEnvelope) -> Result<EncodedFrame, GatewayError> {
        match self.format {
            EncodingFormat::Json => serde_json::to_string(envelope)
                .map(EncodedFrame::Text)
                .map_err(|e| GatewayError::Encode {
                    format: "json",
                    source: Box::new(e),
                }),
            EncodingFormat::Etf => {
                let value =
                    serde_json::to_value(envelope).map_err(|e| GatewayError::Encode {
                        format: "etf",
                        source: Box::new(e),
                    })?;
                Ok(EncodedFrame::Binary(etf::encode(&strip_nulls(value))))
            }
        }
    }
}

/// ETF envelopes omit null dispatch fields rather than sending nil atoms.
fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect(),
        ),
        other => other,
    }
}
