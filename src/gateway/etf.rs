//! External Term Format codec.
//!
//! The compact binary wire format is ETF version 131, restricted to the
//! terms the gateway actually emits: integers (small, 32-bit, small big),
//! new floats, atoms (all three encodings), nil, strings, lists, binaries,
//! and maps. Terms decode into [`serde_json::Value`]; the atoms `nil`,
//! `null`, `true` and `false` map to JSON null and booleans.

use std::error::Error as StdError;
use std::fmt;

use serde_json::{Map, Number, Value};

const FORMAT_VERSION: u8 = 131;

const NEW_FLOAT_EXT: u8 = 70;
const SMALL_INTEGER_EXT: u8 = 97;
const INTEGER_EXT: u8 = 98;
const ATOM_EXT: u8 = 100;
const NIL_EXT: u8 = 106;
const STRING_EXT: u8 = 107;
const LIST_EXT: u8 = 108;
const BINARY_EXT: u8 = 109;
const SMALL_BIG_EXT: u8 = 110;
const MAP_EXT: u8 = 116;
const ATOM_UTF8_EXT: u8 = 118;
const SMALL_ATOM_UTF8_EXT: u8 = 119;

/// Decode failure; positions index the raw term bytes.
#[non_exhaustive]
#[derive(Debug, PartialEq, Eq)]
pub enum EtfError {
    /// Term ended before the tag's payload was complete
    UnexpectedEof { at: usize },
    /// Leading byte was not the supported format version
    BadVersion(u8),
    /// Term tag outside the supported subset
    UnknownTag { tag: u8, at: usize },
    /// Binary or atom bytes were not valid UTF-8
    InvalidUtf8 { at: usize },
    /// Big integer wider than 64 bits
    BigIntTooWide { digits: u8 },
    /// List with a non-nil tail
    ImproperList { at: usize },
    /// Float payload was NaN or infinite
    NonFiniteFloat,
    /// Bytes left over after the root term
    TrailingBytes { at: usize },
}

impl fmt::Display for EtfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof { at } => write!(f, "unexpected end of term at byte {at}"),
            Self::BadVersion(v) => write!(f, "unsupported term format version {v}"),
            Self::UnknownTag { tag, at } => write!(f, "unknown term tag {tag} at byte {at}"),
            Self::InvalidUtf8 { at } => write!(f, "invalid utf-8 in term at byte {at}"),
            Self::BigIntTooWide { digits } => {
                write!(f, "big integer with {digits} digit bytes exceeds 64 bits")
            }
            Self::ImproperList { at } => write!(f, "improper list tail at byte {at}"),
            Self::NonFiniteFloat => write!(f, "non-finite float in term"),
            Self::TrailingBytes { at } => write!(f, "trailing bytes after term at byte {at}"),
        }
    }
}

impl StdError for EtfError {}

/// Decode a full term (version byte included) into a JSON value.
pub fn decode(bytes: &[u8]) -> Result<Value, EtfError> {
    let mut reader = Reader { bytes, pos: 0 };
    let version = reader.u8()?;
    if version != FORMAT_VERSION {
        return Err(EtfError::BadVersion(version));
    }
    let value = reader.term()?;
    if reader.pos != bytes.len() {
        return Err(EtfError::TrailingBytes { at: reader.pos });
    }
    Ok(value)
}

/// Encode a JSON value as a full term, version byte included.
#[must_use]
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.push(FORMAT_VERSION);
    encode_term(value, &mut out);
    out
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8], EtfError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(EtfError::UnexpectedEof { at: self.pos })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, EtfError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, EtfError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, EtfError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn term(&mut self) -> Result<Value, EtfError> {
        let at = self.pos;
        let tag = self.u8()?;
        match tag {
            SMALL_INTEGER_EXT => Ok(Value::from(self.u8()?)),
            INTEGER_EXT => {
                let b = self.take(4)?;
                Ok(Value::from(i32::from_be_bytes([b[0], b[1], b[2], b[3]])))
            }
            NEW_FLOAT_EXT => {
                let b = self.take(8)?;
                let float = f64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
                Number::from_f64(float)
                    .map(Value::Number)
                    .ok_or(EtfError::NonFiniteFloat)
            }
            ATOM_EXT | ATOM_UTF8_EXT => {
                let len = self.u16()? as usize;
                self.atom(len, at)
            }
            SMALL_ATOM_UTF8_EXT => {
                let len = self.u8()? as usize;
                self.atom(len, at)
            }
            NIL_EXT => Ok(Value::Array(Vec::new())),
            STRING_EXT => {
                // Byte list; the gateway uses it for short integer lists.
                let len = self.u16()? as usize;
                let bytes = self.take(len)?;
                Ok(Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()))
            }
            LIST_EXT => {
                let len = self.u32()? as usize;
                let mut items = Vec::with_capacity(len.min(4096));
                for _ in 0..len {
                    items.push(self.term()?);
                }
                let tail_at = self.pos;
                if self.u8()? != NIL_EXT {
                    return Err(EtfError::ImproperList { at: tail_at });
                }
                Ok(Value::Array(items))
            }
            BINARY_EXT => {
                let len = self.u32()? as usize;
                let bytes = self.take(len)?;
                let text = std::str::from_utf8(bytes)
                    .map_err(|_| EtfError::InvalidUtf8 { at })?;
                Ok(Value::String(text.to_owned()))
            }
            SMALL_BIG_EXT => {
                let digits = self.u8()?;
                let sign = self.u8()?;
                if digits > 8 {
                    return Err(EtfError::BigIntTooWide { digits });
                }
                let bytes = self.take(digits as usize)?;
                let mut magnitude = 0_u64;
                for (i, byte) in bytes.iter().enumerate() {
                    magnitude |= u64::from(*byte) << (8 * i);
                }
                if sign == 0 {
                    Ok(Value::from(magnitude))
                } else {
                    let negated = i64::try_from(magnitude)
                        .map(|m| -m)
                        .map_err(|_| EtfError::BigIntTooWide { digits })?;
                    Ok(Value::from(negated))
                }
            }
            MAP_EXT => {
                let arity = self.u32()? as usize;
                let mut map = Map::with_capacity(arity.min(4096));
                for _ in 0..arity {
                    let key_at = self.pos;
                    let key = match self.term()? {
                        Value::String(s) => s,
                        Value::Number(n) => n.to_string(),
                        Value::Null => "nil".to_owned(),
                        Value::Bool(b) => b.to_string(),
                        Value::Array(_) | Value::Object(_) => {
                            return Err(EtfError::UnknownTag {
                                tag: MAP_EXT,
                                at: key_at,
                            });
                        }
                    };
                    let value = self.term()?;
                    map.insert(key, value);
                }
                Ok(Value::Object(map))
            }
            other => Err(EtfError::UnknownTag { tag: other, at }),
        }
    }

    fn atom(&mut self, len: usize, at: usize) -> Result<Value, EtfError> {
        let bytes = self.take(len)?;
        let name = std::str::from_utf8(bytes).map_err(|_| EtfError::InvalidUtf8 { at })?;
        Ok(match name {
            "nil" | "null" => Value::Null,
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(name.to_owned()),
        })
    }
}

fn encode_term(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => small_atom("nil", out),
        Value::Bool(true) => small_atom("true", out),
        Value::Bool(false) => small_atom("false", out),
        Value::Number(n) => encode_number(n, out),
        Value::String(s) => {
            out.push(BINARY_EXT);
            out.extend_from_slice(&(u32::try_from(s.len()).unwrap_or(u32::MAX)).to_be_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        Value::Array(items) => {
            if items.is_empty() {
                out.push(NIL_EXT);
                return;
            }
            out.push(LIST_EXT);
            out.extend_from_slice(&(u32::try_from(items.len()).unwrap_or(u32::MAX)).to_be_bytes());
            for item in items {
                encode_term(item, out);
            }
            out.push(NIL_EXT);
        }
        Value::Object(map) => {
            out.push(MAP_EXT);
            out.extend_from_slice(&(u32::try_from(map.len()).unwrap_or(u32::MAX)).to_be_bytes());
            for (key, item) in map {
                out.push(BINARY_EXT);
                out.extend_from_slice(
                    &(u32::try_from(key.len()).unwrap_or(u32::MAX)).to_be_bytes(),
                );
                out.extend_from_slice(key.as_bytes());
                encode_term(item, out);
            }
        }
    }
}

fn encode_number(n: &Number, out: &mut Vec<u8>) {
    if let Some(unsigned) = n.as_u64() {
        if unsigned <= u64::from(u8::MAX) {
            out.push(SMALL_INTEGER_EXT);
            out.push(unsigned as u8);
        } else if let Ok(signed) = i32::try_from(unsigned) {
            out.push(INTEGER_EXT);
            out.extend_from_slice(&signed.to_be_bytes());
        } else {
            small_big(unsigned, 0, out);
        }
    } else if let Some(signed) = n.as_i64() {
        if let Ok(narrow) = i32::try_from(signed) {
            out.push(INTEGER_EXT);
            out.extend_from_slice(&narrow.to_be_bytes());
        } else {
            small_big(signed.unsigned_abs(), 1, out);
        }
    } else {
        // serde_json numbers are finite, so this cannot produce NaN bytes.
        out.push(NEW_FLOAT_EXT);
        out.extend_from_slice(&n.as_f64().unwrap_or(0.0).to_be_bytes());
    }
}

fn small_big(magnitude: u64, sign: u8, out: &mut Vec<u8>) {
    let bytes = magnitude.to_le_bytes();
    let digits = bytes.iter().rposition(|b| *b != 0).map_or(1, |i| i + 1);
    out.push(SMALL_BIG_EXT);
    out.push(digits as u8);
    out.push(sign);
    out.extend_from_slice(&bytes[..digits]);
}

fn small_atom(name: &str, out: &mut Vec<u8>) {
    out.push(SMALL_ATOM_UTF8_EXT);
    out.push(name.len() as u8);
    out.extend_from_slice(name.as_bytes());
}
