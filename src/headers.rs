use crate::{BusResult, MalformedEnvelope};
use snafu::{ensure, OptionExt};

/// Header keys reserved by the core. Implementers must preserve any other
/// key end-to-end.
pub mod keys {
    /// Unique id of a request/response exchange
    pub const REQUEST_ID: &str = "RequestId";
    /// Logical address replies are delivered to
    pub const REPLY_TO: &str = "ReplyTo";
    /// Absolute unix-millis timestamp after which the message is dropped
    pub const EXPIRES: &str = "Expires";
    /// Non-empty on a reply when the remote handler failed
    pub const ERROR: &str = "Error";
    /// Wire name of the payload type, used for polymorphic dispatch
    pub const MESSAGE_TYPE: &str = "MessageType";
}

/// A single header value
#[derive(Clone, Debug, PartialEq)]
pub enum HeaderValue {
    /// UTF-8 string
    String(String),
    /// Signed 64-bit integer
    Int(i64),
    /// Boolean flag
    Bool(bool),
    /// Milliseconds since the unix epoch
    Timestamp(i64),
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_string())
    }
}
impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}
impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}
impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

/// Ordered map of message headers.
///
/// Insertion order is preserved; setting an existing key replaces its value
/// in place.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Headers {
    entries: Vec<(String, HeaderValue)>,
}

impl Headers {
    /// An empty header map
    pub fn new() -> Self {
        Default::default()
    }

    /// Number of headers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no headers are set
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Value stored under `key`
    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.entries
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }

    /// Set `key` to `value`, replacing an existing entry in place
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<HeaderValue>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(name, _)| name == &key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Remove and return the value stored under `key`
    pub fn remove(&mut self, key: &str) -> Option<HeaderValue> {
        let index = self.entries.iter().position(|(name, _)| name == key)?;
        Some(self.entries.remove(index).1)
    }

    /// Iterate headers in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// String value stored under `key`, if any
    pub fn string(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(HeaderValue::String(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    /// Integer value stored under `key`, if any
    pub fn int(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(HeaderValue::Int(value)) => Some(*value),
            _ => None,
        }
    }

    /// Boolean value stored under `key`, if any
    pub fn flag(&self, key: &str) -> Option<bool> {
        match self.get(key) {
            Some(HeaderValue::Bool(value)) => Some(*value),
            _ => None,
        }
    }

    /// Timestamp stored under `key`. Integer values are accepted as unix
    /// millis as well, for headers set by foreign producers.
    pub fn timestamp(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(HeaderValue::Timestamp(value)) => Some(*value),
            Some(HeaderValue::Int(value)) => Some(*value),
            _ => None,
        }
    }
}

const TAG_STRING: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_BOOL: u8 = 2;
const TAG_TIMESTAMP: u8 = 3;

/// Encode headers and payload bytes into the default envelope wire format:
/// `[u16 count] ([u16 keyLen][key][u8 tag][u32 valueLen][value])* [payload]`,
/// all integers big-endian.
pub fn encode_envelope(headers: &Headers, payload: &[u8]) -> BusResult<Vec<u8>> {
    ensure!(
        headers.len() <= u16::MAX as usize,
        MalformedEnvelope {
            reason: "too many headers for the wire format",
        }
    );
    let mut buffer = Vec::with_capacity(payload.len() + 16 + headers.len() * 24);
    buffer.extend_from_slice(&(headers.len() as u16).to_be_bytes());
    for (key, value) in headers.iter() {
        ensure!(
            key.len() <= u16::MAX as usize,
            MalformedEnvelope {
                reason: format!("header key '{}' exceeds the wire limit", key),
            }
        );
        buffer.extend_from_slice(&(key.len() as u16).to_be_bytes());
        buffer.extend_from_slice(key.as_bytes());
        let (tag, bytes) = match value {
            HeaderValue::String(value) => (TAG_STRING, value.as_bytes().to_vec()),
            HeaderValue::Int(value) => (TAG_INT, value.to_be_bytes().to_vec()),
            HeaderValue::Bool(value) => (TAG_BOOL, vec![*value as u8]),
            HeaderValue::Timestamp(value) => (TAG_TIMESTAMP, value.to_be_bytes().to_vec()),
        };
        ensure!(
            bytes.len() <= u32::MAX as usize,
            MalformedEnvelope {
                reason: format!("value of header '{}' exceeds the wire limit", key),
            }
        );
        buffer.push(tag);
        buffer.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        buffer.extend_from_slice(&bytes);
    }
    buffer.extend_from_slice(payload);
    Ok(buffer)
}

/// Decode an envelope produced by [`encode_envelope`], returning the headers
/// and the remaining payload bytes.
pub fn decode_envelope(data: &[u8]) -> BusResult<(Headers, Vec<u8>)> {
    let mut position = 0;
    let count = read_u16(data, &mut position)?;
    let mut headers = Headers::new();
    for _ in 0 .. count {
        let key_len = read_u16(data, &mut position)? as usize;
        let key = String::from_utf8(take(data, &mut position, key_len)?.to_vec())
            .ok()
            .context(MalformedEnvelope {
                reason: "header key is not valid utf-8",
            })?;
        let tag = read_u8(data, &mut position)?;
        let value_len = read_u32(data, &mut position)? as usize;
        let bytes = take(data, &mut position, value_len)?;
        let value = match tag {
            TAG_STRING => HeaderValue::String(
                String::from_utf8(bytes.to_vec()).ok().context(
                    MalformedEnvelope {
                        reason: format!("value of header '{}' is not valid utf-8", key),
                    },
                )?,
            ),
            TAG_INT => HeaderValue::Int(read_i64(bytes, &key)?),
            TAG_BOOL => {
                ensure!(
                    bytes.len() == 1,
                    MalformedEnvelope {
                        reason: format!("boolean header '{}' has a malformed value", key),
                    }
                );
                HeaderValue::Bool(bytes[0] != 0)
            }
            TAG_TIMESTAMP => HeaderValue::Timestamp(read_i64(bytes, &key)?),
            _ => {
                return MalformedEnvelope {
                    reason: format!("unknown tag {} on header '{}'", tag, key),
                }
                .fail()
            }
        };
        headers.set(key, value);
    }
    Ok((headers, data[position ..].to_vec()))
}

fn take<'a>(data: &'a [u8], position: &mut usize, length: usize) -> BusResult<&'a [u8]> {
    ensure!(
        *position + length <= data.len(),
        MalformedEnvelope {
            reason: "truncated envelope",
        }
    );
    let slice = &data[*position .. *position + length];
    *position += length;
    Ok(slice)
}

fn read_u8(data: &[u8], position: &mut usize) -> BusResult<u8> {
    Ok(take(data, position, 1)?[0])
}

fn read_u16(data: &[u8], position: &mut usize) -> BusResult<u16> {
    let bytes = take(data, position, 2)?;
    let mut raw = [0u8; 2];
    raw.copy_from_slice(bytes);
    Ok(u16::from_be_bytes(raw))
}

fn read_u32(data: &[u8], position: &mut usize) -> BusResult<u32> {
    let bytes = take(data, position, 4)?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    Ok(u32::from_be_bytes(raw))
}

fn read_i64(bytes: &[u8], key: &str) -> BusResult<i64> {
    ensure!(
        bytes.len() == 8,
        MalformedEnvelope {
            reason: format!("integer header '{}' has a malformed value", key),
        }
    );
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok(i64::from_be_bytes(raw))
}
