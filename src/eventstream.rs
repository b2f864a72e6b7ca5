//! AWS event-stream framing
//!
//! Bedrock's streaming invoke answers with `application/vnd.amazon.eventstream`:
//! a sequence of binary frames, each a 12-byte prelude (total length, header
//! length, prelude CRC), typed headers, a payload and a trailing message CRC.
//! Chunk frames carry `{"bytes": "<base64>"}` wrapping one Messages event.
//!
//! CRCs are skipped; TLS already guarantees integrity on this hop.

use base64::Engine;
use serde::Deserialize;

use crate::error::BodsError;
use crate::stream::StreamEvent;

const PRELUDE_LEN: usize = 12;
const CRC_LEN: usize = 4;
/// Frames larger than this are treated as corruption
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Bytes(Vec<u8>),
    String(String),
    Timestamp(i64),
    Uuid([u8; 16]),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub headers: Vec<(String, HeaderValue)>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find_map(|(n, v)| match v {
            HeaderValue::String(s) if n == name => Some(s.as_str()),
            _ => None,
        })
    }

    /// Interpret the frame as one Messages stream event.
    ///
    /// Returns `Ok(None)` for frames that carry no event (unknown event types).
    pub fn into_event(self) -> Result<Option<StreamEvent>, BodsError> {
        match self.header(":message-type") {
            Some("event") | None => {}
            Some("exception") => return Err(self.exception()),
            Some("error") => {
                return Err(BodsError::transport(format!(
                    "{}: {}",
                    self.header(":error-code").unwrap_or("error"),
                    self.header(":error-message").unwrap_or_default()
                )))
            }
            Some(other) => {
                tracing::warn!("ignoring event-stream frame with message type {}", other);
                return Ok(None);
            }
        }

        match self.header(":event-type") {
            Some("chunk") | None => {}
            Some(other) => {
                tracing::warn!("ignoring event-stream frame with event type {}", other);
                return Ok(None);
            }
        }

        let chunk: Chunk = serde_json::from_slice(&self.payload)
            .map_err(|e| BodsError::protocol(format!("malformed chunk payload: {}", e)))?;
        let json = base64::engine::general_purpose::STANDARD
            .decode(chunk.bytes.as_bytes())
            .map_err(|e| BodsError::protocol(format!("chunk is not valid base64: {}", e)))?;
        if json.is_empty() {
            return Err(BodsError::protocol("empty event"));
        }
        StreamEvent::from_json(&json).map(Some)
    }

    fn exception(&self) -> BodsError {
        let kind = self.header(":exception-type").unwrap_or("exception");
        let message = serde_json::from_slice::<ExceptionBody>(&self.payload)
            .map(|b| b.message)
            .unwrap_or_else(|_| String::from_utf8_lossy(&self.payload).into_owned());
        BodsError::transport(format!("{}: {}", kind, message))
    }
}

#[derive(Deserialize)]
struct Chunk {
    bytes: String,
}

#[derive(Deserialize)]
struct ExceptionBody {
    #[serde(alias = "Message")]
    message: String,
}

/// Incremental frame splitter fed with network chunks
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Bytes received but not yet forming a complete frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Pop the next complete frame, if the buffer holds one
    pub fn next_frame(&mut self) -> Result<Option<Frame>, BodsError> {
        if self.buffer.len() < PRELUDE_LEN {
            return Ok(None);
        }

        let total = read_u32(&self.buffer[0..4]) as usize;
        let headers_len = read_u32(&self.buffer[4..8]) as usize;
        if total < PRELUDE_LEN + CRC_LEN + headers_len || total > MAX_FRAME_LEN {
            return Err(BodsError::protocol(format!(
                "invalid event-stream prelude: total {} headers {}",
                total, headers_len
            )));
        }
        if self.buffer.len() < total {
            return Ok(None);
        }

        let frame: Vec<u8> = self.buffer.drain(..total).collect();
        let headers_end = PRELUDE_LEN + headers_len;
        let headers = parse_headers(&frame[PRELUDE_LEN..headers_end])?;
        let payload = frame[headers_end..total - CRC_LEN].to_vec();

        Ok(Some(Frame { headers, payload }))
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn parse_headers(mut bytes: &[u8]) -> Result<Vec<(String, HeaderValue)>, BodsError> {
    let truncated = || BodsError::protocol("truncated event-stream header");
    let mut headers = Vec::new();

    while !bytes.is_empty() {
        let name_len = bytes[0] as usize;
        let name = bytes.get(1..1 + name_len).ok_or_else(truncated)?;
        let name = String::from_utf8_lossy(name).into_owned();
        let kind = *bytes.get(1 + name_len).ok_or_else(truncated)?;
        let rest = &bytes[2 + name_len..];

        let (value, used) = match kind {
            0 => (HeaderValue::Bool(true), 0),
            1 => (HeaderValue::Bool(false), 0),
            2 => (HeaderValue::Byte(*rest.first().ok_or_else(truncated)? as i8), 1),
            3 => (HeaderValue::Short(i16::from_be_bytes(fixed(rest)?)), 2),
            4 => (HeaderValue::Int(i32::from_be_bytes(fixed(rest)?)), 4),
            5 => (HeaderValue::Long(i64::from_be_bytes(fixed(rest)?)), 8),
            6 | 7 => {
                let len = u16::from_be_bytes(fixed(rest)?) as usize;
                let data = rest.get(2..2 + len).ok_or_else(truncated)?;
                let value = if kind == 6 {
                    HeaderValue::Bytes(data.to_vec())
                } else {
                    HeaderValue::String(String::from_utf8_lossy(data).into_owned())
                };
                (value, 2 + len)
            }
            8 => (HeaderValue::Timestamp(i64::from_be_bytes(fixed(rest)?)), 8),
            9 => (HeaderValue::Uuid(fixed(rest)?), 16),
            other => {
                return Err(BodsError::protocol(format!(
                    "unknown event-stream header type {}",
                    other
                )))
            }
        };

        headers.push((name, value));
        bytes = &rest[used..];
    }
    Ok(headers)
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N], BodsError> {
    bytes
        .get(..N)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| BodsError::protocol("truncated event-stream header value"))
}
