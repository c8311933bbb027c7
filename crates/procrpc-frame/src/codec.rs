use bytes::{BufMut, BytesMut};
use serde_json::Value;

use crate::error::{FrameError, Result};

/// Packet start byte.
pub const STX: u8 = 0x02;

/// Packet end byte.
pub const ETX: u8 = 0x03;

/// Default maximum receive buffer size: 16 KiB.
pub const DEFAULT_MAX_BUFFER: usize = 16 * 1024;

/// Serializes values to packet payloads and back.
///
/// Implementations must never emit a raw `STX` or `ETX` byte inside an
/// encoded payload, otherwise the framing breaks.
pub trait Codec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>>;
    fn decode(&self, payload: &[u8]) -> Result<Value>;
}

/// JSON payloads via `serde_json`.
///
/// JSON escapes every control character inside strings and never emits one
/// between tokens, so 0x02 and 0x03 cannot appear in an encoded payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| FrameError::Encode(e.to_string()))
    }

    fn decode(&self, payload: &[u8]) -> Result<Value> {
        serde_json::from_slice(payload).map_err(|e| FrameError::Decode(e.to_string()))
    }
}

/// Wrap an encoded payload in the packet envelope.
///
/// ```text
/// ┌──────┬─────────────────┬──────┐
/// │ STX  │ Payload         │ ETX  │
/// │ 0x02 │ (codec output)  │ 0x03 │
/// └──────┴─────────────────┴──────┘
/// ```
pub fn encode_envelope(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.iter().any(|&b| b == STX || b == ETX) {
        return Err(FrameError::Encode(
            "payload contains a reserved delimiter byte".to_string(),
        ));
    }
    dst.reserve(payload.len() + 2);
    dst.put_u8(STX);
    dst.put_slice(payload);
    dst.put_u8(ETX);
    Ok(())
}

/// Configuration for the framer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum receive buffer size in bytes. Default: 16 KiB.
    pub max_buffer: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_buffer: DEFAULT_MAX_BUFFER,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_escapes_delimiters() {
        let value = json!({"text": "a\u{2}b\u{3}c"});
        let payload = JsonCodec.encode(&value).unwrap();
        assert!(!payload.contains(&STX));
        assert!(!payload.contains(&ETX));
        assert_eq!(JsonCodec.decode(&payload).unwrap(), value);
    }

    #[test]
    fn test_decode_garbage() {
        let result = JsonCodec.decode(b"{not json");
        assert!(matches!(result, Err(FrameError::Decode(_))));
    }

    #[test]
    fn test_envelope() {
        let mut buf = BytesMut::new();
        encode_envelope(b"42", &mut buf).unwrap();
        assert_eq!(buf.as_ref(), &[STX, b'4', b'2', ETX]);
    }

    #[test]
    fn test_envelope_rejects_reserved_bytes() {
        let mut buf = BytesMut::new();
        let result = encode_envelope(&[b'a', ETX], &mut buf);
        assert!(matches!(result, Err(FrameError::Encode(_))));
        assert!(buf.is_empty());
    }
}
