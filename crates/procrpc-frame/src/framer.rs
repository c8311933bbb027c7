use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde_json::Value;
use tracing::trace;

use crate::codec::{encode_envelope, Codec, FrameConfig, JsonCodec, ETX, STX};
use crate::error::{FrameError, Result};

/// Incremental packet assembler.
///
/// The receive buffer holds the bytes following the `STX` of the packet
/// currently being assembled. Bytes arriving before that `STX` has been seen
/// are discarded up to and including the first `STX`, which resynchronizes
/// an unsynchronized stream.
#[derive(Debug)]
pub struct Framer<C = JsonCodec> {
    buffer: BytesMut,
    /// The start byte of the packet being assembled has been consumed.
    in_packet: bool,
    config: FrameConfig,
    codec: C,
}

impl Framer<JsonCodec> {
    pub fn new() -> Self {
        Self::with_config(FrameConfig::default())
    }

    pub fn with_config(config: FrameConfig) -> Self {
        Self::with_codec(JsonCodec, config)
    }
}

impl Default for Framer<JsonCodec> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Codec> Framer<C> {
    pub fn with_codec(codec: C, config: FrameConfig) -> Self {
        Self {
            buffer: BytesMut::new(),
            in_packet: false,
            config,
            codec,
        }
    }

    /// Encode `value` into a complete packet.
    pub fn encode(&self, value: &Value) -> Result<Bytes> {
        let mut dst = BytesMut::new();
        self.encode_into(value, &mut dst)?;
        Ok(dst.freeze())
    }

    /// Encode `value` and append the packet to `dst`.
    pub fn encode_into(&self, value: &Value, dst: &mut BytesMut) -> Result<()> {
        let payload = self.codec.encode(value)?;
        encode_envelope(&payload, dst)
    }

    /// Append freshly read bytes.
    ///
    /// Fails with [`FrameError::BufferOverflow`] if the buffer would grow past
    /// the configured maximum; nothing is appended in that case.
    pub fn feed(&mut self, data: &[u8]) -> Result<()> {
        let incoming = if self.in_packet {
            data
        } else {
            match data.iter().position(|&b| b == STX) {
                Some(pos) => {
                    if pos > 0 {
                        trace!(skipped = pos, "skipping bytes before packet start");
                    }
                    &data[pos + 1..]
                }
                None => {
                    if !data.is_empty() {
                        trace!(dropped = data.len(), "dropping out-of-band bytes");
                    }
                    return Ok(());
                }
            }
        };

        let size = self.buffer.len() + incoming.len();
        if size > self.config.max_buffer {
            return Err(FrameError::BufferOverflow {
                size,
                max: self.config.max_buffer,
            });
        }
        self.in_packet = true;
        self.buffer.extend_from_slice(incoming);
        Ok(())
    }

    /// Whether a complete packet is buffered.
    pub fn has_packet(&self) -> bool {
        self.buffer.contains(&ETX)
    }

    /// Remove and decode the next complete packet.
    ///
    /// The buffer advances before decoding, so a [`FrameError::Decode`]
    /// only loses the offending packet.
    pub fn take_packet(&mut self) -> Result<Value> {
        let end = self
            .buffer
            .iter()
            .position(|&b| b == ETX)
            .ok_or(FrameError::Incomplete)?;

        let payload = self.buffer.split_to(end);
        match self.buffer[1..].iter().position(|&b| b == STX) {
            Some(pos) => self.buffer.advance(pos + 2),
            None => {
                self.buffer.clear();
                self.in_packet = false;
            }
        }

        self.codec.decode(&payload)
    }

    /// Put a packet back in front of the stream; it is the next one taken.
    ///
    /// Put-back packets are not subject to the buffer maximum since they were
    /// already accepted once.
    pub fn put_back(&mut self, value: &Value) -> Result<()> {
        let payload = self.codec.encode(value)?;
        if payload.iter().any(|&b| b == STX || b == ETX) {
            return Err(FrameError::Encode(
                "payload contains a reserved delimiter byte".to_string(),
            ));
        }

        let mut rebuilt = BytesMut::with_capacity(payload.len() + 2 + self.buffer.len());
        rebuilt.put_slice(&payload);
        rebuilt.put_u8(ETX);
        if self.in_packet {
            rebuilt.put_u8(STX);
            rebuilt.put_slice(&self.buffer);
        }
        self.buffer = rebuilt;
        self.in_packet = true;
        Ok(())
    }

    /// Put several packets back, preserving their order.
    pub fn put_back_all(&mut self, values: &[Value]) -> Result<()> {
        for value in values.iter().rev() {
            self.put_back(value)?;
        }
        Ok(())
    }

    /// Number of bytes currently buffered.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// No packet data buffered and no packet started.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && !self.in_packet
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.in_packet = false;
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}
