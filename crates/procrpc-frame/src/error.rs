/// Errors that can occur during packet encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The codec could not serialize the value.
    #[error("failed to encode packet: {0}")]
    Encode(String),

    /// The payload of a complete packet could not be decoded.
    ///
    /// The packet has already been consumed; later packets are unaffected.
    #[error("failed to decode packet: {0}")]
    Decode(String),

    /// Appending would grow the receive buffer beyond its maximum.
    #[error("receive buffer overflow ({size} bytes, max {max})")]
    BufferOverflow { size: usize, max: usize },

    /// No complete packet is buffered.
    #[error("incomplete packet (end delimiter missing)")]
    Incomplete,
}

pub type Result<T> = std::result::Result<T, FrameError>;
