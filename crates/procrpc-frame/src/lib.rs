//! Delimiter-framed packet stream for procrpc.
//!
//! Every packet on the wire is:
//! - a single start byte `STX` (0x02)
//! - the codec-encoded payload
//! - a single end byte `ETX` (0x03)
//!
//! The [`Framer`] assembles packets from arbitrarily fragmented reads,
//! resynchronizes on garbage before the first `STX`, and supports putting
//! decoded packets back in front of the stream.

pub mod codec;
pub mod error;
pub mod framer;

pub use codec::{Codec, FrameConfig, JsonCodec, DEFAULT_MAX_BUFFER, ETX, STX};
pub use error::{FrameError, Result};
pub use framer::Framer;
