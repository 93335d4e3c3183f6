//! # Codec Errors
//!
//! Every way a byte stream can fail to decode into a frame. None of these
//! are recoverable for the stream that produced them: once framing is lost
//! the session must be torn down.

use thiserror::Error;

use crate::frame::FrameKind;

/// Result alias for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Decode failures for the Guaradict wire protocol.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Length prefix exceeds the configured frame limit.
    #[error("frame of {size} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// Length prefix is smaller than the fixed frame header.
    #[error("frame of {size} bytes is shorter than the {min} byte header")]
    FrameTooShort { size: usize, min: usize },

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown frame kind 0x{0:02x}")]
    UnknownKind(u8),

    #[error("unknown status 0x{0:02x}")]
    UnknownStatus(u8),

    /// Reserved flag bits were set.
    #[error("invalid flags 0x{0:02x}")]
    InvalidFlags(u8),

    /// Declared key length runs past the end of the frame.
    #[error("key length {key_len} exceeds remaining {remaining} bytes")]
    KeyOutOfBounds { key_len: usize, remaining: usize },

    /// Bytes follow the key but the value flag is clear.
    #[error("{0} trailing bytes after key without value flag")]
    TrailingBytes(usize),

    /// The frame decoded but violates the rules for its kind.
    #[error("invalid {kind} frame: {reason}")]
    Invalid {
        kind: FrameKind,
        reason: &'static str,
    },
}
