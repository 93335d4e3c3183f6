//! # Frame Codec
//!
//! Purpose: Convert frames to and from their wire representation without
//! holding any state between calls.
//!
//! ## Design Principles
//! 1. **Self-Framing**: Every frame is length-prefixed, so a reader can find
//!    frame boundaries in an arbitrarily split byte stream.
//! 2. **Caller-Owned Buffers**: Partial frames stay in the caller's
//!    `BytesMut` until the rest arrives; the codec never copies them aside.
//! 3. **Bounded**: The length prefix is checked against a limit before any
//!    payload is buffered.
//! 4. **Fail Fast**: Structural violations surface as `CodecError`.
//!
//! ## Memory Layout
//!
//! ```text
//! +--------+--------+---------+---------+---------+--------+---------+-----+-------+
//! | len:4B | ver:1B | kind:1B | stat:1B | flag:1B | id:8B  | klen:4B | key | value |
//! +--------+--------+---------+---------+---------+--------+---------+-----+-------+
//! ```
//!
//! All integers are big-endian. `len` counts every byte after itself. The
//! value occupies the rest of the frame and is present only when bit 0 of
//! `flag` is set, so an empty value and a missing value stay distinct.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CodecError, CodecResult};
use crate::frame::{Frame, FrameKind, Status};

/// Protocol version written into every frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the length prefix.
pub const LEN_PREFIX_SIZE: usize = 4;

/// Fixed header after the length prefix: ver + kind + stat + flag + id + klen.
pub const HEADER_SIZE: usize = 1 + 1 + 1 + 1 + 8 + 4;

/// Default upper bound for the length prefix (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Largest body the 32-bit length prefix can describe.
pub const MAX_FRAME_SIZE_LIMIT: usize = u32::MAX as usize;

/// Flag bit marking that a value follows the key.
pub const FLAG_HAS_VALUE: u8 = 0x01;

/// Returns the body length (the `len` prefix) the frame will encode to.
pub fn body_len(frame: &Frame) -> usize {
    HEADER_SIZE + frame.key.len() + frame.value.as_ref().map_or(0, |value| value.len())
}

/// Appends the wire form of `frame` to `dst`.
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) {
    let len = body_len(frame);
    debug_assert!(len <= u32::MAX as usize);
    dst.reserve(LEN_PREFIX_SIZE + len);

    let flags = if frame.value.is_some() { FLAG_HAS_VALUE } else { 0 };

    dst.put_u32(len as u32);
    dst.put_u8(PROTOCOL_VERSION);
    dst.put_u8(frame.kind.as_u8());
    dst.put_u8(frame.status.as_u8());
    dst.put_u8(flags);
    dst.put_u64(frame.id);
    dst.put_u32(frame.key.len() as u32);
    dst.put_slice(&frame.key);
    if let Some(value) = &frame.value {
        dst.put_slice(value);
    }
}

/// Encodes `frame` into a fresh buffer.
pub fn encode_to_bytes(frame: &Frame) -> Bytes {
    let mut buf = BytesMut::with_capacity(LEN_PREFIX_SIZE + body_len(frame));
    encode_frame(frame, &mut buf);
    buf.freeze()
}

/// Decodes one frame from the front of `src`.
///
/// Returns `Ok(None)` when `src` does not yet hold a whole frame; nothing is
/// consumed in that case. On success exactly one frame is consumed.
pub fn decode_frame(src: &mut BytesMut, max_frame_size: usize) -> CodecResult<Option<Frame>> {
    if src.len() < LEN_PREFIX_SIZE {
        return Ok(None);
    }

    let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if len > max_frame_size {
        return Err(CodecError::FrameTooLarge {
            size: len,
            max: max_frame_size,
        });
    }
    if len < HEADER_SIZE {
        return Err(CodecError::FrameTooShort {
            size: len,
            min: HEADER_SIZE,
        });
    }

    let total = LEN_PREFIX_SIZE + len;
    if src.len() < total {
        // Grow once for the rest of this frame instead of per read.
        src.reserve(total - src.len());
        return Ok(None);
    }

    let mut body = src.split_to(total).freeze();
    body.advance(LEN_PREFIX_SIZE);
    parse_body(body).map(Some)
}

fn parse_body(mut body: Bytes) -> CodecResult<Frame> {
    let version = body.get_u8();
    if version != PROTOCOL_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let kind = FrameKind::from_u8(body.get_u8())?;
    let status = Status::from_u8(body.get_u8())?;
    let flags = body.get_u8();
    if flags & !FLAG_HAS_VALUE != 0 {
        return Err(CodecError::InvalidFlags(flags));
    }
    let id = body.get_u64();
    let key_len = body.get_u32() as usize;
    if key_len > body.len() {
        return Err(CodecError::KeyOutOfBounds {
            key_len,
            remaining: body.len(),
        });
    }

    let key = body.split_to(key_len);
    let value = if flags & FLAG_HAS_VALUE != 0 {
        Some(body)
    } else if !body.is_empty() {
        return Err(CodecError::TrailingBytes(body.len()));
    } else {
        None
    };

    let frame = Frame {
        kind,
        status,
        id,
        key,
        value,
    };
    frame.validate()?;
    Ok(frame)
}
