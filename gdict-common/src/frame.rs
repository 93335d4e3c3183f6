//! # Frame Model
//!
//! Purpose: Describe one self-contained unit of the Guaradict protocol, used
//! for requests, replies, and server-pushed notifications alike.
//!
//! ## Design Principles
//! 1. **One Shape**: Requests and replies share a struct so the codec has a
//!    single encode/decode path.
//! 2. **Binary-Safe**: Keys and values are raw `Bytes`; no encoding implied.
//! 3. **Zero-Copy**: Decoded keys/values are slices of the receive buffer.
//! 4. **Checked Shape**: `validate` encodes the per-kind rules in one place.

use std::fmt;

use bytes::Bytes;

use crate::error::{CodecError, CodecResult};

/// Correlation id reserved for frames not tied to a request.
pub const UNSOLICITED_ID: u64 = 0;

/// Kind of a frame on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Get = 0x01,
    Set = 0x02,
    Delete = 0x03,
    Ping = 0x04,
    /// Response to a request, matched by correlation id.
    Reply = 0x10,
    /// Server-pushed key change, not tied to any request.
    Notify = 0x20,
}

impl FrameKind {
    /// Returns the wire byte for this kind.
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parses a wire byte into a kind.
    pub fn from_u8(byte: u8) -> CodecResult<Self> {
        match byte {
            0x01 => Ok(FrameKind::Get),
            0x02 => Ok(FrameKind::Set),
            0x03 => Ok(FrameKind::Delete),
            0x04 => Ok(FrameKind::Ping),
            0x10 => Ok(FrameKind::Reply),
            0x20 => Ok(FrameKind::Notify),
            other => Err(CodecError::UnknownKind(other)),
        }
    }

    /// True for kinds a client sends and a server answers.
    #[inline]
    pub const fn is_request(self) -> bool {
        matches!(
            self,
            FrameKind::Get | FrameKind::Set | FrameKind::Delete | FrameKind::Ping
        )
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameKind::Get => "GET",
            FrameKind::Set => "SET",
            FrameKind::Delete => "DELETE",
            FrameKind::Ping => "PING",
            FrameKind::Reply => "REPLY",
            FrameKind::Notify => "NOTIFY",
        };
        f.write_str(name)
    }
}

/// Outcome carried by replies and notifications.
///
/// Requests always carry `Ok`. For `Notify`, `Ok` means the key now holds
/// the attached value and `NotFound` means it was deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Ok = 0x00,
    NotFound = 0x01,
    Error = 0x02,
}

impl Status {
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(byte: u8) -> CodecResult<Self> {
        match byte {
            0x00 => Ok(Status::Ok),
            0x01 => Ok(Status::NotFound),
            0x02 => Ok(Status::Error),
            other => Err(CodecError::UnknownStatus(other)),
        }
    }
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub status: Status,
    /// Correlation id; `UNSOLICITED_ID` for notifications.
    pub id: u64,
    pub key: Bytes,
    pub value: Option<Bytes>,
}

impl Frame {
    /// GET request for `key`.
    pub fn get(id: u64, key: impl Into<Bytes>) -> Self {
        Frame::request(FrameKind::Get, id, key.into(), None)
    }

    /// SET request storing `value` under `key`.
    pub fn set(id: u64, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Frame::request(FrameKind::Set, id, key.into(), Some(value.into()))
    }

    /// DELETE request for `key`.
    pub fn delete(id: u64, key: impl Into<Bytes>) -> Self {
        Frame::request(FrameKind::Delete, id, key.into(), None)
    }

    /// PING request (empty key, no value).
    pub fn ping(id: u64) -> Self {
        Frame::request(FrameKind::Ping, id, Bytes::new(), None)
    }

    /// Reply to the request carrying `id`.
    pub fn reply(id: u64, status: Status, value: Option<Bytes>) -> Self {
        Frame {
            kind: FrameKind::Reply,
            status,
            id,
            key: Bytes::new(),
            value,
        }
    }

    /// Error reply with a human-readable message as the value.
    pub fn error_reply(id: u64, message: &str) -> Self {
        Frame::reply(id, Status::Error, Some(Bytes::copy_from_slice(message.as_bytes())))
    }

    /// Notification that `key` changed; `None` means it was deleted.
    pub fn notify(key: impl Into<Bytes>, value: Option<Bytes>) -> Self {
        let status = if value.is_some() {
            Status::Ok
        } else {
            Status::NotFound
        };
        Frame {
            kind: FrameKind::Notify,
            status,
            id: UNSOLICITED_ID,
            key: key.into(),
            value,
        }
    }

    fn request(kind: FrameKind, id: u64, key: Bytes, value: Option<Bytes>) -> Self {
        Frame {
            kind,
            status: Status::Ok,
            id,
            key,
            value,
        }
    }

    /// Checks the per-kind structural rules.
    pub fn validate(&self) -> CodecResult<()> {
        let invalid = |reason| {
            Err(CodecError::Invalid {
                kind: self.kind,
                reason,
            })
        };

        if self.kind.is_request() && self.status != Status::Ok {
            return invalid("requests must carry status OK");
        }

        match self.kind {
            FrameKind::Get | FrameKind::Delete => {
                if self.key.is_empty() {
                    return invalid("key must not be empty");
                }
                if self.value.is_some() {
                    return invalid("unexpected value");
                }
            }
            FrameKind::Set => {
                if self.key.is_empty() {
                    return invalid("key must not be empty");
                }
                if self.value.is_none() {
                    return invalid("missing value");
                }
            }
            FrameKind::Ping => {
                if !self.key.is_empty() || self.value.is_some() {
                    return invalid("ping carries no key or value");
                }
            }
            FrameKind::Reply => {
                if self.id == UNSOLICITED_ID && self.status != Status::Error {
                    return invalid("reply id must be non-zero");
                }
            }
            FrameKind::Notify => {
                if self.id != UNSOLICITED_ID {
                    return invalid("notify id must be zero");
                }
                if self.key.is_empty() {
                    return invalid("key must not be empty");
                }
                match (self.status, &self.value) {
                    (Status::Ok, Some(_)) | (Status::NotFound, None) => {}
                    (Status::Error, _) => return invalid("notify cannot carry an error"),
                    _ => return invalid("notify status disagrees with value"),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_bytes_roundtrip() {
        for kind in [
            FrameKind::Get,
            FrameKind::Set,
            FrameKind::Delete,
            FrameKind::Ping,
            FrameKind::Reply,
            FrameKind::Notify,
        ] {
            assert_eq!(FrameKind::from_u8(kind.as_u8()), Ok(kind));
        }
        assert_eq!(FrameKind::from_u8(0x7f), Err(CodecError::UnknownKind(0x7f)));
    }

    #[test]
    fn constructors_produce_valid_frames() {
        assert!(Frame::get(1, "k").validate().is_ok());
        assert!(Frame::set(2, "k", "v").validate().is_ok());
        assert!(Frame::delete(3, "k").validate().is_ok());
        assert!(Frame::ping(4).validate().is_ok());
        assert!(Frame::reply(5, Status::NotFound, None).validate().is_ok());
        assert!(Frame::notify("k", None).validate().is_ok());
    }

    #[test]
    fn notify_status_tracks_value() {
        assert_eq!(Frame::notify("k", Some(Bytes::from_static(b"v"))).status, Status::Ok);
        assert_eq!(Frame::notify("k", None).status, Status::NotFound);
    }

    #[test]
    fn rejects_empty_key_for_keyed_requests() {
        let err = Frame::get(1, Bytes::new()).validate().unwrap_err();
        assert!(matches!(err, CodecError::Invalid { kind: FrameKind::Get, .. }));
        assert!(Frame::set(1, Bytes::new(), "v").validate().is_err());
    }

    #[test]
    fn notify_rejects_error_and_mismatched_status() {
        let mut note = Frame::notify("k", Some(Bytes::from_static(b"v")));
        note.status = Status::Error;
        assert!(matches!(
            note.validate(),
            Err(CodecError::Invalid { kind: FrameKind::Notify, .. })
        ));

        let mut note = Frame::notify("k", None);
        note.status = Status::Ok;
        assert!(note.validate().is_err());

        let mut note = Frame::notify("k", Some(Bytes::from_static(b"v")));
        note.status = Status::NotFound;
        assert!(note.validate().is_err());
    }

    #[test]
    fn error_reply_may_use_unsolicited_id() {
        assert!(Frame::error_reply(UNSOLICITED_ID, "bad frame").validate().is_ok());
        assert!(Frame::reply(UNSOLICITED_ID, Status::Ok, None).validate().is_err());
    }
}
