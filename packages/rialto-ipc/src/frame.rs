//! The framed message codec.
//!
//! Wire frame, little-endian:
//!
//! ```text
//! u32 body_length | u32 method_or_serial | u8 kind | u8 fd_count | u16 reserved | body
//! ```
//!
//! File descriptors travel out of band as `SCM_RIGHTS` ancillary data in the
//! same `sendmsg` call; `fd_count` is a redundancy check against the received
//! ancillary payload. Frames are self-delimiting because SEQPACKET preserves
//! record boundaries.

use std::os::fd::OwnedFd;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed size of the frame header in bytes.
pub const FRAME_HEADER_LEN: usize = 12;

/// Largest accepted frame body.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Largest number of file descriptors attached to one frame.
pub const MAX_FDS_PER_FRAME: usize = 8;

/// Errors raised while encoding a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("body of {len} bytes exceeds the {max} byte frame limit")]
    BodyTooLarge { len: usize, max: usize },
    #[error("{count} file descriptors exceed the per-frame limit of {max}")]
    TooManyFds { count: usize, max: usize },
}

/// Errors raised while decoding a frame.
///
/// A failed decode closes the connection. Any file descriptors already
/// received with the failed frame are consumed by [`Frame::decode`] and
/// closed on drop, so the caller never leaks them.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame of {len} bytes is shorter than the {FRAME_HEADER_LEN} byte header")]
    Truncated { len: usize },
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
    #[error("reserved header field is non-zero")]
    ReservedNonZero,
    #[error("declared body length {declared} does not match received {actual}")]
    BodyLengthMismatch { declared: usize, actual: usize },
    #[error("declared body length {declared} exceeds the {max} byte frame limit")]
    BodyTooLarge { declared: usize, max: usize },
    #[error("declared fd count {declared} does not match {received} received descriptors")]
    FdCountMismatch { declared: usize, received: usize },
}

/// The three message classes carried over a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Client to server, expects a response correlated by serial.
    Request,
    /// Server to client, answers the request with the same serial.
    Response,
    /// Server to client, one-way.
    Event,
}

impl MessageKind {
    fn from_wire(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(Self::Request),
            1 => Ok(Self::Response),
            2 => Ok(Self::Event),
            other => Err(DecodeError::UnknownKind(other)),
        }
    }

    const fn to_wire(self) -> u8 {
        match self {
            Self::Request => 0,
            Self::Response => 1,
            Self::Event => 2,
        }
    }
}

/// One framed message together with the descriptors passed alongside it.
///
/// Owning the descriptors as [`OwnedFd`] means a dropped frame closes every
/// fd it carried, which is what keeps the fd-conservation invariant.
#[derive(Debug)]
pub struct Frame {
    pub kind: MessageKind,
    /// Method id for requests and events, serial for responses.
    pub method_or_serial: u32,
    pub body: Vec<u8>,
    pub fds: Vec<OwnedFd>,
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        use std::os::fd::AsRawFd;
        self.kind == other.kind
            && self.method_or_serial == other.method_or_serial
            && self.body == other.body
            && self.fds.len() == other.fds.len()
            && self
                .fds
                .iter()
                .zip(other.fds.iter())
                .all(|(a, b)| a.as_raw_fd() == b.as_raw_fd())
    }
}

impl Frame {
    /// Builds a frame without descriptors.
    #[must_use]
    pub fn new(kind: MessageKind, method_or_serial: u32, body: Vec<u8>) -> Self {
        Self {
            kind,
            method_or_serial,
            body,
            fds: Vec::new(),
        }
    }

    /// Builds a frame carrying descriptors.
    #[must_use]
    pub fn with_fds(
        kind: MessageKind,
        method_or_serial: u32,
        body: Vec<u8>,
        fds: Vec<OwnedFd>,
    ) -> Self {
        Self {
            kind,
            method_or_serial,
            body,
            fds,
        }
    }

    /// Encodes the header and body into one buffer for `sendmsg`.
    ///
    /// The descriptors themselves are not part of the byte stream; the
    /// transport attaches them as ancillary data.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        if self.body.len() > MAX_BODY_BYTES {
            return Err(EncodeError::BodyTooLarge {
                len: self.body.len(),
                max: MAX_BODY_BYTES,
            });
        }
        if self.fds.len() > MAX_FDS_PER_FRAME {
            return Err(EncodeError::TooManyFds {
                count: self.fds.len(),
                max: MAX_FDS_PER_FRAME,
            });
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.body.len());
        buf.put_u32_le(self.body.len() as u32);
        buf.put_u32_le(self.method_or_serial);
        buf.put_u8(self.kind.to_wire());
        buf.put_u8(self.fds.len() as u8);
        buf.put_u16_le(0);
        buf.put_slice(&self.body);
        Ok(buf.to_vec())
    }

    /// Decodes one received datagram plus its ancillary descriptors.
    ///
    /// On error the descriptors are dropped (and therefore closed) before
    /// returning, satisfying the receiver's obligation for failed frames.
    pub fn decode(data: &[u8], fds: Vec<OwnedFd>) -> Result<Self, DecodeError> {
        if data.len() < FRAME_HEADER_LEN {
            return Err(DecodeError::Truncated { len: data.len() });
        }

        let mut header = &data[..FRAME_HEADER_LEN];
        let body_len = header.get_u32_le() as usize;
        let method_or_serial = header.get_u32_le();
        let kind = MessageKind::from_wire(header.get_u8())?;
        let fd_count = header.get_u8() as usize;
        if header.get_u16_le() != 0 {
            return Err(DecodeError::ReservedNonZero);
        }

        if body_len > MAX_BODY_BYTES {
            return Err(DecodeError::BodyTooLarge {
                declared: body_len,
                max: MAX_BODY_BYTES,
            });
        }
        let actual = data.len() - FRAME_HEADER_LEN;
        if body_len != actual {
            return Err(DecodeError::BodyLengthMismatch {
                declared: body_len,
                actual,
            });
        }
        if fd_count != fds.len() || fd_count > MAX_FDS_PER_FRAME {
            return Err(DecodeError::FdCountMismatch {
                declared: fd_count,
                received: fds.len(),
            });
        }

        Ok(Self {
            kind,
            method_or_serial,
            body: data[FRAME_HEADER_LEN..].to_vec(),
            fds,
        })
    }
}

/// Body envelope of a request frame: the serial the response must echo plus
/// the typed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub serial: u32,
    pub payload: Vec<u8>,
}

/// Body envelope of a response frame: the typed payload, or the textual
/// reason the handler failed the call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub reply: Result<Vec<u8>, String>,
}
