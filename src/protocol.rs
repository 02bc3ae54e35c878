//! Wire frames.
//!
//! Request frame, 12-byte header:
//! ```text
//! ┌────────────┬──────────────┬──────────┬──────────────┬─────────┐
//! │ callset id │ operation id │ sequence │ payload len  │ payload │
//! │ u16 BE     │ u16 BE       │ u32 BE   │ u32 BE       │ N bytes │
//! └────────────┴──────────────┴──────────┴──────────────┴─────────┘
//! ```
//!
//! Reply frame, 10-byte header:
//! ```text
//! ┌──────────┬────────┬──────────────┬─────────┐
//! │ sequence │ status │ payload len  │ payload │
//! │ u32 BE   │ u16 BE │ u32 BE       │ N bytes │
//! └──────────┴────────┴──────────────┴─────────┘
//! ```

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::error::{RemoteError, Result, RpcError};

pub const REQUEST_HEADER_SIZE: usize = 12;

pub const REPLY_HEADER_SIZE: usize = 10;

/// Default upper bound for a frame payload (1 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 1024 * 1024;

/// Reply status carried in every reply frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    HandlerError,
    UnknownCallset,
    UnknownOperation,
    BadRequest,
    Other(u16),
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 0,
            Status::HandlerError => 1,
            Status::UnknownCallset => 2,
            Status::UnknownOperation => 3,
            Status::BadRequest => 4,
            Status::Other(code) => code,
        }
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl From<u16> for Status {
    fn from(code: u16) -> Self {
        match code {
            0 => Status::Ok,
            1 => Status::HandlerError,
            2 => Status::UnknownCallset,
            3 => Status::UnknownOperation,
            4 => Status::BadRequest,
            other => Status::Other(other),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "ok"),
            Status::HandlerError => write!(f, "handler error"),
            Status::UnknownCallset => write!(f, "unknown callset"),
            Status::UnknownOperation => write!(f, "unknown operation"),
            Status::BadRequest => write!(f, "bad request"),
            Status::Other(code) => write!(f, "status {}", code),
        }
    }
}

/// A frame type with a fixed-size header followed by a length-prefixed payload.
pub trait WireFrame: Sized + Send {
    const HEADER_SIZE: usize;

    /// Read the payload length out of a complete header.
    fn payload_len(header: &[u8]) -> u32;

    fn from_parts(header: &[u8], payload: Bytes) -> Self;

    fn encode(&self) -> Bytes;

    /// Split one complete frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` while more bytes are needed. A declared payload
    /// larger than `max_payload` is a decode error; the stream cannot be
    /// resynchronized after it.
    fn extract(buf: &mut BytesMut, max_payload: u32) -> Result<Option<Self>> {
        if buf.len() < Self::HEADER_SIZE {
            return Ok(None);
        }

        let len = Self::payload_len(&buf[..Self::HEADER_SIZE]);
        if len > max_payload {
            return Err(RpcError::decode(format!(
                "payload size {} exceeds maximum {}",
                len, max_payload
            )));
        }

        let total = Self::HEADER_SIZE + len as usize;
        if buf.len() < total {
            debug!("Frame incomplete: have {} of {} bytes", buf.len(), total);
            return Ok(None);
        }

        let frame = buf.split_to(total).freeze();
        let payload = frame.slice(Self::HEADER_SIZE..);
        Ok(Some(Self::from_parts(&frame[..Self::HEADER_SIZE], payload)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub callset_id: u16,
    pub operation_id: u16,
    pub sequence: u32,
    pub payload: Bytes,
}

impl RequestFrame {
    pub fn new(callset_id: u16, operation_id: u16, sequence: u32, payload: Bytes) -> Self {
        RequestFrame {
            callset_id,
            operation_id,
            sequence,
            payload,
        }
    }
}

impl WireFrame for RequestFrame {
    const HEADER_SIZE: usize = REQUEST_HEADER_SIZE;

    fn payload_len(mut header: &[u8]) -> u32 {
        header.advance(8);
        header.get_u32()
    }

    fn from_parts(mut header: &[u8], payload: Bytes) -> Self {
        RequestFrame {
            callset_id: header.get_u16(),
            operation_id: header.get_u16(),
            sequence: header.get_u32(),
            payload,
        }
    }

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(REQUEST_HEADER_SIZE + self.payload.len());
        buf.put_u16(self.callset_id);
        buf.put_u16(self.operation_id);
        buf.put_u32(self.sequence);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyFrame {
    pub sequence: u32,
    pub status: Status,
    pub payload: Bytes,
}

impl ReplyFrame {
    pub fn new(sequence: u32, status: Status, payload: Bytes) -> Self {
        ReplyFrame {
            sequence,
            status,
            payload,
        }
    }

    pub fn success(sequence: u32, payload: Bytes) -> Self {
        Self::new(sequence, Status::Ok, payload)
    }

    pub fn error(sequence: u32, error: &RemoteError) -> Self {
        Self::new(sequence, error.status, error.to_payload())
    }
}

impl WireFrame for ReplyFrame {
    const HEADER_SIZE: usize = REPLY_HEADER_SIZE;

    fn payload_len(mut header: &[u8]) -> u32 {
        header.advance(6);
        header.get_u32()
    }

    fn from_parts(mut header: &[u8], payload: Bytes) -> Self {
        ReplyFrame {
            sequence: header.get_u32(),
            status: Status::from(header.get_u16()),
            payload,
        }
    }

    fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(REPLY_HEADER_SIZE + self.payload.len());
        buf.put_u32(self.sequence);
        buf.put_u16(self.status.code());
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}
