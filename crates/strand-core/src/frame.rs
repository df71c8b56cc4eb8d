//! The transport envelope: typed frames flowing over a stream.
//!
//! This is the SPI frame set. Adapters with richer native framing (HTTP/2
//! SETTINGS, QUIC control, ...) keep that vocabulary internal and surface
//! only these six types.

use std::fmt;

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame type tag. The numeric values are the wire representation used by
/// byte-oriented adapters.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Length-prefixed RPC message bytes.
    Data = 0,
    /// A header block; trailers are a headers frame with `END_STREAM`.
    Headers = 1,
    /// Standalone status notification.
    Status = 2,
    /// Abort the stream.
    Cancel = 3,
    /// Liveness probe.
    Keepalive = 4,
    /// Out-of-band metadata update.
    Metadata = 5,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => FrameType::Data,
            1 => FrameType::Headers,
            2 => FrameType::Status,
            3 => FrameType::Cancel,
            4 => FrameType::Keepalive,
            5 => FrameType::Metadata,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

bitflags! {
    /// Per-frame flag bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct FrameFlags: u8 {
        /// No further frames follow in this direction.
        const END_STREAM = 0b0000_0001;
        /// The header block is complete.
        const END_HEADERS = 0b0000_0010;
    }
}

/// The minimal transport envelope. The payload is owned by the frame and
/// freed when the frame is dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

/// Errors from the byte-level frame codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameDecodeError {
    /// Buffer ends before the fixed header or declared payload.
    Truncated,
    /// Type tag outside the SPI set.
    UnknownType(u8),
    /// Flag bits outside the defined set.
    UnknownFlags(u8),
    /// Trailing bytes after the declared payload.
    TrailingBytes(usize),
}

impl fmt::Display for FrameDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameDecodeError::Truncated => write!(f, "frame truncated"),
            FrameDecodeError::UnknownType(t) => write!(f, "unknown frame type {}", t),
            FrameDecodeError::UnknownFlags(bits) => {
                write!(f, "unknown frame flag bits {:#010b}", bits)
            }
            FrameDecodeError::TrailingBytes(n) => {
                write!(f, "{} trailing bytes after frame payload", n)
            }
        }
    }
}

impl std::error::Error for FrameDecodeError {}

impl Frame {
    pub fn new(frame_type: FrameType, flags: FrameFlags, payload: Bytes) -> Self {
        Frame {
            frame_type,
            flags,
            payload,
        }
    }

    /// A data frame, optionally ending the direction.
    pub fn data(payload: Bytes, end_stream: bool) -> Self {
        let flags = if end_stream {
            FrameFlags::END_STREAM
        } else {
            FrameFlags::empty()
        };
        Frame::new(FrameType::Data, flags, payload)
    }

    /// A headers frame carrying an encoded header block.
    pub fn headers(block: Bytes, flags: FrameFlags) -> Self {
        Frame::new(FrameType::Headers, flags | FrameFlags::END_HEADERS, block)
    }

    /// An empty cancel frame.
    pub fn cancel() -> Self {
        Frame::new(FrameType::Cancel, FrameFlags::empty(), Bytes::new())
    }

    /// A keepalive probe carrying an opaque correlation payload.
    pub fn keepalive(payload: Bytes) -> Self {
        Frame::new(FrameType::Keepalive, FrameFlags::empty(), payload)
    }

    pub fn is_end_stream(&self) -> bool {
        self.flags.contains(FrameFlags::END_STREAM)
    }

    /// Encode as `[type u8][flags u8][len u32 BE][payload]`.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(6 + self.payload.len());
        buf.put_u8(self.frame_type.as_u8());
        buf.put_u8(self.flags.bits());
        buf.put_u32(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a frame from a buffer that holds exactly one frame.
    pub fn decode(mut buf: &[u8]) -> Result<Frame, FrameDecodeError> {
        if buf.len() < 6 {
            return Err(FrameDecodeError::Truncated);
        }
        let type_tag = buf.get_u8();
        let frame_type =
            FrameType::from_u8(type_tag).ok_or(FrameDecodeError::UnknownType(type_tag))?;
        let flag_bits = buf.get_u8();
        let flags =
            FrameFlags::from_bits(flag_bits).ok_or(FrameDecodeError::UnknownFlags(flag_bits))?;
        let len = buf.get_u32() as usize;
        if buf.len() < len {
            return Err(FrameDecodeError::Truncated);
        }
        if buf.len() > len {
            return Err(FrameDecodeError::TrailingBytes(buf.len() - len));
        }
        Ok(Frame {
            frame_type,
            flags,
            payload: Bytes::copy_from_slice(buf),
        })
    }
}
