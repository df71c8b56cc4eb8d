//! gRPC framing over the SPI frame model.
//!
//! One RPC message becomes `[compression_flag u8][length u32 BE][body]`
//! inside data frames; messages are concatenable and may be fragmented
//! across frames arbitrarily. Header blocks carry the pseudo-headers and
//! user metadata; trailers are a headers frame with `END_STREAM` carrying
//! `grpc-status`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::deadline::{Deadline, parse_timeout};
use crate::limits::DEFAULT_MAX_MESSAGE_SIZE;
use crate::metadata::Metadata;
use crate::status::{Code, Status, decode_grpc_message, encode_grpc_message};

/// Compression flag for an uncompressed message. The core preserves any
/// flag value it sees; interpreting nonzero flags is a codec concern.
pub const COMPRESSION_NONE: u8 = 0;

/// Bytes of message header preceding each body.
pub const MESSAGE_HEADER_LEN: usize = 5;

/// Expected `content-type` for requests and responses. Suffixed forms
/// (`application/grpc+proto`, ...) are accepted.
pub const CONTENT_TYPE_GRPC: &str = "application/grpc";

/// One reassembled RPC message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcMessage {
    pub compression: u8,
    pub body: Bytes,
}

/// Frame an RPC message body for a data frame.
pub fn encode_message(compression: u8, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(MESSAGE_HEADER_LEN + body.len());
    buf.put_u8(compression);
    buf.put_u32(body.len() as u32);
    buf.extend_from_slice(body);
    buf.freeze()
}

/// Reassembles length-prefixed messages out of arbitrarily fragmented data
/// frame payloads.
///
/// The buffer is bounded: a declared length over the cap is rejected before
/// any body bytes accumulate.
#[derive(Debug)]
pub struct MessageReassembler {
    buf: BytesMut,
    max_message_size: usize,
}

impl MessageReassembler {
    pub fn new(max_message_size: usize) -> Self {
        MessageReassembler {
            buf: BytesMut::new(),
            max_message_size,
        }
    }

    /// Feed bytes from a data frame.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete message, if any.
    ///
    /// A declared length above the cap fails with `resource_exhausted`;
    /// a length equal to the cap is accepted.
    pub fn next(&mut self) -> Result<Option<RpcMessage>, Status> {
        if self.buf.len() < MESSAGE_HEADER_LEN {
            return Ok(None);
        }
        let declared = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]])
            as usize;
        if declared > self.max_message_size {
            return Err(Status::resource_exhausted(format!(
                "message length {} exceeds maximum {}",
                declared, self.max_message_size
            )));
        }
        if self.buf.len() < MESSAGE_HEADER_LEN + declared {
            return Ok(None);
        }
        let compression = self.buf.get_u8();
        self.buf.advance(4);
        let body = self.buf.split_to(declared).freeze();
        Ok(Some(RpcMessage { compression, body }))
    }

    /// Whether any buffered bytes remain unconsumed.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

impl Default for MessageReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

/// Build the request header block: pseudo-headers, user metadata, and a
/// `grpc-timeout` derived from the remaining deadline at this moment.
pub fn encode_request_headers(
    path: &str,
    authority: &str,
    metadata: &Metadata,
    deadline: Option<Deadline>,
) -> Bytes {
    let mut block = metadata.clone();
    block.insert_raw_ascii(":method", "POST");
    block.insert_raw_ascii(":path", path);
    block.insert_raw_ascii(":authority", authority);
    block.insert_raw_ascii("content-type", CONTENT_TYPE_GRPC);
    if let Some(deadline) = deadline {
        block.insert_raw_ascii("grpc-timeout", deadline.to_timeout_header());
    }
    block.encode()
}

/// A parsed inbound request head.
#[derive(Debug)]
pub struct RequestHead {
    pub path: String,
    /// User metadata with the pseudo-headers and core-reserved keys removed.
    pub metadata: Metadata,
    /// Absolute deadline derived from `grpc-timeout` against our clock.
    pub deadline: Option<Deadline>,
}

/// Parse and validate an inbound request header block.
pub fn decode_request_headers(block: &[u8]) -> Result<RequestHead, Status> {
    let mut metadata = Metadata::parse(block)
        .map_err(|e| Status::internal(format!("bad request headers: {}", e)))?;

    match metadata.get("content-type") {
        Some(ct) if ct.starts_with(CONTENT_TYPE_GRPC) => {}
        Some(ct) => {
            return Err(Status::invalid_argument(format!(
                "unsupported content-type {:?}",
                ct
            )));
        }
        None => {
            return Err(Status::invalid_argument("missing content-type"));
        }
    }

    let path = metadata
        .get(":path")
        .ok_or_else(|| Status::invalid_argument("missing :path"))?
        .to_string();

    let deadline = match metadata.get("grpc-timeout") {
        Some(text) => {
            let remaining = parse_timeout(text)
                .map_err(|e| Status::invalid_argument(format!("bad grpc-timeout: {}", e)))?;
            Some(Deadline::after(remaining))
        }
        None => None,
    };

    let reserved: Vec<String> = metadata
        .iter()
        .map(|(k, _)| k.to_string())
        .filter(|k| k.starts_with(':') || k.starts_with("grpc-") || k == "content-type")
        .collect();
    for key in reserved {
        metadata.remove(&key);
    }

    Ok(RequestHead {
        path,
        metadata,
        deadline,
    })
}

/// Build a response header block (initial metadata).
pub fn encode_response_headers(metadata: &Metadata) -> Bytes {
    let mut block = metadata.clone();
    block.insert_raw_ascii("content-type", CONTENT_TYPE_GRPC);
    block.encode()
}

/// Build a trailer block from a final status.
pub fn encode_trailers(status: &Status) -> Bytes {
    let mut block = Metadata::new();
    block.insert_raw_ascii("grpc-status", status.code().as_i32().to_string());
    if !status.message().is_empty() {
        block.insert_raw_ascii("grpc-message", encode_grpc_message(status.message()));
    }
    if !status.details().is_empty() {
        block.insert_raw_bin("grpc-status-details-bin", status.details().clone());
    }
    block.encode()
}

/// Whether a parsed header block is a trailer block.
pub fn is_trailer_block(metadata: &Metadata) -> bool {
    metadata.contains_key("grpc-status")
}

/// Parse a trailer block into a status.
///
/// Out-of-range codes decode leniently to `Unknown` so a broken peer still
/// yields a status rather than a parse failure.
pub fn decode_trailers(block: &[u8]) -> Result<Status, Status> {
    let metadata =
        Metadata::parse(block).map_err(|e| Status::internal(format!("bad trailers: {}", e)))?;
    status_from_trailers(&metadata)
}

/// Extract a status from already-parsed trailer metadata.
pub fn status_from_trailers(metadata: &Metadata) -> Result<Status, Status> {
    let raw = metadata
        .get("grpc-status")
        .ok_or_else(|| Status::internal("trailers missing grpc-status"))?;
    let code = raw
        .parse::<i32>()
        .ok()
        .map(|v| Code::from_i32(v).unwrap_or(Code::Unknown))
        .ok_or_else(|| Status::internal(format!("non-integer grpc-status {:?}", raw)))?;

    let message = metadata
        .get("grpc-message")
        .map(decode_grpc_message)
        .unwrap_or_default();

    let mut status = Status::new(code, message);
    if let Some(details) = metadata.get_bin("grpc-status-details-bin") {
        status = status.with_details(details.clone());
    }
    Ok(status)
}
