//! Per-call state machine and the frame-level plumbing shared by all four
//! call patterns.

use std::time::Duration;

use bytes::Bytes;
use strand_core::{
    CancelToken, Code, Deadline, Frame, FrameFlags, FrameStream, FrameType, Metadata,
    MessageReassembler, RpcMessage, Status, TransportError, encode_message, encode_request_headers,
    is_trailer_block, status_from_trailers,
};

/// How long the engine waits for the transport to acknowledge a cancel
/// before releasing the stream anyway.
pub(crate) const CANCEL_ACK_TIMEOUT: Duration = Duration::from_millis(100);

/// The lifecycle of one call attempt.
///
/// Transitions outside the edges below are engine bugs and surface as
/// `internal`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallState {
    Start,
    Encoding,
    Sending,
    AwaitingResponse,
    Decoding,
    Cancelling,
    Completed,
    Failed(Code),
}

impl CallState {
    /// Step to `next`, validating the edge.
    pub fn advance(self, next: CallState) -> Result<CallState, Status> {
        if self.may_advance(next) {
            Ok(next)
        } else {
            Err(Status::internal(format!(
                "invalid call transition {:?} -> {:?}",
                self, next
            )))
        }
    }

    fn may_advance(self, next: CallState) -> bool {
        use CallState::*;
        match (self, next) {
            (Start, Encoding) => true,
            (Encoding, Sending) => true,
            (Sending, AwaitingResponse) => true,
            (AwaitingResponse, Decoding) => true,
            (Decoding, Completed) => true,
            // Deadline expiry or a cancel request interrupts the in-flight
            // phases; a transport error fails them directly.
            (Sending | AwaitingResponse | Decoding, Cancelling) => true,
            (Cancelling, Failed(_)) => true,
            (Start | Encoding | Sending | AwaitingResponse | Decoding, Failed(_)) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Completed | CallState::Failed(_))
    }
}

/// One event observed while awaiting the response side of a call.
#[derive(Debug)]
pub(crate) enum ResponseEvent {
    /// Initial (non-trailer) response metadata.
    InitialMetadata(Metadata),
    /// A complete, reassembled message.
    Message(RpcMessage),
    /// The trailer block; the call is over in this direction.
    Trailers(Status),
    /// The peer aborted the stream.
    PeerCancel,
}

/// Read the next response event off a stream.
///
/// Local interruptions come back as `Err`: `deadline_exceeded` when the
/// deadline timer fires, `cancelled` when the context token fires, and the
/// mapped status for transport errors. The select is biased toward frames
/// already readable, so a response that fully arrived wins a race against
/// the deadline observing it.
pub(crate) async fn recv_event<S: FrameStream>(
    stream: &S,
    reassembler: &mut MessageReassembler,
    deadline: Option<Deadline>,
    cancel: &CancelToken,
) -> Result<ResponseEvent, Status> {
    loop {
        if let Some(message) = reassembler.next()? {
            return Ok(ResponseEvent::Message(message));
        }

        let deadline_fired = async {
            match deadline {
                Some(d) => d.timer().await,
                None => std::future::pending().await,
            }
        };

        let frame = tokio::select! {
            biased;
            frame = stream.recv_frame() => frame,
            _ = cancel.cancelled() => return Err(Status::cancelled("call cancelled")),
            _ = deadline_fired => return Err(Status::deadline_exceeded("deadline elapsed awaiting response")),
        };

        match frame {
            Ok(frame) => match frame.frame_type {
                FrameType::Data => {
                    reassembler.push(&frame.payload);
                }
                FrameType::Headers => {
                    let block = Metadata::parse(&frame.payload)
                        .map_err(|e| Status::internal(format!("bad header block: {}", e)))?;
                    if is_trailer_block(&block) {
                        return Ok(ResponseEvent::Trailers(status_from_trailers(&block)?));
                    }
                    return Ok(ResponseEvent::InitialMetadata(block));
                }
                FrameType::Status => {
                    let block = Metadata::parse(&frame.payload)
                        .map_err(|e| Status::internal(format!("bad status block: {}", e)))?;
                    return Ok(ResponseEvent::Trailers(status_from_trailers(&block)?));
                }
                FrameType::Cancel => return Ok(ResponseEvent::PeerCancel),
                FrameType::Metadata => {
                    let block = Metadata::parse(&frame.payload)
                        .map_err(|e| Status::internal(format!("bad metadata block: {}", e)))?;
                    return Ok(ResponseEvent::InitialMetadata(block));
                }
                // Probes carry no call-visible information.
                FrameType::Keepalive => continue,
            },
            Err(err) => {
                return Err(match err {
                    TransportError::Canceled => Status::cancelled("stream cancelled"),
                    other => Status::unavailable(format!(
                        "stream ended before trailers: {}",
                        other
                    )),
                });
            }
        }
    }
}

/// Tear a stream down after a local abort: best-effort cancel frame to the
/// peer, then transport-level cancel with a bounded wait so the stream is
/// never leaked.
pub(crate) async fn abort_stream<S: FrameStream>(stream: &S) {
    let _ = tokio::time::timeout(CANCEL_ACK_TIMEOUT, stream.send_frame(Frame::cancel())).await;
    let _ = tokio::time::timeout(CANCEL_ACK_TIMEOUT, stream.cancel()).await;
    stream.close();
}

/// Write the request header frame.
pub(crate) async fn send_request_headers<S: FrameStream>(
    stream: &S,
    path: &str,
    authority: &str,
    metadata: &Metadata,
    deadline: Option<Deadline>,
) -> Result<(), Status> {
    let block = encode_request_headers(path, authority, metadata, deadline);
    stream
        .send_frame(Frame::headers(block, FrameFlags::empty()))
        .await
        .map_err(Status::from)
}

/// Frame and write one message as a data frame.
pub(crate) async fn send_message<S: FrameStream>(
    stream: &S,
    body: &[u8],
    end_stream: bool,
) -> Result<(), Status> {
    let payload = encode_message(strand_core::COMPRESSION_NONE, body);
    stream
        .send_frame(Frame::data(payload, end_stream))
        .await
        .map_err(Status::from)
}

/// Write the empty data frame that half-closes the sending direction.
pub(crate) async fn send_half_close<S: FrameStream>(stream: &S) -> Result<(), Status> {
    stream
        .send_frame(Frame::data(Bytes::new(), true))
        .await
        .map_err(Status::from)
}
