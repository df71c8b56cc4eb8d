//! The transport SPI: the single boundary between the core and any wire
//! protocol.
//!
//! Adapters implement four abstractions. A [`Transport`] is a factory for
//! client connections and server listeners; a [`Connection`] multiplexes
//! frame streams against one remote endpoint; a [`FrameStream`] carries the
//! frames of exactly one call. Handles are cheap clones over shared state
//! and every operation takes `&self`.
//!
//! Every failure is a [`TransportError`] from a closed set; adapters must
//! map their native errors into it and never surface anything else.

use std::fmt;
use std::future::Future;

use crate::frame::Frame;
use crate::status::{Code, Status};

/// Errors surfaced by transport adapters. Closed set; the core maps each
/// variant onto a canonical status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// An operation exceeded its time budget.
    Timeout,
    /// The stream or connection was cancelled locally or by the peer.
    Canceled,
    /// The stream, connection, or listener is closed.
    Closed,
    /// The peer reset the connection underneath us.
    ConnectionReset,
    /// A transient condition; retrying may succeed.
    Temporary,
    /// The adapter ran out of buffers, streams, or quota.
    ResourceExhausted,
    /// The peer violated the wire protocol.
    Protocol(String),
    /// A malformed endpoint or parameter.
    InvalidArgument(String),
    /// The connection was never established.
    NotConnected,
    /// An operation was issued in a state that cannot accept it.
    InvalidState,
    /// Allocation failure inside the adapter.
    OutOfMemory,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Timeout => write!(f, "transport timeout"),
            TransportError::Canceled => write!(f, "transport operation canceled"),
            TransportError::Closed => write!(f, "transport closed"),
            TransportError::ConnectionReset => write!(f, "connection reset"),
            TransportError::Temporary => write!(f, "temporary transport failure"),
            TransportError::ResourceExhausted => write!(f, "transport resources exhausted"),
            TransportError::Protocol(msg) => write!(f, "protocol violation: {}", msg),
            TransportError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            TransportError::NotConnected => write!(f, "not connected"),
            TransportError::InvalidState => write!(f, "invalid transport state"),
            TransportError::OutOfMemory => write!(f, "transport out of memory"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<TransportError> for Status {
    fn from(err: TransportError) -> Status {
        let code = match &err {
            TransportError::Timeout => Code::DeadlineExceeded,
            TransportError::Canceled => Code::Cancelled,
            TransportError::Closed
            | TransportError::ConnectionReset
            | TransportError::NotConnected => Code::Unavailable,
            TransportError::Temporary => Code::Unavailable,
            TransportError::Protocol(_) => Code::Internal,
            TransportError::ResourceExhausted | TransportError::OutOfMemory => {
                Code::ResourceExhausted
            }
            TransportError::InvalidArgument(_) => Code::InvalidArgument,
            TransportError::InvalidState => Code::Internal,
        };
        Status::new(code, err.to_string())
    }
}

/// TLS options passed through to adapters. The core never interprets these.
#[derive(Clone, Debug)]
pub struct TlsConfig {
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub ca_file: Option<String>,
    pub server_name: Option<String>,
    pub alpn_protocols: Vec<String>,
    pub verify_peer: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        TlsConfig {
            cert_file: None,
            key_file: None,
            ca_file: None,
            server_name: None,
            alpn_protocols: vec!["h2".to_string(), "h3".to_string()],
            verify_peer: true,
        }
    }
}

/// Connection lifecycle states. Adapters report these for observability;
/// the core only distinguishes connected from not.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Initial,
    Handshake,
    Established,
    Closing,
    Draining,
    Closed,
}

/// Stream lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
    Reset,
}

/// A logical bidirectional frame channel carrying one call.
///
/// Within a stream, frames arrive in send order. Across streams of the same
/// connection no ordering is guaranteed.
pub trait FrameStream: Clone + Send + Sync + 'static {
    /// Write one frame. May suspend for backpressure.
    fn send_frame(&self, frame: Frame) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Read the next frame. Returns `Closed` once the stream is finished,
    /// never a partial frame.
    fn recv_frame(&self) -> impl Future<Output = Result<Frame, TransportError>> + Send;

    /// Abort the stream. Idempotent and asynchronous; subsequent reads
    /// return `Canceled`.
    fn cancel(&self) -> impl Future<Output = ()> + Send;

    /// Release the stream without aborting the peer.
    fn close(&self);

    /// The stream's id, unique within its connection.
    fn id(&self) -> u64;
}

/// A transport session against one remote endpoint.
pub trait Connection: Clone + Send + Sync + 'static {
    type Stream: FrameStream;

    /// Open an outbound stream.
    fn open_stream(&self) -> impl Future<Output = Result<Self::Stream, TransportError>> + Send;

    /// Receive the next stream opened by the peer. The server-side intake.
    fn accept_stream(&self) -> impl Future<Output = Result<Self::Stream, TransportError>> + Send;

    /// Liveness probe; resolves when the peer answered.
    fn ping(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn is_connected(&self) -> bool;

    /// Close the connection; all open streams observe `Closed`.
    fn close(&self);
}

/// A server-side intake of inbound connections.
pub trait Listener: Send + Sync + 'static {
    type Conn: Connection;

    /// Accept the next inbound connection. Returns `Closed` after
    /// [`Listener::close`]; blocked accepts unblock.
    fn accept(&self) -> impl Future<Output = Result<Self::Conn, TransportError>> + Send;

    fn close(&self);
}

/// A factory for connections and listeners. Endpoints are opaque strings
/// validated by the adapter.
pub trait Transport: Send + Sync + 'static {
    type Conn: Connection;
    type Listener: Listener<Conn = Self::Conn>;

    fn connect(
        &self,
        endpoint: &str,
        tls: Option<&TlsConfig>,
    ) -> impl Future<Output = Result<Self::Conn, TransportError>> + Send;

    fn listen(
        &self,
        bind: &str,
        tls: Option<&TlsConfig>,
    ) -> impl Future<Output = Result<Self::Listener, TransportError>> + Send;
}

#[cfg(feature = "mem")]
pub mod mem;
