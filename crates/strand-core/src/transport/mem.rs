//! In-process reference transport.
//!
//! Connections are pairs of channel bundles living in the same process;
//! streams are bounded frame channels so senders feel backpressure. This is
//! the adapter the contract harness and the end-to-end tests run against.
//!
//! Liveness is trivial here: both ends share the connection state, so
//! `ping` answers from the shared closed flag rather than a wire exchange.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::{mpsc, watch};

use crate::frame::Frame;
use crate::transport::{
    Connection, ConnectionState, FrameStream, Listener, StreamState, TlsConfig, Transport,
    TransportError,
};

/// Frames buffered per stream direction before senders suspend.
const STREAM_CHANNEL_CAPACITY: usize = 32;

/// A flag whose waiters never miss an edge.
#[derive(Clone)]
struct Flag {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Flag {
    fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Flag { tx: Arc::new(tx), rx }
    }

    fn set(&self) {
        self.tx.send_replace(true);
    }

    fn is_set(&self) -> bool {
        *self.rx.borrow()
    }

    async fn wait(&self) {
        let mut rx = self.rx.clone();
        // An Err means the sender vanished, which only happens at teardown;
        // treat it the same as the flag firing.
        let _ = rx.wait_for(|set| *set).await;
    }
}

/// Shared between both ends of a connection.
struct ConnShared {
    closed: Flag,
}

struct ConnInner {
    shared: Arc<ConnShared>,
    /// New locally opened streams are handed to the peer through this.
    to_peer: mpsc::UnboundedSender<MemStream>,
    /// Streams the peer opened toward us.
    incoming: AsyncMutex<mpsc::UnboundedReceiver<MemStream>>,
    next_stream_id: AtomicU64,
}

/// One end of an in-process connection.
#[derive(Clone)]
pub struct MemConnection {
    inner: Arc<ConnInner>,
}

impl MemConnection {
    /// A connected pair. The first element allocates odd stream ids, the
    /// second even, so ids are unique within the connection.
    pub fn pair() -> (MemConnection, MemConnection) {
        let shared = Arc::new(ConnShared { closed: Flag::new() });
        let (a_to_b, b_incoming) = mpsc::unbounded_channel();
        let (b_to_a, a_incoming) = mpsc::unbounded_channel();
        let a = MemConnection {
            inner: Arc::new(ConnInner {
                shared: shared.clone(),
                to_peer: a_to_b,
                incoming: AsyncMutex::new(a_incoming),
                next_stream_id: AtomicU64::new(1),
            }),
        };
        let b = MemConnection {
            inner: Arc::new(ConnInner {
                shared,
                to_peer: b_to_a,
                incoming: AsyncMutex::new(b_incoming),
                next_stream_id: AtomicU64::new(2),
            }),
        };
        (a, b)
    }

    fn shared(&self) -> &Arc<ConnShared> {
        &self.inner.shared
    }

    /// Lifecycle state. An in-process pair is born established; there is no
    /// handshake to observe.
    pub fn state(&self) -> ConnectionState {
        if self.shared().closed.is_set() {
            ConnectionState::Closed
        } else {
            ConnectionState::Established
        }
    }
}

impl std::fmt::Debug for MemConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemConnection")
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Connection for MemConnection {
    type Stream = MemStream;

    async fn open_stream(&self) -> Result<MemStream, TransportError> {
        if self.shared().closed.is_set() {
            return Err(TransportError::NotConnected);
        }
        let id = self.inner.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let (local, remote) = MemStream::pair(id, self.shared().clone());
        self.inner
            .to_peer
            .send(remote)
            .map_err(|_| TransportError::Closed)?;
        Ok(local)
    }

    async fn accept_stream(&self) -> Result<MemStream, TransportError> {
        let mut incoming = self.inner.incoming.lock().await;
        tokio::select! {
            stream = incoming.recv() => stream.ok_or(TransportError::Closed),
            _ = self.shared().closed.wait() => Err(TransportError::Closed),
        }
    }

    async fn ping(&self) -> Result<(), TransportError> {
        if self.shared().closed.is_set() {
            return Err(TransportError::NotConnected);
        }
        // The peer shares our process; a schedule round stands in for the
        // wire round trip.
        tokio::task::yield_now().await;
        if self.shared().closed.is_set() {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.shared().closed.is_set()
    }

    fn close(&self) {
        if self.is_connected() {
            tracing::debug!("mem connection closed");
        }
        self.shared().closed.set();
    }
}

struct StreamInner {
    id: u64,
    conn: Arc<ConnShared>,
    tx: mpsc::Sender<Frame>,
    rx: AsyncMutex<mpsc::Receiver<Frame>>,
    cancelled: Flag,
    closed: Flag,
    state: Mutex<StreamState>,
}

/// One end of an in-process stream.
#[derive(Clone)]
pub struct MemStream {
    inner: Arc<StreamInner>,
}

impl MemStream {
    fn pair(id: u64, conn: Arc<ConnShared>) -> (MemStream, MemStream) {
        let (tx_fwd, rx_fwd) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (tx_back, rx_back) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let make = |tx, rx| MemStream {
            inner: Arc::new(StreamInner {
                id,
                conn: conn.clone(),
                tx,
                rx: AsyncMutex::new(rx),
                cancelled: Flag::new(),
                closed: Flag::new(),
                state: Mutex::new(StreamState::Open),
            }),
        };
        (make(tx_fwd, rx_back), make(tx_back, rx_fwd))
    }

    /// The stream's lifecycle state as tracked by this end.
    pub fn state(&self) -> StreamState {
        *self.inner.state.lock()
    }

    fn note_sent_end(&self) {
        let mut state = self.inner.state.lock();
        *state = match *state {
            StreamState::HalfClosedRemote => StreamState::Closed,
            StreamState::Reset => StreamState::Reset,
            _ => StreamState::HalfClosedLocal,
        };
    }

    fn note_received(&self, frame: &Frame) {
        if frame.is_end_stream() {
            let mut state = self.inner.state.lock();
            *state = match *state {
                StreamState::HalfClosedLocal => StreamState::Closed,
                StreamState::Reset => StreamState::Reset,
                _ => StreamState::HalfClosedRemote,
            };
        }
    }
}

impl std::fmt::Debug for MemStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemStream")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl FrameStream for MemStream {
    async fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        if self.inner.cancelled.is_set() {
            return Err(TransportError::Canceled);
        }
        if self.inner.closed.is_set() || self.inner.conn.closed.is_set() {
            return Err(TransportError::Closed);
        }
        let ends_stream = frame.is_end_stream();
        let sent = tokio::select! {
            sent = self.inner.tx.send(frame) => sent.map_err(|_| TransportError::Closed),
            _ = self.inner.cancelled.wait() => Err(TransportError::Canceled),
            _ = self.inner.conn.closed.wait() => Err(TransportError::Closed),
        };
        if sent.is_ok() && ends_stream {
            self.note_sent_end();
        }
        sent
    }

    async fn recv_frame(&self) -> Result<Frame, TransportError> {
        if self.inner.cancelled.is_set() {
            return Err(TransportError::Canceled);
        }
        if self.inner.closed.is_set() {
            return Err(TransportError::Closed);
        }
        let mut rx = self.inner.rx.lock().await;
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => {
                    self.note_received(&frame);
                    Ok(frame)
                }
                None => Err(TransportError::Closed),
            },
            _ = self.inner.cancelled.wait() => Err(TransportError::Canceled),
            _ = self.inner.conn.closed.wait() => Err(TransportError::Closed),
        }
    }

    async fn cancel(&self) {
        if !self.inner.cancelled.is_set() {
            tracing::trace!(stream_id = self.inner.id, "stream cancelled");
            self.inner.cancelled.set();
            *self.inner.state.lock() = StreamState::Reset;
            // Best effort: let the peer see the abort as a frame. A full
            // buffer just drops it; the engine sends its own cancel frame
            // ahead of transport-level teardown anyway.
            let _ = self.inner.tx.try_send(Frame::cancel());
        }
    }

    fn close(&self) {
        self.inner.closed.set();
        let mut state = self.inner.state.lock();
        if *state != StreamState::Reset {
            *state = StreamState::Closed;
        }
    }

    fn id(&self) -> u64 {
        self.inner.id
    }
}

struct ListenerInner {
    incoming: AsyncMutex<mpsc::UnboundedReceiver<MemConnection>>,
    closed: Flag,
    registry: Arc<Registry>,
    bind: String,
}

/// Accepts in-process connections made to a bound name.
pub struct MemListener {
    inner: Arc<ListenerInner>,
}

impl Listener for MemListener {
    type Conn = MemConnection;

    async fn accept(&self) -> Result<MemConnection, TransportError> {
        if self.inner.closed.is_set() {
            return Err(TransportError::Closed);
        }
        let mut incoming = self.inner.incoming.lock().await;
        tokio::select! {
            conn = incoming.recv() => conn.ok_or(TransportError::Closed),
            _ = self.inner.closed.wait() => Err(TransportError::Closed),
        }
    }

    fn close(&self) {
        self.inner.closed.set();
        self.inner
            .registry
            .endpoints
            .lock()
            .remove(&self.inner.bind);
    }
}

#[derive(Default)]
struct Registry {
    endpoints: Mutex<HashMap<String, mpsc::UnboundedSender<MemConnection>>>,
}

/// The in-process transport factory.
///
/// A `MemTransport` is its own little network: names bound by `listen` are
/// visible to `connect` calls on the same instance (clones included).
#[derive(Clone, Default)]
pub struct MemTransport {
    registry: Arc<Registry>,
}

impl MemTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A directly connected pair, bypassing the endpoint registry.
    pub fn pair() -> (MemConnection, MemConnection) {
        MemConnection::pair()
    }
}

fn validate_endpoint(endpoint: &str) -> Result<(), TransportError> {
    if endpoint.is_empty() || endpoint.contains(char::is_whitespace) {
        return Err(TransportError::InvalidArgument(format!(
            "bad mem endpoint {:?}",
            endpoint
        )));
    }
    Ok(())
}

impl Transport for MemTransport {
    type Conn = MemConnection;
    type Listener = MemListener;

    async fn connect(
        &self,
        endpoint: &str,
        _tls: Option<&TlsConfig>,
    ) -> Result<MemConnection, TransportError> {
        validate_endpoint(endpoint)?;
        let accept_tx = self
            .registry
            .endpoints
            .lock()
            .get(endpoint)
            .cloned()
            .ok_or(TransportError::NotConnected)?;
        let (client, server) = MemConnection::pair();
        accept_tx
            .send(server)
            .map_err(|_| TransportError::NotConnected)?;
        Ok(client)
    }

    async fn listen(
        &self,
        bind: &str,
        _tls: Option<&TlsConfig>,
    ) -> Result<MemListener, TransportError> {
        validate_endpoint(bind)?;
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut endpoints = self.registry.endpoints.lock();
            if endpoints.contains_key(bind) {
                return Err(TransportError::InvalidArgument(format!(
                    "mem endpoint {:?} already bound",
                    bind
                )));
            }
            endpoints.insert(bind.to_string(), tx);
        }
        Ok(MemListener {
            inner: Arc::new(ListenerInner {
                incoming: AsyncMutex::new(rx),
                closed: Flag::new(),
                registry: self.registry.clone(),
                bind: bind.to_string(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameFlags, FrameType};
    use bytes::Bytes;

    #[tokio::test]
    async fn stream_roundtrip() {
        let (client, server) = MemConnection::pair();
        let out = client.open_stream().await.unwrap();
        let inbound = server.accept_stream().await.unwrap();
        assert_eq!(out.id(), inbound.id());

        out.send_frame(Frame::data(Bytes::from_static(b"hi"), false))
            .await
            .unwrap();
        let frame = inbound.recv_frame().await.unwrap();
        assert_eq!(frame.frame_type, FrameType::Data);
        assert_eq!(frame.payload.as_ref(), b"hi");
    }

    #[tokio::test]
    async fn frames_keep_send_order() {
        let (client, server) = MemConnection::pair();
        let out = client.open_stream().await.unwrap();
        let inbound = server.accept_stream().await.unwrap();

        for i in 0..10u8 {
            out.send_frame(Frame::data(Bytes::from(vec![i]), false))
                .await
                .unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(inbound.recv_frame().await.unwrap().payload.as_ref(), &[i]);
        }
    }

    #[tokio::test]
    async fn stream_ids_unique_across_sides() {
        let (client, server) = MemConnection::pair();
        let a = client.open_stream().await.unwrap();
        let b = client.open_stream().await.unwrap();
        let c = server.open_stream().await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_ne!(b.id(), c.id());
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_poisons_reads() {
        let (client, server) = MemConnection::pair();
        let out = client.open_stream().await.unwrap();
        let _inbound = server.accept_stream().await.unwrap();

        out.cancel().await;
        out.cancel().await;
        assert_eq!(out.recv_frame().await, Err(TransportError::Canceled));
        assert_eq!(
            out.send_frame(Frame::data(Bytes::new(), false)).await,
            Err(TransportError::Canceled)
        );
        assert_eq!(out.state(), StreamState::Reset);
    }

    #[tokio::test]
    async fn closing_connection_closes_streams() {
        let (client, server) = MemConnection::pair();
        let out = client.open_stream().await.unwrap();
        let inbound = server.accept_stream().await.unwrap();

        let reader = tokio::spawn(async move { inbound.recv_frame().await });
        client.close();
        assert!(!client.is_connected());
        assert!(!server.is_connected());
        assert_eq!(reader.await.unwrap(), Err(TransportError::Closed));
        assert_eq!(
            out.send_frame(Frame::data(Bytes::new(), false)).await,
            Err(TransportError::Closed)
        );
        assert!(matches!(
            client.open_stream().await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn closed_listener_unblocks_accept() {
        let transport = MemTransport::new();
        let listener = transport.listen("svc", None).await.unwrap();
        let listener = Arc::new(listener);
        let accepting = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        listener.close();
        assert_eq!(accepting.await.unwrap(), Err(TransportError::Closed));
        // The name is released and connects now fail.
        assert!(matches!(
            transport.connect("svc", None).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn connect_and_accept_through_registry() {
        let transport = MemTransport::new();
        let listener = transport.listen("svc", None).await.unwrap();
        let client = transport.connect("svc", None).await.unwrap();
        let server = listener.accept().await.unwrap();
        assert!(client.is_connected());
        assert!(server.is_connected());
        assert!(client.ping().await.is_ok());
    }

    #[tokio::test]
    async fn connection_state_tracks_close() {
        let (client, server) = MemConnection::pair();
        assert_eq!(client.state(), ConnectionState::Established);
        server.close();
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(matches!(
            client.ping().await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn invalid_endpoint_rejected() {
        let transport = MemTransport::new();
        assert!(matches!(
            transport.connect("", None).await,
            Err(TransportError::InvalidArgument(_))
        ));
        assert!(matches!(
            transport.listen("has space", None).await,
            Err(TransportError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_endpoint_rejected() {
        let transport = MemTransport::new();
        assert!(matches!(
            transport.connect("nobody-home", None).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn duplicate_bind_rejected() {
        let transport = MemTransport::new();
        let _listener = transport.listen("svc", None).await.unwrap();
        assert!(matches!(
            transport.listen("svc", None).await,
            Err(TransportError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn end_stream_walks_half_close_states() {
        let (client, server) = MemConnection::pair();
        let out = client.open_stream().await.unwrap();
        let inbound = server.accept_stream().await.unwrap();

        out.send_frame(Frame::new(
            FrameType::Data,
            FrameFlags::END_STREAM,
            Bytes::new(),
        ))
        .await
        .unwrap();
        assert_eq!(out.state(), StreamState::HalfClosedLocal);

        inbound.recv_frame().await.unwrap();
        assert_eq!(inbound.state(), StreamState::HalfClosedRemote);

        inbound
            .send_frame(Frame::new(
                FrameType::Data,
                FrameFlags::END_STREAM,
                Bytes::new(),
            ))
            .await
            .unwrap();
        assert_eq!(inbound.state(), StreamState::Closed);
        out.recv_frame().await.unwrap();
        assert_eq!(out.state(), StreamState::Closed);
    }
}
