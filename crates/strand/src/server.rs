//! The server: accept loop, per-connection tasks, and per-stream dispatch.
//!
//! Dispatch per stream: await the headers frame, parse `:path`, look up the
//! handler (miss means `unimplemented` trailers, never anything else),
//! build a request context carrying metadata and the `grpc-timeout`
//! deadline, then drive the handler according to its call kind. A deadline
//! watchdog and a cancel-frame watcher both fire the context's token, so a
//! handler that checks its context observes cancellation promptly and any
//! later write is suppressed.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use strand_core::{
    CancelToken, Connection, Context, Frame, FrameFlags, FrameStream, FrameType, Limits, Listener,
    Marshal, MessageReassembler, Metadata, Status, TransportError, encode_response_headers,
    encode_trailers,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::call::send_message;
use crate::registry::{
    BidiHandler, ClientStreamingHandler, Inbound, Messages, MethodHandler, RegistryError,
    RequestContext, ServerStreamingHandler, ServiceRegistry, UnaryHandler,
};

/// Server-wide knobs.
#[derive(Clone, Copy, Debug)]
pub struct ServerConfig {
    pub max_connections: usize,
    pub max_streams_per_connection: usize,
    pub limits: Limits,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            max_connections: strand_core::DEFAULT_MAX_CONNECTIONS,
            max_streams_per_connection: strand_core::DEFAULT_MAX_STREAMS_PER_CONNECTION,
            limits: Limits::default(),
        }
    }
}

/// An RPC server: a registry plus the codec its typed handlers use.
///
/// Register handlers, then call [`Server::serve`]; serving consumes the
/// server, so the registry cannot change underneath in-flight dispatch.
pub struct Server<C> {
    registry: ServiceRegistry,
    config: ServerConfig,
    codec: C,
}

impl<C> Server<C>
where
    C: Clone + Send + Sync + 'static,
{
    pub fn new(codec: C) -> Self {
        Server {
            registry: ServiceRegistry::new(),
            config: ServerConfig::default(),
            codec,
        }
    }

    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Register a unary handler.
    pub fn register_unary<Req, Res, F, Fut>(
        &mut self,
        service: &str,
        method: &str,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        C: Marshal<Req> + Marshal<Res>,
        F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, Status>> + Send + 'static,
        Req: Send + 'static,
        Res: Send + 'static,
    {
        let codec = self.codec.clone();
        let handler = Arc::new(handler);
        self.registry.register(
            service,
            method,
            MethodHandler::Unary(Arc::new(move |ctx, body| {
                let codec = codec.clone();
                let handler = handler.clone();
                Box::pin(async move {
                    let request: Req = codec.decode(&body).map_err(Status::from)?;
                    let response = handler(ctx, request).await?;
                    codec.encode(&response).map_err(Status::from)
                })
            })),
        )
    }

    /// Register a client-streaming handler: many requests, one response.
    pub fn register_client_streaming<Req, Res, F, Fut>(
        &mut self,
        service: &str,
        method: &str,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        C: Marshal<Req> + Marshal<Res>,
        F: Fn(RequestContext, Messages<Req, C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, Status>> + Send + 'static,
        Req: Send + 'static,
        Res: Send + 'static,
    {
        let codec = self.codec.clone();
        let handler = Arc::new(handler);
        self.registry.register(
            service,
            method,
            MethodHandler::ClientStreaming(Arc::new(move |ctx, inbound| {
                let codec = codec.clone();
                let handler = handler.clone();
                Box::pin(async move {
                    let messages = Messages::new(inbound, codec.clone());
                    let response = handler(ctx, messages).await?;
                    codec.encode(&response).map_err(Status::from)
                })
            })),
        )
    }

    /// Register a server-streaming handler: one request, a response stream.
    pub fn register_server_streaming<Req, Res, F, St>(
        &mut self,
        service: &str,
        method: &str,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        C: Marshal<Req> + Marshal<Res>,
        F: Fn(RequestContext, Req) -> St + Send + Sync + 'static,
        St: futures::Stream<Item = Result<Res, Status>> + Send + 'static,
        Req: Send + 'static,
        Res: Send + 'static,
    {
        let codec = self.codec.clone();
        let handler = Arc::new(handler);
        self.registry.register(
            service,
            method,
            MethodHandler::ServerStreaming(Arc::new(move |ctx, body| {
                let request: Req = match codec.decode(&body) {
                    Ok(request) => request,
                    Err(e) => {
                        return futures::stream::once(async move { Err(Status::from(e)) }).boxed();
                    }
                };
                let codec = codec.clone();
                handler(ctx, request)
                    .map(move |item| item.and_then(|res| codec.encode(&res).map_err(Status::from)))
                    .boxed()
            })),
        )
    }

    /// Register a bidirectional handler.
    pub fn register_bidi<Req, Res, F, St>(
        &mut self,
        service: &str,
        method: &str,
        handler: F,
    ) -> Result<(), RegistryError>
    where
        C: Marshal<Req> + Marshal<Res>,
        F: Fn(RequestContext, Messages<Req, C>) -> St + Send + Sync + 'static,
        St: futures::Stream<Item = Result<Res, Status>> + Send + 'static,
        Req: Send + 'static,
        Res: Send + 'static,
    {
        let codec = self.codec.clone();
        let handler = Arc::new(handler);
        self.registry.register(
            service,
            method,
            MethodHandler::Bidi(Arc::new(move |ctx, inbound| {
                let messages = Messages::new(inbound, codec.clone());
                let codec = codec.clone();
                handler(ctx, messages)
                    .map(move |item| item.and_then(|res| codec.encode(&res).map_err(Status::from)))
                    .boxed()
            })),
        )
    }

    /// Register a pre-built byte-level handler.
    pub fn register_raw(
        &mut self,
        service: &str,
        method: &str,
        handler: MethodHandler,
    ) -> Result<(), RegistryError> {
        self.registry.register(service, method, handler)
    }

    /// Accept connections until the listener closes. Each connection gets a
    /// task, each stream a dispatch task; over-cap intake is answered with
    /// `resource_exhausted`.
    pub async fn serve<L: Listener>(self, listener: L) -> Result<(), Status> {
        let server = Arc::new(self);
        let active_connections = Arc::new(AtomicUsize::new(0));
        loop {
            match listener.accept().await {
                Ok(conn) => {
                    let guard = CounterGuard::acquire(&active_connections);
                    if guard.count > server.config.max_connections {
                        tracing::warn!(
                            limit = server.config.max_connections,
                            "connection limit reached"
                        );
                        tokio::spawn(reject_connection(conn, guard));
                    } else {
                        let server = server.clone();
                        tokio::spawn(async move {
                            handle_connection(server, conn, guard).await;
                        });
                    }
                }
                Err(TransportError::Closed) => return Ok(()),
                Err(TransportError::Temporary) => continue,
                Err(err) => return Err(Status::from(err)),
            }
        }
    }
}

/// Scoped increment of a shared counter.
struct CounterGuard {
    counter: Arc<AtomicUsize>,
    count: usize,
}

impl CounterGuard {
    fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        let count = counter.fetch_add(1, Ordering::AcqRel) + 1;
        CounterGuard {
            counter: counter.clone(),
            count,
        }
    }
}

impl Drop for CounterGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Answer an over-cap connection: its first stream gets a
/// `resource_exhausted` trailer, then the connection goes away.
async fn reject_connection<Conn: Connection>(conn: Conn, _guard: CounterGuard) {
    if let Ok(stream) = conn.accept_stream().await {
        let status = Status::resource_exhausted("server connection limit reached");
        let _ = send_trailers_only(&stream, &status).await;
        stream.close();
    }
    conn.close();
}

async fn handle_connection<C, Conn>(server: Arc<Server<C>>, conn: Conn, _guard: CounterGuard)
where
    C: Clone + Send + Sync + 'static,
    Conn: Connection,
{
    let active_streams = Arc::new(AtomicUsize::new(0));
    loop {
        match conn.accept_stream().await {
            Ok(stream) => {
                let guard = CounterGuard::acquire(&active_streams);
                if guard.count > server.config.max_streams_per_connection {
                    tokio::spawn(async move {
                        let status = Status::resource_exhausted("per-connection stream limit reached");
                        let _ = send_trailers_only(&stream, &status).await;
                        stream.close();
                        drop(guard);
                    });
                } else {
                    let server = server.clone();
                    tokio::spawn(async move {
                        dispatch_stream(server, stream, guard).await;
                    });
                }
            }
            Err(_) => break,
        }
    }
}

async fn dispatch_stream<C, S>(server: Arc<Server<C>>, stream: S, _guard: CounterGuard)
where
    C: Clone + Send + Sync + 'static,
    S: FrameStream,
{
    if let Err(status) = dispatch_inner(&server, &stream).await {
        let _ = send_trailers_only(&stream, &status).await;
    }
    stream.close();
}

async fn dispatch_inner<C, S>(server: &Arc<Server<C>>, stream: &S) -> Result<(), Status>
where
    C: Clone + Send + Sync + 'static,
    S: FrameStream,
{
    let first = stream.recv_frame().await.map_err(Status::from)?;
    if first.frame_type != FrameType::Headers {
        return Err(Status::internal("first frame on a stream must be headers"));
    }
    let head = strand_core::decode_request_headers(&first.payload)?;

    let handler = match server.registry.lookup(&head.path) {
        Some(handler) => handler.clone(),
        None => {
            tracing::debug!(path = %head.path, "unknown method");
            return Err(Status::unimplemented(format!(
                "unknown method {}",
                head.path
            )));
        }
    };

    let mut context = Context::background();
    context.set_metadata(head.metadata);
    if let Some(deadline) = head.deadline {
        context = context.with_deadline(deadline);
    }
    let cancel = context.cancel_token().clone();
    let request_context = RequestContext::new(context, head.path.clone());

    // The deadline fires the same token a client cancel frame does, so
    // handlers have a single thing to watch.
    let watchdog: Option<JoinHandle<()>> = head.deadline.map(|deadline| {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            deadline.timer().await;
            cancel.cancel();
        })
    });

    let limits = server.config.limits;
    let result = match handler {
        MethodHandler::Unary(f) => dispatch_unary(stream, &cancel, &limits, request_context, f).await,
        MethodHandler::ServerStreaming(f) => {
            dispatch_server_streaming(stream, &cancel, &limits, request_context, f).await
        }
        MethodHandler::ClientStreaming(f) => {
            dispatch_client_streaming(stream, &cancel, &limits, request_context, f).await
        }
        MethodHandler::Bidi(f) => {
            dispatch_bidi(stream, &cancel, &limits, request_context, f).await
        }
    };

    if let Some(watchdog) = watchdog {
        watchdog.abort();
    }
    result
}

async fn send_trailers_only<S: FrameStream>(stream: &S, status: &Status) -> Result<(), Status> {
    stream
        .send_frame(Frame::headers(
            encode_trailers(status),
            FrameFlags::END_STREAM,
        ))
        .await
        .map_err(Status::from)
}

/// What the request-reading side observed.
enum ClientEvent {
    Message(Bytes),
    HalfClosed,
    Cancelled,
}

/// Read the next inbound event. The cancel token covers both the deadline
/// watchdog and cancel frames spotted elsewhere.
async fn next_client_event<S: FrameStream>(
    stream: &S,
    reassembler: &mut MessageReassembler,
    half_closed: &mut bool,
    cancel: &CancelToken,
) -> Result<ClientEvent, Status> {
    loop {
        if let Some(message) = reassembler.next()? {
            return Ok(ClientEvent::Message(message.body));
        }
        if *half_closed {
            return Ok(ClientEvent::HalfClosed);
        }
        let frame = tokio::select! {
            biased;
            frame = stream.recv_frame() => frame,
            _ = cancel.cancelled() => return Ok(ClientEvent::Cancelled),
        };
        match frame {
            Ok(frame) => match frame.frame_type {
                FrameType::Data => {
                    reassembler.push(&frame.payload);
                    if frame.is_end_stream() {
                        *half_closed = true;
                    }
                }
                FrameType::Cancel => return Ok(ClientEvent::Cancelled),
                // Late header or metadata blocks carry nothing we dispatch on.
                FrameType::Headers | FrameType::Metadata | FrameType::Status => continue,
                FrameType::Keepalive => continue,
            },
            Err(TransportError::Canceled) => return Ok(ClientEvent::Cancelled),
            Err(err) => return Err(Status::from(err)),
        }
    }
}

/// Read the single request message of a unary or server-streaming call.
async fn read_single_request<S: FrameStream>(
    stream: &S,
    limits: &Limits,
    cancel: &CancelToken,
) -> Result<Option<Bytes>, Status> {
    let mut reassembler = MessageReassembler::new(limits.max_message_size);
    let mut half_closed = false;
    let mut body: Option<Bytes> = None;
    loop {
        match next_client_event(stream, &mut reassembler, &mut half_closed, cancel).await? {
            ClientEvent::Message(bytes) => {
                if body.is_some() {
                    return Err(Status::internal("received more than one request message"));
                }
                body = Some(bytes);
            }
            ClientEvent::HalfClosed => {
                return body
                    .ok_or_else(|| Status::invalid_argument("missing request message"))
                    .map(Some);
            }
            ClientEvent::Cancelled => return Ok(None),
        }
    }
}

/// Watch for cancel frames (or a vanished peer) while a handler runs.
fn spawn_cancel_watcher<S: FrameStream>(stream: S, cancel: CancelToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match stream.recv_frame().await {
                Ok(frame) if frame.frame_type == FrameType::Cancel => {
                    cancel.cancel();
                    return;
                }
                Ok(_) => continue,
                Err(TransportError::Closed | TransportError::ConnectionReset) => {
                    cancel.cancel();
                    return;
                }
                Err(_) => return,
            }
        }
    })
}

async fn dispatch_unary<S: FrameStream>(
    stream: &S,
    cancel: &CancelToken,
    limits: &Limits,
    request_context: RequestContext,
    handler: UnaryHandler,
) -> Result<(), Status> {
    let Some(body) = read_single_request(stream, limits, cancel).await? else {
        return Ok(());
    };
    let watcher = spawn_cancel_watcher(stream.clone(), cancel.clone());
    let result = handler(request_context, body).await;
    watcher.abort();
    write_single_response(stream, cancel, result).await
}

async fn dispatch_client_streaming<S: FrameStream>(
    stream: &S,
    cancel: &CancelToken,
    limits: &Limits,
    request_context: RequestContext,
    handler: ClientStreamingHandler,
) -> Result<(), Status> {
    let (tx, rx) = mpsc::channel(limits.producer_buffer_depth.max(1));
    let pump = spawn_request_pump(stream.clone(), cancel.clone(), *limits, tx);
    let result = handler(request_context, Inbound::new(rx)).await;
    pump.abort();
    write_single_response(stream, cancel, result).await
}

async fn dispatch_server_streaming<S: FrameStream>(
    stream: &S,
    cancel: &CancelToken,
    limits: &Limits,
    request_context: RequestContext,
    handler: ServerStreamingHandler,
) -> Result<(), Status> {
    let Some(body) = read_single_request(stream, limits, cancel).await? else {
        return Ok(());
    };
    let watcher = spawn_cancel_watcher(stream.clone(), cancel.clone());
    let responses = handler(request_context, body);
    let result = write_response_stream(stream, cancel, responses).await;
    watcher.abort();
    result
}

async fn dispatch_bidi<S: FrameStream>(
    stream: &S,
    cancel: &CancelToken,
    limits: &Limits,
    request_context: RequestContext,
    handler: BidiHandler,
) -> Result<(), Status> {
    let (tx, rx) = mpsc::channel(limits.producer_buffer_depth.max(1));
    let pump = spawn_request_pump(stream.clone(), cancel.clone(), *limits, tx);
    let responses = handler(request_context, Inbound::new(rx));
    let result = write_response_stream(stream, cancel, responses).await;
    pump.abort();
    result
}

/// Feed inbound request messages to a streaming handler, then keep watching
/// the stream for cancel frames until it goes away.
fn spawn_request_pump<S: FrameStream>(
    stream: S,
    cancel: CancelToken,
    limits: Limits,
    tx: mpsc::Sender<Result<Bytes, Status>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reassembler = MessageReassembler::new(limits.max_message_size);
        let mut half_closed = false;
        loop {
            match next_client_event(&stream, &mut reassembler, &mut half_closed, &cancel).await {
                Ok(ClientEvent::Message(bytes)) => {
                    if tx.send(Ok(bytes)).await.is_err() {
                        // Handler stopped consuming; keep watching for
                        // cancel below.
                        break;
                    }
                }
                Ok(ClientEvent::HalfClosed) => break,
                Ok(ClientEvent::Cancelled) => {
                    cancel.cancel();
                    let _ = tx.try_send(Err(Status::cancelled("call cancelled")));
                    return;
                }
                Err(status) => {
                    let _ = tx.try_send(Err(status));
                    return;
                }
            }
        }
        drop(tx);
        // The request direction is done; stay on watch for a cancel frame
        // while the handler finishes.
        loop {
            match stream.recv_frame().await {
                Ok(frame) if frame.frame_type == FrameType::Cancel => {
                    cancel.cancel();
                    return;
                }
                Ok(_) => continue,
                Err(TransportError::Closed | TransportError::ConnectionReset) => {
                    cancel.cancel();
                    return;
                }
                Err(_) => return,
            }
        }
    })
}

/// Write the single response of a unary or client-streaming call.
///
/// A response that arrives after the context was cancelled is not sent;
/// the write fails over to `cancelled` trailers so the outcome is explicit
/// on the wire.
async fn write_single_response<S: FrameStream>(
    stream: &S,
    cancel: &CancelToken,
    result: Result<Bytes, Status>,
) -> Result<(), Status> {
    if cancel.is_cancelled() {
        tracing::debug!("response ready after cancellation; failing the write");
        return send_trailers_only(stream, &Status::cancelled("call cancelled")).await;
    }
    match result {
        Ok(body) => {
            stream
                .send_frame(Frame::headers(
                    encode_response_headers(&Metadata::new()),
                    FrameFlags::empty(),
                ))
                .await
                .map_err(Status::from)?;
            send_message(stream, &body, false).await?;
            send_trailers_only(stream, &Status::ok()).await
        }
        Err(status) => send_trailers_only(stream, &status).await,
    }
}

/// Stream response messages, then trailers. A handler error becomes the
/// trailer status; once the context is cancelled, further writes fail over
/// to `cancelled` trailers.
async fn write_response_stream<S: FrameStream>(
    stream: &S,
    cancel: &CancelToken,
    mut responses: BoxStream<'_, Result<Bytes, Status>>,
) -> Result<(), Status> {
    if cancel.is_cancelled() {
        return send_trailers_only(stream, &Status::cancelled("call cancelled")).await;
    }
    stream
        .send_frame(Frame::headers(
            encode_response_headers(&Metadata::new()),
            FrameFlags::empty(),
        ))
        .await
        .map_err(Status::from)?;
    loop {
        let item = tokio::select! {
            biased;
            item = responses.next() => item,
            _ = cancel.cancelled() => {
                tracing::debug!("response stream cancelled mid-flight");
                return send_trailers_only(stream, &Status::cancelled("call cancelled")).await;
            }
        };
        match item {
            Some(Ok(body)) => {
                if cancel.is_cancelled() {
                    return send_trailers_only(stream, &Status::cancelled("call cancelled"))
                        .await;
                }
                send_message(stream, &body, false).await?;
            }
            Some(Err(status)) => return send_trailers_only(stream, &status).await,
            None => {
                let status = if cancel.is_cancelled() {
                    Status::cancelled("call cancelled")
                } else {
                    Status::ok()
                };
                return send_trailers_only(stream, &status).await;
            }
        }
    }
}
