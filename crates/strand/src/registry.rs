//! Server-side method registry: wire paths mapped to handlers.
//!
//! Handlers are byte-level async closures, one shape per call kind; the
//! typed registration helpers on `Server` wrap user functions with the
//! server's codec at registration time. The registry is built before
//! serving and read-only afterwards.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use strand_core::{
    CallKind, CancelToken, Context, Deadline, DescriptorError, Marshal, Metadata,
    MethodDescriptor, Status,
};
use tokio::sync::mpsc;

/// The ambient state handed to a handler: the request context plus the
/// method path it was dispatched under.
#[derive(Debug)]
pub struct RequestContext {
    context: Context,
    path: String,
}

impl RequestContext {
    pub(crate) fn new(context: Context, path: String) -> Self {
        RequestContext { context, path }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn metadata(&self) -> &Metadata {
        self.context.metadata()
    }

    pub fn deadline(&self) -> Option<Deadline> {
        self.context.deadline()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        self.context.cancel_token()
    }

    /// Handlers are expected to check this before long operations.
    pub fn is_cancelled(&self) -> bool {
        self.context.is_cancelled()
    }
}

/// Inbound request messages for client-streaming and bidi handlers, as raw
/// bodies.
pub struct Inbound {
    rx: mpsc::Receiver<Result<Bytes, Status>>,
}

impl Inbound {
    pub(crate) fn new(rx: mpsc::Receiver<Result<Bytes, Status>>) -> Self {
        Inbound { rx }
    }

    /// The next request body; `None` once the client half-closed.
    pub async fn next(&mut self) -> Option<Result<Bytes, Status>> {
        self.rx.recv().await
    }
}

/// Typed view over [`Inbound`], decoding with the server's codec.
pub struct Messages<Req, C> {
    inner: Inbound,
    codec: C,
    _marker: PhantomData<fn() -> Req>,
}

impl<Req, C: Marshal<Req>> Messages<Req, C> {
    pub(crate) fn new(inner: Inbound, codec: C) -> Self {
        Messages {
            inner,
            codec,
            _marker: PhantomData,
        }
    }

    pub async fn next(&mut self) -> Option<Result<Req, Status>> {
        match self.inner.next().await? {
            Ok(body) => Some(self.codec.decode(&body).map_err(Status::from)),
            Err(status) => Some(Err(status)),
        }
    }
}

pub type UnaryHandler =
    Arc<dyn Fn(RequestContext, Bytes) -> BoxFuture<'static, Result<Bytes, Status>> + Send + Sync>;
pub type ClientStreamingHandler =
    Arc<dyn Fn(RequestContext, Inbound) -> BoxFuture<'static, Result<Bytes, Status>> + Send + Sync>;
pub type ServerStreamingHandler =
    Arc<dyn Fn(RequestContext, Bytes) -> BoxStream<'static, Result<Bytes, Status>> + Send + Sync>;
pub type BidiHandler =
    Arc<dyn Fn(RequestContext, Inbound) -> BoxStream<'static, Result<Bytes, Status>> + Send + Sync>;

/// A registered handler, one variant per call pattern.
#[derive(Clone)]
pub enum MethodHandler {
    Unary(UnaryHandler),
    ClientStreaming(ClientStreamingHandler),
    ServerStreaming(ServerStreamingHandler),
    Bidi(BidiHandler),
}

impl MethodHandler {
    pub fn kind(&self) -> CallKind {
        match self {
            MethodHandler::Unary(_) => CallKind::Unary,
            MethodHandler::ClientStreaming(_) => CallKind::ClientStreaming,
            MethodHandler::ServerStreaming(_) => CallKind::ServerStreaming,
            MethodHandler::Bidi(_) => CallKind::Bidirectional,
        }
    }
}

impl fmt::Debug for MethodHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MethodHandler({:?})", self.kind())
    }
}

/// Errors from handler registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The path is already registered.
    DuplicateMethod(String),
    /// Service or method name is invalid.
    Descriptor(DescriptorError),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::DuplicateMethod(path) => {
                write!(f, "method {:?} is already registered", path)
            }
            RegistryError::Descriptor(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<DescriptorError> for RegistryError {
    fn from(e: DescriptorError) -> Self {
        RegistryError::Descriptor(e)
    }
}

/// Path-to-handler mapping. Registration takes ownership of the path.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    methods: HashMap<String, MethodHandler>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `/<service>/<method>`. The handler's
    /// variant fixes the call kind.
    pub fn register(
        &mut self,
        service: &str,
        method: &str,
        handler: MethodHandler,
    ) -> Result<(), RegistryError> {
        let descriptor = MethodDescriptor::new(service, method, handler.kind())?;
        let path = descriptor.path();
        if self.methods.contains_key(&path) {
            return Err(RegistryError::DuplicateMethod(path));
        }
        self.methods.insert(path, handler);
        Ok(())
    }

    pub fn lookup(&self, path: &str) -> Option<&MethodHandler> {
        self.methods.get(path)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("methods", &self.methods.len())
            .finish()
    }
}
