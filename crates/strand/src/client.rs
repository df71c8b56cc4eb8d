//! The client: connection handling, deadline resolution, and the four call
//! entry points.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use strand_core::{
    CallKind, CancelToken, Code, Connection, Context, Deadline, FrameStream, Limits, Marshal,
    MessageReassembler, Metadata, MethodDescriptor, Status, TlsConfig, Transport,
};
use tokio::sync::Mutex as AsyncMutex;

use crate::call::{
    CallState, ResponseEvent, abort_stream, recv_event, send_message, send_request_headers,
};
use crate::interceptor::{Interceptor, InterceptorChain, InterceptorContext};
use crate::streaming::{BidiCall, BidiSender, ClientStreamCall, InboundStream, PipelineTail};

/// The stream type a transport's connections produce.
pub type StreamOf<T> = <<T as Transport>::Conn as Connection>::Stream;

/// Per-call options. Deadline resolution order: explicit deadline, then
/// explicit timeout, then the parent context's deadline, then the client's
/// default timeout.
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    pub deadline: Option<Deadline>,
    pub timeout: Option<Duration>,
    pub metadata: Metadata,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// An RPC client over one endpoint.
///
/// The client owns its transport and at most one idle connection, re-dialed
/// lazily when it drops. An in-flight call exclusively owns its stream.
pub struct Client<T: Transport, C> {
    transport: T,
    endpoint: String,
    authority: String,
    tls: Option<TlsConfig>,
    codec: C,
    chain: InterceptorChain,
    limits: Limits,
    default_timeout: Option<Duration>,
    conn: AsyncMutex<Option<T::Conn>>,
}

impl<T, C> Client<T, C>
where
    T: Transport,
    C: Clone + Send + Sync + 'static,
{
    pub fn new(transport: T, endpoint: impl Into<String>, codec: C) -> Self {
        let endpoint = endpoint.into();
        Client {
            authority: endpoint.clone(),
            transport,
            endpoint,
            tls: None,
            codec,
            chain: InterceptorChain::new(),
            limits: Limits::default(),
            default_timeout: None,
            conn: AsyncMutex::new(None),
        }
    }

    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = authority.into();
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn with_interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.chain.push(interceptor);
        self
    }

    pub fn with_interceptor_arc(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.chain.push_arc(interceptor);
        self
    }

    /// The connection, dialing if the cached one is gone. The lock is never
    /// held across the dial itself.
    async fn connection(&self) -> Result<T::Conn, Status> {
        {
            let cached = self.conn.lock().await;
            if let Some(conn) = cached.as_ref() {
                if conn.is_connected() {
                    return Ok(conn.clone());
                }
            }
        }
        let conn = self
            .transport
            .connect(&self.endpoint, self.tls.as_ref())
            .await
            .map_err(Status::from)?;
        let mut cached = self.conn.lock().await;
        *cached = Some(conn.clone());
        Ok(conn)
    }

    fn resolve_deadline(&self, ctx: &Context, options: &CallOptions) -> Option<Deadline> {
        options
            .deadline
            .or_else(|| options.timeout.map(Deadline::after))
            .or(ctx.deadline())
            .or_else(|| self.default_timeout.map(Deadline::after))
    }

    fn attempt_metadata(&self, ctx: &Context, options: &CallOptions) -> Metadata {
        let mut metadata = ctx.metadata().clone();
        metadata.merge(&options.metadata);
        metadata
    }

    async fn open_call_stream(&self) -> Result<StreamOf<T>, Status> {
        let conn = self.connection().await?;
        conn.open_stream().await.map_err(Status::from)
    }

    /// Issue a unary call.
    ///
    /// Runs the interceptor chain forward, drives the request over one
    /// stream, decodes, runs the chain in reverse, and re-issues the whole
    /// attempt when the retry interceptor asks for it (carrying the original
    /// deadline, never a fresh one).
    pub async fn unary<Req, Res>(
        &self,
        ctx: &Context,
        method: &MethodDescriptor,
        request: &Req,
        options: CallOptions,
    ) -> Result<Res, Status>
    where
        C: Marshal<Req> + Marshal<Res>,
    {
        if method.kind() != CallKind::Unary {
            return Err(Status::invalid_argument(format!(
                "{} is not a unary method",
                method
            )));
        }
        let deadline = self.resolve_deadline(ctx, &options);
        let mut attempt: u32 = 0;
        loop {
            let cancel = ctx.cancel_token().child();
            let mut cx =
                InterceptorContext::new(method.path(), self.attempt_metadata(ctx, &options), attempt);
            let result = self
                .unary_attempt(&mut cx, request, deadline, &cancel)
                .await;
            let deadline_left = deadline.is_none_or(|d| !d.is_expired());
            if cx.retry_requested && deadline_left && !ctx.is_cancelled() {
                attempt += 1;
                tracing::debug!(
                    method = %cx.method,
                    attempt,
                    "re-issuing call at retry interceptor's request"
                );
                continue;
            }
            return result;
        }
    }

    async fn unary_attempt<Req, Res>(
        &self,
        cx: &mut InterceptorContext,
        request: &Req,
        deadline: Option<Deadline>,
        cancel: &CancelToken,
    ) -> Result<Res, Status>
    where
        C: Marshal<Req> + Marshal<Res>,
    {
        let state = CallState::Start.advance(CallState::Encoding)?;
        let body = self.codec.encode(request).map_err(Status::from)?;
        cx.request_body = Some(body.clone());

        let ran = self.chain.run_request(cx).await;
        if cx.status.is_some() {
            // Short-circuit: the transport is skipped, reverse processing
            // still covers everything that ran.
            self.chain.run_response(cx, ran).await;
            let status = cx.status.clone().unwrap_or_else(Status::ok);
            return Err(status);
        }

        let state = state.advance(CallState::Sending)?;
        let outcome = self
            .unary_transport(&cx.method, &cx.metadata, &body, deadline, cancel, state)
            .await;
        let (response_body, status) = match outcome {
            Ok((response_body, status)) => (response_body, status),
            Err(status) => (None, status),
        };

        // Decode before the reverse chain so interceptors see the final
        // status of the decode as well.
        let mut decoded: Option<Res> = None;
        let mut status = status;
        if status.is_ok() {
            match response_body.as_ref() {
                Some(bytes) => match self.codec.decode(bytes) {
                    Ok(value) => decoded = Some(value),
                    Err(e) => status = Status::from(e),
                },
                None => status = Status::internal("response missing message body"),
            }
        }
        cx.response_body = response_body;
        cx.status = Some(status);
        self.chain.run_response(cx, ran).await;

        let status = cx.status.clone().unwrap_or_else(Status::ok);
        match (status.is_ok(), decoded) {
            (true, Some(value)) => Ok(value),
            (true, None) => Err(Status::internal("response missing message body")),
            (false, _) => Err(status),
        }
    }

    /// The transport phase of a unary attempt: open, send, await trailers.
    async fn unary_transport(
        &self,
        path: &str,
        metadata: &Metadata,
        body: &Bytes,
        deadline: Option<Deadline>,
        cancel: &CancelToken,
        state: CallState,
    ) -> Result<(Option<Bytes>, Status), Status> {
        if deadline.is_some_and(|d| d.is_expired()) {
            let state = state.advance(CallState::Cancelling)?;
            state.advance(CallState::Failed(Code::DeadlineExceeded))?;
            return Err(Status::deadline_exceeded("deadline expired before send"));
        }
        if cancel.is_cancelled() {
            let state = state.advance(CallState::Cancelling)?;
            state.advance(CallState::Failed(Code::Cancelled))?;
            return Err(Status::cancelled("call cancelled before send"));
        }

        let stream = match self.open_call_stream().await {
            Ok(stream) => stream,
            Err(status) => {
                state.advance(CallState::Failed(status.code()))?;
                return Err(status);
            }
        };

        let sent: Result<(), Status> = async {
            send_request_headers(&stream, path, &self.authority, metadata, deadline).await?;
            send_message(&stream, body, true).await
        }
        .await;
        if let Err(status) = sent {
            abort_stream(&stream).await;
            state.advance(CallState::Failed(status.code()))?;
            return Err(status);
        }

        let state = state.advance(CallState::AwaitingResponse)?;
        let mut reassembler = MessageReassembler::new(self.limits.max_message_size);
        let mut response_body: Option<Bytes> = None;
        loop {
            match recv_event(&stream, &mut reassembler, deadline, cancel).await {
                Ok(ResponseEvent::InitialMetadata(_)) => {}
                Ok(ResponseEvent::Message(message)) => {
                    if response_body.is_some() {
                        abort_stream(&stream).await;
                        state.advance(CallState::Failed(Code::Internal))?;
                        return Err(Status::internal(
                            "received more than one response message",
                        ));
                    }
                    response_body = Some(message.body);
                }
                Ok(ResponseEvent::Trailers(status)) => {
                    stream.close();
                    state.advance(CallState::Decoding)?;
                    return Ok((response_body, status));
                }
                Ok(ResponseEvent::PeerCancel) => {
                    stream.close();
                    state.advance(CallState::Failed(Code::Cancelled))?;
                    return Err(Status::cancelled("peer cancelled the stream"));
                }
                Err(status) => {
                    let code = status.code();
                    if matches!(code, Code::DeadlineExceeded | Code::Cancelled) {
                        // Local interruption: tell the peer, then release
                        // the stream within a bounded wait.
                        let state = state.advance(CallState::Cancelling)?;
                        abort_stream(&stream).await;
                        state.advance(CallState::Failed(code))?;
                    } else {
                        stream.close();
                        state.advance(CallState::Failed(code))?;
                    }
                    return Err(status);
                }
            }
        }
    }

    /// Start a client-streaming call: send many, then await one response.
    pub async fn client_streaming<Req, Res>(
        &self,
        ctx: &Context,
        method: &MethodDescriptor,
        options: CallOptions,
    ) -> Result<ClientStreamCall<StreamOf<T>, Req, Res, C>, Status>
    where
        C: Marshal<Req> + Marshal<Res>,
    {
        if method.kind() != CallKind::ClientStreaming {
            return Err(Status::invalid_argument(format!(
                "{} is not a client-streaming method",
                method
            )));
        }
        let deadline = self.resolve_deadline(ctx, &options);
        let cancel = ctx.cancel_token().child();
        let cx =
            InterceptorContext::new(method.path(), self.attempt_metadata(ctx, &options), 0);
        let (stream, tail) = self.start_streaming(cx, deadline).await?;
        Ok(ClientStreamCall::new(
            stream,
            self.codec.clone(),
            deadline,
            cancel,
            self.limits.producer_buffer_depth,
            self.limits.max_message_size,
            tail,
        ))
    }

    /// Issue a server-streaming call: one request, a lazy response sequence.
    pub async fn server_streaming<Req, Res>(
        &self,
        ctx: &Context,
        method: &MethodDescriptor,
        request: &Req,
        options: CallOptions,
    ) -> Result<InboundStream<StreamOf<T>, Res, C>, Status>
    where
        C: Marshal<Req> + Marshal<Res>,
    {
        if method.kind() != CallKind::ServerStreaming {
            return Err(Status::invalid_argument(format!(
                "{} is not a server-streaming method",
                method
            )));
        }
        let deadline = self.resolve_deadline(ctx, &options);
        let cancel = ctx.cancel_token().child();
        let body = self.codec.encode(request).map_err(Status::from)?;
        let mut cx =
            InterceptorContext::new(method.path(), self.attempt_metadata(ctx, &options), 0);
        cx.request_body = Some(body.clone());
        let (stream, tail) = self.start_streaming(cx, deadline).await?;
        if let Err(status) = send_message(&stream, &body, true).await {
            abort_stream(&stream).await;
            let mut tail = tail;
            return Err(tail.complete(status, None).await);
        }
        Ok(InboundStream::new(
            stream,
            self.codec.clone(),
            deadline,
            cancel,
            self.limits.max_message_size,
            tail,
        ))
    }

    /// Open a bidirectional call.
    pub async fn bidi<Req, Res>(
        &self,
        ctx: &Context,
        method: &MethodDescriptor,
        options: CallOptions,
    ) -> Result<BidiCall<StreamOf<T>, Req, Res, C>, Status>
    where
        C: Marshal<Req> + Marshal<Res>,
    {
        if method.kind() != CallKind::Bidirectional {
            return Err(Status::invalid_argument(format!(
                "{} is not a bidirectional method",
                method
            )));
        }
        let deadline = self.resolve_deadline(ctx, &options);
        let cancel = ctx.cancel_token().child();
        let cx =
            InterceptorContext::new(method.path(), self.attempt_metadata(ctx, &options), 0);
        let (stream, tail) = self.start_streaming(cx, deadline).await?;
        let sender = BidiSender::new(
            stream.clone(),
            self.codec.clone(),
            deadline,
            cancel.clone(),
            self.limits.producer_buffer_depth,
        );
        let receiver = InboundStream::new(
            stream,
            self.codec.clone(),
            deadline,
            cancel,
            self.limits.max_message_size,
            tail,
        );
        Ok(BidiCall { sender, receiver })
    }

    /// Shared start of every streaming call: forward chain, stream open,
    /// request headers. Returns the pipeline tail the call object completes
    /// later.
    async fn start_streaming(
        &self,
        mut cx: InterceptorContext,
        deadline: Option<Deadline>,
    ) -> Result<(StreamOf<T>, PipelineTail), Status> {
        let ran = self.chain.run_request(&mut cx).await;
        if cx.status.is_some() {
            self.chain.run_response(&mut cx, ran).await;
            return Err(cx.status.unwrap_or_else(Status::ok));
        }
        if deadline.is_some_and(|d| d.is_expired()) {
            cx.status = Some(Status::deadline_exceeded("deadline expired before send"));
            self.chain.run_response(&mut cx, ran).await;
            return Err(cx.status.unwrap_or_else(Status::ok));
        }

        let stream = match self.open_call_stream().await {
            Ok(stream) => stream,
            Err(status) => {
                cx.status = Some(status);
                self.chain.run_response(&mut cx, ran).await;
                return Err(cx.status.unwrap_or_else(Status::ok));
            }
        };
        if let Err(status) =
            send_request_headers(&stream, &cx.method, &self.authority, &cx.metadata, deadline)
                .await
        {
            abort_stream(&stream).await;
            cx.status = Some(status);
            self.chain.run_response(&mut cx, ran).await;
            return Err(cx.status.unwrap_or_else(Status::ok));
        }

        let tail = PipelineTail {
            chain: self.chain.clone(),
            cx,
            ran,
            completed: false,
        };
        Ok((stream, tail))
    }
}
