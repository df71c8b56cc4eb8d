//! Client-side call objects for the three streaming patterns.
//!
//! Outbound messages flow through a bounded producer buffer drained by a
//! writer task; `send` suspends once the buffer is full and the transport
//! is not accepting bytes. Inbound messages arrive as a lazy, single-pass
//! sequence terminated by the trailer status.

use std::marker::PhantomData;

use bytes::Bytes;
use strand_core::{
    CancelToken, Code, Deadline, FrameStream, Marshal, MessageReassembler, Metadata, Status,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::call::{
    ResponseEvent, abort_stream, recv_event, send_half_close, send_message,
};
use crate::interceptor::{InterceptorChain, InterceptorContext};

/// Tear a stream down in the background after a local cancel trigger.
///
/// Cancellation must reach the peer as a cancel frame when it is
/// triggered, not only if the caller happens to poll the call again; the
/// bounded abort runs on its own task so `cancel()` stays synchronous.
fn spawn_abort<S: FrameStream>(stream: &S) {
    let stream = stream.clone();
    tokio::spawn(async move {
        abort_stream(&stream).await;
    });
}

/// Spawn the writer task that drains encoded messages onto the stream.
fn spawn_writer<S: FrameStream>(
    stream: S,
    mut rx: mpsc::Receiver<Bytes>,
    cancel: CancelToken,
) -> JoinHandle<Result<(), Status>> {
    tokio::spawn(async move {
        while let Some(body) = rx.recv().await {
            if cancel.is_cancelled() {
                return Err(Status::cancelled("call cancelled"));
            }
            send_message(&stream, &body, false).await?;
        }
        Ok(())
    })
}

/// Pipeline state a call object needs to finish the interceptor chain.
pub(crate) struct PipelineTail {
    pub(crate) chain: InterceptorChain,
    pub(crate) cx: InterceptorContext,
    pub(crate) ran: usize,
    pub(crate) completed: bool,
}

impl PipelineTail {
    /// Run the reverse chain with the final status; returns the status the
    /// caller should surface (an `on_response` hook may replace it).
    pub(crate) async fn complete(&mut self, status: Status, response_body: Option<Bytes>) -> Status {
        if self.completed {
            return status;
        }
        self.completed = true;
        self.cx.response_body = response_body;
        self.cx.status = Some(status.clone());
        self.chain.run_response(&mut self.cx, self.ran).await;
        self.cx.status.clone().unwrap_or(status)
    }
}

/// A client-streaming call: many requests in, one response out.
pub struct ClientStreamCall<S: FrameStream, Req, Res, C> {
    stream: S,
    codec: C,
    deadline: Option<Deadline>,
    cancel: CancelToken,
    max_message_size: usize,
    tx: Option<mpsc::Sender<Bytes>>,
    writer: JoinHandle<Result<(), Status>>,
    tail: PipelineTail,
    _marker: PhantomData<fn(Req) -> Res>,
}

impl<S, Req, Res, C> ClientStreamCall<S, Req, Res, C>
where
    S: FrameStream,
    C: Marshal<Req> + Marshal<Res>,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        stream: S,
        codec: C,
        deadline: Option<Deadline>,
        cancel: CancelToken,
        buffer_depth: usize,
        max_message_size: usize,
        tail: PipelineTail,
    ) -> Self {
        let (tx, rx) = mpsc::channel(buffer_depth.max(1));
        let writer = spawn_writer(stream.clone(), rx, cancel.clone());
        ClientStreamCall {
            stream,
            codec,
            deadline,
            cancel,
            max_message_size,
            tx: Some(tx),
            writer,
            tail,
            _marker: PhantomData,
        }
    }

    /// Queue one request message. Suspends when the producer buffer is full
    /// and the transport is not draining it.
    pub async fn send(&self, request: &Req) -> Result<(), Status> {
        if self.cancel.is_cancelled() {
            return Err(Status::cancelled("call cancelled"));
        }
        if self.deadline.is_some_and(|d| d.is_expired()) {
            return Err(Status::deadline_exceeded("deadline elapsed before send"));
        }
        let body = self.codec.encode(request).map_err(Status::from)?;
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Status::internal("send after finish"))?;
        tx.send(body)
            .await
            .map_err(|_| Status::unavailable("stream writer stopped"))
    }

    /// Half-close the sending direction and await the single response.
    pub async fn finish(mut self) -> Result<Res, Status> {
        // Dropping the producer handle lets the writer drain and exit.
        self.tx = None;
        let drained = match (&mut self.writer).await {
            Ok(result) => result,
            Err(join_err) => Err(Status::internal(format!("writer task failed: {}", join_err))),
        };
        if let Err(status) = drained {
            abort_stream(&self.stream).await;
            return Err(self.tail.complete(status, None).await);
        }
        if let Err(status) = send_half_close(&self.stream).await {
            abort_stream(&self.stream).await;
            return Err(self.tail.complete(status, None).await);
        }

        let response = read_single_response(
            &self.stream,
            self.max_message_size,
            self.deadline,
            &self.cancel,
        )
        .await;
        let (body, status) = match response {
            Ok((body, status)) => {
                self.stream.close();
                (body, status)
            }
            Err(status) => {
                abort_stream(&self.stream).await;
                (None, status)
            }
        };

        let mut decoded: Option<Res> = None;
        let mut status = status;
        if status.is_ok() {
            match body.as_ref() {
                Some(bytes) => match self.codec.decode(bytes) {
                    Ok(value) => decoded = Some(value),
                    Err(e) => status = Status::from(e),
                },
                None => status = Status::internal("response missing message body"),
            }
        }
        let status = self.tail.complete(status, body).await;
        match (status.is_ok(), decoded) {
            (true, Some(value)) => Ok(value),
            (true, None) => Err(Status::internal("response missing message body")),
            (false, _) => Err(status),
        }
    }

    /// Abort the call from the sending side: fires the token and sends the
    /// peer a cancel frame within a bounded wait.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
            spawn_abort(&self.stream);
        }
    }
}

/// Await exactly one response message plus trailers.
async fn read_single_response<S: FrameStream>(
    stream: &S,
    max_message_size: usize,
    deadline: Option<Deadline>,
    cancel: &CancelToken,
) -> Result<(Option<Bytes>, Status), Status> {
    let mut reassembler = MessageReassembler::new(max_message_size);
    let mut body: Option<Bytes> = None;
    loop {
        match recv_event(stream, &mut reassembler, deadline, cancel).await? {
            ResponseEvent::InitialMetadata(_) => {}
            ResponseEvent::Message(message) => {
                if body.is_some() {
                    return Err(Status::internal("received more than one response message"));
                }
                body = Some(message.body);
            }
            ResponseEvent::Trailers(status) => return Ok((body, status)),
            ResponseEvent::PeerCancel => {
                return Err(Status::cancelled("peer cancelled the stream"));
            }
        }
    }
}

/// A lazy, single-pass sequence of inbound response messages.
///
/// Yields decoded messages until the trailer status arrives; a non-ok
/// trailer (or any local abort) terminates the sequence with that error.
pub struct InboundStream<S: FrameStream, Res, C> {
    stream: S,
    codec: C,
    reassembler: MessageReassembler,
    deadline: Option<Deadline>,
    cancel: CancelToken,
    tail: PipelineTail,
    initial_metadata: Option<Metadata>,
    finished: bool,
    _marker: PhantomData<fn() -> Res>,
}

impl<S, Res, C> InboundStream<S, Res, C>
where
    S: FrameStream,
    C: Marshal<Res>,
{
    pub(crate) fn new(
        stream: S,
        codec: C,
        deadline: Option<Deadline>,
        cancel: CancelToken,
        max_message_size: usize,
        tail: PipelineTail,
    ) -> Self {
        InboundStream {
            stream,
            codec,
            reassembler: MessageReassembler::new(max_message_size),
            deadline,
            cancel,
            tail,
            initial_metadata: None,
            finished: false,
            _marker: PhantomData,
        }
    }

    /// The next message, or `None` at a clean end of stream.
    pub async fn next(&mut self) -> Option<Result<Res, Status>> {
        if self.finished {
            return None;
        }
        loop {
            match recv_event(&self.stream, &mut self.reassembler, self.deadline, &self.cancel)
                .await
            {
                Ok(ResponseEvent::InitialMetadata(metadata)) => {
                    self.initial_metadata.get_or_insert(metadata);
                }
                Ok(ResponseEvent::Message(message)) => match self.codec.decode(&message.body) {
                    Ok(value) => return Some(Ok(value)),
                    Err(e) => return Some(Err(self.fail(Status::from(e)).await)),
                },
                Ok(ResponseEvent::Trailers(status)) => {
                    self.finished = true;
                    self.stream.close();
                    let status = self.tail.complete(status, None).await;
                    if status.is_ok() {
                        return None;
                    }
                    return Some(Err(status));
                }
                Ok(ResponseEvent::PeerCancel) => {
                    return Some(Err(
                        self.fail(Status::cancelled("peer cancelled the stream")).await
                    ));
                }
                Err(status) => return Some(Err(self.fail(status).await)),
            }
        }
    }

    /// Response headers observed before the first message, if any.
    pub fn initial_metadata(&self) -> Option<&Metadata> {
        self.initial_metadata.as_ref()
    }

    /// Abort the call from the receiving side: fires the token and sends
    /// the peer a cancel frame within a bounded wait.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
            spawn_abort(&self.stream);
        }
    }

    async fn fail(&mut self, status: Status) -> Status {
        self.finished = true;
        if matches!(status.code(), Code::Cancelled | Code::DeadlineExceeded) {
            abort_stream(&self.stream).await;
        } else {
            self.stream.close();
        }
        self.tail.complete(status.clone(), None).await
    }
}

impl<S: FrameStream, Res, C> Drop for InboundStream<S, Res, C> {
    fn drop(&mut self) {
        // A dropped iterator releases the stream; the peer sees it closed.
        if !self.finished {
            self.stream.close();
        }
    }
}

/// The sending half of a bidirectional call.
pub struct BidiSender<S: FrameStream, Req, C> {
    stream: S,
    codec: C,
    deadline: Option<Deadline>,
    cancel: CancelToken,
    tx: Option<mpsc::Sender<Bytes>>,
    writer: JoinHandle<Result<(), Status>>,
    _marker: PhantomData<fn(Req)>,
}

impl<S, Req, C> BidiSender<S, Req, C>
where
    S: FrameStream,
    C: Marshal<Req>,
{
    pub(crate) fn new(
        stream: S,
        codec: C,
        deadline: Option<Deadline>,
        cancel: CancelToken,
        buffer_depth: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(buffer_depth.max(1));
        let writer = spawn_writer(stream.clone(), rx, cancel.clone());
        BidiSender {
            stream,
            codec,
            deadline,
            cancel,
            tx: Some(tx),
            writer,
            _marker: PhantomData,
        }
    }

    pub async fn send(&self, request: &Req) -> Result<(), Status> {
        if self.cancel.is_cancelled() {
            return Err(Status::cancelled("call cancelled"));
        }
        if self.deadline.is_some_and(|d| d.is_expired()) {
            return Err(Status::deadline_exceeded("deadline elapsed before send"));
        }
        let body = self.codec.encode(request).map_err(Status::from)?;
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Status::internal("send after finish"))?;
        tx.send(body)
            .await
            .map_err(|_| Status::unavailable("stream writer stopped"))
    }

    /// Half-close this direction. The receiving half keeps running.
    pub async fn finish(mut self) -> Result<(), Status> {
        self.tx = None;
        let drained = match (&mut self.writer).await {
            Ok(result) => result,
            Err(join_err) => Err(Status::internal(format!("writer task failed: {}", join_err))),
        };
        drained?;
        send_half_close(&self.stream).await
    }

    /// Abort the whole call; both directions unblock with `cancelled` and
    /// the peer sees a cancel frame.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
            spawn_abort(&self.stream);
        }
    }
}

/// A bidirectional call: independent sending and receiving directions.
///
/// The call completes when both directions have closed; cancelling either
/// half unblocks both.
pub struct BidiCall<S: FrameStream, Req, Res, C> {
    pub(crate) sender: BidiSender<S, Req, C>,
    pub(crate) receiver: InboundStream<S, Res, C>,
}

impl<S, Req, Res, C> BidiCall<S, Req, Res, C>
where
    S: FrameStream,
    C: Marshal<Req> + Marshal<Res>,
{
    /// Split into independently owned halves.
    pub fn split(self) -> (BidiSender<S, Req, C>, InboundStream<S, Res, C>) {
        (self.sender, self.receiver)
    }

    /// Abort the whole call.
    pub fn cancel(&self) {
        self.sender.cancel();
    }
}
