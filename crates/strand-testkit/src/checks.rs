//! The individual contract checks.

use strand_core::{Connection, FrameStream, FrameType, Listener, Transport, TransportError};

use crate::{TestResult, connected_pair, data_frame, expect_frame, headers_frame, within};

macro_rules! try_check {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(result) => return result,
        }
    };
}

/// connect → accept → open → headers + data → close, end to end.
pub async fn lifecycle<T: Transport>(transport: &T, endpoint: &str) -> TestResult {
    let (client, server, listener) = try_check!(connected_pair(transport, endpoint).await);

    let out = match within("open_stream", client.open_stream()).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return TestResult::fail(format!("open_stream failed: {}", e)),
        Err(r) => return r,
    };
    let inbound = match within("accept_stream", server.accept_stream()).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return TestResult::fail(format!("accept_stream failed: {}", e)),
        Err(r) => return r,
    };

    // Obligation: a fresh stream accepts at least one headers frame and one
    // data frame before any `Closed`.
    if let Err(e) = out.send_frame(headers_frame()).await {
        return TestResult::fail(format!("headers frame rejected: {}", e));
    }
    if let Err(e) = out.send_frame(data_frame(b"ping", true)).await {
        return TestResult::fail(format!("data frame rejected: {}", e));
    }

    let frame = match within("recv headers", inbound.recv_frame()).await {
        Ok(Ok(frame)) => frame,
        Ok(Err(e)) => return TestResult::fail(format!("recv failed: {}", e)),
        Err(r) => return r,
    };
    if frame.frame_type != FrameType::Headers {
        return TestResult::fail(format!("expected headers first, got {:?}", frame.frame_type));
    }
    let frame = match within("recv data", inbound.recv_frame()).await {
        Ok(Ok(frame)) => frame,
        Ok(Err(e)) => return TestResult::fail(format!("recv failed: {}", e)),
        Err(r) => return r,
    };
    if !expect_frame(&frame, FrameType::Data, b"ping") {
        return TestResult::fail("data frame corrupted in flight");
    }

    out.close();
    inbound.close();
    client.close();
    server.close();
    listener.close();
    TestResult::pass()
}

/// Frames on one stream arrive in send order.
pub async fn frame_order<T: Transport>(transport: &T, endpoint: &str) -> TestResult {
    let (client, server, listener) = try_check!(connected_pair(transport, endpoint).await);
    let out = match client.open_stream().await {
        Ok(stream) => stream,
        Err(e) => return TestResult::fail(format!("open_stream failed: {}", e)),
    };
    let inbound = match within("accept_stream", server.accept_stream()).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return TestResult::fail(format!("accept_stream failed: {}", e)),
        Err(r) => return r,
    };

    for i in 0..16u8 {
        if let Err(e) = out.send_frame(data_frame(&[i], false)).await {
            return TestResult::fail(format!("send #{} failed: {}", i, e));
        }
    }
    for i in 0..16u8 {
        let frame = match within("ordered recv", inbound.recv_frame()).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => return TestResult::fail(format!("recv #{} failed: {}", i, e)),
            Err(r) => return r,
        };
        if frame.payload.as_ref() != [i] {
            return TestResult::fail(format!(
                "frame #{} out of order: got {:?}",
                i,
                frame.payload.as_ref()
            ));
        }
    }
    listener.close();
    TestResult::pass()
}

/// Reads on a locally closed stream return `Closed`, never a partial frame.
pub async fn closed_stream_reads<T: Transport>(transport: &T, endpoint: &str) -> TestResult {
    let (client, server, listener) = try_check!(connected_pair(transport, endpoint).await);
    let out = match client.open_stream().await {
        Ok(stream) => stream,
        Err(e) => return TestResult::fail(format!("open_stream failed: {}", e)),
    };
    let _inbound = match within("accept_stream", server.accept_stream()).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return TestResult::fail(format!("accept_stream failed: {}", e)),
        Err(r) => return r,
    };

    out.close();
    match within("recv on closed", out.recv_frame()).await {
        Ok(Err(TransportError::Closed)) => {}
        Ok(Err(other)) => {
            return TestResult::fail(format!("expected Closed, got {:?}", other));
        }
        Ok(Ok(_)) => return TestResult::fail("read a frame from a closed stream"),
        Err(r) => return r,
    }
    listener.close();
    TestResult::pass()
}

/// `cancel` is idempotent and asynchronous; subsequent reads return
/// `Canceled`.
pub async fn cancel_idempotent<T: Transport>(transport: &T, endpoint: &str) -> TestResult {
    let (client, server, listener) = try_check!(connected_pair(transport, endpoint).await);
    let out = match client.open_stream().await {
        Ok(stream) => stream,
        Err(e) => return TestResult::fail(format!("open_stream failed: {}", e)),
    };
    let _inbound = match within("accept_stream", server.accept_stream()).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return TestResult::fail(format!("accept_stream failed: {}", e)),
        Err(r) => return r,
    };

    try_check!(within("first cancel", out.cancel()).await);
    try_check!(within("second cancel", out.cancel()).await);

    match within("recv after cancel", out.recv_frame()).await {
        Ok(Err(TransportError::Canceled)) => {}
        Ok(other) => {
            return TestResult::fail(format!("expected Canceled after cancel, got {:?}", other));
        }
        Err(r) => return r,
    }
    listener.close();
    TestResult::pass()
}

/// Closing a connection closes all of its open streams with `Closed`.
pub async fn connection_close_cascades<T: Transport>(transport: &T, endpoint: &str) -> TestResult {
    let (client, server, listener) = try_check!(connected_pair(transport, endpoint).await);
    let out = match client.open_stream().await {
        Ok(stream) => stream,
        Err(e) => return TestResult::fail(format!("open_stream failed: {}", e)),
    };
    let inbound = match within("accept_stream", server.accept_stream()).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return TestResult::fail(format!("accept_stream failed: {}", e)),
        Err(r) => return r,
    };

    let pending = tokio::spawn(async move { inbound.recv_frame().await });
    tokio::task::yield_now().await;
    client.close();

    match within("blocked read unblocks", pending).await {
        Ok(Ok(Err(TransportError::Closed))) => {}
        Ok(Ok(other)) => {
            return TestResult::fail(format!(
                "peer read should see Closed after connection close, got {:?}",
                other
            ));
        }
        Ok(Err(join)) => return TestResult::fail(format!("reader task died: {}", join)),
        Err(r) => return r,
    }
    match out.send_frame(data_frame(b"x", false)).await {
        Err(TransportError::Closed) => {}
        other => {
            return TestResult::fail(format!(
                "send on closed connection should see Closed, got {:?}",
                other
            ));
        }
    }
    listener.close();
    TestResult::pass()
}

/// A closed listener unblocks pending accepts with `Closed`.
pub async fn listener_close_unblocks<T: Transport>(transport: &T, endpoint: &str) -> TestResult {
    let listener = match transport.listen(endpoint, None).await {
        Ok(listener) => listener,
        Err(e) => return TestResult::fail(format!("listen failed: {}", e)),
    };
    let listener = std::sync::Arc::new(listener);
    let accepting = {
        let listener = listener.clone();
        tokio::spawn(async move { listener.accept().await.map(|_| ()) })
    };
    tokio::task::yield_now().await;
    listener.close();

    match within("accept unblocks", accepting).await {
        Ok(Ok(Err(TransportError::Closed))) => TestResult::pass(),
        Ok(Ok(other)) => TestResult::fail(format!(
            "accept after close should see Closed, got {:?}",
            other
        )),
        Ok(Err(join)) => TestResult::fail(format!("accept task died: {}", join)),
        Err(r) => r,
    }
}

/// Invalid endpoints map to `InvalidArgument`; unreachable ones must not.
pub async fn error_mapping<T: Transport>(transport: &T, endpoint: &str) -> TestResult {
    match transport.connect("", None).await {
        Err(TransportError::InvalidArgument(_)) => {}
        Err(other) => {
            return TestResult::fail(format!(
                "empty endpoint should be InvalidArgument, got {:?}",
                other
            ));
        }
        Ok(_) => return TestResult::fail("connect to empty endpoint succeeded"),
    }
    match transport.connect(endpoint, None).await {
        Err(
            TransportError::NotConnected
            | TransportError::Closed
            | TransportError::Timeout
            | TransportError::ConnectionReset,
        ) => TestResult::pass(),
        Err(other) => TestResult::fail(format!(
            "unreachable endpoint mapped to unexpected kind {:?}",
            other
        )),
        Ok(_) => TestResult::fail("connect to unreachable endpoint succeeded"),
    }
}

/// Dropping an unread stream must not wedge the connection.
pub async fn dropped_stream_cleanup<T: Transport>(transport: &T, endpoint: &str) -> TestResult {
    let (client, server, listener) = try_check!(connected_pair(transport, endpoint).await);

    {
        let out = match client.open_stream().await {
            Ok(stream) => stream,
            Err(e) => return TestResult::fail(format!("open_stream failed: {}", e)),
        };
        let inbound = match within("accept_stream", server.accept_stream()).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return TestResult::fail(format!("accept_stream failed: {}", e)),
            Err(r) => return r,
        };
        if let Err(e) = inbound.send_frame(data_frame(b"unread", false)).await {
            return TestResult::fail(format!("peer send failed: {}", e));
        }
        // Drop both ends without ever reading.
        drop(out);
        drop(inbound);
    }

    // The connection still carries fresh streams.
    let out = match client.open_stream().await {
        Ok(stream) => stream,
        Err(e) => return TestResult::fail(format!("open after drop failed: {}", e)),
    };
    let inbound = match within("accept after drop", server.accept_stream()).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return TestResult::fail(format!("accept after drop failed: {}", e)),
        Err(r) => return r,
    };
    if let Err(e) = out.send_frame(data_frame(b"fresh", true)).await {
        return TestResult::fail(format!("send on fresh stream failed: {}", e));
    }
    match within("recv on fresh stream", inbound.recv_frame()).await {
        Ok(Ok(frame)) if frame.payload.as_ref() == b"fresh" => {}
        Ok(other) => return TestResult::fail(format!("fresh stream broken: {:?}", other)),
        Err(r) => return r,
    }
    listener.close();
    TestResult::pass()
}
