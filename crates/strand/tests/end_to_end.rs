//! End-to-end call tests over the in-memory transport.
//!
//! Every test wires a real server and client through a `MemTransport`
//! registry and drives full calls: headers, framed messages, trailers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use strand::{
    AuthInterceptor, BreakerConfig, BytesCodec, CallKind, CallOptions, CircuitBreaker, Client,
    Code, Context, Interceptor, InterceptorContext, Limits, MemTransport, MethodDescriptor,
    MetricsInterceptor, RetryInterceptor, RetryPolicy, Server, Status, Transport,
    BREAKER_STATE_KEY,
};
use tokio::task::JoinHandle;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn start_server(
    server: Server<BytesCodec>,
    transport: &MemTransport,
    endpoint: &str,
) -> JoinHandle<()> {
    let listener = transport.listen(endpoint, None).await.unwrap();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    })
}

fn bytes_client(transport: &MemTransport, endpoint: &str) -> Client<MemTransport, BytesCodec> {
    Client::new(transport.clone(), endpoint, BytesCodec)
}

fn echo_server() -> Server<BytesCodec> {
    let mut server = Server::new(BytesCodec);
    server
        .register_unary("echo.Echo", "Say", |_ctx, req: Vec<u8>| async move { Ok(req) })
        .unwrap();
    server
}

#[tokio::test]
async fn unary_happy_path() {
    init_tracing();
    let transport = MemTransport::new();
    let server = start_server(echo_server(), &transport, "echo").await;
    let client = bytes_client(&transport, "echo");

    let method = MethodDescriptor::unary("echo.Echo", "Say").unwrap();
    let response: Vec<u8> = client
        .unary(
            &Context::background(),
            &method,
            &vec![0x48u8, 0x69],
            CallOptions::new(),
        )
        .await
        .expect("echo call failed");

    assert_eq!(response, vec![0x48, 0x69]);
    server.abort();
}

#[tokio::test]
async fn unary_unknown_method_is_unimplemented() {
    init_tracing();
    let transport = MemTransport::new();
    let server = start_server(echo_server(), &transport, "unknown").await;
    let client = bytes_client(&transport, "unknown");

    let method = MethodDescriptor::unary("echo.Echo", "Missing").unwrap();
    let err = client
        .unary::<Vec<u8>, Vec<u8>>(
            &Context::background(),
            &method,
            &vec![1u8],
            CallOptions::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), Code::Unimplemented);
    server.abort();
}

#[tokio::test]
async fn unary_handler_status_reaches_client() {
    init_tracing();
    let transport = MemTransport::new();
    let mut server = Server::new(BytesCodec);
    server
        .register_unary("kv.Store", "Get", |_ctx, _req: Vec<u8>| async move {
            Err::<Vec<u8>, _>(Status::not_found("no such key"))
        })
        .unwrap();
    let server = start_server(server, &transport, "kv").await;
    let client = bytes_client(&transport, "kv");

    let method = MethodDescriptor::unary("kv.Store", "Get").unwrap();
    let err = client
        .unary::<Vec<u8>, Vec<u8>>(
            &Context::background(),
            &method,
            &vec![1u8],
            CallOptions::new(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), Code::NotFound);
    assert_eq!(err.message(), "no such key");
    server.abort();
}

#[tokio::test]
async fn deadline_exceeded_cancels_server_context() {
    init_tracing();
    let transport = MemTransport::new();

    let observed_cancel = Arc::new(Mutex::new(None::<Duration>));
    let observed = observed_cancel.clone();
    let mut server = Server::new(BytesCodec);
    server
        .register_unary("slow.Slow", "Sleep", move |ctx, _req: Vec<u8>| {
            let observed = observed.clone();
            async move {
                let start = Instant::now();
                for _ in 0..40 {
                    if ctx.is_cancelled() {
                        observed.lock().get_or_insert(start.elapsed());
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Ok::<Vec<u8>, Status>(vec![])
            }
        })
        .unwrap();
    let server = start_server(server, &transport, "slow").await;
    let client = bytes_client(&transport, "slow");

    let method = MethodDescriptor::unary("slow.Slow", "Sleep").unwrap();
    let started = Instant::now();
    let err = client
        .unary::<Vec<u8>, Vec<u8>>(
            &Context::background(),
            &method,
            &vec![0u8],
            CallOptions::new().with_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code(), Code::DeadlineExceeded);
    // The call returned within a bounded slack of the deadline.
    assert!(started.elapsed() < Duration::from_millis(500));

    // The server observed cancellation on the context shortly after the
    // deadline.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let observed = observed_cancel.lock().expect("server never saw the cancel");
    assert!(
        observed < Duration::from_millis(80),
        "server saw cancellation after {:?}",
        observed
    );
    server.abort();
}

/// Captures what the breaker put in the request metadata, as seen by an
/// interceptor earlier in the chain during reverse processing.
#[derive(Default)]
struct MetadataProbe {
    breaker_state: Mutex<Option<String>>,
}

impl Interceptor for MetadataProbe {
    fn on_response<'a>(
        &'a self,
        cx: &'a mut InterceptorContext,
    ) -> BoxFuture<'a, Result<(), Status>> {
        Box::pin(async move {
            if let Some(value) = cx.metadata.get(BREAKER_STATE_KEY) {
                *self.breaker_state.lock() = Some(value.to_string());
            }
            Ok(())
        })
    }
}

#[tokio::test]
async fn circuit_breaker_trips_and_recovers() {
    init_tracing();
    let transport = MemTransport::new();

    let healthy = Arc::new(AtomicBool::new(false));
    let invocations = Arc::new(AtomicUsize::new(0));
    let mut server = Server::new(BytesCodec);
    {
        let healthy = healthy.clone();
        let invocations = invocations.clone();
        server
            .register_unary("flaky.Flaky", "Do", move |_ctx, req: Vec<u8>| {
                let healthy = healthy.clone();
                let invocations = invocations.clone();
                async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    if healthy.load(Ordering::SeqCst) {
                        Ok(req)
                    } else {
                        Err(Status::unavailable("backend down"))
                    }
                }
            })
            .unwrap();
    }
    let server = start_server(server, &transport, "flaky").await;

    let breaker = CircuitBreaker::new(BreakerConfig {
        failure_threshold: 3,
        success_threshold: 2,
        timeout: Duration::from_millis(100),
        max_half_open_requests: 1,
    });
    let probe = Arc::new(MetadataProbe::default());
    let client = bytes_client(&transport, "flaky")
        .with_interceptor_arc(probe.clone())
        .with_interceptor_arc(breaker.clone());

    async fn flaky_call(
        client: &Client<MemTransport, BytesCodec>,
        method: &MethodDescriptor,
    ) -> Result<Vec<u8>, Status> {
        client
            .unary::<Vec<u8>, Vec<u8>>(
                &Context::background(),
                method,
                &vec![1u8],
                CallOptions::new(),
            )
            .await
    }
    let method = MethodDescriptor::unary("flaky.Flaky", "Do").unwrap();

    // Three failures trip the breaker.
    for _ in 0..3 {
        let err = flaky_call(&client, &method).await.unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    // Call four fast-fails without touching the transport and carries the
    // breaker's metadata.
    let err = flaky_call(&client, &method).await.unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    assert_eq!(probe.breaker_state.lock().as_deref(), Some("open"));

    // After the open timeout a probe goes through; two successes close it.
    healthy.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(150)).await;
    flaky_call(&client, &method)
        .await
        .expect("half-open probe should pass");
    flaky_call(&client, &method)
        .await
        .expect("second success should pass");
    assert_eq!(breaker.state(), strand::BreakerState::Closed);
    server.abort();
}

#[tokio::test]
async fn server_streaming_yields_messages_in_order() {
    init_tracing();
    let transport = MemTransport::new();
    let mut server = Server::new(BytesCodec);
    server
        .register_server_streaming("count.Counter", "Up", |_ctx, _req: Vec<u8>| {
            strand::stream! {
                for i in 0u8..3 {
                    yield Ok(vec![i]);
                }
            }
        })
        .unwrap();
    let server = start_server(server, &transport, "count").await;
    let client = bytes_client(&transport, "count");

    let method =
        MethodDescriptor::new("count.Counter", "Up", CallKind::ServerStreaming).unwrap();
    let mut stream = client
        .server_streaming::<Vec<u8>, Vec<u8>>(
            &Context::background(),
            &method,
            &vec![0u8],
            CallOptions::new(),
        )
        .await
        .unwrap();

    let mut received = Vec::new();
    while let Some(item) = stream.next().await {
        received.push(item.unwrap());
    }
    assert_eq!(received, vec![vec![0u8], vec![1], vec![2]]);
    // The sequence is single-pass and stays finished.
    assert!(stream.next().await.is_none());
    server.abort();
}

#[tokio::test]
async fn server_streaming_error_terminates_sequence() {
    init_tracing();
    let transport = MemTransport::new();
    let mut server = Server::new(BytesCodec);
    server
        .register_server_streaming("count.Counter", "Broken", |_ctx, _req: Vec<u8>| {
            strand::stream! {
                yield Ok(vec![0u8]);
                yield Err(Status::internal("lost my place"));
            }
        })
        .unwrap();
    let server = start_server(server, &transport, "count-err").await;
    let client = bytes_client(&transport, "count-err");

    let method =
        MethodDescriptor::new("count.Counter", "Broken", CallKind::ServerStreaming).unwrap();
    let mut stream = client
        .server_streaming::<Vec<u8>, Vec<u8>>(
            &Context::background(),
            &method,
            &vec![0u8],
            CallOptions::new(),
        )
        .await
        .unwrap();

    assert_eq!(stream.next().await.unwrap().unwrap(), vec![0u8]);
    let err = stream.next().await.unwrap().unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert!(stream.next().await.is_none());
    server.abort();
}

#[tokio::test]
async fn client_streaming_sums_on_the_server() {
    init_tracing();
    let transport = MemTransport::new();
    let mut server = Server::new(BytesCodec);
    server
        .register_client_streaming(
            "sum.Adder",
            "Add",
            |_ctx, mut messages: strand::Messages<Vec<u8>, BytesCodec>| async move {
                let mut total: u8 = 0;
                while let Some(item) = messages.next().await {
                    for byte in item? {
                        total = total.wrapping_add(byte);
                    }
                }
                Ok(vec![total])
            },
        )
        .unwrap();
    let server = start_server(server, &transport, "sum").await;
    let client = bytes_client(&transport, "sum");

    let method = MethodDescriptor::new("sum.Adder", "Add", CallKind::ClientStreaming).unwrap();
    let call = client
        .client_streaming::<Vec<u8>, Vec<u8>>(
            &Context::background(),
            &method,
            CallOptions::new(),
        )
        .await
        .unwrap();

    for byte in [1u8, 2, 3] {
        call.send(&vec![byte]).await.unwrap();
    }
    let response = call.finish().await.unwrap();
    assert_eq!(response, vec![6u8]);
    server.abort();
}

#[tokio::test]
async fn bidi_echo_then_cancel_unblocks_both_sides() {
    init_tracing();
    let transport = MemTransport::new();

    let server_saw_cancel = Arc::new(AtomicBool::new(false));
    let mut server = Server::new(BytesCodec);
    {
        let server_saw_cancel = server_saw_cancel.clone();
        server
            .register_bidi(
                "chat.Chat",
                "Talk",
                move |_ctx, mut messages: strand::Messages<Vec<u8>, BytesCodec>| {
                    let server_saw_cancel = server_saw_cancel.clone();
                    strand::stream! {
                        while let Some(item) = messages.next().await {
                            match item {
                                Ok(msg) => yield Ok(msg),
                                Err(status) => {
                                    if status.code() == Code::Cancelled {
                                        server_saw_cancel.store(true, Ordering::SeqCst);
                                    }
                                    break;
                                }
                            }
                        }
                    }
                },
            )
            .unwrap();
    }
    let server = start_server(server, &transport, "chat").await;
    let client = bytes_client(&transport, "chat");

    let method = MethodDescriptor::new("chat.Chat", "Talk", CallKind::Bidirectional).unwrap();
    let call = client
        .bidi::<Vec<u8>, Vec<u8>>(&Context::background(), &method, CallOptions::new())
        .await
        .unwrap();
    let (sender, mut receiver) = call.split();

    sender.send(&vec![10u8]).await.unwrap();
    sender.send(&vec![20u8]).await.unwrap();
    assert_eq!(receiver.next().await.unwrap().unwrap(), vec![10u8]);
    assert_eq!(receiver.next().await.unwrap().unwrap(), vec![20u8]);

    sender.cancel();

    // Both directions unblock with `cancelled` within a bounded time.
    let err = tokio::time::timeout(Duration::from_secs(1), receiver.next())
        .await
        .expect("receiver did not unblock")
        .unwrap()
        .unwrap_err();
    assert_eq!(err.code(), Code::Cancelled);
    let err = sender.send(&vec![30u8]).await.unwrap_err();
    assert_eq!(err.code(), Code::Cancelled);

    // The server-side handler observed the cancellation on its next read.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server_saw_cancel.load(Ordering::SeqCst));
    server.abort();
}

#[tokio::test]
async fn retry_reissues_until_success() {
    init_tracing();
    let transport = MemTransport::new();

    let failures_left = Arc::new(AtomicUsize::new(2));
    let mut server = Server::new(BytesCodec);
    {
        let failures_left = failures_left.clone();
        server
            .register_unary("retry.Retry", "Do", move |_ctx, req: Vec<u8>| {
                let failures_left = failures_left.clone();
                async move {
                    if failures_left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        n.checked_sub(1)
                    })
                    .is_ok()
                    {
                        Err(Status::unavailable("still warming up"))
                    } else {
                        Ok(req)
                    }
                }
            })
            .unwrap();
    }
    let server = start_server(server, &transport, "retry").await;

    let retry = Arc::new(RetryInterceptor::new(RetryPolicy::retries(2)));
    let client = bytes_client(&transport, "retry").with_interceptor_arc(retry.clone());

    let method = MethodDescriptor::unary("retry.Retry", "Do").unwrap();
    let response = client
        .unary::<Vec<u8>, Vec<u8>>(
            &Context::background(),
            &method,
            &vec![7u8],
            CallOptions::new(),
        )
        .await
        .expect("third attempt should succeed");
    assert_eq!(response, vec![7u8]);
    assert_eq!(retry.retries_signalled(), 2);
    server.abort();
}

#[tokio::test]
async fn retry_with_zero_attempts_behaves_as_absent() {
    init_tracing();
    let transport = MemTransport::new();
    let mut server = Server::new(BytesCodec);
    server
        .register_unary("retry.Retry", "Do", |_ctx, _req: Vec<u8>| async move {
            Err::<Vec<u8>, _>(Status::unavailable("always down"))
        })
        .unwrap();
    let server = start_server(server, &transport, "retry0").await;

    let retry = Arc::new(RetryInterceptor::new(RetryPolicy::retries(0)));
    let client = bytes_client(&transport, "retry0").with_interceptor_arc(retry.clone());

    let method = MethodDescriptor::unary("retry.Retry", "Do").unwrap();
    let err = client
        .unary::<Vec<u8>, Vec<u8>>(
            &Context::background(),
            &method,
            &vec![1u8],
            CallOptions::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
    assert_eq!(retry.retries_signalled(), 0);
    server.abort();
}

#[tokio::test]
async fn auth_interceptor_injects_credential_visible_to_handler() {
    init_tracing();
    let transport = MemTransport::new();
    let mut server = Server::new(BytesCodec);
    server
        .register_unary("auth.Auth", "Who", |ctx, _req: Vec<u8>| async move {
            match ctx.metadata().get("authorization") {
                Some(value) => Ok(value.as_bytes().to_vec()),
                None => Err(Status::unauthenticated("no credential")),
            }
        })
        .unwrap();
    let server = start_server(server, &transport, "auth").await;

    let client =
        bytes_client(&transport, "auth").with_interceptor(AuthInterceptor::bearer("tok-1"));
    let method = MethodDescriptor::unary("auth.Auth", "Who").unwrap();
    let response = client
        .unary::<Vec<u8>, Vec<u8>>(
            &Context::background(),
            &method,
            &vec![0u8],
            CallOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(response, b"Bearer tok-1".to_vec());
    server.abort();
}

#[tokio::test]
async fn auth_require_short_circuits_without_transport() {
    init_tracing();
    let transport = MemTransport::new();
    // No server behind this endpoint: a short-circuit never dials.
    let client = Client::new(transport, "nowhere", BytesCodec)
        .with_interceptor(AuthInterceptor::require("x-api-key", "secret"));

    let method = MethodDescriptor::unary("auth.Auth", "Who").unwrap();
    let err = client
        .unary::<Vec<u8>, Vec<u8>>(
            &Context::background(),
            &method,
            &vec![0u8],
            CallOptions::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);
}

#[tokio::test]
async fn metrics_interceptor_counts_calls_and_errors() {
    init_tracing();
    let transport = MemTransport::new();
    let server = start_server(echo_server(), &transport, "metrics").await;

    let metrics = Arc::new(MetricsInterceptor::new());
    let client = bytes_client(&transport, "metrics").with_interceptor_arc(metrics.clone());

    let ok_method = MethodDescriptor::unary("echo.Echo", "Say").unwrap();
    let bad_method = MethodDescriptor::unary("echo.Echo", "Missing").unwrap();
    client
        .unary::<Vec<u8>, Vec<u8>>(
            &Context::background(),
            &ok_method,
            &vec![1u8, 2],
            CallOptions::new(),
        )
        .await
        .unwrap();
    let _ = client
        .unary::<Vec<u8>, Vec<u8>>(
            &Context::background(),
            &bad_method,
            &vec![3u8],
            CallOptions::new(),
        )
        .await
        .unwrap_err();

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.requests, 2);
    assert_eq!(snapshot.completed, 2);
    assert_eq!(snapshot.errors, 1);
    assert!(snapshot.latency_ns_total > 0);
    server.abort();
}

#[tokio::test]
async fn oversized_response_rejected_at_the_cap() {
    init_tracing();
    let transport = MemTransport::new();
    let mut server = Server::new(BytesCodec);
    server
        .register_unary("big.Big", "Blob", |_ctx, req: Vec<u8>| async move {
            Ok(vec![0u8; req[0] as usize])
        })
        .unwrap();
    let server = start_server(server, &transport, "big").await;

    let limits = Limits {
        max_message_size: 16,
        ..Limits::default()
    };
    let client = bytes_client(&transport, "big").with_limits(limits);
    let method = MethodDescriptor::unary("big.Big", "Blob").unwrap();

    // A response exactly at the cap passes.
    let response = client
        .unary::<Vec<u8>, Vec<u8>>(
            &Context::background(),
            &method,
            &vec![16u8],
            CallOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(response.len(), 16);

    // One byte over fails with resource_exhausted.
    let err = client
        .unary::<Vec<u8>, Vec<u8>>(
            &Context::background(),
            &method,
            &vec![17u8],
            CallOptions::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::ResourceExhausted);
    server.abort();
}

#[tokio::test]
async fn cancelled_parent_context_cancels_the_call() {
    init_tracing();
    let transport = MemTransport::new();
    let mut server = Server::new(BytesCodec);
    server
        .register_unary("slow.Slow", "Forever", |ctx, _req: Vec<u8>| async move {
            ctx.cancel_token().cancelled().await;
            Err::<Vec<u8>, _>(Status::cancelled("handler saw cancel"))
        })
        .unwrap();
    let server = start_server(server, &transport, "parent-cancel").await;
    let client = bytes_client(&transport, "parent-cancel");

    let ctx = Context::background();
    let canceller = ctx.cancel_token().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        canceller.cancel();
    });

    let method = MethodDescriptor::unary("slow.Slow", "Forever").unwrap();
    let err = tokio::time::timeout(
        Duration::from_secs(1),
        client.unary::<Vec<u8>, Vec<u8>>(&ctx, &method, &vec![0u8], CallOptions::new()),
    )
    .await
    .expect("call did not unblock on parent cancel")
    .unwrap_err();
    assert_eq!(err.code(), Code::Cancelled);
    server.abort();
}

#[tokio::test]
async fn stream_cap_rejects_excess_streams_with_resource_exhausted() {
    init_tracing();
    let transport = MemTransport::new();
    let mut server = Server::new(BytesCodec);
    server
        .register_client_streaming(
            "sum.Adder",
            "Add",
            |_ctx, mut messages: strand::Messages<Vec<u8>, BytesCodec>| async move {
                let mut total: u8 = 0;
                while let Some(item) = messages.next().await {
                    for byte in item? {
                        total = total.wrapping_add(byte);
                    }
                }
                Ok(vec![total])
            },
        )
        .unwrap();
    let server = server.with_config(strand::ServerConfig {
        max_streams_per_connection: 1,
        ..strand::ServerConfig::default()
    });
    let server = start_server(server, &transport, "stream-cap").await;
    let client = bytes_client(&transport, "stream-cap");

    let method = MethodDescriptor::new("sum.Adder", "Add", CallKind::ClientStreaming).unwrap();
    // The first call keeps its stream open.
    let first = client
        .client_streaming::<Vec<u8>, Vec<u8>>(
            &Context::background(),
            &method,
            CallOptions::new(),
        )
        .await
        .unwrap();
    first.send(&vec![2u8]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The second stream on the same connection is over the cap.
    let second = client
        .client_streaming::<Vec<u8>, Vec<u8>>(
            &Context::background(),
            &method,
            CallOptions::new(),
        )
        .await
        .unwrap();
    let err = second.finish().await.unwrap_err();
    assert_eq!(err.code(), Code::ResourceExhausted);

    // The first call is unaffected.
    let response = first.finish().await.unwrap();
    assert_eq!(response, vec![2u8]);
    server.abort();
}

#[tokio::test]
async fn connection_cap_rejects_excess_connections() {
    init_tracing();
    let transport = MemTransport::new();
    let server = echo_server().with_config(strand::ServerConfig {
        max_connections: 1,
        ..strand::ServerConfig::default()
    });
    let server = start_server(server, &transport, "conn-cap").await;

    let method = MethodDescriptor::unary("echo.Echo", "Say").unwrap();
    let first = bytes_client(&transport, "conn-cap");
    first
        .unary::<Vec<u8>, Vec<u8>>(
            &Context::background(),
            &method,
            &vec![1u8],
            CallOptions::new(),
        )
        .await
        .expect("first connection should be served");

    // A second client means a second connection, which is over the cap.
    let second = bytes_client(&transport, "conn-cap");
    let err = second
        .unary::<Vec<u8>, Vec<u8>>(
            &Context::background(),
            &method,
            &vec![1u8],
            CallOptions::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::ResourceExhausted);
    server.abort();
}

mod typed_codecs {
    use super::*;
    use strand::{JsonCodec, ProtoCodec};

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Greeting {
        name: String,
        excited: bool,
    }

    #[tokio::test]
    async fn json_codec_round_trips_typed_messages() {
        init_tracing();
        let transport = MemTransport::new();
        let mut server = Server::new(JsonCodec);
        server
            .register_unary("greet.Greeter", "Hello", |_ctx, req: Greeting| async move {
                Ok(Greeting {
                    name: format!("hello {}", req.name),
                    excited: !req.excited,
                })
            })
            .unwrap();
        let listener = transport.listen("greet-json", None).await.unwrap();
        let server = tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        let client = Client::new(transport.clone(), "greet-json", JsonCodec);
        let method = MethodDescriptor::unary("greet.Greeter", "Hello").unwrap();
        let response: Greeting = client
            .unary(
                &Context::background(),
                &method,
                &Greeting {
                    name: "strand".to_string(),
                    excited: false,
                },
                CallOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(
            response,
            Greeting {
                name: "hello strand".to_string(),
                excited: true,
            }
        );
        server.abort();
    }

    #[derive(Clone, PartialEq, prost::Message)]
    struct Blob {
        #[prost(bytes = "vec", tag = "1")]
        payload: Vec<u8>,
    }

    #[tokio::test]
    async fn proto_codec_round_trips_typed_messages() {
        init_tracing();
        let transport = MemTransport::new();
        let mut server = Server::new(ProtoCodec);
        server
            .register_unary("blob.Blobs", "Flip", |_ctx, req: Blob| async move {
                Ok(Blob {
                    payload: req.payload.iter().rev().copied().collect(),
                })
            })
            .unwrap();
        let listener = transport.listen("blob-proto", None).await.unwrap();
        let server = tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        let client = Client::new(transport.clone(), "blob-proto", ProtoCodec);
        let method = MethodDescriptor::unary("blob.Blobs", "Flip").unwrap();
        let response: Blob = client
            .unary(
                &Context::background(),
                &method,
                &Blob {
                    payload: vec![1, 2, 3],
                },
                CallOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(response.payload, vec![3, 2, 1]);
        server.abort();
    }
}
