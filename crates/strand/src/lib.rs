#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

mod breaker;
mod call;
mod client;
mod interceptor;
mod interceptors;
mod registry;
mod server;
mod streaming;

pub use breaker::*;
pub use call::CallState;
pub use client::*;
pub use interceptor::*;
pub use interceptors::*;
pub use registry::*;
pub use server::*;
pub use streaming::{BidiCall, BidiSender, ClientStreamCall, InboundStream};

// Re-export stream constructors for streaming handlers.
pub use async_stream::{stream, try_stream};

// Re-export the core layer so downstream crates need only one dependency.
pub use strand_core as core;
pub use strand_core::{
    BytesCodec, CallKind, CancelToken, Code, CodecError, Connection, Context, Deadline,
    FrameStream, JsonCodec, Limits, Listener, Marshal, Metadata, MethodDescriptor, ProtoCodec,
    Status, TlsConfig, Transport, TransportError,
};

#[cfg(feature = "mem")]
pub use strand_core::{MemConnection, MemListener, MemStream, MemTransport};

/// Prelude for convenient imports.
///
/// ```ignore
/// use strand::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        AuthInterceptor, BreakerConfig, CallKind, CallOptions, CircuitBreaker, Client, Context,
        Deadline, Interceptor, InterceptorChain, InterceptorContext, JsonCodec, LoggingInterceptor,
        Marshal, MethodDescriptor, MetricsInterceptor, ProtoCodec, RetryInterceptor, RetryPolicy,
        Server, ServerConfig, Status,
    };
    pub use strand_core::Code;
}
