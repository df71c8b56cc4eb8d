//! Call logging via `tracing`.

use futures::future::BoxFuture;
use strand_core::Status;

use crate::interceptor::{Interceptor, InterceptorContext};

/// Logs method, sizes, status code, and latency for every call.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingInterceptor;

impl Interceptor for LoggingInterceptor {
    fn on_request<'a>(
        &'a self,
        cx: &'a mut InterceptorContext,
    ) -> BoxFuture<'a, Result<(), Status>> {
        Box::pin(async move {
            tracing::debug!(
                method = %cx.method,
                request_bytes = cx.request_size(),
                attempt = cx.attempt,
                "rpc request"
            );
            Ok(())
        })
    }

    fn on_response<'a>(
        &'a self,
        cx: &'a mut InterceptorContext,
    ) -> BoxFuture<'a, Result<(), Status>> {
        Box::pin(async move {
            let code = cx
                .status
                .as_ref()
                .map(|s| s.code().as_i32())
                .unwrap_or_default();
            tracing::debug!(
                method = %cx.method,
                response_bytes = cx.response_size(),
                grpc_status = code,
                latency_us = cx.elapsed().as_micros() as u64,
                "rpc response"
            );
            Ok(())
        })
    }
}
