//! Request/error counters and latency totals as atomics, with a non-atomic
//! snapshot for observers.

use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use strand_core::Status;

use crate::interceptor::{Interceptor, InterceptorContext};

/// Per-client call metrics.
#[derive(Debug, Default)]
pub struct MetricsInterceptor {
    requests: AtomicU64,
    completed: AtomicU64,
    errors: AtomicU64,
    latency_ns_total: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// Non-atomic snapshot of [`MetricsInterceptor`] counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub completed: u64,
    pub errors: u64,
    pub latency_ns_total: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl MetricsSnapshot {
    /// Mean latency over completed attempts, in nanoseconds.
    pub fn mean_latency_ns(&self) -> u64 {
        if self.completed == 0 {
            0
        } else {
            self.latency_ns_total / self.completed
        }
    }
}

impl MetricsInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            latency_ns_total: self.latency_ns_total.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.requests.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.latency_ns_total.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
    }
}

impl Interceptor for MetricsInterceptor {
    fn on_request<'a>(
        &'a self,
        cx: &'a mut InterceptorContext,
    ) -> BoxFuture<'a, Result<(), Status>> {
        Box::pin(async move {
            self.requests.fetch_add(1, Ordering::Relaxed);
            self.bytes_sent
                .fetch_add(cx.request_size() as u64, Ordering::Relaxed);
            Ok(())
        })
    }

    fn on_response<'a>(
        &'a self,
        cx: &'a mut InterceptorContext,
    ) -> BoxFuture<'a, Result<(), Status>> {
        Box::pin(async move {
            self.completed.fetch_add(1, Ordering::Relaxed);
            self.bytes_received
                .fetch_add(cx.response_size() as u64, Ordering::Relaxed);
            self.latency_ns_total
                .fetch_add(cx.elapsed().as_nanos() as u64, Ordering::Relaxed);
            if cx.status.as_ref().is_some_and(|s| !s.is_ok()) {
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
            Ok(())
        })
    }
}
