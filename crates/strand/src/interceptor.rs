//! The interceptor pipeline: ordered middleware around every call.
//!
//! An interceptor is a pair of fallible hooks. `on_request` runs in
//! insertion order before any transport work; `on_response` runs in reverse
//! order after the transport returns, or after a short-circuit. A failing
//! `on_request` skips the transport but reverse processing still covers
//! every interceptor whose `on_request` was invoked, the failing one
//! included.
//!
//! Instances are shared by all calls; internal state lives behind atomics
//! or a short-held mutex. Adding the same `Arc` twice yields two
//! invocations.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::future::BoxFuture;
use strand_core::{Metadata, Status};

/// Mutable per-attempt call state threaded through the pipeline.
///
/// The body fields are shared views of the engine's buffers; interceptors
/// must not hold onto them past `on_response`.
#[derive(Debug)]
pub struct InterceptorContext {
    /// Wire path of the method, `/<service>/<method>`.
    pub method: String,
    /// Outbound metadata. Mutations before transport work reach the wire.
    pub metadata: Metadata,
    /// Encoded request body, present once the engine has encoded it.
    pub request_body: Option<Bytes>,
    /// Encoded response body, present during response processing when the
    /// call produced one.
    pub response_body: Option<Bytes>,
    /// Outcome slot: unset until the transport (or a short-circuit) filled
    /// it in.
    pub status: Option<Status>,
    /// Zero-based attempt number; above zero only when the engine re-issues
    /// a call at the retry interceptor's request.
    pub attempt: u32,
    /// Set by the retry interceptor to ask the engine for a re-issue.
    pub retry_requested: bool,
    pub(crate) started_at: Instant,
}

impl InterceptorContext {
    pub fn new(method: impl Into<String>, metadata: Metadata, attempt: u32) -> Self {
        InterceptorContext {
            method: method.into(),
            metadata,
            request_body: None,
            response_body: None,
            status: None,
            attempt,
            retry_requested: false,
            started_at: Instant::now(),
        }
    }

    pub fn request_size(&self) -> usize {
        self.request_body.as_ref().map_or(0, |b| b.len())
    }

    pub fn response_size(&self) -> usize {
        self.response_body.as_ref().map_or(0, |b| b.len())
    }

    /// Time since this attempt started.
    pub fn elapsed(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }
}

/// Middleware with request and response hooks. Both default to passive.
///
/// Hooks return boxed futures so chains can hold trait objects; an
/// interceptor is free to suspend (an auth lookup, say) in either hook.
pub trait Interceptor: Send + Sync + 'static {
    fn on_request<'a>(
        &'a self,
        cx: &'a mut InterceptorContext,
    ) -> BoxFuture<'a, Result<(), Status>> {
        let _ = cx;
        Box::pin(async { Ok(()) })
    }

    fn on_response<'a>(
        &'a self,
        cx: &'a mut InterceptorContext,
    ) -> BoxFuture<'a, Result<(), Status>> {
        let _ = cx;
        Box::pin(async { Ok(()) })
    }
}

/// An ordered interceptor chain.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, interceptor: impl Interceptor) {
        self.interceptors.push(Arc::new(interceptor));
    }

    /// Add a shared interceptor instance. The same instance added twice is
    /// invoked twice.
    pub fn push_arc(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Run `on_request` hooks in insertion order.
    ///
    /// Returns how many interceptors were invoked. On failure the returned
    /// status is also stored in `cx.status` and the count includes the
    /// failing interceptor, so [`InterceptorChain::run_response`] covers it.
    pub async fn run_request(&self, cx: &mut InterceptorContext) -> usize {
        for (index, interceptor) in self.interceptors.iter().enumerate() {
            if let Err(status) = interceptor.on_request(cx).await {
                cx.status = Some(status);
                return index + 1;
            }
        }
        self.interceptors.len()
    }

    /// Run `on_response` hooks in reverse order over the first `ran`
    /// interceptors.
    ///
    /// Every covered hook runs even when one fails; a failure replaces
    /// `cx.status` so the engine surfaces it.
    pub async fn run_response(&self, cx: &mut InterceptorContext, ran: usize) {
        for interceptor in self.interceptors[..ran].iter().rev() {
            if let Err(status) = interceptor.on_response(cx).await {
                cx.status = Some(status);
            }
        }
    }
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("len", &self.interceptors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records invocation order into a shared log.
    struct Tracer {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_request: bool,
    }

    impl Interceptor for Tracer {
        fn on_request<'a>(
            &'a self,
            _cx: &'a mut InterceptorContext,
        ) -> BoxFuture<'a, Result<(), Status>> {
            Box::pin(async move {
                self.log.lock().push(format!("{}:req", self.name));
                if self.fail_request {
                    Err(Status::failed_precondition("nope"))
                } else {
                    Ok(())
                }
            })
        }

        fn on_response<'a>(
            &'a self,
            _cx: &'a mut InterceptorContext,
        ) -> BoxFuture<'a, Result<(), Status>> {
            Box::pin(async move {
                self.log.lock().push(format!("{}:resp", self.name));
                Ok(())
            })
        }
    }

    fn ctx() -> InterceptorContext {
        InterceptorContext::new("/t.T/M", Metadata::new(), 0)
    }

    #[tokio::test]
    async fn forward_then_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = InterceptorChain::new();
        for name in ["a", "b", "c"] {
            chain.push(Tracer {
                name,
                log: log.clone(),
                fail_request: false,
            });
        }

        let mut cx = ctx();
        let ran = chain.run_request(&mut cx).await;
        assert_eq!(ran, 3);
        assert!(cx.status.is_none());
        chain.run_response(&mut cx, ran).await;

        assert_eq!(
            *log.lock(),
            vec!["a:req", "b:req", "c:req", "c:resp", "b:resp", "a:resp"]
        );
    }

    #[tokio::test]
    async fn short_circuit_still_reverses_over_invoked() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = InterceptorChain::new();
        chain.push(Tracer {
            name: "a",
            log: log.clone(),
            fail_request: false,
        });
        chain.push(Tracer {
            name: "b",
            log: log.clone(),
            fail_request: true,
        });
        chain.push(Tracer {
            name: "c",
            log: log.clone(),
            fail_request: false,
        });

        let mut cx = ctx();
        let ran = chain.run_request(&mut cx).await;
        assert_eq!(ran, 2);
        assert_eq!(
            cx.status.as_ref().unwrap().code(),
            strand_core::Code::FailedPrecondition
        );
        chain.run_response(&mut cx, ran).await;

        // c never ran in either direction.
        assert_eq!(*log.lock(), vec!["a:req", "b:req", "b:resp", "a:resp"]);
    }

    #[tokio::test]
    async fn same_instance_twice_runs_twice() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let shared: Arc<dyn Interceptor> = Arc::new(Tracer {
            name: "dup",
            log: log.clone(),
            fail_request: false,
        });
        let mut chain = InterceptorChain::new();
        chain.push_arc(shared.clone());
        chain.push_arc(shared);

        let mut cx = ctx();
        let ran = chain.run_request(&mut cx).await;
        chain.run_response(&mut cx, ran).await;
        assert_eq!(
            *log.lock(),
            vec!["dup:req", "dup:req", "dup:resp", "dup:resp"]
        );
    }

    #[tokio::test]
    async fn empty_chain_is_a_no_op() {
        let chain = InterceptorChain::new();
        let mut cx = ctx();
        let ran = chain.run_request(&mut cx).await;
        assert_eq!(ran, 0);
        chain.run_response(&mut cx, ran).await;
        assert!(cx.status.is_none());
    }
}
