//! Retry classification.
//!
//! The interceptor never re-issues anything itself: it inspects the final
//! status of an attempt and raises `retry_requested` in the context when
//! the policy allows another attempt. The engine owns the re-issue loop and
//! carries the original deadline across attempts.

use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use strand_core::{Code, Status};

use crate::interceptor::{Interceptor, InterceptorContext};

/// Which statuses may be retried, and how many times.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Additional attempts after the first. Zero disables retries entirely:
    /// the interceptor behaves as if it were absent.
    pub max_retries: u32,
    /// Status codes eligible for a re-issue.
    pub retryable: Vec<Code>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 2,
            retryable: vec![
                Code::Unavailable,
                Code::DeadlineExceeded,
                Code::ResourceExhausted,
            ],
        }
    }
}

impl RetryPolicy {
    pub fn retries(max_retries: u32) -> Self {
        RetryPolicy {
            max_retries,
            ..Default::default()
        }
    }

    fn should_retry(&self, status: &Status, attempt: u32) -> bool {
        !status.is_ok() && attempt < self.max_retries && self.retryable.contains(&status.code())
    }
}

/// The retry interceptor: passive on request, classifies on response.
#[derive(Debug, Default)]
pub struct RetryInterceptor {
    policy: RetryPolicy,
    signalled: AtomicU64,
}

impl RetryInterceptor {
    pub fn new(policy: RetryPolicy) -> Self {
        RetryInterceptor {
            policy,
            signalled: AtomicU64::new(0),
        }
    }

    /// How many re-issues this interceptor has requested.
    pub fn retries_signalled(&self) -> u64 {
        self.signalled.load(Ordering::Relaxed)
    }
}

impl Interceptor for RetryInterceptor {
    fn on_response<'a>(
        &'a self,
        cx: &'a mut InterceptorContext,
    ) -> BoxFuture<'a, Result<(), Status>> {
        Box::pin(async move {
            if let Some(status) = cx.status.as_ref() {
                if self.policy.should_retry(status, cx.attempt) {
                    self.signalled.fetch_add(1, Ordering::Relaxed);
                    cx.retry_requested = true;
                    tracing::debug!(
                        method = %cx.method,
                        code = status.code().as_i32(),
                        attempt = cx.attempt,
                        "requesting retry"
                    );
                }
            }
            Ok(())
        })
    }
}
