//! Per-endpoint circuit breaker.
//!
//! The classic three-state machine. `Closed` counts consecutive failures
//! and trips open at the threshold. `Open` fails calls immediately until
//! the timeout elapses, then admits probes in `HalfOpen` — at most
//! `max_half_open_requests` in flight — and either recovers to `Closed`
//! after enough successes or snaps back to `Open` on the first failure.
//!
//! One mutex guards the whole state record, so every read and every single
//! transition is linearizable with respect to concurrent calls.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use strand_core::Status;

use crate::interceptor::{Interceptor, InterceptorContext};

/// Metadata key announcing a fast-fail to the caller.
pub const BREAKER_STATE_KEY: &str = "x-circuit-breaker-state";
/// Metadata key hinting when a retry may be worthwhile.
pub const RETRY_AFTER_KEY: &str = "x-retry-after-seconds";

/// Breaker tuning.
#[derive(Clone, Copy, Debug)]
pub struct BreakerConfig {
    /// Consecutive failures in `Closed` that trip the breaker.
    pub failure_threshold: u32,
    /// Successes in `HalfOpen` that close it again.
    pub success_threshold: u32,
    /// How long `Open` lasts before probing.
    pub timeout: Duration,
    /// Probe concurrency cap while `HalfOpen`.
    pub max_half_open_requests: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
            max_half_open_requests: 1,
        }
    }
}

/// The three breaker states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Core {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_in_flight: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    last_transition_at: Instant,
    total_requests: u64,
    total_successes: u64,
    total_failures: u64,
    rejected: u64,
}

impl Core {
    fn new() -> Self {
        Core {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            half_open_in_flight: 0,
            opened_at: None,
            last_failure_at: None,
            last_transition_at: Instant::now(),
            total_requests: 0,
            total_successes: 0,
            total_failures: 0,
            rejected: 0,
        }
    }

    fn transition(&mut self, next: BreakerState) {
        tracing::debug!(from = ?self.state, to = ?next, "circuit breaker transition");
        self.state = next;
        self.last_transition_at = Instant::now();
        match next {
            BreakerState::Open => {
                self.opened_at = Some(Instant::now());
            }
            BreakerState::HalfOpen => {
                self.half_open_successes = 0;
                self.half_open_in_flight = 0;
                self.consecutive_failures = 0;
            }
            BreakerState::Closed => {
                self.opened_at = None;
                self.consecutive_failures = 0;
                self.half_open_successes = 0;
                self.half_open_in_flight = 0;
            }
        }
    }
}

/// Observable breaker statistics.
#[derive(Clone, Copy, Debug)]
pub struct BreakerStats {
    pub state: BreakerState,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected: u64,
    pub last_failure_at: Option<Instant>,
    pub last_transition_at: Instant,
}

/// A shareable circuit breaker; add the same `Arc` to a chain to gate calls.
pub struct CircuitBreaker {
    config: BreakerConfig,
    core: Mutex<Core>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Arc<Self> {
        Arc::new(CircuitBreaker {
            config,
            core: Mutex::new(Core::new()),
        })
    }

    pub fn state(&self) -> BreakerState {
        self.core.lock().state
    }

    pub fn stats(&self) -> BreakerStats {
        let core = self.core.lock();
        BreakerStats {
            state: core.state,
            total_requests: core.total_requests,
            total_successes: core.total_successes,
            total_failures: core.total_failures,
            rejected: core.rejected,
            last_failure_at: core.last_failure_at,
            last_transition_at: core.last_transition_at,
        }
    }

    /// Force the breaker closed and clear its counters.
    pub fn reset(&self) {
        let mut core = self.core.lock();
        core.transition(BreakerState::Closed);
    }

    /// Ask to admit one call. `Err` carries the suggested retry-after.
    fn admit(&self) -> Result<(), Duration> {
        let mut core = self.core.lock();
        match core.state {
            BreakerState::Closed => {
                core.total_requests += 1;
                Ok(())
            }
            BreakerState::Open => {
                let elapsed = core
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.timeout {
                    core.transition(BreakerState::HalfOpen);
                    core.half_open_in_flight = 1;
                    core.total_requests += 1;
                    Ok(())
                } else {
                    core.rejected += 1;
                    Err(self.config.timeout - elapsed)
                }
            }
            BreakerState::HalfOpen => {
                if core.half_open_in_flight < self.config.max_half_open_requests {
                    core.half_open_in_flight += 1;
                    core.total_requests += 1;
                    Ok(())
                } else {
                    core.rejected += 1;
                    Err(self.config.timeout)
                }
            }
        }
    }

    /// Record the outcome of an admitted call.
    fn record(&self, success: bool) {
        let mut core = self.core.lock();
        if success {
            core.total_successes += 1;
        } else {
            core.total_failures += 1;
            core.last_failure_at = Some(Instant::now());
        }
        match core.state {
            BreakerState::Closed => {
                if success {
                    core.consecutive_failures = 0;
                } else {
                    core.consecutive_failures += 1;
                    if core.consecutive_failures >= self.config.failure_threshold {
                        core.transition(BreakerState::Open);
                    }
                }
            }
            BreakerState::HalfOpen => {
                core.half_open_in_flight = core.half_open_in_flight.saturating_sub(1);
                if success {
                    core.half_open_successes += 1;
                    if core.half_open_successes >= self.config.success_threshold {
                        core.transition(BreakerState::Closed);
                    }
                } else {
                    core.transition(BreakerState::Open);
                }
            }
            // A response landing after the breaker already re-opened only
            // feeds the totals above.
            BreakerState::Open => {}
        }
    }
}

impl Interceptor for CircuitBreaker {
    fn on_request<'a>(
        &'a self,
        cx: &'a mut InterceptorContext,
    ) -> BoxFuture<'a, Result<(), Status>> {
        Box::pin(async move {
            match self.admit() {
                Ok(()) => Ok(()),
                Err(retry_after) => {
                    let _ = cx.metadata.insert_ascii(BREAKER_STATE_KEY, "open");
                    let _ = cx.metadata.insert_ascii(
                        RETRY_AFTER_KEY,
                        retry_after.as_secs().max(1).to_string(),
                    );
                    Err(Status::unavailable("circuit breaker open"))
                }
            }
        })
    }

    fn on_response<'a>(
        &'a self,
        cx: &'a mut InterceptorContext,
    ) -> BoxFuture<'a, Result<(), Status>> {
        Box::pin(async move {
            // Our own fast-fail also flows back through here; it never
            // reached the transport and must not count as a call outcome.
            if cx.metadata.get(BREAKER_STATE_KEY) == Some("open") {
                return Ok(());
            }
            let success = cx.status.as_ref().is_none_or(Status::is_ok);
            self.record(success);
            Ok(())
        })
    }
}
