//! Connection health tracking via periodic pings.
//!
//! A spawned driver pings the connection on an interval, recording per-ping
//! round-trip times and the set of pings still awaiting an answer. A ping
//! that times out marks the connection unhealthy; the paired interceptor
//! then fails calls fast with `unavailable` instead of queueing them onto a
//! dead connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use strand_core::{Connection, Status};
use tokio::task::JoinHandle;

use crate::interceptor::{Interceptor, InterceptorContext};

/// Keepalive timing knobs.
#[derive(Clone, Copy, Debug)]
pub struct KeepaliveConfig {
    /// Gap between probes.
    pub interval: Duration,
    /// How long a probe may stay unanswered before the connection is
    /// declared unhealthy.
    pub timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        KeepaliveConfig {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Health as observed by the keepalive driver.
#[derive(Debug)]
pub struct HealthState {
    healthy: AtomicBool,
    next_seq: AtomicU64,
    pending: Mutex<HashMap<u64, Instant>>,
    last_rtt_ns: AtomicU64,
    pings_sent: AtomicU64,
    pings_answered: AtomicU64,
}

impl HealthState {
    fn new() -> Self {
        HealthState {
            healthy: AtomicBool::new(true),
            next_seq: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            last_rtt_ns: AtomicU64::new(0),
            pings_sent: AtomicU64::new(0),
            pings_answered: AtomicU64::new(0),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Round-trip time of the most recent answered ping.
    pub fn last_rtt(&self) -> Option<Duration> {
        match self.last_rtt_ns.load(Ordering::Relaxed) {
            0 => None,
            ns => Some(Duration::from_nanos(ns)),
        }
    }

    /// Probes currently awaiting an answer.
    pub fn pending_pings(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn pings_sent(&self) -> u64 {
        self.pings_sent.load(Ordering::Relaxed)
    }

    pub fn pings_answered(&self) -> u64 {
        self.pings_answered.load(Ordering::Relaxed)
    }

    fn begin_ping(&self) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().insert(seq, Instant::now());
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
        seq
    }

    fn finish_ping(&self, seq: u64, answered: bool) {
        let sent_at = self.pending.lock().remove(&seq);
        if answered {
            if let Some(sent_at) = sent_at {
                self.last_rtt_ns
                    .store(sent_at.elapsed().as_nanos() as u64, Ordering::Relaxed);
            }
            self.pings_answered.fetch_add(1, Ordering::Relaxed);
            self.healthy.store(true, Ordering::Release);
        } else {
            self.healthy.store(false, Ordering::Release);
        }
    }
}

/// The keepalive driver. Holds the shared [`HealthState`]; `spawn` starts
/// the ping loop on a connection.
pub struct Keepalive {
    config: KeepaliveConfig,
    state: Arc<HealthState>,
}

impl Keepalive {
    pub fn new(config: KeepaliveConfig) -> Self {
        Keepalive {
            config,
            state: Arc::new(HealthState::new()),
        }
    }

    pub fn state(&self) -> Arc<HealthState> {
        self.state.clone()
    }

    /// An interceptor gating calls on this driver's health view.
    pub fn interceptor(&self) -> HealthInterceptor {
        HealthInterceptor {
            state: self.state.clone(),
        }
    }

    /// Start pinging `conn` until it disconnects or the task is aborted.
    pub fn spawn<Conn: Connection>(&self, conn: Conn) -> JoinHandle<()> {
        let state = self.state.clone();
        let config = self.config;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !conn.is_connected() {
                    state.healthy.store(false, Ordering::Release);
                    tracing::debug!("keepalive stopping: connection gone");
                    return;
                }
                let seq = state.begin_ping();
                match tokio::time::timeout(config.timeout, conn.ping()).await {
                    Ok(Ok(())) => state.finish_ping(seq, true),
                    Ok(Err(err)) => {
                        tracing::warn!(seq, error = %err, "keepalive ping failed");
                        state.finish_ping(seq, false);
                    }
                    Err(_) => {
                        tracing::warn!(seq, "keepalive ping timed out");
                        state.finish_ping(seq, false);
                    }
                }
            }
        })
    }
}

impl Default for Keepalive {
    fn default() -> Self {
        Self::new(KeepaliveConfig::default())
    }
}

/// Fails calls with `unavailable` while the connection is unhealthy.
pub struct HealthInterceptor {
    state: Arc<HealthState>,
}

impl Interceptor for HealthInterceptor {
    fn on_request<'a>(
        &'a self,
        _cx: &'a mut InterceptorContext,
    ) -> BoxFuture<'a, Result<(), Status>> {
        Box::pin(async move {
            if self.state.is_healthy() {
                Ok(())
            } else {
                Err(Status::unavailable("connection unhealthy"))
            }
        })
    }
}
