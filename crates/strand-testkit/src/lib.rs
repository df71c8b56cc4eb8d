//! Contract test harness for transport adapters.
//!
//! Every SPI implementation owes the core the same observable behaviors:
//! stream frames arrive in order, cancels are idempotent and poison reads,
//! closing a connection closes its streams, a closed listener unblocks
//! accepts, and error kinds map onto the closed `TransportError` set. The
//! checks here verify those obligations against any [`Transport`]; run
//! them from an adapter's test suite via [`run_contract`].

use std::time::Duration;

use bytes::Bytes;
use strand_core::{Frame, FrameFlags, FrameType, Listener, Transport};

mod checks;

pub use checks::*;

/// Outcome of a single contract check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestResult {
    passed: bool,
    message: Option<String>,
}

impl TestResult {
    pub fn pass() -> Self {
        TestResult {
            passed: true,
            message: None,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        TestResult {
            passed: false,
            message: Some(message.into()),
        }
    }

    pub fn is_pass(&self) -> bool {
        self.passed
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

/// Results of a full contract run, by check name.
#[derive(Debug, Default)]
pub struct ContractReport {
    results: Vec<(&'static str, TestResult)>,
}

impl ContractReport {
    pub fn record(&mut self, name: &'static str, result: TestResult) {
        if let Some(message) = result.message() {
            tracing::warn!(check = name, message, "contract check failed");
        }
        self.results.push((name, result));
    }

    pub fn all_passed(&self) -> bool {
        self.results.iter().all(|(_, r)| r.is_pass())
    }

    pub fn failures(&self) -> Vec<(&'static str, &TestResult)> {
        self.results
            .iter()
            .filter(|(_, r)| !r.is_pass())
            .map(|(name, r)| (*name, r))
            .collect()
    }

    pub fn results(&self) -> &[(&'static str, TestResult)] {
        &self.results
    }

    /// Panic with a readable summary if anything failed. For use straight
    /// from an adapter's `#[tokio::test]`.
    pub fn assert_all_passed(&self) {
        if !self.all_passed() {
            let mut summary = String::new();
            for (name, result) in self.failures() {
                summary.push_str(&format!(
                    "\n  {}: {}",
                    name,
                    result.message().unwrap_or("failed")
                ));
            }
            panic!("transport contract violations:{}", summary);
        }
    }
}

/// Run every contract check against a transport.
///
/// `prefix` namespaces the endpoint names so parallel runs against a shared
/// registry do not collide.
pub async fn run_contract<T: Transport>(transport: &T, prefix: &str) -> ContractReport {
    let mut report = ContractReport::default();
    let ep = |name: &str| format!("{}-{}", prefix, name);

    report.record(
        "lifecycle",
        checks::lifecycle(transport, &ep("lifecycle")).await,
    );
    report.record(
        "frame_order",
        checks::frame_order(transport, &ep("frame-order")).await,
    );
    report.record(
        "closed_stream_reads",
        checks::closed_stream_reads(transport, &ep("closed-reads")).await,
    );
    report.record(
        "cancel_idempotent",
        checks::cancel_idempotent(transport, &ep("cancel")).await,
    );
    report.record(
        "connection_close_cascades",
        checks::connection_close_cascades(transport, &ep("conn-close")).await,
    );
    report.record(
        "listener_close_unblocks",
        checks::listener_close_unblocks(transport, &ep("listener-close")).await,
    );
    report.record(
        "error_mapping",
        checks::error_mapping(transport, &ep("errors")).await,
    );
    report.record(
        "dropped_stream_cleanup",
        checks::dropped_stream_cleanup(transport, &ep("drop-cleanup")).await,
    );

    report
}

/// Bound every await so a broken adapter fails a check instead of hanging
/// the suite.
pub(crate) async fn within<F, O>(what: &str, fut: F) -> Result<O, TestResult>
where
    F: std::future::Future<Output = O>,
{
    match tokio::time::timeout(Duration::from_secs(5), fut).await {
        Ok(out) => Ok(out),
        Err(_) => Err(TestResult::fail(format!("timed out waiting for {}", what))),
    }
}

/// Dial and accept one connection pair through the listener.
pub(crate) async fn connected_pair<T: Transport>(
    transport: &T,
    endpoint: &str,
) -> Result<(T::Conn, T::Conn, T::Listener), TestResult> {
    let listener = match transport.listen(endpoint, None).await {
        Ok(listener) => listener,
        Err(e) => return Err(TestResult::fail(format!("listen failed: {}", e))),
    };
    let client = match within("connect", transport.connect(endpoint, None)).await? {
        Ok(conn) => conn,
        Err(e) => return Err(TestResult::fail(format!("connect failed: {}", e))),
    };
    let server = match within("accept", listener.accept()).await? {
        Ok(conn) => conn,
        Err(e) => return Err(TestResult::fail(format!("accept failed: {}", e))),
    };
    Ok((client, server, listener))
}

pub(crate) fn headers_frame() -> Frame {
    Frame::headers(Bytes::from_static(b"k: v\r\n"), FrameFlags::empty())
}

pub(crate) fn data_frame(payload: &[u8], end: bool) -> Frame {
    Frame::data(Bytes::copy_from_slice(payload), end)
}

pub(crate) fn expect_frame(frame: &Frame, frame_type: FrameType, payload: &[u8]) -> bool {
    frame.frame_type == frame_type && frame.payload.as_ref() == payload
}
