//! The reference in-memory transport must satisfy its own contract.

use strand_core::MemTransport;
use strand_testkit::run_contract;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[tokio::test]
async fn mem_transport_satisfies_contract() {
    init_tracing();
    let transport = MemTransport::new();
    let report = run_contract(&transport, "mem").await;
    report.assert_all_passed();
}

#[tokio::test]
async fn contract_runs_are_namespaced() {
    init_tracing();
    let transport = MemTransport::new();
    let first = run_contract(&transport, "a").await;
    let second = run_contract(&transport, "b").await;
    first.assert_all_passed();
    second.assert_all_passed();
}
