//! One agent, one ACTIVE agreement, one covered route: the search returns
//! the Source's offers at seq 1 and the follow-up poll reports completion
//! with nothing new.

use std::time::Duration;

use rmx_adapters::MockSourceAdapter;
use rmx_schemas::JobStatus;
use rmx_testkit::{criteria, offer, Mesh};

#[tokio::test]
async fn scenario_happy_path_availability() {
    let mesh = Mesh::new();
    let agent = mesh.seed_agent().await;
    let source = mesh
        .seed_source(MockSourceAdapter::new().with_offers(vec![offer("OFF-1")]))
        .await;
    mesh.seed_active_agreement(agent, source, "AGR-001").await;
    mesh.set_base_coverage(source, &["PKKHI", "PKLHE"]).await;

    let receipt = mesh
        .dispatcher
        .submit(agent, criteria("PKKHI", "PKLHE"))
        .await
        .unwrap();
    assert_eq!(receipt.expected_sources, 1);

    // First poll: the Source's offers arrive at seq 1.
    let first = mesh
        .dispatcher
        .jobs()
        .get_since(receipt.request_id, 0, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(first.last_seq, 1);
    assert_eq!(first.new_items.len(), 1);
    assert_eq!(first.new_items[0].payload[0]["supplier_offer_ref"], "OFF-1");
    assert_eq!(first.new_items[0].payload[0]["agreement_ref"], "AGR-001");
    assert!(!first.new_items[0].timed_out);

    // Second poll from the returned cursor: completion, nothing new.
    let second = mesh
        .dispatcher
        .jobs()
        .get_since(receipt.request_id, first.last_seq, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(second.status, JobStatus::Complete);
    assert_eq!(second.last_seq, 1);
    assert!(second.new_items.is_empty());
}
