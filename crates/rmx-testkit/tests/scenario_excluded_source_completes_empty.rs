//! A Source inside its exclusion window never receives traffic: when it is
//! the only candidate the job completes immediately with zero expected
//! sources, and no result row ever carries its id.

use std::time::Duration;

use chrono::Utc;
use rmx_adapters::MockSourceAdapter;
use rmx_health::CallMetric;
use rmx_schemas::JobStatus;
use rmx_testkit::{criteria, offer, Mesh};

fn drive_into_exclusion(mesh: &Mesh, source: uuid::Uuid) {
    let now = Utc::now();
    // Three all-slow windows of min_samples each escalate to backoff level 1.
    for _ in 0..3 {
        for _ in 0..10 {
            mesh.health.record_at(
                CallMetric {
                    source_id: source,
                    latency_ms: 10,
                    success: false,
                },
                now,
            );
        }
    }
    assert!(mesh.health.is_excluded(source));
}

#[tokio::test]
async fn scenario_excluded_source_completes_empty() {
    let mesh = Mesh::new();
    let agent = mesh.seed_agent().await;
    let source = mesh
        .seed_source(MockSourceAdapter::new().with_offers(vec![offer("OFF-1")]))
        .await;
    mesh.seed_active_agreement(agent, source, "AGR-001").await;
    mesh.set_base_coverage(source, &["PKKHI", "PKLHE"]).await;

    drive_into_exclusion(&mesh, source);

    let receipt = mesh
        .dispatcher
        .submit(agent, criteria("PKKHI", "PKLHE"))
        .await
        .unwrap();
    assert_eq!(receipt.expected_sources, 0);

    let poll = mesh
        .dispatcher
        .jobs()
        .get_since(receipt.request_id, 0, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(poll.status, JobStatus::Complete);
    assert_eq!(poll.last_seq, 0);
    assert!(poll.new_items.is_empty());
}

#[tokio::test]
async fn scenario_exclusion_spares_healthy_sources() {
    let mesh = Mesh::new();
    let agent = mesh.seed_agent().await;
    let healthy = mesh
        .seed_source(MockSourceAdapter::new().with_offers(vec![offer("OFF-OK")]))
        .await;
    let sick = mesh
        .seed_source(MockSourceAdapter::new().with_offers(vec![offer("OFF-SICK")]))
        .await;
    mesh.seed_active_agreement(agent, healthy, "AGR-OK").await;
    mesh.seed_active_agreement(agent, sick, "AGR-SICK").await;
    mesh.set_base_coverage(healthy, &["PKKHI", "PKLHE"]).await;
    mesh.set_base_coverage(sick, &["PKKHI", "PKLHE"]).await;

    drive_into_exclusion(&mesh, sick);

    let receipt = mesh
        .dispatcher
        .submit(agent, criteria("PKKHI", "PKLHE"))
        .await
        .unwrap();
    assert_eq!(receipt.expected_sources, 1);

    let (items, _) = mesh.drain_availability(receipt.request_id).await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].source_id, healthy);
    assert!(items.iter().all(|i| i.source_id != sick));
}
