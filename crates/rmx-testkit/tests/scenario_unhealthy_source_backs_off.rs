//! The health feedback loop end-to-end: repeated failures during real
//! scatters escalate into an exclusion window that the next search
//! respects, and the window expires on its own.

use std::time::Duration;

use rmx_adapters::MockSourceAdapter;
use rmx_config::HealthConfig;
use rmx_testkit::{criteria, test_config, Mesh};

#[tokio::test]
async fn scenario_unhealthy_source_backs_off() {
    let mut config = test_config();
    // Tight thresholds so a handful of scatters is enough to strike out.
    config.health = HealthConfig {
        window_size: 10,
        min_samples: 2,
        slow_threshold_ms: 3_000,
        strike_rate: 0.5,
        recover_rate: 0.2,
        strike_threshold: 2,
        backoff_base_ms: 400,
        max_backoff_level: 3,
    };
    let mesh = Mesh::with_config(config);

    let agent = mesh.seed_agent().await;
    let source = mesh
        .seed_source(MockSourceAdapter::new().with_availability_error("down"))
        .await;
    mesh.seed_active_agreement(agent, source, "AGR-001").await;
    mesh.set_base_coverage(source, &["PKKHI", "PKLHE"]).await;

    // Two failed samples per window, two strike windows: 4 failing calls.
    for _ in 0..4 {
        let receipt = mesh
            .dispatcher
            .submit(agent, criteria("PKKHI", "PKLHE"))
            .await
            .unwrap();
        mesh.drain_availability(receipt.request_id).await;
    }

    let snap = mesh.health.snapshot(source).unwrap();
    assert_eq!(snap.backoff_level, 1);
    assert!(mesh.health.is_excluded(source));

    // While excluded, the source is invisible to eligibility.
    let receipt = mesh
        .dispatcher
        .submit(agent, criteria("PKKHI", "PKLHE"))
        .await
        .unwrap();
    assert_eq!(receipt.expected_sources, 0);

    // The window expires by itself; traffic resumes.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!mesh.health.is_excluded(source));
    let receipt = mesh
        .dispatcher
        .submit(agent, criteria("PKKHI", "PKLHE"))
        .await
        .unwrap();
    assert_eq!(receipt.expected_sources, 1);
    mesh.drain_availability(receipt.request_id).await;
}
