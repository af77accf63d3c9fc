//! The echo broker as a liveness probe: every active-agreement Source gets
//! the payload, replies aggregate behind the same long-poll cursor, and the
//! slow one is accounted as timed out.

use std::time::Duration;

use rmx_adapters::MockSourceAdapter;
use rmx_schemas::{EchoPayload, JobStatus};
use rmx_testkit::Mesh;

fn payload() -> EchoPayload {
    EchoPayload {
        message: "liveness-ping".to_string(),
        attrs: [("probe".to_string(), "t1".to_string())].into_iter().collect(),
    }
}

#[tokio::test]
async fn scenario_echo_probe_round_trip() {
    let mesh = Mesh::new();
    let agent = mesh.seed_agent().await;
    let alive_a = mesh.seed_source(MockSourceAdapter::new()).await;
    let alive_b = mesh.seed_source(MockSourceAdapter::new()).await;
    let dead = mesh
        .seed_source(MockSourceAdapter::new().with_delay(Duration::from_secs(5)))
        .await;
    mesh.seed_active_agreement(agent, alive_a, "AGR-A").await;
    mesh.seed_active_agreement(agent, alive_b, "AGR-B").await;
    mesh.seed_active_agreement(agent, dead, "AGR-DEAD").await;

    let receipt = mesh.echo.submit(agent, None, payload()).await.unwrap();
    assert_eq!(receipt.total_expected, 3);

    // Drain to completion through the aggregate view.
    let mut since_seq = 0;
    let results = loop {
        let r = mesh
            .echo
            .get_results(receipt.request_id, since_seq, Duration::from_millis(400))
            .await
            .unwrap();
        since_seq = r.last_seq;
        if r.status == JobStatus::Complete {
            break mesh
                .echo
                .get_results(receipt.request_id, 0, Duration::ZERO)
                .await
                .unwrap();
        }
    };

    assert_eq!(results.total_expected, 3);
    assert_eq!(results.responses_received, 2);
    assert_eq!(results.timed_out_sources, 1);
    assert_eq!(results.last_seq, 3);

    let replies: Vec<_> = results
        .new_items
        .iter()
        .filter(|i| !i.timed_out)
        .collect();
    for reply in replies {
        assert_eq!(reply.payload["message"], "liveness-ping");
        assert_eq!(reply.payload["attrs"]["probe"], "t1");
        assert!(reply.payload["latency_ms"].is_u64());
    }

    // Identical observation, identical fingerprint.
    let again = mesh
        .echo
        .get_results(receipt.request_id, 0, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(results.aggregate_etag, again.aggregate_etag);
}
