//! A Source-level failure never fails the outer request: the error is
//! materialized as items in the job while other Sources' offers flow
//! through untouched.

use rmx_adapters::MockSourceAdapter;
use rmx_testkit::{criteria, offer, Mesh};

#[tokio::test]
async fn scenario_source_error_materializes_in_job() {
    let mesh = Mesh::new();
    let agent = mesh.seed_agent().await;
    let good = mesh
        .seed_source(MockSourceAdapter::new().with_offers(vec![offer("OFF-OK")]))
        .await;
    let broken = mesh
        .seed_source(MockSourceAdapter::new().with_availability_error("supplier exploded"))
        .await;
    mesh.seed_active_agreement(agent, good, "AGR-OK").await;
    mesh.seed_active_agreement(agent, broken, "AGR-BROKEN").await;
    mesh.set_base_coverage(good, &["PKKHI", "PKLHE"]).await;
    mesh.set_base_coverage(broken, &["PKKHI", "PKLHE"]).await;

    let receipt = mesh
        .dispatcher
        .submit(agent, criteria("PKKHI", "PKLHE"))
        .await
        .unwrap();
    assert_eq!(receipt.expected_sources, 2);

    let (items, _) = mesh.drain_availability(receipt.request_id).await;

    // Good source: one offers item. Broken source: empty item + error item.
    assert_eq!(items.len(), 3);
    let good_items: Vec<_> = items.iter().filter(|i| i.source_id == good).collect();
    assert_eq!(good_items.len(), 1);
    assert_eq!(good_items[0].payload[0]["supplier_offer_ref"], "OFF-OK");

    let broken_items: Vec<_> = items.iter().filter(|i| i.source_id == broken).collect();
    assert_eq!(broken_items.len(), 2);
    assert_eq!(broken_items[0].payload, serde_json::json!([]));
    assert!(!broken_items[0].timed_out, "an error is not a timeout marker");
    assert_eq!(broken_items[1].payload["error"], "SOURCE_ERROR");
    assert_eq!(broken_items[1].payload["agreement_ref"], "AGR-BROKEN");
    assert!(broken_items[1].payload["message"]
        .as_str()
        .unwrap()
        .contains("supplier exploded"));
}
