//! State-machine closure: the registry only ever applies transitions from
//! the lifecycle graph, and the failure message enumerates what would have
//! been legal.

use rmx_adapters::MockSourceAdapter;
use rmx_schemas::AgreementStatus;
use rmx_testkit::Mesh;

#[tokio::test]
async fn scenario_illegal_transition_lists_legal_targets() {
    let mesh = Mesh::new();
    let agent = mesh.seed_agent().await;
    let source = mesh.seed_source(MockSourceAdapter::new()).await;

    let draft = mesh
        .registry
        .create_draft(agent, source, "AGR-001".to_string(), None, None)
        .await
        .unwrap();
    assert_eq!(draft.status, AgreementStatus::Draft);

    let err = mesh
        .registry
        .set_status(draft.id, AgreementStatus::Suspended)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_TRANSITION");
    let msg = err.to_string();
    assert!(msg.contains("DRAFT -> SUSPENDED"), "{msg}");
    assert!(msg.contains("[OFFERED]"), "{msg}");

    // The agreement is untouched by the refused transition.
    let unchanged = mesh.registry.get(draft.id).await.unwrap();
    assert_eq!(unchanged.status, AgreementStatus::Draft);
}

#[tokio::test]
async fn scenario_expired_agreement_is_terminal() {
    let mesh = Mesh::new();
    let agent = mesh.seed_agent().await;
    let source = mesh.seed_source(MockSourceAdapter::new()).await;
    let id = mesh.seed_active_agreement(agent, source, "AGR-001").await;

    mesh.registry
        .set_status(id, AgreementStatus::Expired)
        .await
        .unwrap();

    for target in [
        AgreementStatus::Active,
        AgreementStatus::Suspended,
        AgreementStatus::Offered,
    ] {
        let err = mesh.registry.set_status(id, target).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");
    }
}
