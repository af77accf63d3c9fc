//! In-process scenario tests for rmx-daemon HTTP endpoints.
//!
//! These tests spin up the Axum router **without** binding a TCP socket.
//! Each test calls `routes::build_router` and drives it via
//! `tower::ServiceExt::oneshot`; no network I/O required.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use rmx_adapters::{mock::offer, MockSourceAdapter};
use rmx_audit::Auditor;
use rmx_config::{CoreConfig, DispatchConfig, EchoConfig};
use rmx_daemon::{routes, state::AppState};
use serde_json::{json, Value};
use tower::ServiceExt; // oneshot
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn test_config() -> CoreConfig {
    CoreConfig {
        dispatch: DispatchConfig {
            max_concurrency: 10,
            per_call_timeout_ms: 300,
            sla_ms: 3_000,
            recommended_poll_ms: 1_500,
        },
        echo: EchoConfig {
            per_call_timeout_ms: 300,
            sla_ms: 3_000,
            watch_poll_ms: 50,
            watch_max_ms: 5_000,
        },
        catalog: rmx_config::CatalogConfig {
            seed: vec!["PKKHI".into(), "PKLHE".into(), "GBMAN".into(), "GBGLA".into()],
        },
        ..Default::default()
    }
}

fn make_state() -> Arc<AppState> {
    Arc::new(AppState::in_memory(
        test_config(),
        Arc::new(Auditor::disabled()),
    ))
}

/// Drive the router with a single request and return (status, body json).
async fn call(st: &Arc<AppState>, req: Request<axum::body::Body>) -> (StatusCode, Value) {
    let resp = routes::build_router(Arc::clone(st))
        .oneshot(req)
        .await
        .expect("oneshot failed");
    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .expect("body collect failed")
        .to_bytes();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).expect("body is not valid JSON")
    };
    (status, json)
}

fn get(uri: &str) -> Request<axum::body::Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<axum::body::Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap()
}

fn put_json(uri: &str, body: Value) -> Request<axum::body::Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap()
}

/// Register an ACTIVE agent + ACTIVE mock source through the ingestion
/// boundary; returns (agent_id, source_id).
async fn seed_companies(st: &Arc<AppState>) -> (Uuid, Uuid) {
    let agent_id = Uuid::new_v4();
    let source_id = Uuid::new_v4();

    let (status, _) = call(
        st,
        post_json(
            "/v1/companies",
            json!({
                "id": agent_id, "name": "agent-co", "kind": "AGENT",
                "status": "ACTIVE", "adapter_kind": null, "endpoint": null
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(
        st,
        post_json(
            "/v1/companies",
            json!({
                "id": source_id, "name": "source-co", "kind": "SOURCE",
                "status": "ACTIVE", "adapter_kind": "mock", "endpoint": null
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    (agent_id, source_id)
}

/// Walk a fresh draft through the state machine to ACTIVE.
async fn seed_active_agreement(
    st: &Arc<AppState>,
    agent_id: Uuid,
    source_id: Uuid,
    agreement_ref: &str,
) -> Uuid {
    let (status, body) = call(
        st,
        post_json(
            "/v1/agreements",
            json!({
                "agent_id": agent_id,
                "source_id": source_id,
                "agreement_ref": agreement_ref
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let id: Uuid = body["id"].as_str().unwrap().parse().unwrap();

    for step in ["offer", "accept"] {
        let (status, _) = call(st, post_json(&format!("/v1/agreements/{id}/{step}"), json!({}))).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, _) = call(
        st,
        post_json(
            &format!("/v1/agreements/{id}/status"),
            json!({"status": "ACTIVE"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    id
}

fn availability_body(agent_id: Uuid) -> Value {
    json!({
        "agent_id": agent_id,
        "pickup_unlocode": "PKKHI",
        "dropoff_unlocode": "PKLHE",
        "pickup_iso": "2026-09-01T10:00:00Z",
        "dropoff_iso": "2026-09-05T10:00:00Z",
        "driver_age": 30
    })
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_returns_200_ok_true() {
    let st = make_state();
    let (status, json) = call(&st, get("/v1/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "rmx-daemon");
}

// ---------------------------------------------------------------------------
// Agreement lifecycle over HTTP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn agreement_lifecycle_and_illegal_transition() {
    let st = make_state();
    let (agent_id, source_id) = seed_companies(&st).await;

    let (status, body) = call(
        &st,
        post_json(
            "/v1/agreements",
            json!({
                "agent_id": agent_id,
                "source_id": source_id,
                "agreement_ref": "AGR-001"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "DRAFT");
    let id = body["id"].as_str().unwrap().to_string();

    // DRAFT -> SUSPENDED is illegal; the message lists the legal targets.
    let (status, body) = call(
        &st,
        post_json(&format!("/v1/agreements/{id}/status"), json!({"status": "SUSPENDED"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "INVALID_TRANSITION");
    assert!(body["message"].as_str().unwrap().contains("[OFFERED]"), "{body}");

    // The legal path works.
    let (status, body) = call(&st, post_json(&format!("/v1/agreements/{id}/offer"), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "OFFERED");

    // Duplicate natural key is a 409.
    let (status, body) = call(
        &st,
        post_json(
            "/v1/agreements",
            json!({
                "agent_id": agent_id,
                "source_id": source_id,
                "agreement_ref": "AGR-001"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "DUPLICATE");
}

// ---------------------------------------------------------------------------
// Availability end-to-end over HTTP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn availability_submit_and_poll_round_trip() {
    let st = make_state();
    let (agent_id, source_id) = seed_companies(&st).await;
    seed_active_agreement(&st, agent_id, source_id, "AGR-001").await;

    st.adapters.register(
        source_id,
        Arc::new(
            MockSourceAdapter::new()
                .with_offers(vec![offer("OFF-1", "compact", "120.00")])
                .with_locations(vec!["PKKHI", "PKLHE"]),
        ),
    );

    // Sync coverage from the adapter so both endpoints are covered.
    let (status, body) = call(&st, post_json(&format!("/v1/coverage/sync/{source_id}"), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);

    let (status, body) = call(&st, post_json("/v1/availability", availability_body(agent_id))).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["expected_sources"], 1);
    let request_id = body["request_id"].as_str().unwrap().to_string();

    // Poll until complete; offers arrive at seq 1.
    let mut since_seq = 0;
    let mut offers_seen = false;
    loop {
        let (status, poll) = call(
            &st,
            get(&format!(
                "/v1/availability/{request_id}?since_seq={since_seq}&wait_ms=500"
            )),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        since_seq = poll["last_seq"].as_u64().unwrap();
        for item in poll["new_items"].as_array().unwrap() {
            if item["payload"][0]["supplier_offer_ref"] == "OFF-1" {
                offers_seen = true;
            }
        }
        if poll["complete"].as_bool().unwrap() {
            break;
        }
    }
    assert!(offers_seen);
    assert_eq!(since_seq, 1);
}

#[tokio::test]
async fn availability_with_no_coverage_completes_empty() {
    let st = make_state();
    let (agent_id, source_id) = seed_companies(&st).await;
    seed_active_agreement(&st, agent_id, source_id, "AGR-001").await;
    // No coverage sync: the source covers nothing.

    let (status, body) = call(&st, post_json("/v1/availability", availability_body(agent_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["expected_sources"], 0);
    let request_id = body["request_id"].as_str().unwrap();

    let (status, poll) = call(
        &st,
        get(&format!("/v1/availability/{request_id}?since_seq=0&wait_ms=0")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(poll["complete"], true);
    assert_eq!(poll["last_seq"], 0);
    assert_eq!(poll["new_items"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn poll_unknown_job_is_404() {
    let st = make_state();
    let (status, body) = call(
        &st,
        get(&format!("/v1/availability/{}?since_seq=0", Uuid::new_v4())),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "NOT_FOUND");
}

// ---------------------------------------------------------------------------
// Booking over HTTP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn booking_requires_idempotency_key_header() {
    let st = make_state();
    let (agent_id, source_id) = seed_companies(&st).await;
    seed_active_agreement(&st, agent_id, source_id, "AGR-001").await;
    st.adapters.register(source_id, Arc::new(MockSourceAdapter::new()));

    let (status, body) = call(
        &st,
        post_json(
            "/v1/bookings",
            json!({ "agent_id": agent_id, "agreement_ref": "AGR-001" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "MISSING_IDEMPOTENCY");
}

#[tokio::test]
async fn booking_create_replay_and_commands() {
    let st = make_state();
    let (agent_id, source_id) = seed_companies(&st).await;
    seed_active_agreement(&st, agent_id, source_id, "AGR-001").await;
    st.adapters.register(source_id, Arc::new(MockSourceAdapter::new()));

    let create = |key: &str| {
        Request::builder()
            .method("POST")
            .uri("/v1/bookings")
            .header("content-type", "application/json")
            .header("Idempotency-Key", key)
            .body(axum::body::Body::from(
                json!({ "agent_id": agent_id, "agreement_ref": "AGR-001" }).to_string(),
            ))
            .unwrap()
    };

    let (status, first) = call(&st, create("K1")).await;
    assert_eq!(status, StatusCode::OK, "{first}");
    assert_eq!(first["status"], "REQUESTED");
    let sbr = first["supplier_booking_ref"].as_str().unwrap().to_string();

    // Replay: byte-identical canonical body.
    let (status, second) = call(&st, create("K1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );

    // Cancel, then check reflects CANCELLED.
    let (status, cancelled) = call(&st, post_json(&format!("/v1/bookings/{sbr}/cancel"), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["status"], "CANCELLED");

    let (status, checked) = call(&st, get(&format!("/v1/bookings/{sbr}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(checked["status"], "CANCELLED");
}

// ---------------------------------------------------------------------------
// Coverage overrides over HTTP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn coverage_override_upsert_and_effective_list() {
    let st = make_state();
    let (agent_id, source_id) = seed_companies(&st).await;
    let agreement_id = seed_active_agreement(&st, agent_id, source_id, "AGR-001").await;

    st.adapters.register(
        source_id,
        Arc::new(MockSourceAdapter::new().with_locations(vec!["GBMAN", "GBGLA"])),
    );
    let (status, _) = call(&st, post_json(&format!("/v1/coverage/sync/{source_id}"), json!({}))).await;
    assert_eq!(status, StatusCode::OK);

    // Deny GBMAN, allow PKKHI on top of base.
    let (status, _) = call(
        &st,
        put_json(
            &format!("/v1/coverage/agreement/{agreement_id}/GBMAN"),
            json!({"allowed": false}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(
        &st,
        put_json(
            &format!("/v1/coverage/agreement/{agreement_id}/PKKHI"),
            json!({"allowed": true}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&st, get(&format!("/v1/coverage/agreement/{agreement_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    let codes: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["unlocode"].as_str().unwrap())
        .collect();
    assert_eq!(codes, vec!["GBGLA", "PKKHI"]);

    // Unknown unlocode is rejected at the boundary.
    let (status, body) = call(
        &st,
        put_json(
            &format!("/v1/coverage/agreement/{agreement_id}/XXXXX"),
            json!({"allowed": true}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "INVALID_PARAM");
}

// ---------------------------------------------------------------------------
// Echo over HTTP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn echo_submit_and_poll() {
    let st = make_state();
    let (agent_id, source_id) = seed_companies(&st).await;
    seed_active_agreement(&st, agent_id, source_id, "AGR-001").await;
    st.adapters.register(source_id, Arc::new(MockSourceAdapter::new()));

    let (status, body) = call(
        &st,
        post_json(
            "/v1/echo",
            json!({
                "pos": { "agent_id": agent_id },
                "payload": { "message": "ping", "attrs": {"k": "v"} }
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["total_expected"], 1);
    let request_id = body["request_id"].as_str().unwrap().to_string();

    let mut since_seq = 0;
    loop {
        let (status, results) = call(
            &st,
            get(&format!("/v1/echo/{request_id}?since_seq={since_seq}&wait_ms=500")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        since_seq = results["last_seq"].as_u64().unwrap();
        if results["status"] == "COMPLETE" {
            assert_eq!(results["responses_received"], 1);
            assert_eq!(results["timed_out_sources"], 0);
            assert_eq!(results["aggregate_etag"].as_str().unwrap().len(), 16);
            break;
        }
    }
    // Give detached scatter tasks a moment to finish logging.
    tokio::time::sleep(Duration::from_millis(10)).await;
}

// ---------------------------------------------------------------------------
// Unknown routes return 404
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_route_returns_404() {
    let st = make_state();
    let (status, _) = call(&st, get("/v1/does_not_exist")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
