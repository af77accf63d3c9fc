//! Axum router and all HTTP handlers for rmx-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. All handlers are `pub(crate)` and the scenario tests
//! in `tests/` compose the bare router directly.

use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post, put},
    Json, Router,
};
use futures_util::Stream;
use rmx_agreements::CompanyDirectory;
use rmx_booking::CreateBookingInput;
use rmx_schemas::{Company, CoreError, JobStatus};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;
use uuid::Uuid;

use crate::{
    api_types::{
        AgreementListQuery, CompanyStatusRequest, CoverageEntry, CreateAgreementRequest,
        CreateBookingRequest, EchoSubmitRequest, ErrorResponse, HealthResponse,
        ModifyBookingRequest, OverrideRequest, PollAvailabilityResponse, PollQuery,
        SetAgreementStatusRequest, SubmitAvailabilityRequest,
    },
    state::{uptime_secs, AppState},
};

/// Long polls are bounded regardless of what the caller asks for.
const MAX_WAIT_MS: u64 = 30_000;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/health/sources", get(health_sources))
        .route("/v1/availability", post(availability_submit))
        .route("/v1/availability/:id", get(availability_poll))
        .route("/v1/bookings", post(booking_create))
        .route("/v1/bookings/:sbr", get(booking_check))
        .route("/v1/bookings/:sbr/modify", post(booking_modify))
        .route("/v1/bookings/:sbr/cancel", post(booking_cancel))
        .route("/v1/agreements", post(agreement_create).get(agreement_list))
        .route("/v1/agreements/:id", get(agreement_get))
        .route("/v1/agreements/:id/offer", post(agreement_offer))
        .route("/v1/agreements/:id/accept", post(agreement_accept))
        .route("/v1/agreements/:id/status", post(agreement_set_status))
        .route("/v1/coverage/sync/:source_id", post(coverage_sync))
        .route("/v1/coverage/agreement/:id", get(coverage_list))
        .route(
            "/v1/coverage/agreement/:id/:unlocode",
            put(coverage_upsert_override).delete(coverage_remove_override),
        )
        .route("/v1/echo", post(echo_submit))
        .route("/v1/echo/:id", get(echo_poll))
        .route("/v1/echo/:id/watch", get(echo_watch))
        // Ingestion boundary for the external identity service.
        .route("/v1/companies", post(company_upsert))
        .route("/v1/companies/:id/status", put(company_set_status))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn status_for(err: &CoreError) -> StatusCode {
    match err.code() {
        "INVALID_PARAM" | "MISSING_IDEMPOTENCY" => StatusCode::BAD_REQUEST,
        "NOT_FOUND" => StatusCode::NOT_FOUND,
        "DUPLICATE" => StatusCode::CONFLICT,
        "INVALID_TRANSITION" | "AGREEMENT_INACTIVE" | "INVALID_PARTY" => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        "UPSTREAM_TIMEOUT" | "TIMEOUT" => StatusCode::GATEWAY_TIMEOUT,
        "SOURCE_ERROR" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: CoreError) -> Response {
    let status = status_for(&err);
    debug!(code = err.code(), status = %status, "request failed");
    (
        status,
        Json(ErrorResponse {
            error: err.code().to_string(),
            message: err.to_string(),
        }),
    )
        .into_response()
}

fn ok_json<T: serde::Serialize>(body: T) -> Response {
    (StatusCode::OK, Json(body)).into_response()
}

fn clamp_wait(wait_ms: u64) -> Duration {
    Duration::from_millis(wait_ms.min(MAX_WAIT_MS))
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
            uptime_secs: uptime_secs(),
        }),
    )
}

pub(crate) async fn health_sources(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.health.snapshots()))
}

// ---------------------------------------------------------------------------
// Availability
// ---------------------------------------------------------------------------

pub(crate) async fn availability_submit(
    State(st): State<Arc<AppState>>,
    Json(body): Json<SubmitAvailabilityRequest>,
) -> Response {
    match st.dispatcher.submit(body.agent_id, body.criteria).await {
        Ok(receipt) => ok_json(receipt),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn availability_poll(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(q): Query<PollQuery>,
) -> Response {
    match st
        .dispatcher
        .jobs()
        .get_since(id, q.since_seq, clamp_wait(q.wait_ms))
        .await
    {
        Ok(poll) => ok_json(PollAvailabilityResponse {
            complete: poll.status == JobStatus::Complete,
            last_seq: poll.last_seq,
            new_items: poll.new_items,
        }),
        Err(err) => error_response(err),
    }
}

// ---------------------------------------------------------------------------
// Bookings
// ---------------------------------------------------------------------------

pub(crate) async fn booking_create(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateBookingRequest>,
) -> Response {
    let idempotency_key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    match st
        .bookings
        .create(
            body.agent_id,
            idempotency_key,
            CreateBookingInput {
                agreement_ref: body.agreement_ref,
                supplier_offer_ref: body.supplier_offer_ref,
                agent_booking_ref: body.agent_booking_ref,
            },
        )
        .await
    {
        Ok(canonical) => ok_json(canonical),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn booking_modify(
    State(st): State<Arc<AppState>>,
    Path(sbr): Path<String>,
    Json(body): Json<ModifyBookingRequest>,
) -> Response {
    match st.bookings.modify(&sbr, body.fields).await {
        Ok(canonical) => ok_json(canonical),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn booking_cancel(
    State(st): State<Arc<AppState>>,
    Path(sbr): Path<String>,
) -> Response {
    match st.bookings.cancel(&sbr).await {
        Ok(canonical) => ok_json(canonical),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn booking_check(
    State(st): State<Arc<AppState>>,
    Path(sbr): Path<String>,
) -> Response {
    match st.bookings.check(&sbr).await {
        Ok(canonical) => ok_json(canonical),
        Err(err) => error_response(err),
    }
}

// ---------------------------------------------------------------------------
// Agreements
// ---------------------------------------------------------------------------

pub(crate) async fn agreement_create(
    State(st): State<Arc<AppState>>,
    Json(body): Json<CreateAgreementRequest>,
) -> Response {
    match st
        .registry
        .create_draft(
            body.agent_id,
            body.source_id,
            body.agreement_ref,
            body.valid_from,
            body.valid_to,
        )
        .await
    {
        Ok(agreement) => ok_json(agreement),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn agreement_get(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match st.registry.get(id).await {
        Ok(agreement) => ok_json(agreement),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn agreement_list(
    State(st): State<Arc<AppState>>,
    Query(q): Query<AgreementListQuery>,
) -> Response {
    let result = match (q.agent_id, q.source_id) {
        (Some(agent_id), _) => st.registry.list_by_agent(agent_id, q.status).await,
        (None, Some(source_id)) => st.registry.list_by_source(source_id, q.status).await,
        (None, None) => Err(CoreError::InvalidParam(
            "agent_id or source_id query parameter is required".into(),
        )),
    };
    match result {
        Ok(rows) => ok_json(rows),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn agreement_offer(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match st.registry.offer(id).await {
        Ok(agreement) => ok_json(agreement),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn agreement_accept(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match st.registry.accept(id).await {
        Ok(agreement) => ok_json(agreement),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn agreement_set_status(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<SetAgreementStatusRequest>,
) -> Response {
    match st.registry.set_status(id, body.status).await {
        Ok(agreement) => ok_json(agreement),
        Err(err) => error_response(err),
    }
}

// ---------------------------------------------------------------------------
// Coverage
// ---------------------------------------------------------------------------

pub(crate) async fn coverage_sync(
    State(st): State<Arc<AppState>>,
    Path(source_id): Path<Uuid>,
) -> Response {
    let adapter = match st.adapters.for_source(source_id).await {
        Ok(adapter) => adapter,
        Err(err) => return error_response(err),
    };
    match st
        .coverage
        .sync_source_coverage(source_id, adapter.as_ref())
        .await
    {
        Ok(report) => ok_json(report),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn coverage_list(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match st.coverage.effective(id).await {
        Ok(codes) => ok_json(
            codes
                .into_iter()
                .map(|unlocode| CoverageEntry {
                    unlocode,
                    allowed: true,
                })
                .collect::<Vec<_>>(),
        ),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn coverage_upsert_override(
    State(st): State<Arc<AppState>>,
    Path((id, unlocode)): Path<(Uuid, String)>,
    Json(body): Json<OverrideRequest>,
) -> Response {
    match st.coverage.upsert_override(id, &unlocode, body.allowed).await {
        Ok(()) => ok_json(serde_json::json!({ "ok": true })),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn coverage_remove_override(
    State(st): State<Arc<AppState>>,
    Path((id, unlocode)): Path<(Uuid, String)>,
) -> Response {
    match st.coverage.remove_override(id, &unlocode).await {
        Ok(()) => ok_json(serde_json::json!({ "ok": true })),
        Err(err) => error_response(err),
    }
}

// ---------------------------------------------------------------------------
// Echo
// ---------------------------------------------------------------------------

pub(crate) async fn echo_submit(
    State(st): State<Arc<AppState>>,
    Json(body): Json<EchoSubmitRequest>,
) -> Response {
    match st
        .echo
        .submit(body.pos.agent_id, body.pos.agreement_ref, body.payload)
        .await
    {
        Ok(receipt) => ok_json(receipt),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn echo_poll(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(q): Query<PollQuery>,
) -> Response {
    match st
        .echo
        .get_results(id, q.since_seq, clamp_wait(q.wait_ms))
        .await
    {
        Ok(results) => ok_json(results),
        Err(err) => error_response(err),
    }
}

/// Server stream over an echo job: an internal poll every `watch_poll_ms`,
/// stopping at COMPLETE or after `watch_max_ms`, whichever is first.
pub(crate) async fn echo_watch(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    // Unknown job ids fail fast instead of producing an empty stream.
    if let Err(err) = st.echo.jobs().get_job(id) {
        return error_response(err);
    }

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(16);
    let poll_interval = Duration::from_millis(st.echo.config().watch_poll_ms);
    let watch_cap = Duration::from_millis(st.echo.config().watch_max_ms);

    tokio::spawn(async move {
        let deadline = tokio::time::Instant::now() + watch_cap;
        let mut since_seq = 0u64;

        loop {
            let results = match st.echo.get_results(id, since_seq, Duration::ZERO).await {
                Ok(results) => results,
                Err(_) => break,
            };
            since_seq = results.last_seq;
            let complete = results.status == JobStatus::Complete;

            let event = match serde_json::to_string(&results) {
                Ok(data) => Event::default().event("results").data(data),
                Err(_) => break,
            };
            if tx.send(Ok(event)).await.is_err() {
                break; // watcher went away; the job is unaffected
            }
            if complete {
                let _ = tx.send(Ok(Event::default().event("complete").data("{}"))).await;
                break;
            }
            if tokio::time::Instant::now() + poll_interval > deadline {
                break;
            }
            tokio::time::sleep(poll_interval).await;
        }
    });

    let stream: ReceiverStream<Result<Event, Infallible>> = ReceiverStream::new(rx);
    sse_response(stream)
}

fn sse_response<S>(stream: S) -> Response
where
    S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    Sse::new(stream).keep_alive(KeepAlive::new()).into_response()
}

// ---------------------------------------------------------------------------
// Companies (identity-service ingestion)
// ---------------------------------------------------------------------------

pub(crate) async fn company_upsert(
    State(st): State<Arc<AppState>>,
    Json(company): Json<Company>,
) -> Response {
    match st.stores.companies.upsert(company).await {
        Ok(()) => ok_json(serde_json::json!({ "ok": true })),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn company_set_status(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<CompanyStatusRequest>,
) -> Response {
    match st.stores.companies.set_status(id, body.status).await {
        Ok(()) => ok_json(serde_json::json!({ "ok": true })),
        Err(err) => error_response(err),
    }
}
