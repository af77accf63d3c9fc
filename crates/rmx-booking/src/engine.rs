//! Booking engine: create / modify / cancel / check against one Source.
//!
//! Create is a pure function of `(agent, idempotency key)`: the canonical
//! response body is committed together with the key, and every replay,
//! racing or later, returns that body byte-identically without touching
//! the Source again. The agreement is revalidated at every command, not
//! just at create time.

use std::sync::Arc;

use chrono::Utc;
use rmx_adapters::{AdapterRegistry, BookingCreateRequest, BookingModifyRequest};
use rmx_agreements::AgreementRegistry;
use rmx_audit::{Auditor, BoundaryEvent, Direction};
use rmx_schemas::{Booking, CompanyId, CoreError};
use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

pub const SCOPE_BOOKING_CREATE: &str = "booking:create";

use crate::store::{BookingStore, CreateOutcome};

#[derive(Debug, Clone)]
pub struct CreateBookingInput {
    pub agreement_ref: String,
    pub supplier_offer_ref: Option<String>,
    pub agent_booking_ref: Option<String>,
}

pub struct BookingEngine {
    agreements: Arc<AgreementRegistry>,
    adapters: Arc<AdapterRegistry>,
    store: Arc<dyn BookingStore>,
    audit: Arc<Auditor>,
}

impl BookingEngine {
    pub fn new(
        agreements: Arc<AgreementRegistry>,
        adapters: Arc<AdapterRegistry>,
        store: Arc<dyn BookingStore>,
        audit: Arc<Auditor>,
    ) -> Self {
        Self {
            agreements,
            adapters,
            store,
            audit,
        }
    }

    /// Create a booking. The idempotency key is mandatory; a key that
    /// already committed returns the prior canonical body and never
    /// contacts the Source.
    pub async fn create(
        &self,
        agent_id: CompanyId,
        idempotency_key: Option<String>,
        input: CreateBookingInput,
    ) -> Result<Value, CoreError> {
        let key = match idempotency_key {
            Some(k) if !k.trim().is_empty() => k,
            _ => return Err(CoreError::MissingIdempotency),
        };

        if let Some(prior) = self
            .store
            .find_key(agent_id, SCOPE_BOOKING_CREATE, &key)
            .await?
        {
            debug!(agent_id = %agent_id, "idempotent replay; source not contacted");
            return Ok(prior.canonical_body);
        }

        // Revalidate at this instant; the agreement may have moved since
        // the offer was shown.
        let active = self
            .agreements
            .resolve_active(agent_id, std::slice::from_ref(&input.agreement_ref))
            .await?;
        let agreement = active
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::AgreementInactive(input.agreement_ref.clone()))?;

        let request_id = Uuid::new_v4();
        let adapter = self.adapters.for_source(agreement.source_id).await?;
        let started = std::time::Instant::now();
        let response = adapter
            .booking_create(BookingCreateRequest {
                agreement_ref: input.agreement_ref.clone(),
                supplier_offer_ref: input.supplier_offer_ref.clone(),
                agent_booking_ref: input.agent_booking_ref.clone(),
                idempotency_key: key.clone(),
                middleware_request_id: request_id,
                agent_id,
            })
            .await
            .map_err(map_upstream)?;
        let duration_ms = started.elapsed().as_millis() as u64;

        let now = Utc::now();
        let booking = Booking {
            id: Uuid::new_v4(),
            agent_id,
            source_id: agreement.source_id,
            agreement_ref: input.agreement_ref.clone(),
            supplier_booking_ref: Some(response.supplier_booking_ref.clone()),
            status: response.status,
            idempotency_key: Some(key.clone()),
            payload: serde_json::to_value(&response).unwrap_or(Value::Null),
            created_at: now,
            updated_at: now,
        };
        let canonical_body = canonical_booking_body(&booking);

        // Booking row + key row commit together; a concurrent retry of the
        // same key falls through to the winner's body.
        let outcome = self
            .store
            .create_with_key(booking, SCOPE_BOOKING_CREATE, canonical_body.clone())
            .await?;
        let body = match outcome {
            CreateOutcome::Created(created) => {
                info!(
                    booking_id = %created.id,
                    supplier_booking_ref = ?created.supplier_booking_ref,
                    "booking created"
                );
                canonical_body
            }
            CreateOutcome::Prior(prior) => prior.canonical_body,
        };

        self.audit.emit(BoundaryEvent {
            direction: Direction::In,
            endpoint: "booking.create".to_string(),
            request_id,
            actor_company_id: Some(agent_id),
            source_id: Some(agreement.source_id),
            agreement_ref: Some(input.agreement_ref),
            status_code: 200,
            request: json!({
                "supplier_offer_ref": input.supplier_offer_ref,
                "idempotency_key": key,
            }),
            response: body.clone(),
            duration_ms,
        });

        Ok(body)
    }

    pub async fn modify(
        &self,
        supplier_booking_ref: &str,
        fields: Value,
    ) -> Result<Value, CoreError> {
        let booking = self.lookup(supplier_booking_ref).await?;
        self.revalidate(&booking).await?;

        let adapter = self.adapters.for_source(booking.source_id).await?;
        let response = adapter
            .booking_modify(BookingModifyRequest {
                supplier_booking_ref: supplier_booking_ref.to_string(),
                agreement_ref: booking.agreement_ref.clone(),
                // Source-defined; forwarded unchanged.
                fields,
            })
            .await
            .map_err(map_upstream)?;

        self.finish_command("booking.modify", booking, response).await
    }

    pub async fn cancel(&self, supplier_booking_ref: &str) -> Result<Value, CoreError> {
        let booking = self.lookup(supplier_booking_ref).await?;
        self.revalidate(&booking).await?;

        let adapter = self.adapters.for_source(booking.source_id).await?;
        let response = adapter
            .booking_cancel(supplier_booking_ref, &booking.agreement_ref)
            .await
            .map_err(map_upstream)?;

        self.finish_command("booking.cancel", booking, response).await
    }

    pub async fn check(&self, supplier_booking_ref: &str) -> Result<Value, CoreError> {
        let booking = self.lookup(supplier_booking_ref).await?;
        self.revalidate(&booking).await?;

        let adapter = self.adapters.for_source(booking.source_id).await?;
        let response = adapter
            .booking_check(supplier_booking_ref, &booking.agreement_ref)
            .await
            .map_err(map_upstream)?;

        self.finish_command("booking.check", booking, response).await
    }

    // -- internals ----------------------------------------------------------

    async fn lookup(&self, supplier_booking_ref: &str) -> Result<Booking, CoreError> {
        self.store
            .get_by_supplier_ref(supplier_booking_ref)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("booking {supplier_booking_ref}")))
    }

    async fn revalidate(&self, booking: &Booking) -> Result<(), CoreError> {
        let active = self
            .agreements
            .resolve_active(
                booking.agent_id,
                std::slice::from_ref(&booking.agreement_ref),
            )
            .await?;
        if active.is_empty() {
            return Err(CoreError::AgreementInactive(booking.agreement_ref.clone()));
        }
        Ok(())
    }

    async fn finish_command(
        &self,
        endpoint: &str,
        booking: Booking,
        response: rmx_adapters::SourceBookingResponse,
    ) -> Result<Value, CoreError> {
        let updated = self
            .store
            .update_snapshot(
                booking.id,
                response.status,
                serde_json::to_value(&response).unwrap_or(Value::Null),
                Utc::now(),
            )
            .await?;
        let body = canonical_booking_body(&updated);

        self.audit.emit(BoundaryEvent {
            direction: Direction::In,
            endpoint: endpoint.to_string(),
            request_id: Uuid::new_v4(),
            actor_company_id: Some(updated.agent_id),
            source_id: Some(updated.source_id),
            agreement_ref: Some(updated.agreement_ref.clone()),
            status_code: 200,
            request: json!({ "supplier_booking_ref": updated.supplier_booking_ref }),
            response: body.clone(),
            duration_ms: 0,
        });

        Ok(body)
    }
}

/// The canonical response body for a booking, shared by first execution and
/// every replay.
fn canonical_booking_body(booking: &Booking) -> Value {
    json!({
        "booking_id": booking.id,
        "supplier_booking_ref": booking.supplier_booking_ref,
        "status": booking.status,
        "agreement_ref": booking.agreement_ref,
        "source_id": booking.source_id,
    })
}

/// Transport timeouts on the command path surface as `UPSTREAM_TIMEOUT`.
fn map_upstream(err: CoreError) -> CoreError {
    match err {
        CoreError::Timeout => CoreError::UpstreamTimeout,
        other => other,
    }
}
