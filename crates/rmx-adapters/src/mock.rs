//! Deterministic in-memory Source adapter.
//!
//! Design decisions (kept intentionally simple/deterministic):
//! - `supplier_booking_ref` is derived from the idempotency key:
//!   `"SBR-{idempotency_key}"`. Re-creates with the same key return the
//!   stored booking unchanged.
//! - No randomness. Latency exists only when configured via `with_delay`.
//! - Failure modes are explicit switches, so a test states exactly what it
//!   simulates.
//!
//! Doubles as the health-probe target and as the scripted Source for the
//! scenario tests: it records every booking request it receives so tests
//! can assert what actually crossed the boundary.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rmx_schemas::{AvailabilityCriteria, BookingStatus, CoreError, EchoPayload, Offer};
use serde_json::Value;

use crate::types::{BookingCreateRequest, BookingModifyRequest, SourceBookingResponse};
use crate::SourceAdapter;

#[derive(Default)]
pub struct MockSourceAdapter {
    offers: Vec<Offer>,
    locations: Vec<String>,
    delay: Option<Duration>,
    availability_error: Option<String>,
    booking_error: Option<String>,
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    /// supplier_booking_ref -> current status.
    bookings: BTreeMap<String, BookingStatus>,
    /// Every create request seen, in arrival order.
    create_requests: Vec<BookingCreateRequest>,
}

impl MockSourceAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offers returned by every availability call; `agreement_ref` is
    /// rewritten per call to the agreement being searched.
    pub fn with_offers(mut self, offers: Vec<Offer>) -> Self {
        self.offers = offers;
        self
    }

    pub fn with_locations(mut self, locations: Vec<&str>) -> Self {
        self.locations = locations.into_iter().map(String::from).collect();
        self
    }

    /// Sleep this long before answering any availability call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every availability call fails with `SOURCE_ERROR: {message}`.
    pub fn with_availability_error(mut self, message: &str) -> Self {
        self.availability_error = Some(message.to_string());
        self
    }

    /// Every booking command fails with `SOURCE_ERROR: {message}`.
    pub fn with_booking_error(mut self, message: &str) -> Self {
        self.booking_error = Some(message.to_string());
        self
    }

    /// Create requests received so far (test hook).
    pub fn seen_create_requests(&self) -> Vec<BookingCreateRequest> {
        self.state.lock().expect("mock state").create_requests.clone()
    }

    fn supplier_ref_for(key: &str) -> String {
        format!("SBR-{key}")
    }
}

#[async_trait]
impl SourceAdapter for MockSourceAdapter {
    async fn availability(
        &self,
        _criteria: &AvailabilityCriteria,
        agreement_ref: &str,
        deadline: Duration,
    ) -> Result<Vec<Offer>, CoreError> {
        if let Some(delay) = self.delay {
            if delay >= deadline {
                tokio::time::sleep(deadline).await;
                return Err(CoreError::Timeout);
            }
            tokio::time::sleep(delay).await;
        }
        if let Some(msg) = &self.availability_error {
            return Err(CoreError::SourceError(msg.clone()));
        }
        Ok(self
            .offers
            .iter()
            .cloned()
            .map(|mut o| {
                o.agreement_ref = agreement_ref.to_string();
                o
            })
            .collect())
    }

    async fn booking_create(
        &self,
        req: BookingCreateRequest,
    ) -> Result<SourceBookingResponse, CoreError> {
        if let Some(msg) = &self.booking_error {
            return Err(CoreError::SourceError(msg.clone()));
        }
        let supplier_booking_ref = Self::supplier_ref_for(&req.idempotency_key);

        let mut state = self.state.lock().expect("mock state");
        state.create_requests.push(req);
        let status = *state
            .bookings
            .entry(supplier_booking_ref.clone())
            .or_insert(BookingStatus::Requested);

        Ok(SourceBookingResponse {
            supplier_booking_ref,
            status,
            extra: Value::Null,
        })
    }

    async fn booking_modify(
        &self,
        req: BookingModifyRequest,
    ) -> Result<SourceBookingResponse, CoreError> {
        if let Some(msg) = &self.booking_error {
            return Err(CoreError::SourceError(msg.clone()));
        }
        let state = self.state.lock().expect("mock state");
        let status = state
            .bookings
            .get(&req.supplier_booking_ref)
            .copied()
            .ok_or_else(|| CoreError::NotFound(format!("booking {}", req.supplier_booking_ref)))?;
        Ok(SourceBookingResponse {
            supplier_booking_ref: req.supplier_booking_ref,
            status,
            extra: req.fields,
        })
    }

    async fn booking_cancel(
        &self,
        supplier_booking_ref: &str,
        _agreement_ref: &str,
    ) -> Result<SourceBookingResponse, CoreError> {
        if let Some(msg) = &self.booking_error {
            return Err(CoreError::SourceError(msg.clone()));
        }
        let mut state = self.state.lock().expect("mock state");
        let status = state
            .bookings
            .get_mut(supplier_booking_ref)
            .ok_or_else(|| CoreError::NotFound(format!("booking {supplier_booking_ref}")))?;
        *status = BookingStatus::Cancelled;
        Ok(SourceBookingResponse {
            supplier_booking_ref: supplier_booking_ref.to_string(),
            status: *status,
            extra: Value::Null,
        })
    }

    async fn booking_check(
        &self,
        supplier_booking_ref: &str,
        _agreement_ref: &str,
    ) -> Result<SourceBookingResponse, CoreError> {
        if let Some(msg) = &self.booking_error {
            return Err(CoreError::SourceError(msg.clone()));
        }
        let state = self.state.lock().expect("mock state");
        let status = state
            .bookings
            .get(supplier_booking_ref)
            .copied()
            .ok_or_else(|| CoreError::NotFound(format!("booking {supplier_booking_ref}")))?;
        Ok(SourceBookingResponse {
            supplier_booking_ref: supplier_booking_ref.to_string(),
            status,
            extra: Value::Null,
        })
    }

    async fn locations(&self) -> Result<Vec<String>, CoreError> {
        Ok(self.locations.clone())
    }

    async fn echo(
        &self,
        payload: &EchoPayload,
        _agreement_ref: &str,
        deadline: Duration,
    ) -> Result<EchoPayload, CoreError> {
        if let Some(delay) = self.delay {
            if delay >= deadline {
                tokio::time::sleep(deadline).await;
                return Err(CoreError::Timeout);
            }
            tokio::time::sleep(delay).await;
        }
        if let Some(msg) = &self.availability_error {
            return Err(CoreError::SourceError(msg.clone()));
        }
        Ok(payload.clone())
    }
}

/// Convenience constructor for the offer shape tests use everywhere.
pub fn offer(supplier_offer_ref: &str, vehicle_class: &str, price: &str) -> Offer {
    Offer {
        supplier_offer_ref: supplier_offer_ref.to_string(),
        agreement_ref: String::new(),
        vehicle_class: vehicle_class.to_string(),
        price: price.to_string(),
        currency: "EUR".to_string(),
    }
}
