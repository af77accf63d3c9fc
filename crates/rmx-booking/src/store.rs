//! Storage seam for bookings and idempotency keys.
//!
//! The two writes of a create (the booking row and its idempotency key)
//! are one atomic unit: an observer sees both or neither. The in-memory
//! implementation gets this from a single critical section; the Postgres
//! implementation in `rmx-db` uses one transaction and falls through to the
//! prior row on a unique violation.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rmx_schemas::{Booking, BookingId, BookingStatus, CompanyId, CoreError};
use serde_json::Value;

/// `(agent_id, scope, key)` → the committed result and its canonical body.
#[derive(Debug, Clone)]
pub struct IdempotencyRecord {
    pub agent_id: CompanyId,
    pub scope: String,
    pub key: String,
    pub booking_id: BookingId,
    /// Stored verbatim so replays are byte-identical to the original
    /// response.
    pub canonical_body: Value,
    pub created_at: DateTime<Utc>,
}

/// Result of an atomic create: either this call committed, or a concurrent
/// or earlier call with the same key already did.
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Created(Booking),
    Prior(IdempotencyRecord),
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Atomically insert the booking row and its idempotency record.
    /// A concurrent duplicate of the same `(agent, scope, key)` loses the
    /// race and receives `Prior`. Fails with `DUPLICATE` when the
    /// `(source_id, supplier_booking_ref)` pair already exists.
    async fn create_with_key(
        &self,
        booking: Booking,
        scope: &str,
        canonical_body: Value,
    ) -> Result<CreateOutcome, CoreError>;

    /// Prior result for the key, if any. Expired records count as absent.
    async fn find_key(
        &self,
        agent_id: CompanyId,
        scope: &str,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, CoreError>;

    async fn get(&self, id: BookingId) -> Result<Option<Booking>, CoreError>;

    async fn get_by_supplier_ref(
        &self,
        supplier_booking_ref: &str,
    ) -> Result<Option<Booking>, CoreError>;

    /// Refresh status + payload snapshot from a Source response.
    async fn update_snapshot(
        &self,
        id: BookingId,
        status: BookingStatus,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Result<Booking, CoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

pub struct MemoryBookingStore {
    inner: RwLock<MemoryBookingInner>,
    key_ttl: Duration,
}

#[derive(Default)]
struct MemoryBookingInner {
    bookings: HashMap<BookingId, Booking>,
    /// (agent_id, scope, key) -> record.
    keys: HashMap<(CompanyId, String, String), IdempotencyRecord>,
    /// (source_id, supplier_booking_ref) -> booking id.
    by_supplier_ref: HashMap<(CompanyId, String), BookingId>,
}

impl MemoryBookingStore {
    pub fn new(key_ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(MemoryBookingInner::default()),
            key_ttl,
        }
    }

    /// Number of booking rows (test hook).
    pub fn booking_count(&self) -> usize {
        self.inner.read().expect("booking lock").bookings.len()
    }

    fn key_expired(&self, rec: &IdempotencyRecord) -> bool {
        let age = Utc::now() - rec.created_at;
        age.to_std().map_or(false, |a| a > self.key_ttl)
    }
}

#[async_trait]
impl BookingStore for MemoryBookingStore {
    async fn create_with_key(
        &self,
        booking: Booking,
        scope: &str,
        canonical_body: Value,
    ) -> Result<CreateOutcome, CoreError> {
        let key = booking
            .idempotency_key
            .clone()
            .ok_or(CoreError::MissingIdempotency)?;

        let mut inner = self.inner.write().expect("booking lock");

        let map_key = (booking.agent_id, scope.to_string(), key.clone());
        if let Some(existing) = inner.keys.get(&map_key) {
            if !self.key_expired(existing) {
                return Ok(CreateOutcome::Prior(existing.clone()));
            }
        }

        if let Some(supplier_ref) = &booking.supplier_booking_ref {
            let ref_key = (booking.source_id, supplier_ref.clone());
            if let Some(other) = inner.by_supplier_ref.get(&ref_key) {
                if *other != booking.id {
                    return Err(CoreError::Duplicate(format!(
                        "supplier_booking_ref '{supplier_ref}' already exists for this source"
                    )));
                }
            }
            inner.by_supplier_ref.insert(ref_key, booking.id);
        }

        let record = IdempotencyRecord {
            agent_id: booking.agent_id,
            scope: scope.to_string(),
            key,
            booking_id: booking.id,
            canonical_body,
            created_at: Utc::now(),
        };
        inner.keys.insert(map_key, record);
        inner.bookings.insert(booking.id, booking.clone());

        Ok(CreateOutcome::Created(booking))
    }

    async fn find_key(
        &self,
        agent_id: CompanyId,
        scope: &str,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, CoreError> {
        let inner = self.inner.read().expect("booking lock");
        Ok(inner
            .keys
            .get(&(agent_id, scope.to_string(), key.to_string()))
            .filter(|rec| !self.key_expired(rec))
            .cloned())
    }

    async fn get(&self, id: BookingId) -> Result<Option<Booking>, CoreError> {
        Ok(self
            .inner
            .read()
            .expect("booking lock")
            .bookings
            .get(&id)
            .cloned())
    }

    async fn get_by_supplier_ref(
        &self,
        supplier_booking_ref: &str,
    ) -> Result<Option<Booking>, CoreError> {
        let inner = self.inner.read().expect("booking lock");
        Ok(inner
            .bookings
            .values()
            .find(|b| b.supplier_booking_ref.as_deref() == Some(supplier_booking_ref))
            .cloned())
    }

    async fn update_snapshot(
        &self,
        id: BookingId,
        status: BookingStatus,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Result<Booking, CoreError> {
        let mut inner = self.inner.write().expect("booking lock");
        let booking = inner
            .bookings
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("booking {id}")))?;
        booking.status = status;
        booking.payload = payload;
        booking.updated_at = now;
        Ok(booking.clone())
    }
}
