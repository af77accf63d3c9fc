//! Source adapters: the execution boundary between the middleware and a
//! car-rental Source.
//!
//! The [`SourceAdapter`] trait is the full capability set a Source exposes.
//! Everything above it (dispatcher, booking engine, coverage sync) is
//! adapter-agnostic; the two concrete variants are an in-process
//! deterministic mock and a typed JSON client against a per-Source
//! endpoint. Discovery is by company attributes: the registry constructs
//! and memoizes one client per Source.

use std::time::Duration;

use async_trait::async_trait;
use rmx_schemas::{AvailabilityCriteria, CoreError, EchoPayload, Offer};

pub mod mock;
pub mod registry;
pub mod remote;
pub mod types;

pub use mock::MockSourceAdapter;
pub use registry::AdapterRegistry;
pub use remote::RemoteSourceAdapter;
pub use types::{BookingCreateRequest, BookingModifyRequest, SourceBookingResponse};

/// Per-Source client contract.
///
/// Deadline semantics: `availability` must give up with `TIMEOUT` once
/// `deadline` elapses. Booking commands are bounded by the adapter's own
/// transport timeout; the engine maps an elapsed one to `UPSTREAM_TIMEOUT`.
/// Implementations MUST pass the Agent's idempotency key and the middleware
/// request id through to the Source verbatim.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    async fn availability(
        &self,
        criteria: &AvailabilityCriteria,
        agreement_ref: &str,
        deadline: Duration,
    ) -> Result<Vec<Offer>, CoreError>;

    async fn booking_create(
        &self,
        req: BookingCreateRequest,
    ) -> Result<SourceBookingResponse, CoreError>;

    async fn booking_modify(
        &self,
        req: BookingModifyRequest,
    ) -> Result<SourceBookingResponse, CoreError>;

    async fn booking_cancel(
        &self,
        supplier_booking_ref: &str,
        agreement_ref: &str,
    ) -> Result<SourceBookingResponse, CoreError>;

    async fn booking_check(
        &self,
        supplier_booking_ref: &str,
        agreement_ref: &str,
    ) -> Result<SourceBookingResponse, CoreError>;

    /// UN/LOCODEs the Source currently serves.
    async fn locations(&self) -> Result<Vec<String>, CoreError>;

    /// Liveness probe: the Source echoes the payload back. Same deadline
    /// semantics as `availability`.
    async fn echo(
        &self,
        payload: &EchoPayload,
        agreement_ref: &str,
        deadline: Duration,
    ) -> Result<EchoPayload, CoreError>;
}
