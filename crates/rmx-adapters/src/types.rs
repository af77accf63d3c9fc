//! Adapter-boundary request/response shapes, Source-agnostic.

use rmx_schemas::{BookingStatus, CompanyId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Booking creation as forwarded to a Source. The Agent's idempotency key
/// and the middleware request id travel with the call so the Source can
/// de-duplicate on its side and correlate logs with ours.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingCreateRequest {
    pub agreement_ref: String,
    pub supplier_offer_ref: Option<String>,
    pub agent_booking_ref: Option<String>,
    pub idempotency_key: String,
    pub middleware_request_id: Uuid,
    pub agent_id: CompanyId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingModifyRequest {
    pub supplier_booking_ref: String,
    pub agreement_ref: String,
    /// Source-defined; passed through unchanged and never validated here.
    pub fields: Value,
}

/// Uniform response shape for all four booking commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceBookingResponse {
    pub supplier_booking_ref: String,
    pub status: BookingStatus,
    /// Whatever else the Source returned, kept verbatim as the payload
    /// snapshot on the booking row.
    #[serde(default)]
    pub extra: Value,
}
