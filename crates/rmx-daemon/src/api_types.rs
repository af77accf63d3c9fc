//! Request/response DTOs for the HTTP surface. Wire-only shapes live here;
//! anything with behavior belongs to the engine crates.

use chrono::{DateTime, Utc};
use rmx_schemas::{
    AgreementStatus, AvailabilityCriteria, CompanyId, CompanyStatus, EchoPayload, JobItem,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Availability
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitAvailabilityRequest {
    pub agent_id: CompanyId,
    #[serde(flatten)]
    pub criteria: AvailabilityCriteria,
}

/// Shared long-poll cursor query (`?since_seq=N&wait_ms=M`).
#[derive(Debug, Deserialize)]
pub struct PollQuery {
    #[serde(default)]
    pub since_seq: u64,
    #[serde(default = "default_wait_ms")]
    pub wait_ms: u64,
}

fn default_wait_ms() -> u64 {
    1_000
}

#[derive(Debug, Serialize)]
pub struct PollAvailabilityResponse {
    pub complete: bool,
    pub last_seq: u64,
    pub new_items: Vec<JobItem>,
}

// ---------------------------------------------------------------------------
// Booking
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateBookingRequest {
    pub agent_id: CompanyId,
    pub agreement_ref: String,
    #[serde(default)]
    pub supplier_offer_ref: Option<String>,
    #[serde(default)]
    pub agent_booking_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ModifyBookingRequest {
    /// Source-defined; forwarded unchanged.
    #[serde(default)]
    pub fields: Value,
}

// ---------------------------------------------------------------------------
// Agreements & companies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateAgreementRequest {
    pub agent_id: CompanyId,
    pub source_id: CompanyId,
    pub agreement_ref: String,
    #[serde(default)]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub valid_to: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct SetAgreementStatusRequest {
    pub status: AgreementStatus,
}

#[derive(Debug, Deserialize)]
pub struct AgreementListQuery {
    pub agent_id: Option<CompanyId>,
    pub source_id: Option<CompanyId>,
    pub status: Option<AgreementStatus>,
}

#[derive(Debug, Deserialize)]
pub struct CompanyStatusRequest {
    pub status: CompanyStatus,
}

// ---------------------------------------------------------------------------
// Coverage
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct OverrideRequest {
    pub allowed: bool,
}

#[derive(Debug, Serialize)]
pub struct CoverageEntry {
    pub unlocode: String,
    pub allowed: bool,
}

// ---------------------------------------------------------------------------
// Echo
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct EchoPos {
    pub agent_id: CompanyId,
    #[serde(default)]
    pub agreement_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EchoSubmitRequest {
    pub pos: EchoPos,
    pub payload: EchoPayload,
}

// ---------------------------------------------------------------------------
// Misc
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
