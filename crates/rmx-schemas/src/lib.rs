//! Shared data types for the RentMesh core.
//!
//! Everything crossing a crate boundary lives here: company and agreement
//! entities, availability criteria and result payloads, booking records,
//! echo payloads. No behavior beyond small predicates; engines own logic.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub mod error;

pub use error::CoreError;

pub type CompanyId = Uuid;
pub type AgreementId = Uuid;
pub type JobId = Uuid;
pub type BookingId = Uuid;

// ---------------------------------------------------------------------------
// Company
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompanyKind {
    Agent,
    Source,
    Admin,
}

impl CompanyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompanyKind::Agent => "AGENT",
            CompanyKind::Source => "SOURCE",
            CompanyKind::Admin => "ADMIN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "AGENT" => Some(CompanyKind::Agent),
            "SOURCE" => Some(CompanyKind::Source),
            "ADMIN" => Some(CompanyKind::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompanyStatus {
    PendingVerification,
    Active,
    Suspended,
}

impl CompanyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompanyStatus::PendingVerification => "PENDING_VERIFICATION",
            CompanyStatus::Active => "ACTIVE",
            CompanyStatus::Suspended => "SUSPENDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING_VERIFICATION" => Some(CompanyStatus::PendingVerification),
            "ACTIVE" => Some(CompanyStatus::Active),
            "SUSPENDED" => Some(CompanyStatus::Suspended),
            _ => None,
        }
    }
}

/// How the middleware reaches a Source: an in-process synthetic adapter or
/// a typed JSON client against the company's endpoint URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    Mock,
    Remote,
}

impl AdapterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterKind::Mock => "mock",
            AdapterKind::Remote => "remote",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mock" => Some(AdapterKind::Mock),
            "remote" => Some(AdapterKind::Remote),
            _ => None,
        }
    }
}

/// A participant company. Created and verified by the external identity
/// service; the core reads these rows and only ever toggles SUSPENDED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Company {
    pub id: CompanyId,
    pub name: String,
    pub kind: CompanyKind,
    pub status: CompanyStatus,
    /// Present on Sources only.
    pub adapter_kind: Option<AdapterKind>,
    /// Base URL of the Source endpoint; present when `adapter_kind` is remote.
    pub endpoint: Option<String>,
}

impl Company {
    pub fn is_active(&self) -> bool {
        self.status == CompanyStatus::Active
    }
}

// ---------------------------------------------------------------------------
// Agreement
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgreementStatus {
    Draft,
    Offered,
    Accepted,
    Active,
    Suspended,
    Expired,
}

impl AgreementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgreementStatus::Draft => "DRAFT",
            AgreementStatus::Offered => "OFFERED",
            AgreementStatus::Accepted => "ACCEPTED",
            AgreementStatus::Active => "ACTIVE",
            AgreementStatus::Suspended => "SUSPENDED",
            AgreementStatus::Expired => "EXPIRED",
        }
    }

    /// EXPIRED admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgreementStatus::Expired)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DRAFT" => Some(AgreementStatus::Draft),
            "OFFERED" => Some(AgreementStatus::Offered),
            "ACCEPTED" => Some(AgreementStatus::Accepted),
            "ACTIVE" => Some(AgreementStatus::Active),
            "SUSPENDED" => Some(AgreementStatus::Suspended),
            "EXPIRED" => Some(AgreementStatus::Expired),
            _ => None,
        }
    }
}

/// A bilateral contract between one Agent and one Source. The natural key
/// `(source_id, agreement_ref)` is unique; rows are never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agreement {
    pub id: AgreementId,
    pub agent_id: CompanyId,
    pub source_id: CompanyId,
    pub agreement_ref: String,
    pub status: AgreementStatus,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_to: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agreement {
    /// ACTIVE status alone is not enough: a `valid_to` in the past means the
    /// agreement is logically EXPIRED even if the stored status says ACTIVE,
    /// and a future `valid_from` means it is not yet in force.
    pub fn is_operational(&self, now: DateTime<Utc>) -> bool {
        self.status == AgreementStatus::Active
            && self.valid_from.map_or(true, |t| t <= now)
            && self.valid_to.map_or(true, |t| t > now)
    }
}

/// Row returned by `resolve_active`, the only agreement projection the
/// dispatcher consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveAgreement {
    pub id: AgreementId,
    pub agreement_ref: String,
    pub source_id: CompanyId,
}

// ---------------------------------------------------------------------------
// Availability
// ---------------------------------------------------------------------------

/// Search criteria as submitted by an Agent. Accepts both camelCase and
/// snake_case spellings on the wire; internal code always reads snake_case.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AvailabilityCriteria {
    #[serde(alias = "pickupUnlocode")]
    pub pickup_unlocode: String,
    #[serde(alias = "dropoffUnlocode")]
    pub dropoff_unlocode: String,
    #[serde(alias = "pickupIso")]
    pub pickup_iso: String,
    #[serde(alias = "dropoffIso")]
    pub dropoff_iso: String,
    #[serde(alias = "driverAge")]
    pub driver_age: u32,
    #[serde(default, alias = "residencyCountry")]
    pub residency_country: Option<String>,
    #[serde(default, alias = "vehicleClasses")]
    pub vehicle_classes: Option<Vec<String>>,
    /// Empty or absent means "every ACTIVE agreement of the Agent".
    #[serde(default, alias = "agreementRefs")]
    pub agreement_refs: Option<Vec<String>>,
}

/// One rental offer as returned by a Source. Monetary amounts stay strings;
/// the middleware never does arithmetic on them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub supplier_offer_ref: String,
    pub agreement_ref: String,
    pub vehicle_class: String,
    pub price: String,
    pub currency: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    InProgress,
    Complete,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Complete => "COMPLETE",
        }
    }
}

/// One appended fan-in result. `payload` is either an offers array, an
/// empty array with `timed_out = true`, or a single `{error, message,
/// agreement_ref}` object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobItem {
    pub seq: u64,
    pub source_id: CompanyId,
    pub payload: Value,
    pub timed_out: bool,
    pub created_at: DateTime<Utc>,
}

/// Error payload materialized into a job instead of failing the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceErrorItem {
    pub error: String,
    pub message: String,
    pub agreement_ref: String,
}

// ---------------------------------------------------------------------------
// Booking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Requested,
    Confirmed,
    Cancelled,
    Failed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Requested => "REQUESTED",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Cancelled => "CANCELLED",
            BookingStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "REQUESTED" => Some(BookingStatus::Requested),
            "CONFIRMED" => Some(BookingStatus::Confirmed),
            "CANCELLED" => Some(BookingStatus::Cancelled),
            "FAILED" => Some(BookingStatus::Failed),
            _ => None,
        }
    }
}

/// Canonical booking record. `supplier_booking_ref` stays null until the
/// Source assigns one; the `payload` snapshot is the last Source response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub agent_id: CompanyId,
    pub source_id: CompanyId,
    pub agreement_ref: String,
    pub supplier_booking_ref: Option<String>,
    pub status: BookingStatus,
    pub idempotency_key: Option<String>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Source health
// ---------------------------------------------------------------------------

/// Point-in-time health row for one Source, as surfaced by the monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceHealthSnapshot {
    pub source_id: CompanyId,
    pub sample_count: usize,
    pub slow_count: usize,
    pub slow_rate: f64,
    pub backoff_level: u32,
    pub excluded_until: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Echo
// ---------------------------------------------------------------------------

/// Instrumentation payload fanned out by the echo broker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EchoPayload {
    pub message: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
}

/// One Source's echo reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoReply {
    pub source_id: CompanyId,
    pub agreement_ref: String,
    pub message: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
    pub latency_ms: u64,
}
