//! The shared error currency of the core.
//!
//! Every failure crossing a component boundary carries one stable machine
//! code alongside its human message. Transports map codes to status codes;
//! engines match on variants. No variant is ever retried by the core.

use crate::AgreementStatus;

#[derive(Debug, Clone, PartialEq)]
pub enum CoreError {
    /// Malformed or missing input at a boundary.
    InvalidParam(String),
    /// A draft or transition names a company that is not an ACTIVE company
    /// of the required kind.
    InvalidParty(String),
    /// Agreement state-machine violation. `legal` lists the targets that
    /// would have been accepted from `from`.
    InvalidTransition {
        from: AgreementStatus,
        to: AgreementStatus,
        legal: Vec<AgreementStatus>,
    },
    /// No ACTIVE agreement at operation time.
    AgreementInactive(String),
    /// Booking create without the mandatory idempotency key.
    MissingIdempotency,
    /// Unique-constraint hit that is user-surfaceable (duplicate agreement
    /// ref, duplicate supplier booking ref).
    Duplicate(String),
    NotFound(String),
    /// Per-call deadline elapsed. Internal to the fan-out path; never
    /// surfaced to an Agent directly.
    Timeout,
    /// A Source failed to respond before the deadline on a command path.
    UpstreamTimeout,
    /// A Source returned a non-timeout error.
    SourceError(String),
    Internal(String),
}

impl CoreError {
    /// Stable machine code. Transports key off this, not the message.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidParam(_) => "INVALID_PARAM",
            CoreError::InvalidParty(_) => "INVALID_PARTY",
            CoreError::InvalidTransition { .. } => "INVALID_TRANSITION",
            CoreError::AgreementInactive(_) => "AGREEMENT_INACTIVE",
            CoreError::MissingIdempotency => "MISSING_IDEMPOTENCY",
            CoreError::Duplicate(_) => "DUPLICATE",
            CoreError::NotFound(_) => "NOT_FOUND",
            CoreError::Timeout => "TIMEOUT",
            CoreError::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            CoreError::SourceError(_) => "SOURCE_ERROR",
            CoreError::Internal(_) => "INTERNAL",
        }
    }
}

impl std::fmt::Display for CoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoreError::InvalidParam(msg) => write!(f, "INVALID_PARAM: {msg}"),
            CoreError::InvalidParty(msg) => write!(f, "INVALID_PARTY: {msg}"),
            CoreError::InvalidTransition { from, to, legal } => {
                let targets: Vec<&str> = legal.iter().map(|s| s.as_str()).collect();
                write!(
                    f,
                    "INVALID_TRANSITION: {} -> {} is not allowed; legal targets: [{}]",
                    from.as_str(),
                    to.as_str(),
                    targets.join(", ")
                )
            }
            CoreError::AgreementInactive(r) => {
                write!(f, "AGREEMENT_INACTIVE: no ACTIVE agreement '{r}'")
            }
            CoreError::MissingIdempotency => {
                write!(f, "MISSING_IDEMPOTENCY: Idempotency-Key is required")
            }
            CoreError::Duplicate(msg) => write!(f, "DUPLICATE: {msg}"),
            CoreError::NotFound(what) => write!(f, "NOT_FOUND: {what}"),
            CoreError::Timeout => write!(f, "TIMEOUT: per-call deadline elapsed"),
            CoreError::UpstreamTimeout => {
                write!(f, "UPSTREAM_TIMEOUT: source did not respond before deadline")
            }
            CoreError::SourceError(msg) => write!(f, "SOURCE_ERROR: {msg}"),
            CoreError::Internal(msg) => write!(f, "INTERNAL: {msg}"),
        }
    }
}

impl std::error::Error for CoreError {}
