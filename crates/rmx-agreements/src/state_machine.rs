//! Agreement lifecycle state machine.
//!
//! ```text
//! DRAFT ──► OFFERED ──► ACCEPTED ──► ACTIVE ◄──► SUSPENDED
//!              │                        │             │
//!              └────────► EXPIRED ◄─────┴─────────────┘   (terminal)
//! ```
//!
//! Every transition is applied through [`check_transition`]; an illegal pair
//! produces `INVALID_TRANSITION` carrying the legal targets so the caller's
//! error message enumerates what would have been accepted.

use rmx_schemas::{AgreementStatus, CoreError};

/// Legal targets from a given status. Empty for terminal states.
pub fn legal_targets(from: AgreementStatus) -> &'static [AgreementStatus] {
    match from {
        AgreementStatus::Draft => &[AgreementStatus::Offered],
        AgreementStatus::Offered => &[AgreementStatus::Accepted, AgreementStatus::Expired],
        AgreementStatus::Accepted => &[AgreementStatus::Active],
        AgreementStatus::Active => &[AgreementStatus::Suspended, AgreementStatus::Expired],
        AgreementStatus::Suspended => &[AgreementStatus::Active, AgreementStatus::Expired],
        AgreementStatus::Expired => &[],
    }
}

pub fn check_transition(from: AgreementStatus, to: AgreementStatus) -> Result<(), CoreError> {
    let legal = legal_targets(from);
    if legal.contains(&to) {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from,
            to,
            legal: legal.to_vec(),
        })
    }
}
