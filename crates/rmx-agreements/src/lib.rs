//! Agreement registry: the authoritative owner of agreements and their
//! lifecycle. All writes flow through [`AgreementRegistry`]; the rest of the
//! system only ever reads projections (`resolve_active` for the dispatcher,
//! `get` for the booking path).

pub mod registry;
pub mod state_machine;
pub mod store;

pub use registry::{AgreementNotification, AgreementRegistry, LogNotificationSink, NotificationSink};
pub use state_machine::{check_transition, legal_targets};
pub use store::{AgreementStore, CompanyDirectory, MemoryAgreementStore, MemoryCompanyDirectory};
