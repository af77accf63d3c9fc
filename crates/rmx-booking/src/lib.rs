//! The booking command path: a single-Source call gated by agreement
//! revalidation and strict idempotency.

pub mod engine;
pub mod store;

pub use engine::{BookingEngine, CreateBookingInput, SCOPE_BOOKING_CREATE};
pub use store::{BookingStore, CreateOutcome, IdempotencyRecord, MemoryBookingStore};
