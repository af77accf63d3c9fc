//! Fan-out orchestration: the availability dispatcher and its
//! instrumentation-grade sibling, the echo broker.
//!
//! Both follow the same scatter/gather shape: resolve eligible
//! `(agreement, source)` pairs, create a job up front, scatter bounded
//! concurrent adapter calls with per-call deadlines, append every outcome
//! to the fan-in buffer, and force-complete at the SLA. Partial failure is
//! a first-class outcome: a Source-level error never fails the outer
//! request.

pub mod dispatcher;
pub mod echo;

pub use dispatcher::{Dispatcher, SubmitReceipt};
pub use echo::{EchoBroker, EchoResults, EchoSubmitReceipt};
