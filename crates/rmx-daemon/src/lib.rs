//! HTTP front-end for the RentMesh core. Thin by design: handlers map the
//! wire surface onto the engines and translate `CoreError` codes to status
//! codes; every business invariant lives below this crate.

pub mod api_types;
pub mod routes;
pub mod state;
