//! Coverage resolution: which pickup/dropoff UN/LOCODEs an agreement
//! authorizes.
//!
//! The effective set is pure set algebra over two inputs: the Source's base
//! coverage and the agreement's overrides. An override row unambiguously
//! wins over base; there is no neutral override state beyond "row absent".

pub mod catalog;
pub mod resolver;
pub mod store;

pub use catalog::{LocationCatalog, StaticLocationCatalog};
pub use resolver::{CoverageResolver, SyncReport};
pub use store::{CoverageStore, MemoryCoverageStore};
