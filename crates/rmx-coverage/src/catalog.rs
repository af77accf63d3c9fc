//! Read-only boundary to the UN/LOCODE reference catalog. Ingestion is an
//! external concern; the core only asks "is this code known".

use std::collections::BTreeSet;

use async_trait::async_trait;
use rmx_schemas::CoreError;

#[async_trait]
pub trait LocationCatalog: Send + Sync {
    async fn exists(&self, unlocode: &str) -> Result<bool, CoreError>;
}

/// Fixed in-memory catalog, seeded at construction. Backs tests and
/// database-less deployments.
pub struct StaticLocationCatalog {
    codes: BTreeSet<String>,
}

impl StaticLocationCatalog {
    pub fn new<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            codes: codes.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl LocationCatalog for StaticLocationCatalog {
    async fn exists(&self, unlocode: &str) -> Result<bool, CoreError> {
        Ok(self.codes.contains(unlocode))
    }
}
