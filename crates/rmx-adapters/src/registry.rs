//! Adapter discovery: one memoized client per Source.
//!
//! A Source company row carries `adapter_kind` (+ `endpoint` for remote
//! Sources). The registry constructs the matching client on first use and
//! caches it; tests and the health probe register mock adapters explicitly,
//! which always win over construction.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rmx_agreements::CompanyDirectory;
use rmx_schemas::{AdapterKind, CompanyId, CompanyKind, CoreError};
use tracing::debug;

use crate::{MockSourceAdapter, RemoteSourceAdapter, SourceAdapter};

pub struct AdapterRegistry {
    companies: Arc<dyn CompanyDirectory>,
    cache: RwLock<HashMap<CompanyId, Arc<dyn SourceAdapter>>>,
}

impl AdapterRegistry {
    pub fn new(companies: Arc<dyn CompanyDirectory>) -> Self {
        Self {
            companies,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Pre-register an adapter for a Source (mock wiring for tests and
    /// synthetic health probing). Replaces any cached client.
    pub fn register(&self, source_id: CompanyId, adapter: Arc<dyn SourceAdapter>) {
        self.cache
            .write()
            .expect("adapter cache lock")
            .insert(source_id, adapter);
    }

    pub async fn for_source(&self, source_id: CompanyId) -> Result<Arc<dyn SourceAdapter>, CoreError> {
        if let Some(found) = self
            .cache
            .read()
            .expect("adapter cache lock")
            .get(&source_id)
        {
            return Ok(found.clone());
        }

        let company = self
            .companies
            .get(source_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("source company {source_id}")))?;
        if company.kind != CompanyKind::Source {
            return Err(CoreError::InvalidParam(format!(
                "company {source_id} is not a SOURCE"
            )));
        }

        let adapter: Arc<dyn SourceAdapter> = match company.adapter_kind {
            Some(AdapterKind::Mock) | None => Arc::new(MockSourceAdapter::new()),
            Some(AdapterKind::Remote) => {
                let endpoint = company.endpoint.as_deref().ok_or_else(|| {
                    CoreError::InvalidParam(format!(
                        "remote source {source_id} has no endpoint configured"
                    ))
                })?;
                Arc::new(RemoteSourceAdapter::new(endpoint))
            }
        };
        debug!(source_id = %source_id, kind = ?company.adapter_kind, "adapter constructed");

        let mut cache = self.cache.write().expect("adapter cache lock");
        // A concurrent construction may have won; keep the first one so all
        // callers share a single client per Source.
        Ok(cache.entry(source_id).or_insert(adapter).clone())
    }
}
