//! The resolver: eligibility answers for the dispatcher and the coverage
//! management operations behind the agreements surface.

use std::collections::BTreeSet;
use std::sync::Arc;

use rmx_adapters::SourceAdapter;
use rmx_agreements::AgreementStore;
use rmx_schemas::{Agreement, AgreementId, CompanyId, CoreError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::catalog::LocationCatalog;
use crate::store::CoverageStore;

/// Outcome of one coverage sync against a Source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub added: usize,
    pub removed: usize,
    pub total: usize,
}

pub struct CoverageResolver {
    store: Arc<dyn CoverageStore>,
    catalog: Arc<dyn LocationCatalog>,
    agreements: Arc<dyn AgreementStore>,
}

impl CoverageResolver {
    pub fn new(
        store: Arc<dyn CoverageStore>,
        catalog: Arc<dyn LocationCatalog>,
        agreements: Arc<dyn AgreementStore>,
    ) -> Self {
        Self {
            store,
            catalog,
            agreements,
        }
    }

    /// Override present wins; otherwise the Source's base set decides.
    pub async fn is_allowed(
        &self,
        agreement_id: AgreementId,
        unlocode: &str,
    ) -> Result<bool, CoreError> {
        if let Some(allowed) = self.store.get_override(agreement_id, unlocode).await? {
            return Ok(allowed);
        }
        let agreement = self.agreement(agreement_id).await?;
        Ok(self
            .store
            .base_set(agreement.source_id)
            .await?
            .contains(unlocode))
    }

    /// `(base ∪ allow) \ deny`, sorted.
    pub async fn effective(&self, agreement_id: AgreementId) -> Result<Vec<String>, CoreError> {
        let agreement = self.agreement(agreement_id).await?;
        let mut set = self.store.base_set(agreement.source_id).await?;
        for (code, allowed) in self.store.overrides(agreement_id).await? {
            if allowed {
                set.insert(code);
            } else {
                set.remove(&code);
            }
        }
        Ok(set.into_iter().collect())
    }

    /// Pull the Source's current location list, drop codes unknown to the
    /// catalog, and replace the stored base set.
    pub async fn sync_source_coverage(
        &self,
        source_id: CompanyId,
        adapter: &dyn SourceAdapter,
    ) -> Result<SyncReport, CoreError> {
        let reported = adapter.locations().await?;

        let mut fresh = BTreeSet::new();
        let mut unknown = 0usize;
        for code in reported {
            if self.catalog.exists(&code).await? {
                fresh.insert(code);
            } else {
                unknown += 1;
            }
        }
        if unknown > 0 {
            debug!(source_id = %source_id, unknown, "ignored unlocodes unknown to the catalog");
        }

        let previous = self.store.base_set(source_id).await?;
        let added = fresh.difference(&previous).count();
        let removed = previous.difference(&fresh).count();
        let total = fresh.len();
        self.store.replace_base(source_id, fresh).await?;

        info!(source_id = %source_id, added, removed, total, "source coverage synced");
        Ok(SyncReport {
            added,
            removed,
            total,
        })
    }

    pub async fn upsert_override(
        &self,
        agreement_id: AgreementId,
        unlocode: &str,
        allowed: bool,
    ) -> Result<(), CoreError> {
        // Every stored coverage row must reference a known location.
        if !self.catalog.exists(unlocode).await? {
            return Err(CoreError::InvalidParam(format!(
                "unknown unlocode '{unlocode}'"
            )));
        }
        self.agreement(agreement_id).await?;
        self.store
            .upsert_override(agreement_id, unlocode.to_string(), allowed)
            .await
    }

    pub async fn remove_override(
        &self,
        agreement_id: AgreementId,
        unlocode: &str,
    ) -> Result<(), CoreError> {
        self.store.remove_override(agreement_id, unlocode).await
    }

    async fn agreement(&self, id: AgreementId) -> Result<Agreement, CoreError> {
        self.agreements
            .get(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("agreement {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticLocationCatalog;
    use crate::store::MemoryCoverageStore;
    use chrono::Utc;
    use rmx_adapters::MockSourceAdapter;
    use rmx_agreements::MemoryAgreementStore;
    use rmx_schemas::AgreementStatus;
    use uuid::Uuid;

    struct Fixture {
        resolver: CoverageResolver,
        store: Arc<MemoryCoverageStore>,
        agreement_id: AgreementId,
        source_id: CompanyId,
    }

    async fn fixture(catalog_codes: &[&str]) -> Fixture {
        let store = Arc::new(MemoryCoverageStore::new());
        let agreements = Arc::new(MemoryAgreementStore::new());
        let agreement_id = Uuid::new_v4();
        let source_id = Uuid::new_v4();
        let now = Utc::now();
        agreements
            .insert(Agreement {
                id: agreement_id,
                agent_id: Uuid::new_v4(),
                source_id,
                agreement_ref: "AGR-1".into(),
                status: AgreementStatus::Active,
                valid_from: None,
                valid_to: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();

        let resolver = CoverageResolver::new(
            store.clone(),
            Arc::new(StaticLocationCatalog::new(catalog_codes.iter().copied())),
            agreements,
        );
        Fixture {
            resolver,
            store,
            agreement_id,
            source_id,
        }
    }

    #[tokio::test]
    async fn base_decides_when_no_override() {
        let f = fixture(&["GBMAN", "GBGLA"]).await;
        f.store
            .replace_base(f.source_id, ["GBMAN".to_string()].into_iter().collect())
            .await
            .unwrap();

        assert!(f.resolver.is_allowed(f.agreement_id, "GBMAN").await.unwrap());
        assert!(!f.resolver.is_allowed(f.agreement_id, "GBGLA").await.unwrap());
    }

    #[tokio::test]
    async fn override_wins_over_base_both_ways() {
        let f = fixture(&["GBMAN", "GBGLA", "USNYC"]).await;
        f.store
            .replace_base(
                f.source_id,
                ["GBMAN".to_string(), "GBGLA".to_string()].into_iter().collect(),
            )
            .await
            .unwrap();

        f.resolver
            .upsert_override(f.agreement_id, "GBMAN", false)
            .await
            .unwrap();
        f.resolver
            .upsert_override(f.agreement_id, "USNYC", true)
            .await
            .unwrap();

        assert!(!f.resolver.is_allowed(f.agreement_id, "GBMAN").await.unwrap());
        assert!(f.resolver.is_allowed(f.agreement_id, "USNYC").await.unwrap());

        let effective = f.resolver.effective(f.agreement_id).await.unwrap();
        assert_eq!(effective, vec!["GBGLA".to_string(), "USNYC".to_string()]);
    }

    #[tokio::test]
    async fn removing_override_restores_inheritance() {
        let f = fixture(&["GBMAN"]).await;
        f.store
            .replace_base(f.source_id, ["GBMAN".to_string()].into_iter().collect())
            .await
            .unwrap();

        f.resolver
            .upsert_override(f.agreement_id, "GBMAN", false)
            .await
            .unwrap();
        assert!(!f.resolver.is_allowed(f.agreement_id, "GBMAN").await.unwrap());

        f.resolver
            .remove_override(f.agreement_id, "GBMAN")
            .await
            .unwrap();
        assert!(f.resolver.is_allowed(f.agreement_id, "GBMAN").await.unwrap());
    }

    #[tokio::test]
    async fn override_on_unknown_code_is_rejected() {
        let f = fixture(&["GBMAN"]).await;
        let err = f
            .resolver
            .upsert_override(f.agreement_id, "XXXXX", true)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAM");
    }

    #[tokio::test]
    async fn sync_diffs_and_ignores_unknown_codes() {
        let f = fixture(&["GBMAN", "GBGLA", "PKKHI"]).await;
        f.store
            .replace_base(
                f.source_id,
                ["GBMAN".to_string(), "PKKHI".to_string()].into_iter().collect(),
            )
            .await
            .unwrap();

        // Source now reports GBMAN + GBGLA + one junk code; PKKHI is gone.
        let adapter =
            MockSourceAdapter::new().with_locations(vec!["GBMAN", "GBGLA", "ZZZZZ", "GBGLA"]);
        let report = f
            .resolver
            .sync_source_coverage(f.source_id, &adapter)
            .await
            .unwrap();

        assert_eq!(
            report,
            SyncReport {
                added: 1,   // GBGLA
                removed: 1, // PKKHI
                total: 2,
            }
        );
        let base = f.store.base_set(f.source_id).await.unwrap();
        assert!(base.contains("GBMAN") && base.contains("GBGLA"));
        assert!(!base.contains("ZZZZZ"));
    }

    #[tokio::test]
    async fn effective_matches_incremental_and_from_scratch() {
        let f = fixture(&["A1AAA", "B2BBB", "C3CCC", "D4DDD"]).await;
        f.store
            .replace_base(
                f.source_id,
                ["A1AAA".to_string(), "B2BBB".to_string()].into_iter().collect(),
            )
            .await
            .unwrap();

        // Incremental upserts...
        f.resolver.upsert_override(f.agreement_id, "C3CCC", true).await.unwrap();
        f.resolver.upsert_override(f.agreement_id, "A1AAA", false).await.unwrap();
        f.resolver.upsert_override(f.agreement_id, "C3CCC", true).await.unwrap();
        let incremental = f.resolver.effective(f.agreement_id).await.unwrap();

        // ...equal the from-scratch computation over the final rows.
        let base = f.store.base_set(f.source_id).await.unwrap();
        let overrides = f.store.overrides(f.agreement_id).await.unwrap();
        let mut scratch = base;
        for (code, allowed) in overrides {
            if allowed {
                scratch.insert(code);
            } else {
                scratch.remove(&code);
            }
        }
        let scratch: Vec<String> = scratch.into_iter().collect();
        assert_eq!(incremental, scratch);
        assert_eq!(incremental, vec!["B2BBB".to_string(), "C3CCC".to_string()]);
    }
}
