//! Storage seam for coverage rows: one base set per Source, one tri-state
//! override map per agreement (present+true = allow, present+false = deny,
//! absent = inherit base).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use rmx_schemas::{AgreementId, CompanyId, CoreError};

#[async_trait]
pub trait CoverageStore: Send + Sync {
    async fn base_set(&self, source_id: CompanyId) -> Result<BTreeSet<String>, CoreError>;

    /// Replace the stored base set wholesale; obsolete rows are deleted,
    /// new rows inserted, duplicates collapse in the set.
    async fn replace_base(
        &self,
        source_id: CompanyId,
        codes: BTreeSet<String>,
    ) -> Result<(), CoreError>;

    async fn overrides(
        &self,
        agreement_id: AgreementId,
    ) -> Result<BTreeMap<String, bool>, CoreError>;

    async fn get_override(
        &self,
        agreement_id: AgreementId,
        unlocode: &str,
    ) -> Result<Option<bool>, CoreError>;

    async fn upsert_override(
        &self,
        agreement_id: AgreementId,
        unlocode: String,
        allowed: bool,
    ) -> Result<(), CoreError>;

    async fn remove_override(
        &self,
        agreement_id: AgreementId,
        unlocode: &str,
    ) -> Result<(), CoreError>;
}

#[derive(Default)]
pub struct MemoryCoverageStore {
    base: RwLock<HashMap<CompanyId, BTreeSet<String>>>,
    overrides: RwLock<HashMap<AgreementId, BTreeMap<String, bool>>>,
}

impl MemoryCoverageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoverageStore for MemoryCoverageStore {
    async fn base_set(&self, source_id: CompanyId) -> Result<BTreeSet<String>, CoreError> {
        Ok(self
            .base
            .read()
            .expect("coverage lock")
            .get(&source_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn replace_base(
        &self,
        source_id: CompanyId,
        codes: BTreeSet<String>,
    ) -> Result<(), CoreError> {
        self.base
            .write()
            .expect("coverage lock")
            .insert(source_id, codes);
        Ok(())
    }

    async fn overrides(
        &self,
        agreement_id: AgreementId,
    ) -> Result<BTreeMap<String, bool>, CoreError> {
        Ok(self
            .overrides
            .read()
            .expect("coverage lock")
            .get(&agreement_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_override(
        &self,
        agreement_id: AgreementId,
        unlocode: &str,
    ) -> Result<Option<bool>, CoreError> {
        Ok(self
            .overrides
            .read()
            .expect("coverage lock")
            .get(&agreement_id)
            .and_then(|m| m.get(unlocode).copied()))
    }

    async fn upsert_override(
        &self,
        agreement_id: AgreementId,
        unlocode: String,
        allowed: bool,
    ) -> Result<(), CoreError> {
        self.overrides
            .write()
            .expect("coverage lock")
            .entry(agreement_id)
            .or_default()
            .insert(unlocode, allowed);
        Ok(())
    }

    async fn remove_override(
        &self,
        agreement_id: AgreementId,
        unlocode: &str,
    ) -> Result<(), CoreError> {
        if let Some(m) = self
            .overrides
            .write()
            .expect("coverage lock")
            .get_mut(&agreement_id)
        {
            m.remove(unlocode);
        }
        Ok(())
    }
}
