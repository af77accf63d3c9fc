//! Storage seams for agreements and companies.
//!
//! The registry speaks to these traits only; the in-memory implementations
//! below back tests and database-less deployments, the Postgres
//! implementations live in `rmx-db`.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rmx_schemas::{
    Agreement, AgreementId, AgreementStatus, Company, CompanyId, CompanyStatus, CoreError,
};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait AgreementStore: Send + Sync {
    /// Insert a new agreement. Fails with `DUPLICATE` when the natural key
    /// `(source_id, agreement_ref)` already exists.
    async fn insert(&self, agreement: Agreement) -> Result<(), CoreError>;

    async fn get(&self, id: AgreementId) -> Result<Option<Agreement>, CoreError>;

    /// Compare-and-swap status update. Returns `Ok(None)` when the stored
    /// status no longer equals `expect` (a concurrent transition won); the
    /// caller re-reads and re-validates. Transitions therefore serialize
    /// per agreement id without the store holding locks across awaits.
    async fn update_status(
        &self,
        id: AgreementId,
        expect: AgreementStatus,
        to: AgreementStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Agreement>, CoreError>;

    async fn list_by_agent(
        &self,
        agent_id: CompanyId,
        status: Option<AgreementStatus>,
    ) -> Result<Vec<Agreement>, CoreError>;

    async fn list_by_source(
        &self,
        source_id: CompanyId,
        status: Option<AgreementStatus>,
    ) -> Result<Vec<Agreement>, CoreError>;

    /// Agreements of the agent matching any of `refs` (exact match on
    /// `agreement_ref`). Unknown refs are simply absent from the result.
    async fn find_by_refs(
        &self,
        agent_id: CompanyId,
        refs: &[String],
    ) -> Result<Vec<Agreement>, CoreError>;
}

#[async_trait]
pub trait CompanyDirectory: Send + Sync {
    async fn get(&self, id: CompanyId) -> Result<Option<Company>, CoreError>;

    /// Companies are created by the external identity service; this is the
    /// ingestion point for their records.
    async fn upsert(&self, company: Company) -> Result<(), CoreError>;

    /// The only company mutation the core performs itself.
    async fn set_status(&self, id: CompanyId, status: CompanyStatus) -> Result<(), CoreError>;

    async fn list(&self) -> Result<Vec<Company>, CoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryAgreementStore {
    inner: RwLock<MemoryAgreementsInner>,
}

#[derive(Default)]
struct MemoryAgreementsInner {
    rows: HashMap<AgreementId, Agreement>,
    /// Natural-key unique index: (source_id, agreement_ref) -> id.
    by_natural_key: HashMap<(CompanyId, String), AgreementId>,
}

impl MemoryAgreementStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgreementStore for MemoryAgreementStore {
    async fn insert(&self, agreement: Agreement) -> Result<(), CoreError> {
        let mut inner = self.inner.write().expect("agreement store lock");
        let key = (agreement.source_id, agreement.agreement_ref.clone());
        if inner.by_natural_key.contains_key(&key) {
            return Err(CoreError::Duplicate(format!(
                "agreement_ref '{}' already exists for this source",
                agreement.agreement_ref
            )));
        }
        inner.by_natural_key.insert(key, agreement.id);
        inner.rows.insert(agreement.id, agreement);
        Ok(())
    }

    async fn get(&self, id: AgreementId) -> Result<Option<Agreement>, CoreError> {
        let inner = self.inner.read().expect("agreement store lock");
        Ok(inner.rows.get(&id).cloned())
    }

    async fn update_status(
        &self,
        id: AgreementId,
        expect: AgreementStatus,
        to: AgreementStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Agreement>, CoreError> {
        let mut inner = self.inner.write().expect("agreement store lock");
        let row = inner
            .rows
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("agreement {id}")))?;
        if row.status != expect {
            return Ok(None);
        }
        row.status = to;
        row.updated_at = now;
        Ok(Some(row.clone()))
    }

    async fn list_by_agent(
        &self,
        agent_id: CompanyId,
        status: Option<AgreementStatus>,
    ) -> Result<Vec<Agreement>, CoreError> {
        let inner = self.inner.read().expect("agreement store lock");
        let mut rows: Vec<Agreement> = inner
            .rows
            .values()
            .filter(|a| a.agent_id == agent_id && status.map_or(true, |s| a.status == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn list_by_source(
        &self,
        source_id: CompanyId,
        status: Option<AgreementStatus>,
    ) -> Result<Vec<Agreement>, CoreError> {
        let inner = self.inner.read().expect("agreement store lock");
        let mut rows: Vec<Agreement> = inner
            .rows
            .values()
            .filter(|a| a.source_id == source_id && status.map_or(true, |s| a.status == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn find_by_refs(
        &self,
        agent_id: CompanyId,
        refs: &[String],
    ) -> Result<Vec<Agreement>, CoreError> {
        let inner = self.inner.read().expect("agreement store lock");
        let mut rows: Vec<Agreement> = inner
            .rows
            .values()
            .filter(|a| a.agent_id == agent_id && refs.contains(&a.agreement_ref))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }
}

#[derive(Default)]
pub struct MemoryCompanyDirectory {
    rows: RwLock<HashMap<CompanyId, Company>>,
}

impl MemoryCompanyDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CompanyDirectory for MemoryCompanyDirectory {
    async fn get(&self, id: CompanyId) -> Result<Option<Company>, CoreError> {
        Ok(self.rows.read().expect("company lock").get(&id).cloned())
    }

    async fn upsert(&self, company: Company) -> Result<(), CoreError> {
        self.rows
            .write()
            .expect("company lock")
            .insert(company.id, company);
        Ok(())
    }

    async fn set_status(&self, id: CompanyId, status: CompanyStatus) -> Result<(), CoreError> {
        let mut rows = self.rows.write().expect("company lock");
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("company {id}")))?;
        row.status = status;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Company>, CoreError> {
        let rows = self.rows.read().expect("company lock");
        let mut out: Vec<Company> = rows.values().cloned().collect();
        out.sort_by_key(|c| c.id);
        Ok(out)
    }
}
