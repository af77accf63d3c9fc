//! The registry: create, transition, and query agreements.
//!
//! Transitions are read-then-write over the state machine, so the store's
//! compare-and-swap serializes them per agreement id; a lost race re-reads
//! and re-validates, which yields the correct `INVALID_TRANSITION` against
//! the state the winner left behind.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use rmx_audit::{Auditor, BoundaryEvent, Direction};
use rmx_schemas::{
    ActiveAgreement, Agreement, AgreementId, AgreementStatus, Company, CompanyId, CompanyKind,
    CoreError,
};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::state_machine::check_transition;
use crate::store::{AgreementStore, CompanyDirectory};

// ---------------------------------------------------------------------------
// Counterparty notifications
// ---------------------------------------------------------------------------

/// Emitted to the counterparty after every applied transition.
#[derive(Debug, Clone)]
pub struct AgreementNotification {
    pub agreement_id: AgreementId,
    pub agreement_ref: String,
    pub counterparty: CompanyId,
    pub from: AgreementStatus,
    pub to: AgreementStatus,
}

/// Fire-and-forget sink. Implementations must not block and must not fail
/// the transition; a lost notification is logged and forgotten.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: AgreementNotification);
}

/// Default sink: a structured log line. The production deployment swaps in
/// the external notification service client.
pub struct LogNotificationSink;

impl NotificationSink for LogNotificationSink {
    fn notify(&self, n: AgreementNotification) {
        info!(
            agreement_id = %n.agreement_id,
            agreement_ref = %n.agreement_ref,
            counterparty = %n.counterparty,
            from = n.from.as_str(),
            to = n.to.as_str(),
            "agreement transition notification"
        );
    }
}

// ---------------------------------------------------------------------------
// AgreementRegistry
// ---------------------------------------------------------------------------

pub struct AgreementRegistry {
    store: Arc<dyn AgreementStore>,
    companies: Arc<dyn CompanyDirectory>,
    notifications: Arc<dyn NotificationSink>,
    audit: Arc<Auditor>,
}

impl AgreementRegistry {
    pub fn new(
        store: Arc<dyn AgreementStore>,
        companies: Arc<dyn CompanyDirectory>,
        notifications: Arc<dyn NotificationSink>,
        audit: Arc<Auditor>,
    ) -> Self {
        Self {
            store,
            companies,
            notifications,
            audit,
        }
    }

    pub fn companies(&self) -> &Arc<dyn CompanyDirectory> {
        &self.companies
    }

    /// Create a DRAFT agreement between an ACTIVE agent and an ACTIVE source.
    pub async fn create_draft(
        &self,
        agent_id: CompanyId,
        source_id: CompanyId,
        agreement_ref: String,
        valid_from: Option<chrono::DateTime<Utc>>,
        valid_to: Option<chrono::DateTime<Utc>>,
    ) -> Result<Agreement, CoreError> {
        if agreement_ref.trim().is_empty() {
            return Err(CoreError::InvalidParam("agreement_ref is empty".into()));
        }
        self.require_party(agent_id, CompanyKind::Agent).await?;
        self.require_party(source_id, CompanyKind::Source).await?;

        let now = Utc::now();
        let agreement = Agreement {
            id: Uuid::new_v4(),
            agent_id,
            source_id,
            agreement_ref,
            status: AgreementStatus::Draft,
            valid_from,
            valid_to,
            created_at: now,
            updated_at: now,
        };
        self.store.insert(agreement.clone()).await?;

        info!(
            agreement_id = %agreement.id,
            agreement_ref = %agreement.agreement_ref,
            "agreement draft created"
        );
        Ok(agreement)
    }

    pub async fn offer(&self, id: AgreementId) -> Result<Agreement, CoreError> {
        self.transition(id, AgreementStatus::Offered).await
    }

    pub async fn accept(&self, id: AgreementId) -> Result<Agreement, CoreError> {
        self.transition(id, AgreementStatus::Accepted).await
    }

    /// Apply an arbitrary target status through the state machine.
    pub async fn set_status(
        &self,
        id: AgreementId,
        target: AgreementStatus,
    ) -> Result<Agreement, CoreError> {
        self.transition(id, target).await
    }

    pub async fn get(&self, id: AgreementId) -> Result<Agreement, CoreError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("agreement {id}")))
    }

    pub async fn list_by_agent(
        &self,
        agent_id: CompanyId,
        status: Option<AgreementStatus>,
    ) -> Result<Vec<Agreement>, CoreError> {
        self.store.list_by_agent(agent_id, status).await
    }

    pub async fn list_by_source(
        &self,
        source_id: CompanyId,
        status: Option<AgreementStatus>,
    ) -> Result<Vec<Agreement>, CoreError> {
        self.store.list_by_source(source_id, status).await
    }

    /// Refs of every operationally ACTIVE agreement of the agent. Used by
    /// the dispatcher when a search names no refs.
    pub async fn active_refs(&self, agent_id: CompanyId) -> Result<Vec<String>, CoreError> {
        let now = Utc::now();
        let rows = self
            .store
            .list_by_agent(agent_id, Some(AgreementStatus::Active))
            .await?;
        Ok(rows
            .into_iter()
            .filter(|a| a.is_operational(now))
            .map(|a| a.agreement_ref)
            .collect())
    }

    /// The one query the dispatcher uses: which of these refs are backed by
    /// an operationally ACTIVE agreement between ACTIVE companies right now.
    /// Duplicate refs are deduplicated; unknown refs are silently dropped.
    pub async fn resolve_active(
        &self,
        agent_id: CompanyId,
        agreement_refs: &[String],
    ) -> Result<Vec<ActiveAgreement>, CoreError> {
        let mut seen = HashSet::new();
        let refs: Vec<String> = agreement_refs
            .iter()
            .filter(|r| seen.insert((*r).clone()))
            .cloned()
            .collect();

        let now = Utc::now();
        let mut out = Vec::new();
        for agreement in self.store.find_by_refs(agent_id, &refs).await? {
            if !agreement.is_operational(now) {
                continue;
            }
            if !self.company_is_active(agreement.agent_id).await?
                || !self.company_is_active(agreement.source_id).await?
            {
                continue;
            }
            out.push(ActiveAgreement {
                id: agreement.id,
                agreement_ref: agreement.agreement_ref,
                source_id: agreement.source_id,
            });
        }
        Ok(out)
    }

    // -- internals ----------------------------------------------------------

    async fn transition(
        &self,
        id: AgreementId,
        target: AgreementStatus,
    ) -> Result<Agreement, CoreError> {
        let now = Utc::now();

        // CAS loop: a concurrent transition costs one re-read, after which
        // the state machine is re-checked against the winner's state.
        for _ in 0..4 {
            let current = self.get(id).await?;
            check_transition(current.status, target)?;
            self.require_party(current.agent_id, CompanyKind::Agent)
                .await?;
            self.require_party(current.source_id, CompanyKind::Source)
                .await?;

            let updated = self
                .store
                .update_status(id, current.status, target, now)
                .await?;
            if let Some(updated) = updated {
                self.after_transition(&current, &updated);
                return Ok(updated);
            }
        }
        Err(CoreError::Internal(format!(
            "agreement {id} transition contention"
        )))
    }

    fn after_transition(&self, before: &Agreement, after: &Agreement) {
        self.audit.emit(BoundaryEvent {
            direction: Direction::In,
            endpoint: "agreements.transition".to_string(),
            request_id: Uuid::new_v4(),
            actor_company_id: Some(after.agent_id),
            source_id: Some(after.source_id),
            agreement_ref: Some(after.agreement_ref.clone()),
            status_code: 200,
            request: json!({ "from": before.status, "to": after.status }),
            response: json!({ "status": after.status }),
            duration_ms: 0,
        });

        // Both counterparties hear about the change; the response never
        // waits on either.
        self.notifications.notify(AgreementNotification {
            agreement_id: after.id,
            agreement_ref: after.agreement_ref.clone(),
            counterparty: after.source_id,
            from: before.status,
            to: after.status,
        });
    }

    async fn require_party(&self, id: CompanyId, kind: CompanyKind) -> Result<Company, CoreError> {
        let company = self
            .companies
            .get(id)
            .await?
            .ok_or_else(|| CoreError::InvalidParty(format!("company {id} does not exist")))?;
        if company.kind != kind {
            warn!(company_id = %id, "wrong company kind for agreement party");
            return Err(CoreError::InvalidParty(format!(
                "company {id} is not of kind {kind:?}"
            )));
        }
        if !company.is_active() {
            return Err(CoreError::InvalidParty(format!(
                "company {id} is not ACTIVE"
            )));
        }
        Ok(company)
    }

    async fn company_is_active(&self, id: CompanyId) -> Result<bool, CoreError> {
        Ok(self
            .companies
            .get(id)
            .await?
            .map_or(false, |c| c.is_active()))
    }
}
