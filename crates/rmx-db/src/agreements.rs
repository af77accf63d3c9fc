//! Postgres-backed company directory and agreement store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rmx_agreements::{AgreementStore, CompanyDirectory};
use rmx_schemas::{
    AdapterKind, Agreement, AgreementId, AgreementStatus, Company, CompanyId, CompanyKind,
    CompanyStatus, CoreError,
};
use sqlx::{PgPool, Row};

use crate::{constraint_of, internal};

// ---------------------------------------------------------------------------
// PgCompanyDirectory
// ---------------------------------------------------------------------------

pub struct PgCompanyDirectory {
    pool: PgPool,
}

impl PgCompanyDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn company_from_row(row: &sqlx::postgres::PgRow) -> Result<Company, CoreError> {
    let kind: String = row
        .try_get("kind")
        .map_err(|e| internal("company.kind", e))?;
    let status: String = row
        .try_get("status")
        .map_err(|e| internal("company.status", e))?;
    let adapter_kind: Option<String> = row
        .try_get("adapter_kind")
        .map_err(|e| internal("company.adapter_kind", e))?;

    Ok(Company {
        id: row.try_get("id").map_err(|e| internal("company.id", e))?,
        name: row
            .try_get("name")
            .map_err(|e| internal("company.name", e))?,
        kind: CompanyKind::parse(&kind)
            .ok_or_else(|| CoreError::Internal(format!("bad company kind '{kind}'")))?,
        status: CompanyStatus::parse(&status)
            .ok_or_else(|| CoreError::Internal(format!("bad company status '{status}'")))?,
        adapter_kind: adapter_kind.as_deref().and_then(AdapterKind::parse),
        endpoint: row
            .try_get("endpoint")
            .map_err(|e| internal("company.endpoint", e))?,
    })
}

#[async_trait]
impl CompanyDirectory for PgCompanyDirectory {
    async fn get(&self, id: CompanyId) -> Result<Option<Company>, CoreError> {
        let row = sqlx::query("select * from company where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| internal("company select", e))?;
        row.as_ref().map(company_from_row).transpose()
    }

    async fn upsert(&self, company: Company) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            insert into company (id, name, kind, status, adapter_kind, endpoint)
            values ($1, $2, $3, $4, $5, $6)
            on conflict (id) do update set
              name = excluded.name,
              kind = excluded.kind,
              status = excluded.status,
              adapter_kind = excluded.adapter_kind,
              endpoint = excluded.endpoint
            "#,
        )
        .bind(company.id)
        .bind(&company.name)
        .bind(company.kind.as_str())
        .bind(company.status.as_str())
        .bind(company.adapter_kind.map(|k| k.as_str()))
        .bind(&company.endpoint)
        .execute(&self.pool)
        .await
        .map_err(|e| internal("company upsert", e))?;
        Ok(())
    }

    async fn set_status(&self, id: CompanyId, status: CompanyStatus) -> Result<(), CoreError> {
        let result = sqlx::query("update company set status = $2 where id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| internal("company set_status", e))?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("company {id}")));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Company>, CoreError> {
        let rows = sqlx::query("select * from company order by id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| internal("company list", e))?;
        rows.iter().map(company_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// PgAgreementStore
// ---------------------------------------------------------------------------

pub struct PgAgreementStore {
    pool: PgPool,
}

impl PgAgreementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn agreement_from_row(row: &sqlx::postgres::PgRow) -> Result<Agreement, CoreError> {
    let status: String = row
        .try_get("status")
        .map_err(|e| internal("agreement.status", e))?;
    Ok(Agreement {
        id: row.try_get("id").map_err(|e| internal("agreement.id", e))?,
        agent_id: row
            .try_get("agent_id")
            .map_err(|e| internal("agreement.agent_id", e))?,
        source_id: row
            .try_get("source_id")
            .map_err(|e| internal("agreement.source_id", e))?,
        agreement_ref: row
            .try_get("agreement_ref")
            .map_err(|e| internal("agreement.agreement_ref", e))?,
        status: AgreementStatus::parse(&status)
            .ok_or_else(|| CoreError::Internal(format!("bad agreement status '{status}'")))?,
        valid_from: row
            .try_get("valid_from")
            .map_err(|e| internal("agreement.valid_from", e))?,
        valid_to: row
            .try_get("valid_to")
            .map_err(|e| internal("agreement.valid_to", e))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| internal("agreement.created_at", e))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| internal("agreement.updated_at", e))?,
    })
}

#[async_trait]
impl AgreementStore for PgAgreementStore {
    async fn insert(&self, agreement: Agreement) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            insert into agreement (
              id, agent_id, source_id, agreement_ref, status,
              valid_from, valid_to, created_at, updated_at
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(agreement.id)
        .bind(agreement.agent_id)
        .bind(agreement.source_id)
        .bind(&agreement.agreement_ref)
        .bind(agreement.status.as_str())
        .bind(agreement.valid_from)
        .bind(agreement.valid_to)
        .bind(agreement.created_at)
        .bind(agreement.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if constraint_of(&err).as_deref() == Some("agreement_natural_key") => {
                Err(CoreError::Duplicate(format!(
                    "agreement_ref '{}' already exists for this source",
                    agreement.agreement_ref
                )))
            }
            Err(err) => Err(internal("agreement insert", err)),
        }
    }

    async fn get(&self, id: AgreementId) -> Result<Option<Agreement>, CoreError> {
        let row = sqlx::query("select * from agreement where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| internal("agreement select", e))?;
        row.as_ref().map(agreement_from_row).transpose()
    }

    async fn update_status(
        &self,
        id: AgreementId,
        expect: AgreementStatus,
        to: AgreementStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<Agreement>, CoreError> {
        // Compare-and-swap on the status column; zero rows means either a
        // lost race or a missing agreement, told apart by a second read.
        let row = sqlx::query(
            r#"
            update agreement
            set status = $3, updated_at = $4
            where id = $1 and status = $2
            returning *
            "#,
        )
        .bind(id)
        .bind(expect.as_str())
        .bind(to.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| internal("agreement cas", e))?;

        match row {
            Some(row) => Ok(Some(agreement_from_row(&row)?)),
            None => {
                if self.get(id).await?.is_none() {
                    Err(CoreError::NotFound(format!("agreement {id}")))
                } else {
                    Ok(None)
                }
            }
        }
    }

    async fn list_by_agent(
        &self,
        agent_id: CompanyId,
        status: Option<AgreementStatus>,
    ) -> Result<Vec<Agreement>, CoreError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "select * from agreement where agent_id = $1 and status = $2 order by created_at",
                )
                .bind(agent_id)
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("select * from agreement where agent_id = $1 order by created_at")
                    .bind(agent_id)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| internal("agreement list_by_agent", e))?;
        rows.iter().map(agreement_from_row).collect()
    }

    async fn list_by_source(
        &self,
        source_id: CompanyId,
        status: Option<AgreementStatus>,
    ) -> Result<Vec<Agreement>, CoreError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "select * from agreement where source_id = $1 and status = $2 order by created_at",
                )
                .bind(source_id)
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("select * from agreement where source_id = $1 order by created_at")
                    .bind(source_id)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| internal("agreement list_by_source", e))?;
        rows.iter().map(agreement_from_row).collect()
    }

    async fn find_by_refs(
        &self,
        agent_id: CompanyId,
        refs: &[String],
    ) -> Result<Vec<Agreement>, CoreError> {
        let rows = sqlx::query(
            r#"
            select * from agreement
            where agent_id = $1 and agreement_ref = any($2)
            order by created_at
            "#,
        )
        .bind(agent_id)
        .bind(refs)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| internal("agreement find_by_refs", e))?;
        rows.iter().map(agreement_from_row).collect()
    }
}
