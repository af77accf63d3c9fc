//! Postgres-backed coverage store and location catalog.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use rmx_coverage::{CoverageStore, LocationCatalog};
use rmx_schemas::{AgreementId, CompanyId, CoreError};
use sqlx::{PgPool, Row};

use crate::internal;

pub struct PgLocationCatalog {
    pool: PgPool,
}

impl PgLocationCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LocationCatalog for PgLocationCatalog {
    async fn exists(&self, unlocode: &str) -> Result<bool, CoreError> {
        let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
            "select exists (select 1 from location_catalog where unlocode = $1)",
        )
        .bind(unlocode)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| internal("catalog exists", e))?;
        Ok(exists)
    }
}

pub struct PgCoverageStore {
    pool: PgPool,
}

impl PgCoverageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CoverageStore for PgCoverageStore {
    async fn base_set(&self, source_id: CompanyId) -> Result<BTreeSet<String>, CoreError> {
        let rows = sqlx::query("select unlocode from source_coverage where source_id = $1")
            .bind(source_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| internal("coverage base_set", e))?;
        rows.iter()
            .map(|r| {
                r.try_get::<String, _>("unlocode")
                    .map_err(|e| internal("coverage.unlocode", e))
            })
            .collect()
    }

    async fn replace_base(
        &self,
        source_id: CompanyId,
        codes: BTreeSet<String>,
    ) -> Result<(), CoreError> {
        // Delete + insert in one transaction so readers never observe a
        // half-replaced set.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| internal("coverage tx begin", e))?;

        sqlx::query("delete from source_coverage where source_id = $1")
            .bind(source_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| internal("coverage delete", e))?;

        for code in &codes {
            sqlx::query(
                r#"
                insert into source_coverage (source_id, unlocode)
                values ($1, $2)
                on conflict do nothing
                "#,
            )
            .bind(source_id)
            .bind(code)
            .execute(&mut *tx)
            .await
            .map_err(|e| internal("coverage insert", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| internal("coverage tx commit", e))?;
        Ok(())
    }

    async fn overrides(
        &self,
        agreement_id: AgreementId,
    ) -> Result<BTreeMap<String, bool>, CoreError> {
        let rows = sqlx::query(
            "select unlocode, allowed from agreement_location_override where agreement_id = $1",
        )
        .bind(agreement_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| internal("override list", e))?;

        let mut out = BTreeMap::new();
        for row in rows {
            let code: String = row
                .try_get("unlocode")
                .map_err(|e| internal("override.unlocode", e))?;
            let allowed: bool = row
                .try_get("allowed")
                .map_err(|e| internal("override.allowed", e))?;
            out.insert(code, allowed);
        }
        Ok(out)
    }

    async fn get_override(
        &self,
        agreement_id: AgreementId,
        unlocode: &str,
    ) -> Result<Option<bool>, CoreError> {
        let row = sqlx::query(
            r#"
            select allowed from agreement_location_override
            where agreement_id = $1 and unlocode = $2
            "#,
        )
        .bind(agreement_id)
        .bind(unlocode)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| internal("override get", e))?;
        row.map(|r| {
            r.try_get::<bool, _>("allowed")
                .map_err(|e| internal("override.allowed", e))
        })
        .transpose()
    }

    async fn upsert_override(
        &self,
        agreement_id: AgreementId,
        unlocode: String,
        allowed: bool,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            insert into agreement_location_override (agreement_id, unlocode, allowed)
            values ($1, $2, $3)
            on conflict (agreement_id, unlocode) do update set allowed = excluded.allowed
            "#,
        )
        .bind(agreement_id)
        .bind(&unlocode)
        .bind(allowed)
        .execute(&self.pool)
        .await
        .map_err(|e| internal("override upsert", e))?;
        Ok(())
    }

    async fn remove_override(
        &self,
        agreement_id: AgreementId,
        unlocode: &str,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "delete from agreement_location_override where agreement_id = $1 and unlocode = $2",
        )
        .bind(agreement_id)
        .bind(unlocode)
        .execute(&self.pool)
        .await
        .map_err(|e| internal("override remove", e))?;
        Ok(())
    }
}
