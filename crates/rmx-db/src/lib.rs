// crates/rmx-db/src/lib.rs
//! Postgres persistence: repository implementations of the engine store
//! traits, plus archival for completed jobs and health snapshots.
//!
//! All queries are runtime-checked; migrations are embedded and applied at
//! daemon boot when a database is configured. Deployments without
//! `RMX_DATABASE_URL` run entirely on the in-memory stores.

use anyhow::{Context, Result};
use rmx_schemas::CoreError;
use sqlx::{postgres::PgPoolOptions, PgPool};

pub mod agreements;
pub mod bookings;
pub mod coverage;
pub mod telemetry;

pub use agreements::{PgAgreementStore, PgCompanyDirectory};
pub use bookings::PgBookingStore;
pub use coverage::{PgCoverageStore, PgLocationCatalog};
pub use telemetry::{archive_availability_job, archive_echo_job, upsert_source_health};

pub const ENV_DB_URL: &str = "RMX_DATABASE_URL";

/// Connect to Postgres using RMX_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='agreement'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok,
        has_schema: exists,
    })
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_schema: bool,
}

/// Map any sqlx failure to the shared INTERNAL error with enough context
/// for the logs; constraint-specific handling happens at the call sites.
pub(crate) fn internal(what: &str, err: sqlx::Error) -> CoreError {
    CoreError::Internal(format!("{what}: {err}"))
}

/// Constraint name from a database error, when present.
pub(crate) fn constraint_of(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.constraint().map(String::from),
        _ => None,
    }
}
