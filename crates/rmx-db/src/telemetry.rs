//! Archival writes: completed jobs flushed before in-memory eviction, and
//! periodic health snapshots. Read paths for these tables live in
//! reporting, not in the core.

use anyhow::{Context, Result};
use rmx_jobstore::JobRecord;
use rmx_schemas::{JobItem, SourceHealthSnapshot};
use sqlx::PgPool;

/// Write one completed availability job and its results. Idempotent per
/// job id, so a sweeper retry does not duplicate rows.
pub async fn archive_availability_job(
    pool: &PgPool,
    record: &JobRecord,
    items: &[JobItem],
) -> Result<()> {
    archive_job(pool, "availability_job", "availability_result", record, items).await
}

/// Same as [`archive_availability_job`] for echo jobs.
pub async fn archive_echo_job(pool: &PgPool, record: &JobRecord, items: &[JobItem]) -> Result<()> {
    archive_job(pool, "echo_job", "echo_item", record, items).await
}

async fn archive_job(
    pool: &PgPool,
    job_table: &str,
    item_table: &str,
    record: &JobRecord,
    items: &[JobItem],
) -> Result<()> {
    let payload_column = if job_table == "echo_job" {
        "payload_json"
    } else {
        "criteria_json"
    };

    let mut tx = pool.begin().await.context("archive tx begin")?;

    sqlx::query(&format!(
        r#"
        insert into {job_table} (id, agent_id, {payload_column}, status, expected_sources, created_at, completed_at)
        values ($1, $2, $3, $4, $5, $6, $7)
        on conflict (id) do nothing
        "#,
    ))
    .bind(record.id)
    .bind(record.agent_id)
    .bind(&record.criteria)
    .bind(record.status.as_str())
    .bind(record.expected_sources as i32)
    .bind(record.created_at)
    .bind(record.completed_at)
    .execute(&mut *tx)
    .await
    .context("archive job insert")?;

    for item in items {
        sqlx::query(&format!(
            r#"
            insert into {item_table} (job_id, seq, source_id, payload_json, timed_out, created_at)
            values ($1, $2, $3, $4, $5, $6)
            on conflict (job_id, seq) do nothing
            "#,
        ))
        .bind(record.id)
        .bind(item.seq as i64)
        .bind(item.source_id)
        .bind(&item.payload)
        .bind(item.timed_out)
        .bind(item.created_at)
        .execute(&mut *tx)
        .await
        .context("archive item insert")?;
    }

    tx.commit().await.context("archive tx commit")?;
    Ok(())
}

/// Persist the monitor's current view of one Source.
pub async fn upsert_source_health(pool: &PgPool, snap: &SourceHealthSnapshot) -> Result<()> {
    sqlx::query(
        r#"
        insert into source_health (
          source_id, sample_count, slow_count, slow_rate, backoff_level, excluded_until, updated_at
        ) values ($1, $2, $3, $4, $5, $6, now())
        on conflict (source_id) do update set
          sample_count = excluded.sample_count,
          slow_count = excluded.slow_count,
          slow_rate = excluded.slow_rate,
          backoff_level = excluded.backoff_level,
          excluded_until = excluded.excluded_until,
          updated_at = excluded.updated_at
        "#,
    )
    .bind(snap.source_id)
    .bind(snap.sample_count as i32)
    .bind(snap.slow_count as i32)
    .bind(snap.slow_rate)
    .bind(snap.backoff_level as i32)
    .bind(snap.excluded_until)
    .execute(pool)
    .await
    .context("source_health upsert")?;
    Ok(())
}
