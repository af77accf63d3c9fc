//! Postgres-backed booking store. The booking row and its idempotency key
//! commit in one transaction; a concurrent duplicate loses on the unique
//! constraint and falls through to the winner's committed record.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rmx_booking::{BookingStore, CreateOutcome, IdempotencyRecord};
use rmx_schemas::{Booking, BookingId, BookingStatus, CompanyId, CoreError};
use serde_json::Value;
use sqlx::{PgPool, Row};

use crate::{constraint_of, internal};

pub struct PgBookingStore {
    pool: PgPool,
    key_ttl: Duration,
}

impl PgBookingStore {
    pub fn new(pool: PgPool, key_ttl: Duration) -> Self {
        Self { pool, key_ttl }
    }

    fn ttl_cutoff(&self) -> DateTime<Utc> {
        Utc::now()
            - chrono::Duration::from_std(self.key_ttl).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

fn booking_from_row(row: &sqlx::postgres::PgRow) -> Result<Booking, CoreError> {
    let status: String = row
        .try_get("status")
        .map_err(|e| internal("booking.status", e))?;
    Ok(Booking {
        id: row.try_get("id").map_err(|e| internal("booking.id", e))?,
        agent_id: row
            .try_get("agent_id")
            .map_err(|e| internal("booking.agent_id", e))?,
        source_id: row
            .try_get("source_id")
            .map_err(|e| internal("booking.source_id", e))?,
        agreement_ref: row
            .try_get("agreement_ref")
            .map_err(|e| internal("booking.agreement_ref", e))?,
        supplier_booking_ref: row
            .try_get("supplier_booking_ref")
            .map_err(|e| internal("booking.supplier_booking_ref", e))?,
        status: BookingStatus::parse(&status)
            .ok_or_else(|| CoreError::Internal(format!("bad booking status '{status}'")))?,
        idempotency_key: row
            .try_get("idempotency_key")
            .map_err(|e| internal("booking.idempotency_key", e))?,
        payload: row
            .try_get("payload_json")
            .map_err(|e| internal("booking.payload_json", e))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| internal("booking.created_at", e))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| internal("booking.updated_at", e))?,
    })
}

fn key_record_from_row(row: &sqlx::postgres::PgRow) -> Result<IdempotencyRecord, CoreError> {
    Ok(IdempotencyRecord {
        agent_id: row
            .try_get("agent_id")
            .map_err(|e| internal("key.agent_id", e))?,
        scope: row.try_get("scope").map_err(|e| internal("key.scope", e))?,
        key: row.try_get("key").map_err(|e| internal("key.key", e))?,
        booking_id: row
            .try_get("booking_id")
            .map_err(|e| internal("key.booking_id", e))?,
        canonical_body: row
            .try_get("canonical_body")
            .map_err(|e| internal("key.canonical_body", e))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| internal("key.created_at", e))?,
    })
}

#[async_trait]
impl BookingStore for PgBookingStore {
    async fn create_with_key(
        &self,
        booking: Booking,
        scope: &str,
        canonical_body: Value,
    ) -> Result<CreateOutcome, CoreError> {
        let key = booking
            .idempotency_key
            .clone()
            .ok_or(CoreError::MissingIdempotency)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| internal("booking tx begin", e))?;

        let inserted = sqlx::query(
            r#"
            insert into booking (
              id, agent_id, source_id, agreement_ref, supplier_booking_ref,
              status, idempotency_key, payload_json, created_at, updated_at
            ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(booking.id)
        .bind(booking.agent_id)
        .bind(booking.source_id)
        .bind(&booking.agreement_ref)
        .bind(&booking.supplier_booking_ref)
        .bind(booking.status.as_str())
        .bind(&booking.idempotency_key)
        .bind(&booking.payload)
        .bind(booking.created_at)
        .bind(booking.updated_at)
        .execute(&mut *tx)
        .await;

        if let Err(err) = inserted {
            drop(tx);
            return match constraint_of(&err).as_deref() {
                // A concurrent retry with the same key committed first:
                // hand back its canonical record.
                Some("booking_agent_key") | Some("idempotency_key_unique") => self
                    .find_key(booking.agent_id, scope, &key)
                    .await?
                    .map(CreateOutcome::Prior)
                    .ok_or_else(|| {
                        CoreError::Internal("duplicate key without committed record".into())
                    }),
                Some("booking_supplier_ref") => Err(CoreError::Duplicate(format!(
                    "supplier_booking_ref {:?} already exists for this source",
                    booking.supplier_booking_ref
                ))),
                _ => Err(internal("booking insert", err)),
            };
        }

        let key_inserted = sqlx::query(
            r#"
            insert into idempotency_key (
              agent_id, scope, key, booking_id, canonical_body, created_at
            ) values ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(booking.agent_id)
        .bind(scope)
        .bind(&key)
        .bind(booking.id)
        .bind(&canonical_body)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await;

        if let Err(err) = key_inserted {
            drop(tx);
            return match constraint_of(&err).as_deref() {
                Some("idempotency_key_unique") => self
                    .find_key(booking.agent_id, scope, &key)
                    .await?
                    .map(CreateOutcome::Prior)
                    .ok_or_else(|| {
                        CoreError::Internal("duplicate key without committed record".into())
                    }),
                _ => Err(internal("idempotency key insert", err)),
            };
        }

        tx.commit()
            .await
            .map_err(|e| internal("booking tx commit", e))?;
        Ok(CreateOutcome::Created(booking))
    }

    async fn find_key(
        &self,
        agent_id: CompanyId,
        scope: &str,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, CoreError> {
        let row = sqlx::query(
            r#"
            select * from idempotency_key
            where agent_id = $1 and scope = $2 and key = $3 and created_at > $4
            "#,
        )
        .bind(agent_id)
        .bind(scope)
        .bind(key)
        .bind(self.ttl_cutoff())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| internal("key select", e))?;
        row.as_ref().map(key_record_from_row).transpose()
    }

    async fn get(&self, id: BookingId) -> Result<Option<Booking>, CoreError> {
        let row = sqlx::query("select * from booking where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| internal("booking select", e))?;
        row.as_ref().map(booking_from_row).transpose()
    }

    async fn get_by_supplier_ref(
        &self,
        supplier_booking_ref: &str,
    ) -> Result<Option<Booking>, CoreError> {
        let row = sqlx::query("select * from booking where supplier_booking_ref = $1")
            .bind(supplier_booking_ref)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| internal("booking select by ref", e))?;
        row.as_ref().map(booking_from_row).transpose()
    }

    async fn update_snapshot(
        &self,
        id: BookingId,
        status: BookingStatus,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Result<Booking, CoreError> {
        let row = sqlx::query(
            r#"
            update booking
            set status = $2, payload_json = $3, updated_at = $4
            where id = $1
            returning *
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(&payload)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| internal("booking update", e))?;
        match row {
            Some(row) => booking_from_row(&row),
            None => Err(CoreError::NotFound(format!("booking {id}"))),
        }
    }
}
