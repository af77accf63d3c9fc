//! Append-only, seq-ordered fan-in buffer behind the availability and echo
//! long-poll surfaces.
//!
//! Invariants enforced here:
//! - `seq` is assigned under the store lock at append time and is strictly
//!   monotonic per job, starting at 1.
//! - After `mark_complete`, appends are dropped (`Ok(false)`), so no seq
//!   ever appears after completion.
//! - `get_since` never returns items out of seq order and the `last_seq` it
//!   reports never decreases across calls for the same job.
//!
//! The long-poll wait is a cooperative notification per job: readers
//! register interest before re-checking, so an append between the check and
//! the await cannot be missed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rmx_schemas::{CompanyId, CoreError, JobId, JobItem, JobStatus};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

/// Job header as stored; results live alongside in the same entry.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: JobId,
    pub agent_id: CompanyId,
    /// Criteria snapshot (availability criteria or echo payload).
    pub criteria: Value,
    pub status: JobStatus,
    pub expected_sources: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// What a poller gets back: the job's status at return time plus every item
/// with `seq > since_seq`, in seq order.
#[derive(Debug, Clone)]
pub struct PollResult {
    pub status: JobStatus,
    pub last_seq: u64,
    pub new_items: Vec<JobItem>,
}

struct JobState {
    record: JobRecord,
    items: Vec<JobItem>,
    notify: Arc<Notify>,
}

#[derive(Default)]
pub struct JobStore {
    inner: Mutex<HashMap<JobId, JobState>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a job in IN_PROGRESS with `expected_sources = 0`; the
    /// dispatcher raises the expectation before fan-out begins.
    pub fn create_job(&self, agent_id: CompanyId, criteria: Value) -> JobRecord {
        let record = JobRecord {
            id: Uuid::new_v4(),
            agent_id,
            criteria,
            status: JobStatus::InProgress,
            expected_sources: 0,
            created_at: Utc::now(),
            completed_at: None,
        };
        let mut inner = self.inner.lock().expect("job store lock");
        inner.insert(
            record.id,
            JobState {
                record: record.clone(),
                items: Vec::new(),
                notify: Arc::new(Notify::new()),
            },
        );
        record
    }

    pub fn set_expected_sources(&self, job_id: JobId, expected: u32) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().expect("job store lock");
        let st = inner
            .get_mut(&job_id)
            .ok_or_else(|| CoreError::NotFound(format!("job {job_id}")))?;
        st.record.expected_sources = expected;
        Ok(())
    }

    /// Atomic append: assigns the next seq and inserts one result row.
    /// Returns `Ok(false)` when the job is already COMPLETE; late arrivals
    /// are dropped, never appended.
    pub fn append_partial(
        &self,
        job_id: JobId,
        source_id: CompanyId,
        payload: Value,
        timed_out: bool,
    ) -> Result<bool, CoreError> {
        let mut inner = self.inner.lock().expect("job store lock");
        let st = inner
            .get_mut(&job_id)
            .ok_or_else(|| CoreError::NotFound(format!("job {job_id}")))?;
        if st.record.status == JobStatus::Complete {
            debug!(job_id = %job_id, source_id = %source_id, "late result dropped");
            return Ok(false);
        }
        let seq = st.items.len() as u64 + 1;
        st.items.push(JobItem {
            seq,
            source_id,
            payload,
            timed_out,
            created_at: Utc::now(),
        });
        st.notify.notify_waiters();
        Ok(true)
    }

    /// Idempotent: the first call freezes the job, later calls are no-ops.
    pub fn mark_complete(&self, job_id: JobId) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().expect("job store lock");
        let st = inner
            .get_mut(&job_id)
            .ok_or_else(|| CoreError::NotFound(format!("job {job_id}")))?;
        if st.record.status == JobStatus::Complete {
            return Ok(());
        }
        st.record.status = JobStatus::Complete;
        st.record.completed_at = Some(Utc::now());
        st.notify.notify_waiters();
        Ok(())
    }

    pub fn get_job(&self, job_id: JobId) -> Result<JobRecord, CoreError> {
        let inner = self.inner.lock().expect("job store lock");
        inner
            .get(&job_id)
            .map(|st| st.record.clone())
            .ok_or_else(|| CoreError::NotFound(format!("job {job_id}")))
    }

    /// Every item appended so far, in seq order.
    pub fn all_items(&self, job_id: JobId) -> Result<Vec<JobItem>, CoreError> {
        let inner = self.inner.lock().expect("job store lock");
        inner
            .get(&job_id)
            .map(|st| st.items.clone())
            .ok_or_else(|| CoreError::NotFound(format!("job {job_id}")))
    }

    /// Long-poll read. Returns immediately when items past `since_seq`
    /// exist or the job is COMPLETE; otherwise waits up to `wait` for an
    /// append, then returns whatever is there (possibly nothing).
    pub async fn get_since(
        &self,
        job_id: JobId,
        since_seq: u64,
        wait: Duration,
    ) -> Result<PollResult, CoreError> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let notify = {
                let inner = self.inner.lock().expect("job store lock");
                let st = inner
                    .get(&job_id)
                    .ok_or_else(|| CoreError::NotFound(format!("job {job_id}")))?;
                if let Some(result) = Self::try_read(st, since_seq) {
                    return Ok(result);
                }
                if tokio::time::Instant::now() >= deadline {
                    return Ok(Self::read_now(st, since_seq));
                }
                st.notify.clone()
            };

            // Register interest, then re-check: an append racing the first
            // check lands either in the re-check or in the notification.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let inner = self.inner.lock().expect("job store lock");
                let st = inner
                    .get(&job_id)
                    .ok_or_else(|| CoreError::NotFound(format!("job {job_id}")))?;
                if let Some(result) = Self::try_read(st, since_seq) {
                    return Ok(result);
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    /// Records of every COMPLETE job still held in memory (archival sweep).
    pub fn completed_jobs(&self) -> Vec<JobRecord> {
        let inner = self.inner.lock().expect("job store lock");
        inner
            .values()
            .filter(|st| st.record.status == JobStatus::Complete)
            .map(|st| st.record.clone())
            .collect()
    }

    /// Evict completed jobs older than `ttl`. Returns how many were removed.
    pub fn sweep_expired(&self, ttl: Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        let mut inner = self.inner.lock().expect("job store lock");
        let before = inner.len();
        inner.retain(|_, st| match st.record.completed_at {
            Some(done) => done > cutoff,
            None => true,
        });
        before - inner.len()
    }

    fn read_now(st: &JobState, since_seq: u64) -> PollResult {
        let new_items: Vec<JobItem> = st
            .items
            .iter()
            .filter(|i| i.seq > since_seq)
            .cloned()
            .collect();
        let total = st.items.len() as u64;
        PollResult {
            status: st.record.status,
            last_seq: total.max(since_seq),
            new_items,
        }
    }

    /// `Some` when the poll should return without waiting.
    fn try_read(st: &JobState, since_seq: u64) -> Option<PollResult> {
        let has_new = st.items.iter().any(|i| i.seq > since_seq);
        if has_new || st.record.status == JobStatus::Complete {
            Some(Self::read_now(st, since_seq))
        } else {
            None
        }
    }
}
