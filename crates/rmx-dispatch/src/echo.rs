//! The echo broker: a degenerate dispatcher used as a liveness and load
//! probe.
//!
//! Same scatter/gather skeleton as the availability path (resolve the
//! Agent's active agreements, create a job, fan out with a short per-call
//! timeout, force-complete at the SLA) but the payload is a trivial
//! `message + attrs` echo and there is no coverage gating: a probe wants to
//! see every Source, including unhealthy ones. Latencies still feed the
//! health monitor.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use rmx_adapters::AdapterRegistry;
use rmx_agreements::AgreementRegistry;
use rmx_audit::{Auditor, BoundaryEvent, Direction};
use rmx_config::EchoConfig;
use rmx_health::{CallMetric, SourceHealthMonitor};
use rmx_jobstore::JobStore;
use rmx_schemas::{
    ActiveAgreement, CompanyId, CoreError, EchoPayload, EchoReply, JobId, JobItem, JobStatus,
};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Echo scatter calls are cheap; a fixed bound keeps a large agreement set
/// from stampeding every Source at once.
const ECHO_MAX_CONCURRENCY: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct EchoSubmitReceipt {
    pub request_id: JobId,
    pub total_expected: u32,
    pub expires_unix_ms: i64,
    pub recommended_poll_ms: u64,
}

/// Poll view over an echo job, with the aggregate accounting the probe
/// clients consume.
#[derive(Debug, Clone, Serialize)]
pub struct EchoResults {
    pub status: JobStatus,
    pub new_items: Vec<JobItem>,
    pub last_seq: u64,
    pub responses_received: u32,
    pub total_expected: u32,
    pub timed_out_sources: u32,
    pub aggregate_etag: String,
}

pub struct EchoBroker {
    agreements: Arc<AgreementRegistry>,
    adapters: Arc<AdapterRegistry>,
    health: Arc<SourceHealthMonitor>,
    jobs: Arc<JobStore>,
    audit: Arc<Auditor>,
    cfg: EchoConfig,
}

impl EchoBroker {
    pub fn new(
        agreements: Arc<AgreementRegistry>,
        adapters: Arc<AdapterRegistry>,
        health: Arc<SourceHealthMonitor>,
        jobs: Arc<JobStore>,
        audit: Arc<Auditor>,
        cfg: EchoConfig,
    ) -> Self {
        Self {
            agreements,
            adapters,
            health,
            jobs,
            audit,
            cfg,
        }
    }

    pub fn jobs(&self) -> &Arc<JobStore> {
        &self.jobs
    }

    pub fn config(&self) -> &EchoConfig {
        &self.cfg
    }

    /// Submit one echo probe. A named agreement restricts the fan-out to
    /// that one contract; otherwise every active agreement is probed.
    pub async fn submit(
        &self,
        agent_id: CompanyId,
        agreement_ref: Option<String>,
        payload: EchoPayload,
    ) -> Result<EchoSubmitReceipt, CoreError> {
        if payload.message.trim().is_empty() {
            return Err(CoreError::InvalidParam("message is required".into()));
        }

        let job = self.jobs.create_job(
            agent_id,
            serde_json::to_value(&payload).unwrap_or(Value::Null),
        );

        let refs = match agreement_ref {
            Some(r) => vec![r],
            None => self.agreements.active_refs(agent_id).await?,
        };
        let eligible = self.agreements.resolve_active(agent_id, &refs).await?;

        let distinct: std::collections::HashSet<CompanyId> =
            eligible.iter().map(|e| e.source_id).collect();
        let total_expected = distinct.len() as u32;
        self.jobs.set_expected_sources(job.id, total_expected)?;

        self.audit.emit(BoundaryEvent {
            direction: Direction::In,
            endpoint: "echo.submit".to_string(),
            request_id: job.id,
            actor_company_id: Some(agent_id),
            source_id: None,
            agreement_ref: None,
            status_code: 200,
            request: serde_json::to_value(&payload).unwrap_or(Value::Null),
            response: json!({ "request_id": job.id, "total_expected": total_expected }),
            duration_ms: 0,
        });

        let expires_unix_ms = (chrono::Utc::now()
            + chrono::Duration::milliseconds(self.cfg.sla_ms as i64))
        .timestamp_millis();

        if eligible.is_empty() {
            self.jobs.mark_complete(job.id)?;
            info!(job_id = %job.id, "echo: no eligible sources");
        } else {
            info!(job_id = %job.id, total_expected, "echo fan-out starting");
            self.spawn_scatter(job.id, payload, eligible);
        }

        Ok(EchoSubmitReceipt {
            request_id: job.id,
            total_expected,
            expires_unix_ms,
            recommended_poll_ms: self.cfg.watch_poll_ms,
        })
    }

    /// Long-poll read plus aggregate accounting over everything visible at
    /// the returned cursor.
    pub async fn get_results(
        &self,
        job_id: JobId,
        since_seq: u64,
        wait: Duration,
    ) -> Result<EchoResults, CoreError> {
        let poll = self.jobs.get_since(job_id, since_seq, wait).await?;
        let record = self.jobs.get_job(job_id)?;
        let all = self.jobs.all_items(job_id)?;

        let visible: Vec<&JobItem> = all.iter().filter(|i| i.seq <= poll.last_seq).collect();
        let timed_out_sources = visible.iter().filter(|i| i.timed_out).count() as u32;
        let responses_received = visible
            .iter()
            .filter(|i| !i.timed_out && i.payload.get("error").is_none())
            .count() as u32;
        let aggregate_etag = etag_over(&visible);

        Ok(EchoResults {
            status: poll.status,
            new_items: poll.new_items,
            last_seq: poll.last_seq,
            responses_received,
            total_expected: record.expected_sources,
            timed_out_sources,
            aggregate_etag,
        })
    }

    fn spawn_scatter(&self, job_id: JobId, payload: EchoPayload, eligible: Vec<ActiveAgreement>) {
        let jobs = self.jobs.clone();
        let adapters = self.adapters.clone();
        let health = self.health.clone();
        let audit = self.audit.clone();
        let per_call = self.cfg.per_call_timeout();
        let sla = self.cfg.sla();

        tokio::spawn(async move {
            let sla_deadline = tokio::time::Instant::now() + sla;
            let semaphore = Arc::new(Semaphore::new(ECHO_MAX_CONCURRENCY));
            let payload = Arc::new(payload);

            let mut handles = Vec::with_capacity(eligible.len());
            for pair in eligible {
                handles.push(tokio::spawn(echo_call(
                    jobs.clone(),
                    adapters.clone(),
                    health.clone(),
                    audit.clone(),
                    semaphore.clone(),
                    payload.clone(),
                    pair,
                    job_id,
                    per_call,
                    sla_deadline,
                )));
            }

            tokio::select! {
                _ = join_all(handles) => {
                    debug!(job_id = %job_id, "all echo calls settled");
                }
                _ = tokio::time::sleep_until(sla_deadline) => {
                    warn!(job_id = %job_id, "echo SLA elapsed with calls in flight");
                }
            }
            if let Err(err) = jobs.mark_complete(job_id) {
                warn!(job_id = %job_id, error = %err, "echo mark_complete failed");
            }
        });
    }
}

/// Stable fingerprint of everything visible at a cursor: identical item
/// sets yield identical etags regardless of when they are observed.
fn etag_over(items: &[&JobItem]) -> String {
    let mut hasher = Sha256::new();
    for item in items {
        hasher.update(item.seq.to_be_bytes());
        hasher.update(item.payload.to_string().as_bytes());
        hasher.update([u8::from(item.timed_out)]);
    }
    hex::encode(hasher.finalize())[..16].to_string()
}

#[allow(clippy::too_many_arguments)]
async fn echo_call(
    jobs: Arc<JobStore>,
    adapters: Arc<AdapterRegistry>,
    health: Arc<SourceHealthMonitor>,
    audit: Arc<Auditor>,
    semaphore: Arc<Semaphore>,
    payload: Arc<EchoPayload>,
    pair: ActiveAgreement,
    job_id: JobId,
    per_call: Duration,
    sla_deadline: tokio::time::Instant,
) {
    let Ok(_permit) = semaphore.acquire_owned().await else {
        return;
    };

    let remaining = sla_deadline.saturating_duration_since(tokio::time::Instant::now());
    let deadline = per_call.min(remaining);
    if deadline.is_zero() {
        return;
    }

    let adapter = match adapters.for_source(pair.source_id).await {
        Ok(adapter) => adapter,
        Err(err) => {
            let _ = jobs.append_partial(
                job_id,
                pair.source_id,
                json!({
                    "error": "SOURCE_ERROR",
                    "message": err.to_string(),
                    "agreement_ref": pair.agreement_ref,
                }),
                false,
            );
            return;
        }
    };

    let started = std::time::Instant::now();
    let outcome = tokio::time::timeout(
        deadline,
        adapter.echo(&payload, &pair.agreement_ref, deadline),
    )
    .await;
    let latency_ms = started.elapsed().as_millis() as u64;

    let (status_code, appended) = match outcome {
        Ok(Ok(echoed)) => {
            let reply = EchoReply {
                source_id: pair.source_id,
                agreement_ref: pair.agreement_ref.clone(),
                message: echoed.message,
                attrs: echoed.attrs,
                latency_ms,
            };
            let _ = jobs.append_partial(
                job_id,
                pair.source_id,
                serde_json::to_value(&reply).unwrap_or(Value::Null),
                false,
            );
            health.record(CallMetric {
                source_id: pair.source_id,
                latency_ms,
                success: true,
            });
            (200u16, "reply")
        }
        Err(_) | Ok(Err(CoreError::Timeout)) => {
            let _ = jobs.append_partial(job_id, pair.source_id, json!([]), true);
            health.record(CallMetric {
                source_id: pair.source_id,
                latency_ms,
                success: false,
            });
            (504, "timeout")
        }
        Ok(Err(err)) => {
            let _ = jobs.append_partial(
                job_id,
                pair.source_id,
                json!({
                    "error": "SOURCE_ERROR",
                    "message": err.to_string(),
                    "agreement_ref": pair.agreement_ref,
                }),
                false,
            );
            health.record(CallMetric {
                source_id: pair.source_id,
                latency_ms,
                success: false,
            });
            (502, "error")
        }
    };

    audit.emit(BoundaryEvent {
        direction: Direction::Out,
        endpoint: "adapter.echo".to_string(),
        request_id: job_id,
        actor_company_id: None,
        source_id: Some(pair.source_id),
        agreement_ref: Some(pair.agreement_ref.clone()),
        status_code,
        request: json!({ "agreement_ref": pair.agreement_ref }),
        response: json!({ "outcome": appended }),
        duration_ms: latency_ms,
    });
}
