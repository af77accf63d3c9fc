//! One availability scatter/gather.
//!
//! The submit path runs synchronously up to eligibility resolution, so the
//! Agent gets its job id (and `expected_sources`) immediately; the scatter
//! itself runs on a detached task. The SLA watchdog force-completes the job
//! without cancelling in-flight calls; their late results are dropped by
//! the job store, which is exactly the post-complete invariant.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use rmx_adapters::AdapterRegistry;
use rmx_agreements::AgreementRegistry;
use rmx_audit::{Auditor, BoundaryEvent, Direction};
use rmx_config::DispatchConfig;
use rmx_coverage::CoverageResolver;
use rmx_health::{CallMetric, SourceHealthMonitor};
use rmx_jobstore::JobStore;
use rmx_schemas::{
    ActiveAgreement, AvailabilityCriteria, CompanyId, CoreError, JobId, SourceErrorItem,
};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// What the Agent gets back from a submit, before any Source has answered.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitReceipt {
    pub request_id: JobId,
    pub expected_sources: u32,
    pub recommended_poll_ms: u64,
}

pub struct Dispatcher {
    agreements: Arc<AgreementRegistry>,
    coverage: Arc<CoverageResolver>,
    health: Arc<SourceHealthMonitor>,
    adapters: Arc<AdapterRegistry>,
    jobs: Arc<JobStore>,
    audit: Arc<Auditor>,
    cfg: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        agreements: Arc<AgreementRegistry>,
        coverage: Arc<CoverageResolver>,
        health: Arc<SourceHealthMonitor>,
        adapters: Arc<AdapterRegistry>,
        jobs: Arc<JobStore>,
        audit: Arc<Auditor>,
        cfg: DispatchConfig,
    ) -> Self {
        Self {
            agreements,
            coverage,
            health,
            adapters,
            jobs,
            audit,
            cfg,
        }
    }

    pub fn jobs(&self) -> &Arc<JobStore> {
        &self.jobs
    }

    /// Submit one availability search. Returns once eligibility is resolved;
    /// the scatter continues in the background.
    pub async fn submit(
        &self,
        agent_id: CompanyId,
        criteria: AvailabilityCriteria,
    ) -> Result<SubmitReceipt, CoreError> {
        validate_criteria(&criteria)?;

        // The job exists before anything can fail downstream, so even a
        // zero-source outcome has a pollable id.
        let job = self.jobs.create_job(
            agent_id,
            serde_json::to_value(&criteria).unwrap_or(Value::Null),
        );

        let refs = match criteria.agreement_refs.clone().filter(|r| !r.is_empty()) {
            Some(refs) => refs,
            None => self.agreements.active_refs(agent_id).await?,
        };
        let candidates = self.agreements.resolve_active(agent_id, &refs).await?;

        let mut eligible: Vec<ActiveAgreement> = Vec::new();
        for candidate in candidates {
            if self.health.is_excluded(candidate.source_id) {
                debug!(source_id = %candidate.source_id, "source excluded by health monitor");
                continue;
            }
            if !self
                .coverage
                .is_allowed(candidate.id, &criteria.pickup_unlocode)
                .await?
            {
                continue;
            }
            if !self
                .coverage
                .is_allowed(candidate.id, &criteria.dropoff_unlocode)
                .await?
            {
                continue;
            }
            eligible.push(candidate);
        }

        // A Source under several active agreements is contacted once per
        // agreement but counts once toward the expectation.
        let distinct: HashSet<CompanyId> = eligible.iter().map(|e| e.source_id).collect();
        let expected_sources = distinct.len() as u32;
        self.jobs.set_expected_sources(job.id, expected_sources)?;

        self.audit.emit(BoundaryEvent {
            direction: Direction::In,
            endpoint: "availability.submit".to_string(),
            request_id: job.id,
            actor_company_id: Some(agent_id),
            source_id: None,
            agreement_ref: None,
            status_code: 200,
            request: serde_json::to_value(&criteria).unwrap_or(Value::Null),
            response: json!({ "request_id": job.id, "expected_sources": expected_sources }),
            duration_ms: 0,
        });

        if eligible.is_empty() {
            // Graceful degradation: the designed outcome, not an error.
            self.jobs.mark_complete(job.id)?;
            info!(job_id = %job.id, "no eligible sources; job complete at submit");
        } else {
            info!(
                job_id = %job.id,
                expected_sources,
                calls = eligible.len(),
                "availability fan-out starting"
            );
            self.spawn_scatter(job.id, criteria, eligible);
        }

        Ok(SubmitReceipt {
            request_id: job.id,
            expected_sources,
            recommended_poll_ms: self.cfg.recommended_poll_ms,
        })
    }

    fn spawn_scatter(
        &self,
        job_id: JobId,
        criteria: AvailabilityCriteria,
        eligible: Vec<ActiveAgreement>,
    ) {
        let jobs = self.jobs.clone();
        let adapters = self.adapters.clone();
        let health = self.health.clone();
        let audit = self.audit.clone();
        let per_call = self.cfg.per_call_timeout();
        let sla = self.cfg.sla();
        let max_concurrency = self.cfg.max_concurrency;

        tokio::spawn(async move {
            let sla_deadline = tokio::time::Instant::now() + sla;
            let semaphore = Arc::new(Semaphore::new(max_concurrency));
            let criteria = Arc::new(criteria);

            let mut handles = Vec::with_capacity(eligible.len());
            for pair in eligible {
                handles.push(tokio::spawn(scatter_call(
                    jobs.clone(),
                    adapters.clone(),
                    health.clone(),
                    audit.clone(),
                    semaphore.clone(),
                    criteria.clone(),
                    pair,
                    job_id,
                    per_call,
                    sla_deadline,
                )));
            }

            // Job completes when every call settles OR the SLA elapses,
            // whichever is first. Dropping the join handles detaches the
            // stragglers; the store drops whatever they append afterwards.
            tokio::select! {
                _ = join_all(handles) => {
                    debug!(job_id = %job_id, "all scatter calls settled");
                }
                _ = tokio::time::sleep_until(sla_deadline) => {
                    warn!(job_id = %job_id, "SLA elapsed with calls in flight");
                }
            }
            if let Err(err) = jobs.mark_complete(job_id) {
                warn!(job_id = %job_id, error = %err, "mark_complete after scatter failed");
            }
        });
    }
}

fn validate_criteria(criteria: &AvailabilityCriteria) -> Result<(), CoreError> {
    if criteria.pickup_unlocode.trim().is_empty() {
        return Err(CoreError::InvalidParam("pickup_unlocode is required".into()));
    }
    if criteria.dropoff_unlocode.trim().is_empty() {
        return Err(CoreError::InvalidParam(
            "dropoff_unlocode is required".into(),
        ));
    }
    if criteria.pickup_iso.trim().is_empty() || criteria.dropoff_iso.trim().is_empty() {
        return Err(CoreError::InvalidParam(
            "pickup_iso and dropoff_iso are required".into(),
        ));
    }
    if criteria.driver_age == 0 {
        return Err(CoreError::InvalidParam("driver_age is required".into()));
    }
    Ok(())
}

/// One adapter call: bounded by the semaphore, deadlined by
/// `min(per_call, SLA remaining)`, and settled into the job store.
#[allow(clippy::too_many_arguments)]
async fn scatter_call(
    jobs: Arc<JobStore>,
    adapters: Arc<AdapterRegistry>,
    health: Arc<SourceHealthMonitor>,
    audit: Arc<Auditor>,
    semaphore: Arc<Semaphore>,
    criteria: Arc<AvailabilityCriteria>,
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
        // The SLA ran out while this call waited for a slot; the watchdog
        // owns completion.
        return;
    }

    let adapter = match adapters.for_source(pair.source_id).await {
        Ok(adapter) => adapter,
        Err(err) => {
            warn!(source_id = %pair.source_id, error = %err, "adapter unavailable");
            append_error(&jobs, job_id, &pair, &err.to_string());
            return;
        }
    };

    let started = std::time::Instant::now();
    let outcome = tokio::time::timeout(
        deadline,
        adapter.availability(&criteria, &pair.agreement_ref, deadline),
    )
    .await;
    let latency_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(Ok(offers)) => {
            let payload = serde_json::to_value(&offers).unwrap_or_else(|_| json!([]));
            let appended = jobs
                .append_partial(job_id, pair.source_id, payload, false)
                .unwrap_or(false);
            if !appended {
                debug!(job_id = %job_id, source_id = %pair.source_id, "result arrived after completion");
            }
            health.record(CallMetric {
                source_id: pair.source_id,
                latency_ms,
                success: true,
            });
            emit_adapter_audit(&audit, job_id, &pair, 200, latency_ms, offers.len());
        }
        Err(_) | Ok(Err(CoreError::Timeout)) => {
            // Timeout marker: an empty payload flagged timed_out, distinct
            // from a successful empty result. No error item is appended.
            let _ = jobs.append_partial(job_id, pair.source_id, json!([]), true);
            health.record(CallMetric {
                source_id: pair.source_id,
                latency_ms,
                success: false,
            });
            emit_adapter_audit(&audit, job_id, &pair, 504, latency_ms, 0);
        }
        Ok(Err(err)) => {
            append_error(&jobs, job_id, &pair, &err.to_string());
            health.record(CallMetric {
                source_id: pair.source_id,
                latency_ms,
                success: false,
            });
            emit_adapter_audit(&audit, job_id, &pair, 502, latency_ms, 0);
        }
    }
}

fn append_error(jobs: &JobStore, job_id: JobId, pair: &ActiveAgreement, message: &str) {
    let _ = jobs.append_partial(job_id, pair.source_id, json!([]), false);
    let item = SourceErrorItem {
        error: "SOURCE_ERROR".to_string(),
        message: message.to_string(),
        agreement_ref: pair.agreement_ref.clone(),
    };
    let _ = jobs.append_partial(
        job_id,
        pair.source_id,
        serde_json::to_value(&item).unwrap_or(Value::Null),
        false,
    );
}

fn emit_adapter_audit(
    audit: &Auditor,
    job_id: JobId,
    pair: &ActiveAgreement,
    status_code: u16,
    duration_ms: u64,
    offers: usize,
) {
    audit.emit(BoundaryEvent {
        direction: Direction::Out,
        endpoint: "adapter.availability".to_string(),
        request_id: job_id,
        actor_company_id: None,
        source_id: Some(pair.source_id),
        agreement_ref: Some(pair.agreement_ref.clone()),
        status_code,
        request: json!({ "agreement_ref": pair.agreement_ref }),
        response: json!({ "offers": offers }),
        duration_ms,
    });
}
