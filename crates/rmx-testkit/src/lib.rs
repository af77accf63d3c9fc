//! Scenario harness: one fully-wired in-memory core, with seeding helpers
//! shared by the `tests/scenario_*.rs` files.
//!
//! Everything goes through the real engines: agreements are walked through
//! the actual state machine, coverage through the resolver, searches through
//! the dispatcher. A scenario therefore exercises the same paths production does,
//! just with scaled-down timings.

use std::sync::Arc;
use std::time::Duration;

use rmx_adapters::{AdapterRegistry, MockSourceAdapter};
use rmx_agreements::{
    AgreementRegistry, CompanyDirectory, LogNotificationSink, MemoryAgreementStore,
    MemoryCompanyDirectory,
};
use rmx_audit::Auditor;
use rmx_booking::{BookingEngine, MemoryBookingStore};
use rmx_config::{CoreConfig, DispatchConfig, EchoConfig};
use rmx_coverage::{CoverageResolver, MemoryCoverageStore, StaticLocationCatalog};
use rmx_dispatch::{Dispatcher, EchoBroker};
use rmx_health::SourceHealthMonitor;
use rmx_jobstore::{JobRecord, JobStore};
use rmx_schemas::{
    AgreementId, AgreementStatus, AvailabilityCriteria, Company, CompanyId, CompanyKind,
    CompanyStatus, JobId, JobItem, JobStatus, Offer,
};
use uuid::Uuid;

/// UN/LOCODEs known to every scenario catalog.
pub const CATALOG: &[&str] = &["PKKHI", "PKLHE", "GBMAN", "GBGLA", "USNYC"];

/// Scaled-down timings: per-call 250ms, SLA 2s, echo per-call 200ms.
pub fn test_config() -> CoreConfig {
    CoreConfig {
        dispatch: DispatchConfig {
            max_concurrency: 10,
            per_call_timeout_ms: 250,
            sla_ms: 2_000,
            recommended_poll_ms: 1_500,
        },
        echo: EchoConfig {
            per_call_timeout_ms: 200,
            sla_ms: 2_000,
            watch_poll_ms: 50,
            watch_max_ms: 5_000,
        },
        ..Default::default()
    }
}

pub struct Mesh {
    pub config: CoreConfig,
    pub directory: Arc<MemoryCompanyDirectory>,
    pub agreement_store: Arc<MemoryAgreementStore>,
    pub coverage_store: Arc<MemoryCoverageStore>,
    pub registry: Arc<AgreementRegistry>,
    pub coverage: Arc<CoverageResolver>,
    pub health: Arc<SourceHealthMonitor>,
    pub adapters: Arc<AdapterRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub echo: Arc<EchoBroker>,
    pub booking_store: Arc<MemoryBookingStore>,
    pub bookings: Arc<BookingEngine>,
}

impl Mesh {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: CoreConfig) -> Self {
        let directory = Arc::new(MemoryCompanyDirectory::new());
        let agreement_store = Arc::new(MemoryAgreementStore::new());
        let coverage_store = Arc::new(MemoryCoverageStore::new());
        let catalog = Arc::new(StaticLocationCatalog::new(CATALOG.iter().copied()));
        let audit = Arc::new(Auditor::disabled());
        let health = Arc::new(SourceHealthMonitor::new(config.health.clone()));
        let adapters = Arc::new(AdapterRegistry::new(directory.clone()));

        let registry = Arc::new(AgreementRegistry::new(
            agreement_store.clone(),
            directory.clone(),
            Arc::new(LogNotificationSink),
            audit.clone(),
        ));
        let coverage = Arc::new(CoverageResolver::new(
            coverage_store.clone(),
            catalog,
            agreement_store.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            coverage.clone(),
            health.clone(),
            adapters.clone(),
            Arc::new(JobStore::new()),
            audit.clone(),
            config.dispatch.clone(),
        ));
        let echo = Arc::new(EchoBroker::new(
            registry.clone(),
            adapters.clone(),
            health.clone(),
            Arc::new(JobStore::new()),
            audit.clone(),
            config.echo.clone(),
        ));
        let booking_store = Arc::new(MemoryBookingStore::new(Duration::from_secs(
            config.retention.idempotency_ttl_secs,
        )));
        let bookings = Arc::new(BookingEngine::new(
            registry.clone(),
            adapters.clone(),
            booking_store.clone(),
            audit,
        ));

        Self {
            config,
            directory,
            agreement_store,
            coverage_store,
            registry,
            coverage,
            health,
            adapters,
            dispatcher,
            echo,
            booking_store,
            bookings,
        }
    }

    pub async fn seed_agent(&self) -> CompanyId {
        let id = Uuid::new_v4();
        self.directory
            .upsert(Company {
                id,
                name: format!("agent-{id}"),
                kind: CompanyKind::Agent,
                status: CompanyStatus::Active,
                adapter_kind: None,
                endpoint: None,
            })
            .await
            .expect("seed agent");
        id
    }

    /// Seed an ACTIVE Source with the given adapter registered for it.
    pub async fn seed_source(&self, adapter: MockSourceAdapter) -> CompanyId {
        let id = Uuid::new_v4();
        self.directory
            .upsert(Company {
                id,
                name: format!("source-{id}"),
                kind: CompanyKind::Source,
                status: CompanyStatus::Active,
                adapter_kind: Some(rmx_schemas::AdapterKind::Mock),
                endpoint: None,
            })
            .await
            .expect("seed source");
        self.adapters.register(id, Arc::new(adapter));
        id
    }

    /// Walk a fresh draft through DRAFT → OFFERED → ACCEPTED → ACTIVE.
    pub async fn seed_active_agreement(
        &self,
        agent: CompanyId,
        source: CompanyId,
        agreement_ref: &str,
    ) -> AgreementId {
        let draft = self
            .registry
            .create_draft(agent, source, agreement_ref.to_string(), None, None)
            .await
            .expect("create draft");
        self.registry.offer(draft.id).await.expect("offer");
        self.registry.accept(draft.id).await.expect("accept");
        self.registry
            .set_status(draft.id, AgreementStatus::Active)
            .await
            .expect("activate");
        draft.id
    }

    pub async fn set_base_coverage(&self, source: CompanyId, codes: &[&str]) {
        use rmx_coverage::CoverageStore;
        self.coverage_store
            .replace_base(source, codes.iter().map(|c| c.to_string()).collect())
            .await
            .expect("set base coverage");
    }

    /// Poll the availability job to completion, asserting the cursor laws on
    /// the way: `last_seq` never decreases and no item is delivered twice.
    pub async fn drain_availability(&self, job_id: JobId) -> (Vec<JobItem>, JobRecord) {
        let jobs = self.dispatcher.jobs();
        let mut since_seq = 0u64;
        let mut collected: Vec<JobItem> = Vec::new();

        loop {
            let poll = jobs
                .get_since(job_id, since_seq, Duration::from_millis(400))
                .await
                .expect("poll");
            assert!(
                poll.last_seq >= since_seq,
                "last_seq must never decrease: {} < {}",
                poll.last_seq,
                since_seq
            );
            for item in &poll.new_items {
                assert!(
                    item.seq > since_seq,
                    "item {} already observed at cursor {}",
                    item.seq,
                    since_seq
                );
            }
            since_seq = poll.last_seq;
            collected.extend(poll.new_items);
            if poll.status == JobStatus::Complete {
                break;
            }
        }
        (collected, jobs.get_job(job_id).expect("job record"))
    }
}

impl Default for Mesh {
    fn default() -> Self {
        Self::new()
    }
}

/// The criteria every scenario uses unless it cares about the route.
pub fn criteria(pickup: &str, dropoff: &str) -> AvailabilityCriteria {
    AvailabilityCriteria {
        pickup_unlocode: pickup.to_string(),
        dropoff_unlocode: dropoff.to_string(),
        pickup_iso: "2026-09-01T10:00:00Z".to_string(),
        dropoff_iso: "2026-09-05T10:00:00Z".to_string(),
        driver_age: 30,
        ..Default::default()
    }
}

pub fn offer(supplier_offer_ref: &str) -> Offer {
    Offer {
        supplier_offer_ref: supplier_offer_ref.to_string(),
        agreement_ref: String::new(),
        vehicle_class: "compact".to_string(),
        price: "120.00".to_string(),
        currency: "EUR".to_string(),
    }
}
