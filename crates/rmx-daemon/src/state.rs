//! Shared runtime state for rmx-daemon.
//!
//! `AppState::in_memory` wires every engine against the in-memory stores;
//! `AppState::with_postgres` swaps the durable stores for their Postgres
//! repositories over one pool. Handlers receive `State<Arc<AppState>>` from
//! Axum; this module owns nothing async itself.

use std::sync::Arc;
use std::time::Duration;

use rmx_adapters::AdapterRegistry;
use rmx_agreements::{
    AgreementRegistry, AgreementStore, CompanyDirectory, LogNotificationSink,
    MemoryAgreementStore, MemoryCompanyDirectory,
};
use rmx_audit::Auditor;
use rmx_booking::{BookingEngine, BookingStore, MemoryBookingStore};
use rmx_config::CoreConfig;
use rmx_coverage::{
    CoverageResolver, CoverageStore, LocationCatalog, MemoryCoverageStore, StaticLocationCatalog,
};
use rmx_db::{PgAgreementStore, PgBookingStore, PgCompanyDirectory, PgCoverageStore, PgLocationCatalog};
use rmx_dispatch::{Dispatcher, EchoBroker};
use rmx_health::SourceHealthMonitor;
use rmx_jobstore::JobStore;
use serde::Serialize;
use sqlx::PgPool;
use tracing::info;

/// Static build metadata included in the health response.
#[derive(Clone, Debug, Serialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// The durable store bundle behind the engines.
pub struct Stores {
    pub companies: Arc<dyn CompanyDirectory>,
    pub agreements: Arc<dyn AgreementStore>,
    pub coverage: Arc<dyn CoverageStore>,
    pub catalog: Arc<dyn LocationCatalog>,
    pub bookings: Arc<dyn BookingStore>,
}

impl Stores {
    pub fn in_memory(cfg: &CoreConfig) -> Self {
        Self {
            companies: Arc::new(MemoryCompanyDirectory::new()),
            agreements: Arc::new(MemoryAgreementStore::new()),
            coverage: Arc::new(MemoryCoverageStore::new()),
            catalog: Arc::new(StaticLocationCatalog::new(cfg.catalog.seed.clone())),
            bookings: Arc::new(MemoryBookingStore::new(Duration::from_secs(
                cfg.retention.idempotency_ttl_secs,
            ))),
        }
    }

    pub fn postgres(cfg: &CoreConfig, pool: PgPool) -> Self {
        Self {
            companies: Arc::new(PgCompanyDirectory::new(pool.clone())),
            agreements: Arc::new(PgAgreementStore::new(pool.clone())),
            coverage: Arc::new(PgCoverageStore::new(pool.clone())),
            catalog: Arc::new(PgLocationCatalog::new(pool.clone())),
            bookings: Arc::new(PgBookingStore::new(
                pool,
                Duration::from_secs(cfg.retention.idempotency_ttl_secs),
            )),
        }
    }
}

/// Cloneable (Arc) handle shared across all Axum handlers.
pub struct AppState {
    pub build: BuildInfo,
    pub config: CoreConfig,
    pub stores: Stores,
    pub registry: Arc<AgreementRegistry>,
    pub coverage: Arc<CoverageResolver>,
    pub health: Arc<SourceHealthMonitor>,
    pub adapters: Arc<AdapterRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub echo: Arc<EchoBroker>,
    pub bookings: Arc<BookingEngine>,
    /// Retained for optional archival by the sweeper.
    pub pool: Option<PgPool>,
}

impl AppState {
    pub fn in_memory(config: CoreConfig, audit: Arc<Auditor>) -> Self {
        let stores = Stores::in_memory(&config);
        Self::wire(config, stores, audit, None)
    }

    pub fn with_postgres(config: CoreConfig, pool: PgPool, audit: Arc<Auditor>) -> Self {
        let stores = Stores::postgres(&config, pool.clone());
        Self::wire(config, stores, audit, Some(pool))
    }

    fn wire(config: CoreConfig, stores: Stores, audit: Arc<Auditor>, pool: Option<PgPool>) -> Self {
        let registry = Arc::new(AgreementRegistry::new(
            stores.agreements.clone(),
            stores.companies.clone(),
            Arc::new(LogNotificationSink),
            audit.clone(),
        ));
        let coverage = Arc::new(CoverageResolver::new(
            stores.coverage.clone(),
            stores.catalog.clone(),
            stores.agreements.clone(),
        ));
        let health = Arc::new(SourceHealthMonitor::new(config.health.clone()));
        let adapters = Arc::new(AdapterRegistry::new(stores.companies.clone()));

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
        let bookings = Arc::new(BookingEngine::new(
            registry.clone(),
            adapters.clone(),
            stores.bookings.clone(),
            audit,
        ));

        Self {
            build: BuildInfo {
                service: "rmx-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            config,
            stores,
            registry,
            coverage,
            health,
            adapters,
            dispatcher,
            echo,
            bookings,
            pool,
        }
    }
}

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs()
}

/// Emit one heartbeat log line per `interval`, forever.
pub fn spawn_heartbeat(interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            tracing::debug!(uptime_secs = uptime_secs(), "heartbeat");
        }
    });
}

/// Periodically evict expired jobs from both fan-in buffers. When a pool is
/// configured, completed jobs are archived before eviction and the health
/// monitor's per-Source rows are written through, so the `source_health`
/// table tracks the live verdicts.
pub fn spawn_job_sweeper(state: Arc<AppState>, interval: Duration) {
    tokio::spawn(async move {
        let ttl = Duration::from_secs(state.config.retention.job_ttl_secs);
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Some(pool) = &state.pool {
                archive_completed(pool, state.dispatcher.jobs(), false).await;
                archive_completed(pool, state.echo.jobs(), true).await;
                persist_source_health(pool, &state).await;
            }
            let evicted =
                state.dispatcher.jobs().sweep_expired(ttl) + state.echo.jobs().sweep_expired(ttl);
            if evicted > 0 {
                info!(evicted, "expired jobs evicted");
            }
        }
    });
}

async fn persist_source_health(pool: &PgPool, state: &AppState) {
    for snap in state.health.snapshots() {
        if let Err(err) = rmx_db::upsert_source_health(pool, &snap).await {
            tracing::warn!(source_id = %snap.source_id, error = %err, "source health persist failed");
        }
    }
}

async fn archive_completed(pool: &PgPool, jobs: &JobStore, echo: bool) {
    for record in jobs.completed_jobs() {
        let items = match jobs.all_items(record.id) {
            Ok(items) => items,
            Err(_) => continue,
        };
        let result = if echo {
            rmx_db::archive_echo_job(pool, &record, &items).await
        } else {
            rmx_db::archive_availability_job(pool, &record, &items).await
        };
        if let Err(err) = result {
            tracing::warn!(job_id = %record.id, error = %err, "job archive failed");
        }
    }
}
