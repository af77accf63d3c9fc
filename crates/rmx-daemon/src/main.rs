//! rmx-daemon entry point.
//!
//! This file is intentionally thin: it sets up tracing, loads configuration,
//! builds the shared state (Postgres-backed when RMX_DATABASE_URL is set,
//! in-memory otherwise), wires middleware, and starts the HTTP server. All
//! route handlers live in `routes.rs`; all shared state in `state.rs`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use rmx_audit::{AuditWriter, Auditor};
use rmx_config::CoreConfig;
use rmx_daemon::{routes, state};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let config = load_config()?;
    let audit = Arc::new(build_auditor()?);

    let shared = match std::env::var(rmx_db::ENV_DB_URL) {
        Ok(_) => {
            let pool = rmx_db::connect_from_env().await?;
            rmx_db::migrate(&pool).await?;
            info!("postgres stores active");
            Arc::new(state::AppState::with_postgres(config, pool, audit))
        }
        Err(_) => {
            info!("no RMX_DATABASE_URL; in-memory stores active");
            Arc::new(state::AppState::in_memory(config, audit))
        }
    };

    state::spawn_heartbeat(Duration::from_secs(1));
    state::spawn_job_sweeper(Arc::clone(&shared), Duration::from_secs(60));

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8910)));
    info!("rmx-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("RMX_LOG").unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn load_config() -> anyhow::Result<CoreConfig> {
    match std::env::var("RMX_CONFIG") {
        Ok(paths) => {
            let paths: Vec<&str> = paths.split(',').map(str::trim).collect();
            let loaded = rmx_config::load_layered_yaml(&paths)?;
            info!(config_hash = %loaded.config_hash, "configuration loaded");
            Ok(loaded.core)
        }
        Err(_) => Ok(CoreConfig::default()),
    }
}

fn build_auditor() -> anyhow::Result<Auditor> {
    match std::env::var("RMX_AUDIT_LOG") {
        Ok(path) => {
            let writer = AuditWriter::new(path, true)?;
            Ok(Auditor::new(writer))
        }
        Err(_) => Ok(Auditor::disabled()),
    }
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("RMX_DAEMON_ADDR").ok()?.parse().ok()
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(tower_http::cors::Any)
}
