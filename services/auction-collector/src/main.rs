//! Companion Auction Collector
//!
//! Single-binary service that:
//! 1. Restores the persisted credential pool and mints up to its minimum size
//! 2. Polls each configured auction search stream on its own cadence
//! 3. Appends normalized auctions to a JSON-lines file
//! 4. Serves `/health` and `/metrics` on the admin listener

mod config;
mod metrics;
mod sink;
mod streams;
mod transport;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use companion_auth::{BundleStore, CapturedAuthPool, PersonaContext, WalSessionMinter};
use companion_pool::{CredentialPool, spawn_maintenance_task};
use companion_poll::PollingOrchestrator;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::Config;
use crate::sink::JsonlWriter;
use crate::transport::ReqwestTransport;

/// How long streams, maintenance and the admin listener get to stop after a
/// shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state for the admin handlers
#[derive(Clone)]
struct AppState {
    pool: Arc<CredentialPool>,
    prometheus: PrometheusHandle,
    started_at: Instant,
    streams_configured: usize,
    streams_active: Arc<AtomicUsize>,
}

/// Build the admin router. `max_connections` caps concurrent admin requests.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs, filtered by LOG_LEVEL or RUST_LOG
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting auction-collector");

    // Must precede any metric emission
    let prometheus_handle = metrics::install_recorder();

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        admin_addr = %config.admin.listen_addr,
        streams = config.streams.len(),
        min_pool_size = config.pool.min_pool_size,
        output = %config.output.path.display(),
        "configuration loaded"
    );

    let access_token = config.persona.access_token.clone().with_context(|| {
        format!(
            "no persona access token: set {} or persona.access_token_file",
            config::ACCESS_TOKEN_ENV
        )
    })?;

    let streams = streams::load_streams(&config).await?;

    let materials = CapturedAuthPool::load(&config.pool.captured_auth_path)
        .await
        .with_context(|| {
            format!(
                "failed to load captured auth from {}",
                config.pool.captured_auth_path.display()
            )
        })?;
    info!(entries = materials.len(), "captured auth material loaded");

    let client = reqwest::Client::new();
    let minter = WalSessionMinter::new(client.clone(), Arc::new(materials))
        .with_endpoint(config.persona.login_endpoint.clone())
        .with_product_name(config.persona.product_name.clone())
        .with_blaze_id(config.persona.blaze_id.clone())
        .with_ticket_lifetime(Duration::from_secs(config.persona.ticket_lifetime_secs));

    let persona = PersonaContext {
        access_token,
        persona_id: config.persona.persona_id,
        cookie: config.persona.cookie.clone(),
    };

    let pool = Arc::new(
        CredentialPool::open(
            config.pool_settings(),
            Arc::new(minter),
            persona,
            BundleStore::new(&config.pool.state_path),
        )
        .await
        .with_context(|| {
            format!(
                "failed to open pool state {}",
                config.pool.state_path.display()
            )
        })?,
    );

    let healthy = streams::warm_up(&pool).await;
    if healthy == 0 {
        warn!("no usable credentials after warm-up, streams will back off until repair succeeds");
    }

    let cancel = CancellationToken::new();
    let maintenance = spawn_maintenance_task(
        Arc::clone(&pool),
        Duration::from_secs(config.pool.maintenance_interval_secs),
        cancel.clone(),
    );

    let orchestrator = Arc::new(PollingOrchestrator::new(
        Arc::clone(&pool),
        Arc::new(ReqwestTransport::new(client)),
        config.orchestrator_settings(),
    ));
    let streams_configured = streams.len();
    let streams_active = Arc::new(AtomicUsize::new(0));
    let mut stream_set = streams::spawn_streams(
        orchestrator,
        streams,
        Arc::new(JsonlWriter::new(&config.output.path)),
        config.poller.max_consecutive_failures,
        cancel.clone(),
        Arc::clone(&streams_active),
    );

    let app = build_router(
        AppState {
            pool: Arc::clone(&pool),
            prometheus: prometheus_handle,
            started_at: Instant::now(),
            streams_configured,
            streams_active: Arc::clone(&streams_active),
        },
        config.admin.max_connections,
    );

    let listen_addr = config.admin.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, streams = streams_configured, "collector running");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    // Streams report as they stop; shutdown begins on a signal or once every
    // stream has stopped on its own.
    let all_streams_stopped = tokio::select! {
        _ = shutdown_signal() => false,
        _ = async {
            while let Some(joined) = stream_set.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "stream task panicked");
                }
            }
        } => true,
    };
    if all_streams_stopped {
        error!("every polling stream has stopped, shutting down");
    }

    cancel.cancel();
    let _ = shutdown_tx.send(());

    // The drain timer starts at signal receipt
    let drain = async {
        while let Some(joined) = stream_set.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "stream task panicked");
            }
        }
        if let Err(e) = maintenance.await {
            error!(error = %e, "maintenance task panicked");
        }
        match server_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "admin server error during shutdown"),
            Err(e) => error!(error = %e, "admin server task panicked"),
        }
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
        Ok(()) => info!("all tasks drained"),
        Err(_) => warn!(
            remaining_streams = streams_active.load(Ordering::SeqCst),
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    info!("shutdown complete");
    if all_streams_stopped {
        anyhow::bail!("all polling streams stopped");
    }
    Ok(())
}

/// Pool health plus stream liveness. 200 while at least one bundle is
/// usable, 503 otherwise.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = state.pool.health().await;
    let usable = body["bundles_usable"].as_u64().unwrap_or(0);

    body["uptime_seconds"] = state.started_at.elapsed().as_secs().into();
    body["streams_configured"] = state.streams_configured.into();
    body["streams_active"] = state.streams_active.load(Ordering::SeqCst).into();

    let status_code = if usable > 0 {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus text exposition.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
