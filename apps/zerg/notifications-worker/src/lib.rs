//! Notifications Worker Service
//!
//! Runs the delivery engine with its sweeps and exposes the admin surface.
//!
//! ## Architecture
//!
//! ```text
//! PostgreSQL (notifications) or in-memory store
//!   ↓
//! DeliveryEngine ── providers (SendGrid, Twilio, FCM, webhook, in-app)
//!   ↑        ↓
//! Sweeper    Redis Stream (notifications:events) or log
//!
//! Admin server: /health, /metrics, /admin/*
//! ```
//!
//! ## Shutdown
//!
//! SIGINT/SIGTERM stops the sweeper, the limiter eviction tasks and the admin
//! server, then waits for running delivery attempts.

use core_config::database::DatabaseConfig;
use core_config::redis::RedisConfig;
use core_config::server::ServerConfig;
use core_config::{Environment, FromEnv};
use domain_notifications::providers::{InAppHub, ProviderSet};
use domain_notifications::{
    AdminState, DeliveryConfig, DeliveryEngine, EventPublisher, InMemoryNotificationRepository,
    LoggingPublisher, NotificationRepository, PgNotificationRepository, RedisStreamPublisher,
    SweepConfig, Sweeper, admin_router,
};
use eyre::{Result, WrapErr};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, Database};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

const IN_APP_HUB_CAPACITY: usize = 1024;

/// Postgres when `DATABASE_URL` is set, otherwise an in-process store.
pub async fn connect_store(
    config: Option<DatabaseConfig>,
) -> Result<Arc<dyn NotificationRepository>> {
    let Some(config) = config else {
        warn!("DATABASE_URL not set, notifications are kept in memory only");
        return Ok(Arc::new(InMemoryNotificationRepository::new()));
    };

    info!("Connecting to PostgreSQL...");
    let mut options = ConnectOptions::new(config.url.clone());
    options.max_connections(config.max_connections);
    let db = Database::connect(options)
        .await
        .wrap_err("Failed to connect to PostgreSQL")?;
    info!("Connected to PostgreSQL successfully");

    info!("Running notifications migrations...");
    Migrator::up(&db, None)
        .await
        .wrap_err("Failed to run migrations")?;

    Ok(Arc::new(PgNotificationRepository::new(db)))
}

/// Redis stream publisher when `REDIS_URL` is set, otherwise log-only.
pub async fn connect_publisher(config: Option<RedisConfig>) -> Result<Arc<dyn EventPublisher>> {
    match config {
        Some(config) => {
            info!(stream = %config.stream_name, "Connecting to Redis...");
            let publisher = RedisStreamPublisher::connect(&config)
                .await
                .wrap_err("Failed to connect to Redis")?;
            info!("Connected to Redis successfully");
            Ok(Arc::new(publisher))
        }
        None => {
            warn!("REDIS_URL not set, lifecycle events are only logged");
            Ok(Arc::new(LoggingPublisher))
        }
    }
}

/// Start the admin HTTP server
///
/// Provides endpoints for:
/// - Liveness probe: `/health`
/// - Prometheus metrics: `/metrics`
/// - Breakers, limiters, stats and manual sweeps: `/admin/*`
async fn start_admin_server(
    state: AdminState,
    server: ServerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = server.socket_addr().wrap_err("Invalid admin server address")?;
    let listener = TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("Failed to bind admin server to {}", addr))?;

    info!(address = %addr, "Admin server listening");

    axum::serve(listener, admin_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .wrap_err("Admin server failed")?;

    Ok(())
}

/// Run the notifications worker
///
/// # Errors
///
/// Returns an error if configuration is invalid, the database or Redis
/// connection fails, or the admin server cannot bind.
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);
    resilience::metrics::init_metrics().wrap_err("Failed to install metrics recorder")?;

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting notifications worker"
    );

    let delivery = DeliveryConfig::from_env().wrap_err("Failed to load delivery configuration")?;
    let sweeps = SweepConfig::from_env().wrap_err("Failed to load sweep configuration")?;
    let server = ServerConfig::from_env().wrap_err("Failed to load server configuration")?;
    info!(
        max_retries = delivery.max_retries,
        max_concurrency = delivery.max_concurrency,
        per_tenant_limits = delivery.per_tenant_limits,
        sweep_interval_secs = sweeps.interval.as_secs(),
        "Delivery configuration loaded"
    );

    let repository = connect_store(
        DatabaseConfig::from_env_optional().wrap_err("Failed to load database configuration")?,
    )
    .await?;
    let publisher = connect_publisher(
        RedisConfig::from_env_optional().wrap_err("Failed to load Redis configuration")?,
    )
    .await?;
    let providers = ProviderSet::from_env(InAppHub::new(IN_APP_HUB_CAPACITY))
        .wrap_err("Failed to configure channel providers")?;

    let engine = Arc::new(DeliveryEngine::new(repository, publisher, providers, delivery));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
        let _ = shutdown_tx.send(true);
    });

    let evictors = engine.spawn_limiter_eviction(sweeps.limiter_eviction_interval, shutdown_rx.clone());
    let admin_state = AdminState::new(engine.clone(), sweeps.pending_batch, sweeps.retry_batch);
    let admin = tokio::spawn(start_admin_server(admin_state, server, shutdown_rx.clone()));

    Sweeper::new(engine.clone(), sweeps).run(shutdown_rx).await;

    for evictor in evictors {
        if let Err(e) = evictor.await {
            warn!(error = %e, "Limiter eviction task ended abnormally");
        }
    }
    match admin.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Admin server failed"),
        Err(e) => error!(error = %e, "Admin server task panicked"),
    }

    engine.shutdown().await;
    info!("Notifications worker stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .wrap_err("Failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install SIGTERM handler")?
            .recv()
            .await;
        Ok::<(), eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
