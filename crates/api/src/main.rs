//! Courier realtime server

use std::sync::Arc;

use anyhow::Context;
use courier_api::{
    config::Config,
    realtime::{Bridge, Broker, Hub, RedisBroker},
    routes::create_router,
    telemetry, AppState,
};
use courier_shared::{create_pool, run_migrations};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Missing .env is fine in production
    let _ = dotenvy::dotenv();

    let config = Config::from_env().context("Failed to load configuration")?;
    telemetry::init(config.log_format);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Courier realtime server starting");

    let pool = create_pool(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to database")?;
    run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;

    let shutdown = CancellationToken::new();
    let hub = Hub::new();

    let (bridge, bridge_task) = match &config.redis_url {
        Some(redis_url) => {
            let broker: Arc<dyn Broker> =
                Arc::new(RedisBroker::open(redis_url).context("Invalid REDIS_URL")?);
            let bridge = Bridge::new(broker, hub.clone(), config.bridge_settings());
            let task = bridge.spawn(shutdown.child_token());
            tracing::info!(instance_id = %bridge.instance_id(), "Cross-instance bridge enabled");
            (Some(bridge), Some(task))
        }
        None => {
            tracing::warn!("REDIS_URL not set, running without cross-instance delivery");
            (None, None)
        }
    };

    let bind_address = config.bind_address.clone();
    let shutdown_grace = config.shutdown_grace;
    let state = AppState::new(config, pool, hub.clone(), bridge);
    let app = create_router(state);

    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", bind_address))?;
    tracing::info!(address = %bind_address, "Listening");

    let signal = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        signal.cancel();
    });

    let server_shutdown = shutdown.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await });

    // Upgraded sockets are not tracked by axum; close them alongside the server
    let (served, ()) = tokio::join!(server, async {
        shutdown.cancelled().await;
        hub.shutdown(shutdown_grace).await;
    });
    served.context("Server error")?;

    if let Some(task) = bridge_task {
        if let Err(e) = task.await {
            tracing::warn!(error = ?e, "Bridge task ended abnormally");
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = ?e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = ?e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
