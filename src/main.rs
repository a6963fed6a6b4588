// src/main.rs

use keypool_proxy::cli::{Cli, Commands};
use keypool_proxy::{run, AppError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{watch, Notify};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!(signal = "Ctrl+C", "Received signal. Initiating graceful shutdown...") },
        () = terminate => { info!(signal = "Terminate", "Received signal. Initiating graceful shutdown...") },
    }
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json_layer = fmt::layer().json().with_current_span(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();

    let cli = Cli::parse_args();
    match cli.command {
        Some(Commands::MigrateKeys { from, to }) => {
            let dsn = std::env::var("DATABASE_DSN")
                .unwrap_or_else(|_| "sqlite://data/keypool.db?mode=rwc".to_string());
            let migrated = keypool_proxy::migrate::run_migrate_keys(&dsn, from, to)
                .await
                .map_err(|e| {
                    error!(error = %e, "key migration failed");
                    e
                })?;
            info!(migrated, "migrate-keys completed");
            Ok(())
        }
        Some(Commands::Serve) | None => serve().await,
    }
}

async fn serve() -> Result<(), AppError> {
    let (app, state) = run().await.map_err(|e| {
        eprintln!("Application setup error: {e:?}");
        e
    })?;

    // Background workers run only on the primary instance; slaves serve
    // traffic against the shared store.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut scheduler = None;
    if state.config.is_slave {
        info!("IS_SLAVE set, background schedulers disabled");
    } else {
        state.pool.start_maintenance();
        scheduler = Some(state.validator.start_scheduler(shutdown_rx));
    }

    let addr: SocketAddr = format!("{}:{}", state.config.host, state.config.port)
        .parse()
        .map_err(|e| AppError::Config {
            message: format!("invalid HOST/PORT combination: {e}"),
        })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!(server.address = %addr, error = ?e, "Failed to bind to address. Exiting.");
        AppError::from(e)
    })?;
    info!(server.address = %addr, "Server listening");

    // In-flight requests get a bounded drain window once the signal arrives.
    let drain_timeout =
        std::time::Duration::from_secs(state.settings.current().graceful_shutdown_timeout_s);
    let stop = Arc::new(Notify::new());
    let stop_rx = stop.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move { stop_rx.notified().await })
            .await
    });

    shutdown_signal().await;
    stop.notify_one();
    match tokio::time::timeout(drain_timeout, server).await {
        Ok(joined) => {
            joined
                .map_err(|e| AppError::internal(format!("server task panicked: {e}")))?
                .map_err(|e| {
                    error!(error = ?e, "Server run loop encountered an error. Exiting.");
                    AppError::from(e)
                })?;
        }
        Err(_) => {
            warn!(
                timeout_s = drain_timeout.as_secs(),
                "graceful drain timed out, aborting in-flight requests"
            );
        }
    }

    // Shutdown order: stop the validator, then the pool tickers and the
    // request-log writer, then close the store and database.
    let _ = shutdown_tx.send(true);
    if let Some(handle) = scheduler {
        handle.abort();
        let _ = handle.await;
    }
    state.shutdown().await;

    info!("Server shut down gracefully.");
    Ok(())
}
