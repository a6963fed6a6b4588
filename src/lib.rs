// src/lib.rs

pub mod admin;
pub mod channel;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod handler;
pub mod key_service;
pub mod keypool;
pub mod migrate;
pub mod models;
pub mod proxy;
pub mod request_log;
pub mod state;
pub mod store;
pub mod tasks;

use axum::{
    body::Body,
    http::Request as AxumRequest,
    middleware::{self, Next},
    response::Response as AxumResponse,
    routing::{any, get},
    Router,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, span, Instrument, Level};
use uuid::Uuid;

pub use config::AppConfig;
pub use error::{AppError, Result};
pub use state::AppState;

/// Creates the main Axum router for the application.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handler::health_check))
        .merge(admin::admin_routes(state.clone()))
        .route("/proxy/:group/*rest", any(handler::proxy_handler))
        .layer(middleware::from_fn(trace_requests))
        .with_state(state)
}

/// Middleware to add a request id and trace request timing.
async fn trace_requests(req: AxumRequest<Body>, next: Next) -> AxumResponse {
    let request_id = Uuid::new_v4();
    let start_time = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let span = span!(
        Level::INFO,
        "request",
        request_id = %request_id,
        http.method = %method,
        url.path = %path,
    );

    let response = next.run(req).instrument(span).await;

    info!(
        request_id = %request_id,
        http.method = %method,
        url.path = %path,
        http.status_code = response.status().as_u16(),
        http.response.duration = ?start_time.elapsed(),
        "Finished processing request"
    );
    response
}

/// Loads configuration from the environment, wires the application state, and
/// returns the router alongside the state handle.
///
/// # Errors
///
/// Returns an error when configuration is invalid or any component of the
/// state graph (database, store, settings) fails to initialize.
pub async fn run() -> Result<(Router, Arc<AppState>)> {
    let config = AppConfig::from_env()?;
    info!(?config, "Starting key pool proxy");

    let state = Arc::new(AppState::new(config).await?);
    let app = create_router(state.clone());
    Ok((app, state))
}
