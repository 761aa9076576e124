//! Signaling relay server: pairs one `sender` with one `receiver` per session
//! and relays their offer/answer/candidate frames over WebSockets.

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use std::{future::Future, sync::Arc, time::Instant};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

pub mod config;
pub mod registry;
pub mod relay;
pub mod session;
pub mod supervisor;
pub mod telemetry;
pub mod websocket;

pub use config::{Cli, ServerConfig};
pub use registry::{RegistrationError, SessionRegistry};
pub use session::{Departure, SessionConfig, SessionSnapshot};

pub struct AppState {
    pub registry: SessionRegistry,
    pub config: ServerConfig,
    metrics: PrometheusHandle,
    started_at: Instant,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    uptime_secs: u64,
    active_sessions: usize,
    registered_endpoints: usize,
    sessions: Vec<SessionSnapshot>,
}

impl AppState {
    pub fn new(config: ServerConfig, metrics: PrometheusHandle) -> Self {
        Self {
            registry: SessionRegistry::new(config.session.clone()),
            config,
            metrics,
            started_at: Instant::now(),
        }
    }

    async fn stats(&self) -> StatsResponse {
        let sessions = self.registry.snapshot().await;
        StatsResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            active_sessions: sessions.len(),
            registered_endpoints: self.registry.endpoint_count(),
            sessions,
        }
    }

    fn render_metrics(&self) -> String {
        self.metrics.render()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(websocket::default_session_handler))
        .route("/ws/:session_id", get(websocket::session_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves until `shutdown` resolves, then tears down every session so both
/// endpoints learn the server is going away.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().context("listener has no local address")?;
    info!(%addr, "tandem listening");

    let registry = state.registry.clone();
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("shutdown signal received; closing sessions");
            registry.shutdown().await;
        })
        .await
        .context("server shutdown with error")
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.stats().await)
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.render_metrics(),
    )
}
