//! HTTP status API for operators.
//!
//! Routes:
//!   GET /api/health                → status, uptime, client count, active session
//!   GET /api/clients               → registered device connections
//!   GET /api/sessions/{id}/files   → manifest records of one session

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use flashsync_common::session::{sanitize_session_id, ManifestRecord, SessionStore};

use crate::command_server::{ClientInfo, CommandServer};

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub clients: usize,
    pub active_session: Option<String>,
}

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    commands: Arc<CommandServer>,
    store: Arc<SessionStore>,
    start_time: Instant,
}

impl AppState {
    pub fn new(commands: Arc<CommandServer>, store: Arc<SessionStore>) -> Self {
        Self {
            commands,
            store,
            start_time: Instant::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/clients", get(list_clients))
        .route("/api/sessions/{id}/files", get(session_files))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the API on `listen_addr` until `shutdown` is set.
pub async fn run(
    state: AppState,
    listen_addr: &str,
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!("Status API listening on {listen_addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !shutdown.load(Ordering::Relaxed) {
                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            }
        })
        .await?;

    Ok(())
}

/// The API running in the background.
pub struct StatusTask(JoinHandle<()>);

impl StatusTask {
    /// Spawn [`run`]; a serve error is logged, not returned.
    pub fn spawn(state: AppState, listen_addr: String, shutdown: Arc<AtomicBool>) -> Self {
        Self(tokio::spawn(async move {
            if let Err(e) = run(state, &listen_addr, shutdown).await {
                error!("Status API error: {e:#}");
            }
        }))
    }

    /// Wait for the task. `false` if it panicked or was cancelled.
    pub async fn join(self) -> bool {
        match self.0.await {
            Ok(()) => true,
            Err(e) => {
                warn!("Status API task ended abnormally: {e}");
                false
            }
        }
    }
}

// ── route handlers ───────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        clients: state.commands.client_count(),
        active_session: state.commands.active_session(),
    })
}

async fn list_clients(State(state): State<AppState>) -> Json<Vec<ClientInfo>> {
    Json(state.commands.clients())
}

async fn session_files(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ManifestRecord>>, StatusCode> {
    if sanitize_session_id(&id) != id {
        return Err(StatusCode::BAD_REQUEST);
    }
    if !state.store.session_dir(&id).is_dir() {
        return Err(StatusCode::NOT_FOUND);
    }

    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.read_manifest(&id)).await {
        Ok(Ok(records)) => Ok(Json(records)),
        Ok(Err(e)) => {
            warn!("Cannot read manifest: {e}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}
