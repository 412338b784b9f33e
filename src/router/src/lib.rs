use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{Router, http::StatusCode, middleware, response::IntoResponse, routing::get};
use common::config::Configuration;
use compactor::{MaintenanceOrchestrator, Registry};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

pub mod auth;
pub mod endpoints;

/// Shared state of the admin surface
#[derive(Clone, Debug)]
pub struct AdminState {
    orchestrator: MaintenanceOrchestrator,
    registry: Arc<Registry>,
    admin_key: Option<Arc<str>>,
    default_id_column: String,
    run_timeout: Duration,
    /// Held for the duration of a run so two requests never compact concurrently
    run_lock: Arc<Mutex<()>>,
}

impl AdminState {
    pub fn new(orchestrator: MaintenanceOrchestrator, config: &Configuration) -> Self {
        Self {
            orchestrator,
            registry: Arc::new(Registry::from_config(&config.maintenance.tables)),
            admin_key: config.admin.admin_key.as_deref().map(Arc::from),
            default_id_column: config.maintenance.id_column.clone(),
            run_timeout: config.admin.run_timeout,
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn orchestrator(&self) -> &MaintenanceOrchestrator {
        &self.orchestrator
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn default_id_column(&self) -> &str {
        &self.default_id_column
    }

    pub fn run_timeout(&self) -> Duration {
        self.run_timeout
    }

    pub fn run_lock(&self) -> &Mutex<()> {
        &self.run_lock
    }
}

/// Create a new router instance with all routes configured
pub fn create_router(state: AdminState) -> Router {
    let admin_key = state.admin_key.clone();
    let auth_layer = middleware::from_fn(move |req, next| {
        auth::admin_auth_middleware(admin_key.clone(), req, next)
    });

    Router::new()
        // Public health check endpoint (no authentication)
        .route("/health", get(health_check))
        // Maintenance runs require the admin key
        .nest(
            "/api/v1/admin/maintenance",
            endpoints::maintenance::router().layer(auth_layer),
        )
        .with_state(state)
}

/// Serve the admin surface on `addr` until `shutdown` resolves
pub async fn run_admin_server(
    addr: SocketAddr,
    state: AdminState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind admin server to {addr}"))?;
    log::info!("Admin API listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Admin server error")?;

    log::info!("Admin API stopped");
    Ok(())
}

/// Basic health check endpoint
async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}
