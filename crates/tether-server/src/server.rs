//! `TetherServer`: Axum HTTP + WebSocket relay server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tether_auth::AuthResolver;
use tether_core::{CloseCode, Role};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::registry::SessionRegistry;
use crate::websocket::session::{self, RelayContext};

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Pairing registry.
    pub registry: Arc<SessionRegistry>,
    /// Token lookup.
    pub resolver: Arc<dyn AuthResolver>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle for `/metrics`.
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    fn relay_context(&self) -> RelayContext {
        RelayContext {
            registry: Arc::clone(&self.registry),
            resolver: Arc::clone(&self.resolver),
            ping_interval: self.config.ping_interval,
            ping_timeout: self.config.ping_timeout,
            shutdown: self.shutdown.token(),
        }
    }
}

/// The relay server.
pub struct TetherServer {
    config: Arc<ServerConfig>,
    registry: Arc<SessionRegistry>,
    resolver: Arc<dyn AuthResolver>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics_handle: Option<PrometheusHandle>,
}

impl TetherServer {
    /// Create a new server.
    pub fn new(config: ServerConfig, resolver: Arc<dyn AuthResolver>) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.max_devices_per_account));
        Self {
            config: Arc::new(config),
            registry,
            resolver,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            metrics_handle: None,
        }
    }

    /// Serve `/metrics` from this recorder handle.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            config: Arc::clone(&self.config),
            registry: Arc::clone(&self.registry),
            resolver: Arc::clone(&self.resolver),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
            metrics_handle: self.metrics_handle.clone(),
        };

        Router::new()
            .route("/tool", get(tool_handler))
            .route("/device", get(device_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the configured address and start serving.
    pub async fn listen(&self) -> std::io::Result<ServerHandle> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "relay listening");

        let router = self.router();
        let token = self.shutdown.token();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = serve.await {
                error!(error = %e, "server error");
            }
        });

        Ok(ServerHandle {
            addr,
            task,
            registry: Arc::clone(&self.registry),
            shutdown: Arc::clone(&self.shutdown),
            config: Arc::clone(&self.config),
        })
    }

    /// Get the pairing registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// A running server.
pub struct ServerHandle {
    addr: SocketAddr,
    task: JoinHandle<()>,
    registry: Arc<SessionRegistry>,
    shutdown: Arc<ShutdownCoordinator>,
    config: Arc<ServerConfig>,
}

impl ServerHandle {
    /// Bound address (useful with port `0`).
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Pairing registry of the running server.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Stop accepting, close every socket with [`CloseCode::Shutdown`], and
    /// wait for the listener to drain.
    pub async fn shutdown(self) {
        info!("relay shutting down");
        self.shutdown.shutdown();
        self.registry.close_all(CloseCode::Shutdown);
        if !self.shutdown.drain(self.task, self.config.shutdown_timeout).await {
            warn!("listener aborted before connections drained");
        }
    }
}

/// GET /tool
async fn tool_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    upgrade(ws, &state, Role::Tool)
}

/// GET /device
async fn device_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    upgrade(ws, &state, Role::Device)
}

fn upgrade(ws: WebSocketUpgrade, state: &AppState, role: Role) -> Response {
    if state.shutdown.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let ctx = state.relay_context();
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| session::run_peer_session(socket, role, ctx))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(state.start_time, &state.registry))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics_handle {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
