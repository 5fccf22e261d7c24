use std::sync::Arc;
use std::time::Duration;

use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use microproto_engine::EngineHandle;
use microproto_telemetry::MetricsRecorder;

use crate::client::{self, ClientRegistry};
use crate::connection::{self, ConnectionLimits};

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// WebSocket route.
    pub path: String,
    /// Per-connection broadcast queue; a session that fills it is dropped.
    pub max_send_queue: usize,
    pub control_queue: usize,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// Transport cap. Frames above the negotiated packet size but below this
    /// reach the session and get `BUFFER_OVERFLOW`; larger ones end the socket.
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            path: "/".into(),
            max_send_queue: 256,
            control_queue: 16,
            idle_timeout_secs: 60,
            sweep_interval_secs: 10,
            max_message_size: 64 * 1024,
        }
    }
}

impl ServerConfig {
    fn limits(&self) -> ConnectionLimits {
        ConnectionLimits {
            max_send_queue: self.max_send_queue,
            control_queue: self.control_queue,
            max_message_size: self.max_message_size,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    pub client_registry: Arc<ClientRegistry>,
    pub metrics: Option<Arc<MetricsRecorder>>,
    pub limits: ConnectionLimits,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, ws_path: &str) -> Router {
    Router::new()
        .route(ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Bind and start serving. The returned handle keeps the background tasks alive.
pub async fn start(
    config: ServerConfig,
    engine: EngineHandle,
    metrics: Option<Arc<MetricsRecorder>>,
) -> Result<ServerHandle, std::io::Error> {
    let client_registry = Arc::new(ClientRegistry::new());

    let cleanup = client::start_cleanup_task(
        Arc::clone(&client_registry),
        Duration::from_secs(config.idle_timeout_secs.max(1)),
        Duration::from_secs(config.sweep_interval_secs.max(1)),
    );

    let state = AppState {
        engine,
        client_registry: Arc::clone(&client_registry),
        metrics,
        limits: config.limits(),
    };
    let router = build_router(state, &config.path);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, path = %config.path, "MicroProto server started");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "server stopped");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        client_registry,
        server,
        cleanup,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    pub client_registry: Arc<ClientRegistry>,
    server: tokio::task::JoinHandle<()>,
    cleanup: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        self.server.abort();
        self.cleanup.abort();
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(state.limits.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: axum::extract::ws::WebSocket, state: AppState) {
    let client = state.client_registry.register();
    tracing::info!(client_id = %client.id, "WebSocket client connected");

    connection::handle_ws_connection(
        socket,
        client,
        state.client_registry,
        state.engine,
        state.limits,
    )
    .await;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    /// Open WebSocket connections.
    pub clients: usize,
    /// Connections past HELLO, as seen by the server.
    pub established: usize,
    /// Sessions in the engine's broadcast set.
    pub sessions: usize,
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.engine.session_count().await {
        Ok(sessions) => (
            axum::http::StatusCode::OK,
            Json(HealthStatus {
                status: "healthy".into(),
                clients: state.client_registry.count(),
                established: state.client_registry.established_count(),
                sessions,
            }),
        ),
        Err(_) => (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthStatus {
                status: "engine_stopped".into(),
                clients: state.client_registry.count(),
                established: state.client_registry.established_count(),
                sessions: 0,
            }),
        ),
    }
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(m) => (axum::http::StatusCode::OK, Json(serde_json::json!(m.snapshot()))),
        None => (
            axum::http::StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "metrics disabled" })),
        ),
    }
}
