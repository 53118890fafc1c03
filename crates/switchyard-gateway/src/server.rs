use crate::connection::{Connection, ConnectionManager, ConnectionState};
use crate::middleware::{auth_middleware, authenticator_from_config, AllowAll, Authenticator};
use crate::router::MessageRouter;
use crate::supervisor::spawn_supervisor;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    middleware as axum_mw,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::BrokerConfig;
use switchyard_orchestrator::{BrokerStats, ControlPlane, NoopRecorder, TaskRecorder};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Shared application state.
pub struct AppState {
    /// Message routing over the control plane.
    pub router: Arc<MessageRouter>,
    /// Live connections.
    pub connections: Arc<ConnectionManager>,
}

/// The broker: control plane, connections, and HTTP surface.
pub struct BrokerServer {
    router: Arc<MessageRouter>,
    authenticator: Arc<dyn Authenticator>,
    supervisor_interval: Duration,
}

impl BrokerServer {
    /// Build a broker from configuration with no persistence.
    pub fn build(config: &BrokerConfig) -> Self {
        Self::with_recorder(config, Arc::new(NoopRecorder))
    }

    /// Build a broker that hands terminal tasks to `recorder`.
    pub fn with_recorder(config: &BrokerConfig, recorder: Arc<dyn TaskRecorder>) -> Self {
        let plane = Arc::new(ControlPlane::new(config));
        let connections = ConnectionManager::new();
        let router = Arc::new(MessageRouter::new(plane, connections, recorder));
        Self {
            router,
            authenticator: authenticator_from_config(&config.auth),
            supervisor_interval: config.supervisor_interval(),
        }
    }

    /// Replace the authentication collaborator.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Admit every connection.
    pub fn without_auth(self) -> Self {
        self.with_authenticator(Arc::new(AllowAll))
    }

    /// The control plane behind this broker.
    pub fn plane(&self) -> &Arc<ControlPlane> {
        self.router.plane()
    }

    /// The message router.
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// The axum application: `/ws` and `/stats` behind authentication,
    /// `/health` open.
    pub fn app(&self) -> Router {
        let state = Arc::new(AppState {
            router: self.router.clone(),
            connections: self.router.connections().clone(),
        });

        let guarded = Router::new()
            .route("/ws", get(ws_handler))
            .route("/stats", get(stats_handler))
            .route_layer(axum_mw::from_fn_with_state(
                self.authenticator.clone(),
                auth_middleware,
            ));

        Router::new()
            .route("/health", get(health_handler))
            .merge(guarded)
            .with_state(state)
    }

    /// Start the periodic supervisor.
    pub fn spawn_supervisor(&self) -> tokio::task::JoinHandle<()> {
        spawn_supervisor(self.router.clone(), self.supervisor_interval)
    }

    /// Cancel every in-flight task and notify peers.
    pub async fn shutdown(&self) {
        self.router.shutdown().await;
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok", "service": "switchyard"}))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<BrokerStats> {
    Json(state.router.plane().stats())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = Uuid::new_v4();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Outbound frames from the router are funneled through this channel.
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state
        .connections
        .add(Connection::new(connection_id, tx))
        .await;
    info!(connection_id = %connection_id, "WebSocket connected");

    use futures_util::SinkExt;
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(Message::Text(frame.into())).await.is_err() {
                return;
            }
        }
        // The manager dropped this connection.
        let _ = ws_sender.close().await;
    });

    use futures_util::StreamExt;
    let router = state.router.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => router.handle_frame(connection_id, text.as_bytes()).await,
                Message::Binary(bytes) => router.handle_frame(connection_id, &bytes).await,
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Whichever side ends first closes the connection.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => {},
    }

    state
        .connections
        .set_state(connection_id, ConnectionState::Closing)
        .await;
    debug!(connection_id = %connection_id, "WebSocket closing");
    state.router.connection_closed(connection_id).await;
    info!(connection_id = %connection_id, "WebSocket disconnected");
}
