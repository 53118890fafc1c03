use std::collections::HashMap;
use std::sync::Arc;
use switchyard_orchestrator::ConnectionId;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// Lifecycle of one tracked WebSocket connection. The connecting and
/// authenticating phases run inside the HTTP upgrade (see
/// [`auth_middleware`](crate::middleware::auth_middleware)), so tracking
/// starts at OPEN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Upgraded and authenticated; frames flow both ways.
    Open,
    /// The socket ended; cleanup is running.
    Closing,
    /// Removed from the manager.
    Closed,
}

/// A live WebSocket peer. Frames pushed into `tx` are written by the
/// connection's send task.
#[derive(Debug)]
pub struct Connection {
    /// Broker-assigned connection id.
    pub id: ConnectionId,
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// Set once the peer registers as an agent.
    pub agent_id: Option<String>,
    /// Outbound frame queue.
    pub tx: mpsc::UnboundedSender<String>,
}

impl Connection {
    /// An OPEN connection with no agent bound.
    pub fn new(id: ConnectionId, tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id,
            state: ConnectionState::Open,
            agent_id: None,
            tx,
        }
    }
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Connection>,
    agents: HashMap<String, ConnectionId>,
}

/// Manages active WebSocket connections and the agent id bound to each.
#[derive(Default)]
pub struct ConnectionManager {
    inner: RwLock<Inner>,
}

impl ConnectionManager {
    /// Empty manager, shared.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Track a freshly upgraded connection.
    pub async fn add(&self, conn: Connection) {
        let id = conn.id;
        self.inner.write().await.connections.insert(id, conn);
        info!(connection_id = %id, "Connection added");
    }

    /// Remove a connection and its agent binding. Returns the removed
    /// connection; `None` if it was already gone.
    pub async fn remove(&self, id: ConnectionId) -> Option<Connection> {
        let mut inner = self.inner.write().await;
        let mut conn = inner.connections.remove(&id)?;
        if let Some(agent_id) = &conn.agent_id {
            if inner.agents.get(agent_id) == Some(&id) {
                inner.agents.remove(agent_id);
            }
        }
        conn.state = ConnectionState::Closed;
        info!(connection_id = %id, agent_id = ?conn.agent_id, "Connection removed");
        Some(conn)
    }

    /// Remove whichever connection holds `agent_id`. Dropping the returned
    /// connection releases its outbound queue.
    pub async fn remove_agent(&self, agent_id: &str) -> Option<Connection> {
        let id = self.inner.read().await.agents.get(agent_id).copied()?;
        self.remove(id).await
    }

    /// Move a tracked connection to `state`.
    pub async fn set_state(&self, id: ConnectionId, state: ConnectionState) {
        if let Some(conn) = self.inner.write().await.connections.get_mut(&id) {
            debug!(connection_id = %id, from = ?conn.state, to = ?state, "Connection state");
            conn.state = state;
        }
    }

    /// State of a tracked connection.
    pub async fn state(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.inner.read().await.connections.get(&id).map(|c| c.state)
    }

    /// Bind an agent id to a connection. Fails if the connection is gone,
    /// already bound to another agent, or the id is held by another
    /// connection.
    pub async fn bind_agent(&self, id: ConnectionId, agent_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        if inner.agents.get(agent_id).is_some_and(|holder| *holder != id) {
            return false;
        }
        let Some(conn) = inner.connections.get_mut(&id) else {
            return false;
        };
        match &conn.agent_id {
            Some(existing) if existing != agent_id => return false,
            _ => conn.agent_id = Some(agent_id.to_string()),
        }
        inner.agents.insert(agent_id.to_string(), id);
        true
    }

    /// Drop the agent binding of a connection, keeping the connection.
    pub async fn unbind_agent(&self, id: ConnectionId) -> Option<String> {
        let mut inner = self.inner.write().await;
        let agent_id = inner.connections.get_mut(&id)?.agent_id.take()?;
        inner.agents.remove(&agent_id);
        Some(agent_id)
    }

    /// Agent id bound to a connection, if any.
    pub async fn agent_of(&self, id: ConnectionId) -> Option<String> {
        self.inner
            .read()
            .await
            .connections
            .get(&id)
            .and_then(|c| c.agent_id.clone())
    }

    /// Queue a frame for a connection. `false` when it is no longer open.
    pub async fn send(&self, id: ConnectionId, frame: &str) -> bool {
        let inner = self.inner.read().await;
        match inner.connections.get(&id) {
            Some(conn) if conn.state == ConnectionState::Open => {
                conn.tx.send(frame.to_string()).is_ok()
            }
            _ => false,
        }
    }

    /// Queue a frame for whichever connection holds `agent_id`.
    pub async fn send_to_agent(&self, agent_id: &str, frame: &str) -> bool {
        let id = self.inner.read().await.agents.get(agent_id).copied();
        match id {
            Some(id) => self.send(id, frame).await,
            None => {
                warn!(agent_id = %agent_id, "No connection for agent");
                false
            }
        }
    }

    /// Number of tracked connections.
    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    /// Number of bound agent ids.
    pub async fn agent_count(&self) -> usize {
        self.inner.read().await.agents.len()
    }
}
