//! WebSocket broker for the Switchyard control plane.
//!
//! Owns live connections, routes inbound envelopes to the
//! [`ControlPlane`](switchyard_orchestrator::ControlPlane), pushes assignments
//! and results to peers, and runs the periodic supervisor.

/// Live connections and agent bindings.
pub mod connection;
/// Authentication at the upgrade.
pub mod middleware;
/// Inbound dispatch and effect delivery.
pub mod router;
/// HTTP and WebSocket surface.
pub mod server;
/// Periodic sweep task.
pub mod supervisor;

pub use connection::{ConnectionManager, ConnectionState};
pub use middleware::{AllowAll, ApiKeyAuthenticator, Authenticator, Credentials};
pub use router::MessageRouter;
pub use server::BrokerServer;
