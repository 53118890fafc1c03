//! Clients for the Switchyard broker.
//!
//! - [`SubmitterClient`] — submit tasks and await correlated results.
//! - [`AgentClient`] — register as a worker, receive assignments, report back.

/// Worker-side client.
pub mod agent;
/// Orchestrator-side client.
pub mod submitter;
mod transport;

pub use agent::{AgentClient, AgentEvent, Assignment, Registration};
pub use submitter::{ClientConfig, PendingTask, SubmitRequest, SubmitterClient, TaskOutcome};
