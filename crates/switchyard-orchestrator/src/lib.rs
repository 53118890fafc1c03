//! Agent registry, task queue, and the control plane that owns them.
//!
//! State changes are synchronous and take an explicit timestamp where timing
//! matters, so dispatch, retry, timeout, and liveness rules are testable
//! without a network or a clock. Every mutation returns [`Outbound`]
//! effects that the gateway delivers.
//!
//! # Main types
//!
//! - [`ControlPlane`] — Single writer over registry and queue.
//! - [`AgentRegistry`] — Agents, capabilities, load, liveness.
//! - [`TaskQueue`] — Priority queue with admission control, retries, and deadlines.
//! - [`TaskRecorder`] — Persistence hook for terminal tasks.

/// Control plane.
pub mod engine;
/// Persistence hook for terminal tasks.
pub mod recorder;
/// Agent registry.
pub mod registry;
/// Priority task queue.
pub mod task_queue;
/// Shared types (Agent, Task, Outbound, ...).
pub mod types;

pub use engine::{AgentSummary, BrokerStats, ControlPlane};
pub use recorder::{JsonlTaskRecorder, NoopRecorder, TaskRecorder};
pub use registry::{AgentRegistry, LivenessSweep};
pub use task_queue::TaskQueue;
pub use types::{
    Agent, AgentStatus, ConnectionId, Outbound, Outcome, QueueStats, Submitter, Task, TaskRecord,
    TaskSpec, TaskStatus,
};
