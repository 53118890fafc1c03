use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use switchyard_core::payload::AttemptRecord;
use switchyard_core::{Capability, ErrorReason, Message};
use uuid::Uuid;

/// Identifies a live broker connection.
pub type ConnectionId = Uuid;

/// Lifecycle of a registered agent. The connecting phase precedes the
/// REGISTER frame, so a record starts out READY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Has spare slots.
    Ready,
    /// Every slot is taken.
    Busy,
    /// Missed heartbeats; excluded from dispatch.
    Unavailable,
    /// Removed from the registry. Only seen on the record `deregister`
    /// hands back.
    Disconnected,
}

/// A registered worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Unique id, requested by the agent or assigned by the broker.
    pub agent_id: String,
    /// Declared skills.
    pub capabilities: BTreeSet<Capability>,
    /// Concurrency ceiling.
    pub max_concurrent: u32,
    /// Current lifecycle status.
    pub status: AgentStatus,
    /// Last heartbeat or registration time.
    pub last_heartbeat: DateTime<Utc>,
    /// Registration time.
    pub registered_at: DateTime<Utc>,
    /// Monotonic registration order, used as the dispatch tie-break.
    pub registration_seq: u64,
    /// Tasks currently held. `current_load()` is its size.
    pub assigned_tasks: BTreeSet<Uuid>,
    /// Set when the agent went UNAVAILABLE.
    #[serde(default)]
    pub unavailable_since: Option<DateTime<Utc>>,
}

impl Agent {
    /// Number of tasks currently assigned.
    pub fn current_load(&self) -> u32 {
        self.assigned_tasks.len() as u32
    }

    /// Whether `capability` was declared.
    pub fn has_capability(&self, capability: &Capability) -> bool {
        self.capabilities.contains(capability)
    }

    /// Whether the agent can take one more task.
    pub fn has_spare_slot(&self) -> bool {
        self.current_load() < self.max_concurrent
    }

    /// Live agents are the ones dispatch may consider.
    pub fn is_live(&self) -> bool {
        matches!(self.status, AgentStatus::Ready | AgentStatus::Busy)
    }

    /// READY or BUSY depending on load. UNAVAILABLE is left alone.
    pub(crate) fn refresh_status(&mut self) {
        if self.is_live() {
            self.status = if self.has_spare_slot() {
                AgentStatus::Ready
            } else {
                AgentStatus::Busy
            };
        }
    }
}

/// Status of a task in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// COMPLETED, FAILED, or CANCELLED.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Counted against the admission ceiling.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Assigned | TaskStatus::Running
        )
    }
}

/// What a submitter asks for.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Skill an agent must declare to take the task.
    pub required_capability: Capability,
    /// Opaque to the broker.
    pub payload: serde_json::Value,
    /// Higher dispatches first.
    pub priority: i32,
    /// Falls back to the configured `retry_attempts`.
    pub max_attempts: Option<u32>,
    /// Falls back to the configured `task_timeout_ms`.
    pub timeout: Option<Duration>,
}

impl TaskSpec {
    /// Spec with default priority and queue-wide limits.
    pub fn new(capability: impl Into<Capability>, payload: serde_json::Value) -> Self {
        Self {
            required_capability: capability.into(),
            payload,
            priority: 0,
            max_attempts: None,
            timeout: None,
        }
    }

    /// Higher dispatches first.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Override the retry budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Override the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Who submitted a task and how to reach them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submitter {
    /// Connection the task was submitted over.
    pub connection_id: ConnectionId,
    /// `message_id` of the SUBMIT_TASK; every reply is correlated to it.
    pub submission_id: Uuid,
}

/// A unit of work owned by the [`TaskQueue`](crate::TaskQueue).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Broker-assigned id.
    pub task_id: Uuid,
    /// Skill an agent must declare to take the task.
    pub required_capability: Capability,
    /// Higher dispatches first.
    pub priority: i32,
    /// Opaque to the broker.
    pub payload: serde_json::Value,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Failed attempts so far. Never exceeds `max_attempts`.
    pub attempt_count: u32,
    /// Attempts permitted before the task fails.
    pub max_attempts: u32,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: u64,
    /// Deadline of the current assignment.
    pub deadline: Option<DateTime<Utc>>,
    /// Agent holding the current assignment.
    pub assigned_agent_id: Option<String>,
    /// `message_id` of the current ASSIGN; agent replies must match it.
    pub assignment_id: Option<Uuid>,
    /// Where replies go.
    pub submitter: Submitter,
    /// Set when the submitter connection went away.
    #[serde(default)]
    pub orphaned: bool,
    /// Earliest dispatch time after a failed attempt.
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    /// Start of the current stretch with no agent declaring the capability.
    #[serde(default)]
    pub starved_since: Option<DateTime<Utc>>,
    /// Failed attempts, oldest first.
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    /// Set once terminal.
    pub finished_at: Option<DateTime<Utc>>,
    /// Submission order, breaks `created_at` ties.
    pub seq: u64,
}

impl Task {
    /// Dispatch order: priority descending, then submission order.
    pub fn dispatch_key(&self) -> (std::cmp::Reverse<i32>, DateTime<Utc>, u64) {
        (std::cmp::Reverse(self.priority), self.created_at, self.seq)
    }

    /// Pending and past any retry backoff.
    pub fn is_dispatchable(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.not_before.map_or(true, |t| t <= now)
    }

    /// 1-based number of the attempt currently (or next) running.
    pub fn current_attempt(&self) -> u32 {
        self.attempt_count + 1
    }
}

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The agent's output.
    Success(serde_json::Value),
    /// The agent gave up or refused the assignment.
    Failure {
        /// Reason code.
        reason: ErrorReason,
        /// Human-readable detail.
        message: String,
    },
}

/// Snapshot written to the persistence collaborator when a task goes terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Task id.
    pub task_id: Uuid,
    /// Required capability.
    pub capability: Capability,
    /// Submission priority.
    pub priority: i32,
    /// Terminal status.
    pub status: TaskStatus,
    /// Failed attempts.
    pub attempt_count: u32,
    /// Attempt budget.
    pub max_attempts: u32,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// When the task went terminal.
    pub finished_at: DateTime<Utc>,
    /// Agent that held the last attempt, if any did.
    pub last_agent_id: Option<String>,
    /// Reason for a failed or cancelled task.
    #[serde(default)]
    pub error: Option<ErrorReason>,
    /// Failed attempts, oldest first.
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
}

impl TaskRecord {
    pub(crate) fn from_task(task: &Task, error: Option<ErrorReason>) -> Self {
        Self {
            task_id: task.task_id,
            capability: task.required_capability.clone(),
            priority: task.priority,
            status: task.status,
            attempt_count: task.attempt_count,
            max_attempts: task.max_attempts,
            created_at: task.created_at,
            finished_at: task.finished_at.unwrap_or(task.created_at),
            last_agent_id: task
                .assigned_agent_id
                .clone()
                .or_else(|| task.attempts.last().map(|a| a.agent_id.clone())),
            error,
            attempts: task.attempts.clone(),
        }
    }
}

/// A side effect produced by a control-plane mutation, executed by the
/// broker after the state lock is released.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Push a message to the connection registered as `agent_id`.
    ToAgent {
        /// Recipient agent.
        agent_id: String,
        /// ASSIGN or CANCEL.
        message: Message,
    },
    /// Push a message to a submitter connection.
    ToSubmitter {
        /// Recipient connection.
        connection_id: ConnectionId,
        /// Reply correlated to the submission.
        message: Message,
    },
    /// Hand a terminal task to the persistence collaborator.
    Persist(TaskRecord),
    /// Close the connection still bound to an agent the liveness sweep
    /// dropped, freeing its id for a fresh registration.
    Disconnect {
        /// The dropped agent.
        agent_id: String,
    },
}

/// Counts by status, for `/stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Waiting for dispatch or a retry backoff.
    pub pending: usize,
    /// Sent to an agent, not yet acknowledged.
    pub assigned: usize,
    /// Acknowledged by the agent.
    pub running: usize,
    /// Finished successfully.
    pub completed: usize,
    /// Failed terminally.
    pub failed: usize,
    /// Cancelled.
    pub cancelled: usize,
}

impl QueueStats {
    /// PENDING + ASSIGNED + RUNNING.
    pub fn in_flight(&self) -> usize {
        self.pending + self.assigned + self.running
    }
}

/// Converts a std duration for arithmetic on `DateTime<Utc>`, saturating at
/// a century.
pub(crate) fn span(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
