use crate::registry::AgentRegistry;
use crate::task_queue::TaskQueue;
use crate::types::{
    Agent, AgentStatus, ConnectionId, Outbound, Outcome, QueueStats, Submitter, Task, TaskSpec,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use switchyard_core::config::{LivenessConfig, QueueConfig};
use switchyard_core::{BrokerConfig, Capability, SwitchyardError, SwitchyardResult};
use tracing::{debug, info, warn};
use uuid::Uuid;

struct PlaneState {
    registry: AgentRegistry,
    queue: TaskQueue,
    shutting_down: bool,
}

/// One agent as reported on `/stats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSummary {
    /// Registered id.
    pub agent_id: String,
    /// Declared capabilities, sorted.
    pub capabilities: Vec<Capability>,
    /// Current lifecycle status.
    pub status: AgentStatus,
    /// Tasks currently held.
    pub load: u32,
    /// Concurrency ceiling declared at registration.
    pub max_concurrent: u32,
}

impl From<&Agent> for AgentSummary {
    fn from(agent: &Agent) -> Self {
        Self {
            agent_id: agent.agent_id.clone(),
            capabilities: agent.capabilities.iter().cloned().collect(),
            status: agent.status,
            load: agent.current_load(),
            max_concurrent: agent.max_concurrent,
        }
    }
}

/// Broker-wide snapshot served on `/stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStats {
    /// Registered agents in registration order.
    pub agents: Vec<AgentSummary>,
    /// Task counts by status.
    pub tasks: QueueStats,
}

impl BrokerStats {
    /// Agents currently eligible for dispatch (READY or BUSY).
    pub fn live_agents(&self) -> usize {
        self.agents
            .iter()
            .filter(|a| matches!(a.status, AgentStatus::Ready | AgentStatus::Busy))
            .count()
    }
}

/// The single writer over agent and task state.
///
/// Registry and queue sit behind one lock, so an assignment and the agent
/// load it implies change together. Methods never block on I/O: each one
/// returns the [`Outbound`] effects for the caller to deliver after the
/// lock is released.
pub struct ControlPlane {
    state: Mutex<PlaneState>,
    liveness: LivenessConfig,
}

impl ControlPlane {
    /// Control plane using the queue and liveness sections of `config`.
    pub fn new(config: &BrokerConfig) -> Self {
        Self::with_parts(config.queue.clone(), config.liveness.clone())
    }

    /// Control plane from explicit queue and liveness policies.
    pub fn with_parts(queue: QueueConfig, liveness: LivenessConfig) -> Self {
        Self {
            state: Mutex::new(PlaneState {
                registry: AgentRegistry::new(),
                queue: TaskQueue::new(queue),
                shutting_down: false,
            }),
            liveness,
        }
    }

    /// Register an agent. Without a requested id the broker assigns one.
    /// A fresh agent may immediately receive pending work.
    pub fn register_agent(
        &self,
        requested_id: Option<String>,
        capabilities: Vec<Capability>,
        max_concurrent: u32,
    ) -> SwitchyardResult<(Agent, Vec<Outbound>)> {
        let now = Utc::now();
        let agent_id = requested_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("agent-{}", Uuid::new_v4().simple()));

        let mut state = self.state.lock();
        if state.shutting_down {
            return Err(SwitchyardError::ShuttingDown);
        }
        let agent = state
            .registry
            .register(agent_id, capabilities, max_concurrent, now)?;
        let PlaneState {
            registry, queue, ..
        } = &mut *state;
        let out = queue.dispatch_next(registry, now);
        Ok((agent, out))
    }

    /// Record a heartbeat. Returns `false` for unknown agents.
    pub fn heartbeat(&self, agent_id: &str) -> bool {
        self.state.lock().registry.heartbeat(agent_id, Utc::now())
    }

    /// Remove an agent and requeue whatever it held.
    pub fn deregister_agent(&self, agent_id: &str) -> Vec<Outbound> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let PlaneState {
            registry, queue, ..
        } = &mut *state;
        let Some(agent) = registry.deregister(agent_id) else {
            debug!(agent_id = %agent_id, "Deregister for unknown agent ignored");
            return Vec::new();
        };
        let held: Vec<Uuid> = agent.assigned_tasks.into_iter().collect();
        let mut out = queue.requeue(registry, agent_id, &held, now);
        out.extend(queue.dispatch_next(registry, now));
        out
    }

    /// Admit a task and try to dispatch right away.
    pub fn submit(
        &self,
        spec: TaskSpec,
        submitter: Submitter,
    ) -> SwitchyardResult<(Uuid, Vec<Outbound>)> {
        let now = Utc::now();
        let mut state = self.state.lock();
        if state.shutting_down {
            return Err(SwitchyardError::ShuttingDown);
        }
        let PlaneState {
            registry, queue, ..
        } = &mut *state;
        let task_id = queue.submit(spec, submitter, now)?;
        let out = queue.dispatch_next(registry, now);
        Ok((task_id, out))
    }

    /// An agent acknowledged its assignment.
    pub fn acknowledge(&self, task_id: Uuid, agent_id: &str, assignment_id: Option<Uuid>) -> bool {
        self.state
            .lock()
            .queue
            .mark_running(task_id, agent_id, assignment_id)
    }

    /// Relay progress for the agent's current assignment to the submitter.
    pub fn progress(
        &self,
        task_id: Uuid,
        agent_id: &str,
        assignment_id: Option<Uuid>,
        progress: serde_json::Value,
    ) -> Vec<Outbound> {
        self.state
            .lock()
            .queue
            .progress(task_id, agent_id, assignment_id, progress)
    }

    /// Apply an agent's result; the freed slot may take new work.
    pub fn report_result(
        &self,
        task_id: Uuid,
        agent_id: &str,
        assignment_id: Option<Uuid>,
        outcome: Outcome,
    ) -> Vec<Outbound> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let PlaneState {
            registry, queue, ..
        } = &mut *state;
        let mut out = queue.report_result(registry, task_id, agent_id, assignment_id, outcome, now);
        out.extend(queue.dispatch_next(registry, now));
        out
    }

    /// Cancel a task. Unknown ids are an error; terminal tasks are a no-op.
    pub fn cancel(&self, task_id: Uuid) -> SwitchyardResult<Vec<Outbound>> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let PlaneState {
            registry, queue, ..
        } = &mut *state;
        let mut out = queue.cancel(registry, task_id, now)?;
        out.extend(queue.dispatch_next(registry, now));
        Ok(out)
    }

    /// The submitter connection closed. Its tasks keep running.
    pub fn submitter_disconnected(&self, connection_id: ConnectionId) -> usize {
        self.state.lock().queue.orphan_submitter(connection_id)
    }

    /// One supervisor pass at the current time.
    pub fn tick(&self) -> Vec<Outbound> {
        self.tick_at(Utc::now())
    }

    /// One supervisor pass: liveness sweep, requeue from expired agents,
    /// deadline enforcement, dispatch, and purge of old terminal tasks.
    /// Each expired agent also yields an [`Outbound::Disconnect`].
    pub fn tick_at(&self, now: DateTime<Utc>) -> Vec<Outbound> {
        let mut state = self.state.lock();
        if state.shutting_down {
            return Vec::new();
        }
        let PlaneState {
            registry, queue, ..
        } = &mut *state;

        let sweep = registry.sweep_liveness(
            now,
            self.liveness.liveness_threshold(),
            self.liveness.unavailable_grace(),
        );
        let mut out = Vec::new();
        for (agent_id, held) in sweep.expired {
            out.extend(queue.requeue(registry, &agent_id, &held, now));
            out.push(Outbound::Disconnect { agent_id });
        }
        out.extend(queue.supervise_timeouts(registry, now));
        out.extend(queue.dispatch_next(registry, now));
        queue.purge_terminal(now);
        out
    }

    /// Stop accepting work and cancel everything in flight.
    pub fn shutdown(&self) -> Vec<Outbound> {
        let now = Utc::now();
        let mut state = self.state.lock();
        if state.shutting_down {
            return Vec::new();
        }
        state.shutting_down = true;
        let PlaneState {
            registry, queue, ..
        } = &mut *state;
        let out = queue.shutdown(registry, now);
        let stats = queue.stats();
        info!(
            agents = registry.len(),
            cancelled = stats.cancelled,
            "Control plane shut down"
        );
        if stats.in_flight() > 0 {
            warn!(in_flight = stats.in_flight(), "Tasks left in flight after shutdown");
        }
        out
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Snapshot of agents and task counts.
    pub fn stats(&self) -> BrokerStats {
        let state = self.state.lock();
        BrokerStats {
            agents: state
                .registry
                .agents()
                .into_iter()
                .map(AgentSummary::from)
                .collect(),
            tasks: state.queue.stats(),
        }
    }

    /// Snapshot of a task.
    pub fn task(&self, task_id: Uuid) -> Option<Task> {
        self.state.lock().queue.get(task_id).cloned()
    }

    /// Snapshot of an agent.
    pub fn agent(&self, agent_id: &str) -> Option<Agent> {
        self.state.lock().registry.get(agent_id).cloned()
    }

    /// Snapshot of every agent in registration order.
    pub fn agents(&self) -> Vec<Agent> {
        self.state
            .lock()
            .registry
            .agents()
            .into_iter()
            .cloned()
            .collect()
    }
}
