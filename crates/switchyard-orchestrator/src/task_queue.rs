use crate::registry::AgentRegistry;
use crate::types::{
    span, ConnectionId, Outbound, Outcome, QueueStats, Submitter, Task, TaskRecord, TaskSpec,
    TaskStatus,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use switchyard_core::config::{QueueConfig, MAX_TASK_TIMEOUT_MS};
use switchyard_core::payload::{Assign, AttemptRecord, Cancel, Progress, TaskError, TaskResult};
use switchyard_core::{ErrorReason, Message, SwitchyardError, SwitchyardResult, BROKER_SENDER};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Priority task queue with admission control, retries, and deadlines.
///
/// Every mutation returns the [`Outbound`] effects it produced; nothing is
/// sent from inside the queue. Agent load lives in the [`AgentRegistry`],
/// which callers pass in so both structures change under one lock.
pub struct TaskQueue {
    tasks: HashMap<Uuid, Task>,
    config: QueueConfig,
    next_seq: u64,
}

impl TaskQueue {
    /// Empty queue governed by `config`.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            tasks: HashMap::new(),
            config,
            next_seq: 0,
        }
    }

    /// Policy this queue runs with.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Admit a task in PENDING, or reject it when the in-flight count has
    /// reached `max_concurrent_tasks`.
    pub fn submit(
        &mut self,
        spec: TaskSpec,
        submitter: Submitter,
        now: DateTime<Utc>,
    ) -> SwitchyardResult<Uuid> {
        let in_flight = self.in_flight_count();
        if in_flight >= self.config.max_concurrent_tasks {
            warn!(
                in_flight,
                limit = self.config.max_concurrent_tasks,
                "Submission rejected: queue full"
            );
            return Err(SwitchyardError::QueueFull {
                limit: self.config.max_concurrent_tasks,
            });
        }

        let timeout = spec.timeout.unwrap_or_else(|| self.config.task_timeout());
        if timeout.is_zero() {
            return Err(SwitchyardError::InvalidRequest(
                "timeout must be positive".into(),
            ));
        }
        let timeout_ms = match u64::try_from(timeout.as_millis()) {
            Ok(ms) if ms <= MAX_TASK_TIMEOUT_MS => ms,
            _ => {
                return Err(SwitchyardError::InvalidRequest(format!(
                    "timeout must not exceed {MAX_TASK_TIMEOUT_MS}ms"
                )))
            }
        };
        let max_attempts = match spec.max_attempts {
            Some(0) => {
                return Err(SwitchyardError::InvalidRequest(
                    "max_attempts must be at least 1".into(),
                ))
            }
            Some(n) => n,
            None => self.config.retry_attempts.max(1),
        };

        let task = Task {
            task_id: Uuid::new_v4(),
            required_capability: spec.required_capability,
            priority: spec.priority,
            payload: spec.payload,
            status: TaskStatus::Pending,
            attempt_count: 0,
            max_attempts,
            created_at: now,
            timeout_ms,
            deadline: None,
            assigned_agent_id: None,
            assignment_id: None,
            submitter,
            orphaned: false,
            not_before: None,
            starved_since: None,
            attempts: Vec::new(),
            finished_at: None,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        let id = task.task_id;
        info!(
            task_id = %id,
            capability = %task.required_capability,
            priority = task.priority,
            max_attempts,
            "Task submitted"
        );
        self.tasks.insert(id, task);
        Ok(id)
    }

    /// Assign every dispatchable PENDING task that has an eligible agent,
    /// in priority order (higher first, FIFO within a priority). Tasks whose
    /// capability no live agent declares for longer than the starvation
    /// window are failed with `capability_mismatch`.
    pub fn dispatch_next(
        &mut self,
        registry: &mut AgentRegistry,
        now: DateTime<Utc>,
    ) -> Vec<Outbound> {
        let mut out = Vec::new();
        let mut ready: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.is_dispatchable(now))
            .collect();
        ready.sort_by_key(|t| t.dispatch_key());
        let ready: Vec<Uuid> = ready.into_iter().map(|t| t.task_id).collect();

        let window = span(self.config.starvation_window());
        for id in ready {
            let Some(task) = self.tasks.get_mut(&id) else {
                continue;
            };

            if !registry.has_live_capability(&task.required_capability) {
                let since = *task.starved_since.get_or_insert(now);
                if now - since >= window {
                    let message = format!(
                        "no agent with capability '{}' within {}ms",
                        task.required_capability, self.config.starvation_window_ms
                    );
                    warn!(task_id = %id, capability = %task.required_capability, "Task starved");
                    let error = TaskError {
                        task_id: Some(id),
                        reason: ErrorReason::CapabilityMismatch,
                        message,
                        attempts: task.attempts.clone(),
                    };
                    retire(task, TaskStatus::Failed, Some(error), now, &mut out);
                }
                continue;
            }
            task.starved_since = None;

            let Some(agent_id) = registry
                .find_eligible(&task.required_capability)
                .first()
                .map(|a| a.agent_id.clone())
            else {
                continue;
            };

            // Checked before the agent slot is taken.
            let Some(deadline) = i64::try_from(task.timeout_ms)
                .ok()
                .and_then(chrono::Duration::try_milliseconds)
                .and_then(|timeout| now.checked_add_signed(timeout))
            else {
                warn!(task_id = %id, timeout_ms = task.timeout_ms, "Task deadline out of range");
                let error = TaskError {
                    task_id: Some(id),
                    reason: ErrorReason::InvalidRequest,
                    message: format!("timeout of {}ms is out of range", task.timeout_ms),
                    attempts: task.attempts.clone(),
                };
                retire(task, TaskStatus::Failed, Some(error), now, &mut out);
                continue;
            };
            if let Err(e) = registry.mark_assigned(&agent_id, id) {
                warn!(task_id = %id, agent_id = %agent_id, error = %e, "Assignment refused");
                continue;
            }

            let message = Message::from_payload(
                BROKER_SENDER,
                &Assign {
                    task_id: id,
                    capability: task.required_capability.clone(),
                    payload: task.payload.clone(),
                    attempt: task.current_attempt(),
                    deadline,
                },
            );
            task.status = TaskStatus::Assigned;
            task.assigned_agent_id = Some(agent_id.clone());
            task.assignment_id = Some(message.message_id);
            task.deadline = Some(deadline);
            task.not_before = None;

            info!(
                task_id = %id,
                agent_id = %agent_id,
                attempt = task.current_attempt(),
                priority = task.priority,
                "Task assigned"
            );
            out.push(Outbound::ToAgent { agent_id, message });
        }
        out
    }

    /// ASSIGNED → RUNNING once the agent acknowledges the assignment.
    pub fn mark_running(
        &mut self,
        task_id: Uuid,
        agent_id: &str,
        assignment_id: Option<Uuid>,
    ) -> bool {
        match self.tasks.get_mut(&task_id) {
            Some(task) if holds_assignment(task, agent_id, assignment_id) => {
                if task.status == TaskStatus::Assigned {
                    task.status = TaskStatus::Running;
                    debug!(task_id = %task_id, agent_id = %agent_id, "Task running");
                }
                true
            }
            _ => false,
        }
    }

    /// Relay agent progress to the submitter.
    pub fn progress(
        &mut self,
        task_id: Uuid,
        agent_id: &str,
        assignment_id: Option<Uuid>,
        progress: serde_json::Value,
    ) -> Vec<Outbound> {
        let mut out = Vec::new();
        if !self.mark_running(task_id, agent_id, assignment_id) {
            debug!(task_id = %task_id, agent_id = %agent_id, "Stale progress discarded");
            return out;
        }
        if let Some(task) = self.tasks.get(&task_id) {
            let message =
                Message::reply(task.submitter.submission_id, &Progress { task_id, progress });
            notify_submitter(task, message, &mut out);
        }
        out
    }

    /// Apply an agent's result for its current assignment. Results for
    /// tasks the agent no longer holds (cancelled, timed out, reassigned)
    /// are discarded.
    pub fn report_result(
        &mut self,
        registry: &mut AgentRegistry,
        task_id: Uuid,
        agent_id: &str,
        assignment_id: Option<Uuid>,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Vec<Outbound> {
        let mut out = Vec::new();
        let Some(task) = self.tasks.get_mut(&task_id) else {
            debug!(task_id = %task_id, agent_id = %agent_id, "Result for unknown task discarded");
            return out;
        };
        if !holds_assignment(task, agent_id, assignment_id) {
            warn!(
                task_id = %task_id,
                agent_id = %agent_id,
                status = ?task.status,
                "Stale result discarded"
            );
            return out;
        }

        match outcome {
            Outcome::Success(output) => {
                registry.mark_released(agent_id, task_id);
                info!(task_id = %task_id, agent_id = %agent_id, "Task completed");
                let message =
                    Message::reply(task.submitter.submission_id, &TaskResult { task_id, output });
                notify_submitter(task, message, &mut out);
                retire(task, TaskStatus::Completed, None, now, &mut out);
            }
            Outcome::Failure { reason, message } => {
                fail_attempt(task, registry, &self.config, reason, message, now, &mut out);
            }
        }
        out
    }

    /// Fail every assignment past its deadline and free the agent slot,
    /// whether or not the agent ever answers.
    pub fn supervise_timeouts(
        &mut self,
        registry: &mut AgentRegistry,
        now: DateTime<Utc>,
    ) -> Vec<Outbound> {
        let mut out = Vec::new();
        for task in self.tasks.values_mut() {
            let overdue = matches!(task.status, TaskStatus::Assigned | TaskStatus::Running)
                && task.deadline.is_some_and(|d| d < now);
            if !overdue {
                continue;
            }
            if let (Some(agent_id), Some(assignment_id)) =
                (task.assigned_agent_id.clone(), task.assignment_id)
            {
                warn!(task_id = %task.task_id, agent_id = %agent_id, "Task attempt timed out");
                let cancel = Message::reply(assignment_id, &Cancel {
                    task_id: task.task_id,
                });
                out.push(Outbound::ToAgent {
                    agent_id,
                    message: cancel,
                });
            }
            let message = format!("no result within {}ms", task.timeout_ms);
            fail_attempt(
                task,
                registry,
                &self.config,
                ErrorReason::TaskTimeout,
                message,
                now,
                &mut out,
            );
        }
        out
    }

    /// Cancel a non-terminal task and free any agent slot it holds.
    /// Cancelling a terminal task is a no-op.
    pub fn cancel(
        &mut self,
        registry: &mut AgentRegistry,
        task_id: Uuid,
        now: DateTime<Utc>,
    ) -> SwitchyardResult<Vec<Outbound>> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| SwitchyardError::UnknownTask(task_id.to_string()))?;
        let mut out = Vec::new();
        if task.status.is_terminal() {
            debug!(task_id = %task_id, status = ?task.status, "Cancel of terminal task ignored");
            return Ok(out);
        }

        release_assignment(task, registry, &mut out);
        info!(task_id = %task_id, "Task cancelled");
        let error = TaskError::new(Some(task_id), ErrorReason::Cancelled, "task cancelled");
        retire(task, TaskStatus::Cancelled, Some(error), now, &mut out);
        Ok(out)
    }

    /// Return tasks held by a departed agent to PENDING. Disconnects do not
    /// count as failed attempts.
    pub fn requeue(
        &mut self,
        registry: &mut AgentRegistry,
        agent_id: &str,
        task_ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> Vec<Outbound> {
        let mut out = Vec::new();
        for id in task_ids {
            let Some(task) = self.tasks.get_mut(id) else {
                continue;
            };
            if task.status.is_terminal() || task.assigned_agent_id.as_deref() != Some(agent_id) {
                continue;
            }
            registry.mark_released(agent_id, *id);
            task.assigned_agent_id = None;
            task.assignment_id = None;
            task.deadline = None;

            if task.attempt_count >= task.max_attempts {
                let error = TaskError {
                    task_id: Some(*id),
                    reason: ErrorReason::TaskRetryExhausted,
                    message: format!("agent '{agent_id}' left after final attempt"),
                    attempts: task.attempts.clone(),
                };
                retire(task, TaskStatus::Failed, Some(error), now, &mut out);
                continue;
            }
            task.status = TaskStatus::Pending;
            task.not_before = None;
            info!(
                task_id = %id,
                agent_id = %agent_id,
                attempt_count = task.attempt_count,
                "Task requeued after agent loss"
            );
        }
        out
    }

    /// Mark every task of a departed submitter as orphaned. The tasks keep
    /// running; their results are dropped. Returns how many were in flight.
    pub fn orphan_submitter(&mut self, connection_id: ConnectionId) -> usize {
        let mut count = 0;
        for task in self.tasks.values_mut() {
            if task.submitter.connection_id == connection_id && !task.orphaned {
                task.orphaned = true;
                if !task.status.is_terminal() {
                    count += 1;
                }
            }
        }
        if count > 0 {
            info!(connection_id = %connection_id, tasks = count, "Submitter gone, tasks orphaned");
        }
        count
    }

    /// Cancel everything still in flight, telling submitters and agents.
    pub fn shutdown(&mut self, registry: &mut AgentRegistry, now: DateTime<Utc>) -> Vec<Outbound> {
        let mut out = Vec::new();
        let mut cancelled = 0usize;
        for task in self.tasks.values_mut() {
            if task.status.is_terminal() {
                continue;
            }
            cancelled += 1;
            release_assignment(task, registry, &mut out);
            let error = TaskError::new(
                Some(task.task_id),
                ErrorReason::Shutdown,
                "broker shutting down",
            );
            retire(task, TaskStatus::Cancelled, Some(error), now, &mut out);
        }
        info!(cancelled, "Task queue shut down");
        out
    }

    /// Drop terminal tasks older than the retention period.
    pub fn purge_terminal(&mut self, now: DateTime<Utc>) -> usize {
        let retention = span(self.config.terminal_retention());
        let before = self.tasks.len();
        self.tasks.retain(|_, t| {
            !(t.status.is_terminal() && t.finished_at.is_some_and(|f| now - f >= retention))
        });
        let purged = before - self.tasks.len();
        if purged > 0 {
            debug!(purged, "Purged terminal tasks");
        }
        purged
    }

    /// Look up a tracked task, terminal ones included until purged.
    pub fn get(&self, task_id: Uuid) -> Option<&Task> {
        self.tasks.get(&task_id)
    }

    /// PENDING + ASSIGNED + RUNNING.
    pub fn in_flight_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status.is_in_flight())
            .count()
    }

    /// Count of pending tasks.
    pub fn pending_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    /// Task counts by status.
    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats::default();
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Assigned => stats.assigned += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// All tracked tasks in dispatch order.
    pub fn all_tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by_key(|t| t.dispatch_key());
        tasks
    }

    /// Tracked tasks in any status.
    pub fn total_count(&self) -> usize {
        self.tasks.len()
    }
}

/// Whether `agent_id` holds the task's live assignment. A missing
/// `assignment_id` matches on agent alone.
fn holds_assignment(task: &Task, agent_id: &str, assignment_id: Option<Uuid>) -> bool {
    matches!(task.status, TaskStatus::Assigned | TaskStatus::Running)
        && task.assigned_agent_id.as_deref() == Some(agent_id)
        && assignment_id.map_or(true, |a| task.assignment_id == Some(a))
}

/// Free the agent slot and tell the agent to stop.
fn release_assignment(task: &mut Task, registry: &mut AgentRegistry, out: &mut Vec<Outbound>) {
    let (Some(agent_id), Some(assignment_id)) =
        (task.assigned_agent_id.take(), task.assignment_id.take())
    else {
        return;
    };
    registry.mark_released(&agent_id, task.task_id);
    task.deadline = None;
    out.push(Outbound::ToAgent {
        agent_id: agent_id.clone(),
        message: Message::reply(assignment_id, &Cancel {
            task_id: task.task_id,
        }),
    });
    // Kept for the terminal record.
    task.assigned_agent_id = Some(agent_id);
}

/// Record a failed attempt; retry after backoff or fail for good.
fn fail_attempt(
    task: &mut Task,
    registry: &mut AgentRegistry,
    config: &QueueConfig,
    reason: ErrorReason,
    message: String,
    now: DateTime<Utc>,
    out: &mut Vec<Outbound>,
) {
    let agent_id = task.assigned_agent_id.take().unwrap_or_default();
    registry.mark_released(&agent_id, task.task_id);
    task.assignment_id = None;
    task.deadline = None;
    task.attempt_count = (task.attempt_count + 1).min(task.max_attempts);
    task.attempts.push(AttemptRecord {
        attempt: task.attempt_count,
        agent_id: agent_id.clone(),
        reason,
        message: message.clone(),
        at: now,
    });

    if task.attempt_count < task.max_attempts {
        let delay = config.retry_backoff(task.attempt_count);
        task.status = TaskStatus::Pending;
        task.not_before = Some(now + span(delay));
        info!(
            task_id = %task.task_id,
            agent_id = %agent_id,
            attempt_count = task.attempt_count,
            max_attempts = task.max_attempts,
            backoff_ms = delay.as_millis() as u64,
            reason = %reason,
            "Task attempt failed, will retry"
        );
        return;
    }

    let (final_reason, summary) = if reason == ErrorReason::TaskTimeout {
        (ErrorReason::TaskTimeout, "timed out")
    } else {
        (ErrorReason::TaskRetryExhausted, "failed")
    };
    warn!(
        task_id = %task.task_id,
        attempts = task.attempt_count,
        reason = %final_reason,
        "Task failed permanently"
    );
    let error = TaskError {
        task_id: Some(task.task_id),
        reason: final_reason,
        message: format!("{summary} after {} attempt(s): {message}", task.attempt_count),
        attempts: task.attempts.clone(),
    };
    task.assigned_agent_id = Some(agent_id);
    retire(task, TaskStatus::Failed, Some(error), now, out);
}

/// Move a task to a terminal status, notify the submitter of failures, and
/// emit the persistence record.
fn retire(
    task: &mut Task,
    status: TaskStatus,
    error: Option<TaskError>,
    now: DateTime<Utc>,
    out: &mut Vec<Outbound>,
) {
    task.status = status;
    task.finished_at = Some(now);
    task.deadline = None;
    task.not_before = None;
    let reason = error.as_ref().map(|e| e.reason);
    if let Some(error) = error {
        let message = Message::reply(task.submitter.submission_id, &error);
        notify_submitter(task, message, out);
    }
    out.push(Outbound::Persist(TaskRecord::from_task(task, reason)));
}

fn notify_submitter(task: &Task, message: Message, out: &mut Vec<Outbound>) {
    if task.orphaned {
        warn!(
            task_id = %task.task_id,
            connection_id = %task.submitter.connection_id,
            kind = %message.kind,
            "Delivery dropped: submitter disconnected"
        );
        return;
    }
    out.push(Outbound::ToSubmitter {
        connection_id: task.submitter.connection_id,
        message,
    });
}
