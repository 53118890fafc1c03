use crate::types::{span, Agent, AgentStatus};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use switchyard_core::{Capability, SwitchyardError, SwitchyardResult};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of one liveness sweep.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LivenessSweep {
    /// Agents that just went UNAVAILABLE.
    pub unavailable: Vec<String>,
    /// Agents dropped after the grace period, with the tasks they held.
    pub expired: Vec<(String, Vec<Uuid>)>,
}

/// Tracks registered agents, their capabilities, load, and liveness.
///
/// Not internally synchronized: the [`ControlPlane`](crate::ControlPlane)
/// owns it behind the same lock as the task queue.
pub struct AgentRegistry {
    agents: HashMap<String, Agent>,
    next_seq: u64,
}

impl AgentRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            agents: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Admit an agent in READY status with no load.
    pub fn register(
        &mut self,
        agent_id: impl Into<String>,
        capabilities: impl IntoIterator<Item = Capability>,
        max_concurrent: u32,
        now: DateTime<Utc>,
    ) -> SwitchyardResult<Agent> {
        let agent_id = agent_id.into();
        if agent_id.trim().is_empty() {
            return Err(SwitchyardError::InvalidRequest(
                "agent_id must not be empty".into(),
            ));
        }
        if max_concurrent == 0 {
            return Err(SwitchyardError::InvalidRequest(
                "max_concurrent must be positive".into(),
            ));
        }
        if self.agents.contains_key(&agent_id) {
            return Err(SwitchyardError::DuplicateAgent(agent_id));
        }

        let capabilities: BTreeSet<Capability> = capabilities.into_iter().collect();
        let agent = Agent {
            agent_id: agent_id.clone(),
            capabilities,
            max_concurrent,
            status: AgentStatus::Ready,
            last_heartbeat: now,
            registered_at: now,
            registration_seq: self.next_seq,
            assigned_tasks: BTreeSet::new(),
            unavailable_since: None,
        };
        self.next_seq += 1;

        info!(
            agent_id = %agent_id,
            capabilities = ?agent.capabilities,
            max_concurrent,
            "Agent registered"
        );
        self.agents.insert(agent_id, agent.clone());
        Ok(agent)
    }

    /// Refresh `last_heartbeat`. An UNAVAILABLE agent that heartbeats again
    /// is restored. Returns false for unknown agents.
    pub fn heartbeat(&mut self, agent_id: &str, now: DateTime<Utc>) -> bool {
        let Some(agent) = self.agents.get_mut(agent_id) else {
            debug!(agent_id = %agent_id, "Heartbeat from unknown agent ignored");
            return false;
        };
        agent.last_heartbeat = now;
        if agent.status == AgentStatus::Unavailable {
            agent.status = AgentStatus::Ready;
            agent.unavailable_since = None;
            agent.refresh_status();
            info!(agent_id = %agent_id, "Agent recovered");
        }
        true
    }

    /// Drop the agent and hand back its final record, marked DISCONNECTED,
    /// with the tasks it held still in `assigned_tasks`. `None` if it was
    /// not registered, so duplicate disconnect notices are harmless.
    pub fn deregister(&mut self, agent_id: &str) -> Option<Agent> {
        let mut agent = self.agents.remove(agent_id)?;
        agent.status = AgentStatus::Disconnected;
        info!(
            agent_id = %agent_id,
            held = agent.assigned_tasks.len(),
            "Agent deregistered"
        );
        Some(agent)
    }

    /// Agents able to take a task needing `capability` right now:
    /// least-loaded first, then oldest registration.
    pub fn find_eligible(&self, capability: &Capability) -> Vec<&Agent> {
        let mut eligible: Vec<&Agent> = self
            .agents
            .values()
            .filter(|a| a.is_live() && a.has_capability(capability) && a.has_spare_slot())
            .collect();
        eligible.sort_by_key(|a| (a.current_load(), a.registration_seq));
        eligible
    }

    /// Whether any live agent declares `capability`, regardless of load.
    pub fn has_live_capability(&self, capability: &Capability) -> bool {
        self.agents
            .values()
            .any(|a| a.is_live() && a.has_capability(capability))
    }

    /// Record that `agent_id` now holds `task_id`.
    pub fn mark_assigned(&mut self, agent_id: &str, task_id: Uuid) -> SwitchyardResult<()> {
        let agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| SwitchyardError::UnknownAgent(agent_id.to_string()))?;
        if agent.assigned_tasks.contains(&task_id) {
            return Ok(());
        }
        if !agent.is_live() || !agent.has_spare_slot() {
            return Err(SwitchyardError::AgentAtCapacity(agent_id.to_string()));
        }
        agent.assigned_tasks.insert(task_id);
        agent.refresh_status();
        debug!(
            agent_id = %agent_id,
            task_id = %task_id,
            load = agent.current_load(),
            "Agent slot taken"
        );
        Ok(())
    }

    /// Free the slot `task_id` held on `agent_id`. Idempotent.
    pub fn mark_released(&mut self, agent_id: &str, task_id: Uuid) -> bool {
        let Some(agent) = self.agents.get_mut(agent_id) else {
            return false;
        };
        if !agent.assigned_tasks.remove(&task_id) {
            return false;
        }
        agent.refresh_status();
        debug!(
            agent_id = %agent_id,
            task_id = %task_id,
            load = agent.current_load(),
            "Agent slot released"
        );
        true
    }

    /// Demote silent agents to UNAVAILABLE, and drop those that stayed
    /// UNAVAILABLE past `grace`.
    pub fn sweep_liveness(
        &mut self,
        now: DateTime<Utc>,
        threshold: Duration,
        grace: Duration,
    ) -> LivenessSweep {
        let mut sweep = LivenessSweep::default();
        let threshold = span(threshold);
        let grace = span(grace);

        let mut expired_ids = Vec::new();
        for agent in self.agents.values_mut() {
            match agent.status {
                AgentStatus::Ready | AgentStatus::Busy => {
                    if now - agent.last_heartbeat > threshold {
                        agent.status = AgentStatus::Unavailable;
                        agent.unavailable_since = Some(now);
                        warn!(
                            agent_id = %agent.agent_id,
                            last_heartbeat = %agent.last_heartbeat,
                            "Agent missed heartbeats, marked unavailable"
                        );
                        sweep.unavailable.push(agent.agent_id.clone());
                    }
                }
                AgentStatus::Unavailable => {
                    let since = agent.unavailable_since.unwrap_or(now);
                    if now - since >= grace {
                        expired_ids.push(agent.agent_id.clone());
                    }
                }
                // Removed records never sit in the map.
                AgentStatus::Disconnected => {}
            }
        }

        for agent_id in expired_ids {
            warn!(agent_id = %agent_id, "Agent liveness grace expired");
            if let Some(agent) = self.deregister(&agent_id) {
                sweep
                    .expired
                    .push((agent_id, agent.assigned_tasks.into_iter().collect()));
            }
        }
        sweep
    }

    /// Look up a registered agent.
    pub fn get(&self, agent_id: &str) -> Option<&Agent> {
        self.agents.get(agent_id)
    }

    /// All agents in registration order.
    pub fn agents(&self) -> Vec<&Agent> {
        let mut agents: Vec<&Agent> = self.agents.values().collect();
        agents.sort_by_key(|a| a.registration_seq);
        agents
    }

    /// Registered agent count.
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether no agent is registered.
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn ms(n: i64) -> chrono::Duration {
        chrono::Duration::milliseconds(n)
    }

    #[test]
    fn test_register_ready_with_no_load() {
        let mut reg = AgentRegistry::new();
        let agent = reg
            .register("a1", vec![Capability::WebSearch], 2, t0())
            .unwrap();
        assert_eq!(agent.status, AgentStatus::Ready);
        assert_eq!(agent.current_load(), 0);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut reg = AgentRegistry::new();
        reg.register("a1", vec![Capability::WebSearch], 1, t0())
            .unwrap();
        let err = reg
            .register("a1", vec![Capability::Reasoning], 1, t0())
            .unwrap_err();
        assert!(matches!(err, SwitchyardError::DuplicateAgent(id) if id == "a1"));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut reg = AgentRegistry::new();
        assert!(reg.register("a1", vec![], 0, t0()).is_err());
    }

    #[test]
    fn test_reregister_after_deregister() {
        let mut reg = AgentRegistry::new();
        reg.register("a1", vec![Capability::WebSearch], 1, t0())
            .unwrap();
        let gone = reg.deregister("a1").unwrap();
        assert_eq!(gone.status, AgentStatus::Disconnected);
        assert!(gone.assigned_tasks.is_empty());
        assert!(reg.get("a1").is_none());
        assert!(reg.register("a1", vec![Capability::WebSearch], 1, t0()).is_ok());
    }

    #[test]
    fn test_find_eligible_orders_by_load_then_age() {
        let mut reg = AgentRegistry::new();
        let cap = Capability::WebSearch;
        reg.register("old", vec![cap.clone()], 3, t0()).unwrap();
        reg.register("mid", vec![cap.clone()], 3, t0()).unwrap();
        reg.register("new", vec![cap.clone()], 3, t0()).unwrap();
        reg.register("other", vec![Capability::CodeExec], 3, t0())
            .unwrap();

        reg.mark_assigned("old", Uuid::new_v4()).unwrap();

        let ids: Vec<&str> = reg
            .find_eligible(&cap)
            .iter()
            .map(|a| a.agent_id.as_str())
            .collect();
        assert_eq!(ids, vec!["mid", "new", "old"]);
    }

    #[test]
    fn test_busy_at_capacity_then_ready() {
        let mut reg = AgentRegistry::new();
        reg.register("a1", vec![Capability::CodeExec], 1, t0())
            .unwrap();
        let task = Uuid::new_v4();
        reg.mark_assigned("a1", task).unwrap();
        assert_eq!(reg.get("a1").unwrap().status, AgentStatus::Busy);
        assert!(reg.find_eligible(&Capability::CodeExec).is_empty());

        let err = reg.mark_assigned("a1", Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, SwitchyardError::AgentAtCapacity(_)));
        assert_eq!(reg.get("a1").unwrap().current_load(), 1);

        assert!(reg.mark_released("a1", task));
        assert!(!reg.mark_released("a1", task));
        let agent = reg.get("a1").unwrap();
        assert_eq!(agent.status, AgentStatus::Ready);
        assert_eq!(agent.current_load(), 0);
    }

    #[test]
    fn test_deregister_returns_held_tasks() {
        let mut reg = AgentRegistry::new();
        reg.register("a1", vec![Capability::Reasoning], 2, t0())
            .unwrap();
        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();
        reg.mark_assigned("a1", t1).unwrap();
        reg.mark_assigned("a1", t2).unwrap();

        let gone = reg.deregister("a1").unwrap();
        assert_eq!(gone.status, AgentStatus::Disconnected);
        assert_eq!(gone.assigned_tasks, BTreeSet::from([t1, t2]));
        assert!(reg.deregister("a1").is_none());
    }

    #[test]
    fn test_heartbeat_unknown_is_noop() {
        let mut reg = AgentRegistry::new();
        assert!(!reg.heartbeat("ghost", t0()));
    }

    #[test]
    fn test_liveness_sweep_unavailable_then_expired() {
        let mut reg = AgentRegistry::new();
        let threshold = Duration::from_millis(300);
        let grace = Duration::from_millis(500);
        reg.register("a1", vec![Capability::WebSearch], 1, t0())
            .unwrap();
        reg.register("a2", vec![Capability::WebSearch], 1, t0())
            .unwrap();
        let task = Uuid::new_v4();
        reg.mark_assigned("a1", task).unwrap();
        reg.heartbeat("a2", t0() + ms(250));

        let sweep = reg.sweep_liveness(t0() + ms(400), threshold, grace);
        assert_eq!(sweep.unavailable, vec!["a1".to_string()]);
        assert!(sweep.expired.is_empty());
        assert_eq!(reg.get("a1").unwrap().status, AgentStatus::Unavailable);
        assert!(reg.has_live_capability(&Capability::WebSearch));
        assert_eq!(reg.find_eligible(&Capability::WebSearch).len(), 1);

        let sweep = reg.sweep_liveness(t0() + ms(900), threshold, grace);
        assert_eq!(sweep.expired, vec![("a1".to_string(), vec![task])]);
        assert!(reg.get("a1").is_none());
        // a2 went silent at 250ms and is now past the threshold too.
        assert_eq!(sweep.unavailable, vec!["a2".to_string()]);
    }

    #[test]
    fn test_heartbeat_restores_unavailable() {
        let mut reg = AgentRegistry::new();
        reg.register("a1", vec![Capability::WebSearch], 1, t0())
            .unwrap();
        reg.sweep_liveness(
            t0() + ms(1000),
            Duration::from_millis(100),
            Duration::from_secs(10),
        );
        assert_eq!(reg.get("a1").unwrap().status, AgentStatus::Unavailable);
        assert!(reg.heartbeat("a1", t0() + ms(1100)));
        assert_eq!(reg.get("a1").unwrap().status, AgentStatus::Ready);
    }
}
