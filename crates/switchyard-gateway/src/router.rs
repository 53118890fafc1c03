use crate::connection::ConnectionManager;
use std::sync::Arc;
use switchyard_core::payload::{
    Ack, Cancel, Progress, Register, SubmitTask, TaskError, TaskResult,
};
use switchyard_core::{ErrorReason, Message, MessageType, WirePayload};
use switchyard_orchestrator::{
    ConnectionId, ControlPlane, Outbound, Outcome, Submitter, TaskRecorder, TaskSpec,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Routes decoded envelopes to the control plane and delivers the effects.
pub struct MessageRouter {
    plane: Arc<ControlPlane>,
    connections: Arc<ConnectionManager>,
    recorder: Arc<dyn TaskRecorder>,
}

impl MessageRouter {
    /// Router over shared plane, connection, and recorder handles.
    pub fn new(
        plane: Arc<ControlPlane>,
        connections: Arc<ConnectionManager>,
        recorder: Arc<dyn TaskRecorder>,
    ) -> Self {
        Self {
            plane,
            connections,
            recorder,
        }
    }

    /// The control plane this router drives.
    pub fn plane(&self) -> &Arc<ControlPlane> {
        &self.plane
    }

    /// Live connections and their agent bindings.
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Decode and handle one inbound frame. Malformed frames are logged and
    /// dropped; the connection stays open.
    pub async fn handle_frame(&self, connection_id: ConnectionId, frame: &[u8]) {
        match Message::decode_bytes(frame) {
            Ok(msg) => self.handle_message(connection_id, msg).await,
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "Dropped malformed frame");
            }
        }
    }

    /// Dispatch a decoded envelope by type.
    pub async fn handle_message(&self, connection_id: ConnectionId, msg: Message) {
        debug!(
            connection_id = %connection_id,
            kind = %msg.kind,
            message_id = %msg.message_id,
            "Inbound message"
        );
        match msg.kind {
            MessageType::Register => self.on_register(connection_id, &msg).await,
            MessageType::Heartbeat => self.on_heartbeat(connection_id).await,
            MessageType::Deregister => self.on_deregister(connection_id, &msg).await,
            MessageType::SubmitTask => self.on_submit(connection_id, &msg).await,
            MessageType::Cancel => self.on_cancel(connection_id, &msg).await,
            MessageType::Ack => self.on_agent_ack(connection_id, &msg).await,
            MessageType::Progress => self.on_progress(connection_id, &msg).await,
            MessageType::TaskResult => self.on_task_result(connection_id, &msg).await,
            MessageType::TaskError => self.on_task_error(connection_id, &msg).await,
            MessageType::Assign => {
                warn!(connection_id = %connection_id, "Peers may not send ASSIGN, dropped");
            }
        }
    }

    /// Parse a typed payload; reject with a correlated ACK on failure.
    async fn parse<P: WirePayload>(&self, connection_id: ConnectionId, msg: &Message) -> Option<P> {
        match msg.payload_as::<P>() {
            Ok(p) => Some(p),
            Err(e) => {
                warn!(connection_id = %connection_id, kind = %msg.kind, error = %e, "Bad payload");
                self.reply(
                    connection_id,
                    msg.message_id,
                    &Ack::rejected(ErrorReason::MalformedMessage, e.to_string()),
                )
                .await;
                None
            }
        }
    }

    async fn on_register(&self, connection_id: ConnectionId, msg: &Message) {
        let Some(reg) = self.parse::<Register>(connection_id, msg).await else {
            return;
        };
        if let Some(existing) = self.connections.agent_of(connection_id).await {
            if self.plane.agent(&existing).is_some() {
                let reject = Ack::rejected(
                    ErrorReason::InvalidRequest,
                    format!("connection already registered as '{existing}'"),
                );
                self.reply(connection_id, msg.message_id, &reject).await;
                return;
            }
            // Expired by the liveness sweep; the peer may register again.
            self.connections.unbind_agent(connection_id).await;
        }

        let agent_id = reg
            .agent_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("agent-{}", Uuid::new_v4().simple()));
        // Bound first: an ASSIGN produced by the registration needs the route.
        if !self.connections.bind_agent(connection_id, &agent_id).await {
            let reject = Ack::rejected(
                ErrorReason::DuplicateAgent,
                format!("Agent '{agent_id}' is already registered"),
            );
            self.reply(connection_id, msg.message_id, &reject).await;
            return;
        }

        match self
            .plane
            .register_agent(Some(agent_id), reg.capabilities, reg.max_concurrent)
        {
            Ok((agent, out)) => {
                info!(
                    connection_id = %connection_id,
                    agent_id = %agent.agent_id,
                    capabilities = agent.capabilities.len(),
                    max_concurrent = agent.max_concurrent,
                    "Agent registered"
                );
                self.reply(connection_id, msg.message_id, &Ack::agent(&agent.agent_id))
                    .await;
                self.deliver(out).await;
            }
            Err(e) => {
                self.connections.unbind_agent(connection_id).await;
                warn!(connection_id = %connection_id, error = %e, "Registration rejected");
                self.reply(
                    connection_id,
                    msg.message_id,
                    &Ack::rejected(e.reason(), e.to_string()),
                )
                .await;
            }
        }
    }

    async fn on_heartbeat(&self, connection_id: ConnectionId) {
        match self.connections.agent_of(connection_id).await {
            Some(agent_id) => {
                if !self.plane.heartbeat(&agent_id) {
                    debug!(agent_id = %agent_id, "Heartbeat from unregistered agent ignored");
                }
            }
            None => debug!(connection_id = %connection_id, "Heartbeat before registration ignored"),
        }
    }

    async fn on_deregister(&self, connection_id: ConnectionId, msg: &Message) {
        let Some(agent_id) = self.connections.unbind_agent(connection_id).await else {
            self.reply(
                connection_id,
                msg.message_id,
                &Ack::rejected(ErrorReason::InvalidRequest, "not registered"),
            )
            .await;
            return;
        };
        let out = self.plane.deregister_agent(&agent_id);
        self.reply(connection_id, msg.message_id, &Ack::agent(&agent_id))
            .await;
        self.deliver(out).await;
    }

    async fn on_submit(&self, connection_id: ConnectionId, msg: &Message) {
        let Some(submit) = self.parse::<SubmitTask>(connection_id, msg).await else {
            return;
        };
        let mut spec =
            TaskSpec::new(submit.capability, submit.payload).with_priority(submit.priority);
        if let Some(n) = submit.max_attempts {
            spec = spec.with_max_attempts(n);
        }
        if let Some(ms) = submit.timeout_ms {
            spec = spec.with_timeout(std::time::Duration::from_millis(ms));
        }
        let submitter = Submitter {
            connection_id,
            submission_id: msg.message_id,
        };

        match self.plane.submit(spec, submitter) {
            Ok((task_id, out)) => {
                self.reply(connection_id, msg.message_id, &Ack::task(task_id))
                    .await;
                self.deliver(out).await;
            }
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "Submission rejected");
                self.reply(
                    connection_id,
                    msg.message_id,
                    &Ack::rejected(e.reason(), e.to_string()),
                )
                .await;
            }
        }
    }

    async fn on_cancel(&self, connection_id: ConnectionId, msg: &Message) {
        let Some(Cancel { task_id }) = self.parse::<Cancel>(connection_id, msg).await else {
            return;
        };
        match self.plane.cancel(task_id) {
            Ok(out) => {
                self.reply(connection_id, msg.message_id, &Ack::task(task_id))
                    .await;
                self.deliver(out).await;
            }
            Err(e) => {
                let mut reject = Ack::rejected(e.reason(), e.to_string());
                reject.task_id = Some(task_id);
                self.reply(connection_id, msg.message_id, &reject).await;
            }
        }
    }

    /// An agent accepting (or refusing) an ASSIGN.
    async fn on_agent_ack(&self, connection_id: ConnectionId, msg: &Message) {
        let Some(agent_id) = self.agent_for(connection_id, msg).await else {
            return;
        };
        let Ok(ack) = msg.payload_as::<Ack>() else {
            warn!(agent_id = %agent_id, "Bad ACK payload dropped");
            return;
        };
        let Some(task_id) = ack.task_id else {
            debug!(agent_id = %agent_id, "ACK without task_id ignored");
            return;
        };
        if ack.ok {
            if !self.plane.acknowledge(task_id, &agent_id, msg.correlation_id) {
                debug!(agent_id = %agent_id, task_id = %task_id, "Stale ACK ignored");
            }
            return;
        }
        let outcome = Outcome::Failure {
            reason: ack.reason.unwrap_or(ErrorReason::AgentFailure),
            message: ack.message.unwrap_or_else(|| "assignment refused".into()),
        };
        let out = self
            .plane
            .report_result(task_id, &agent_id, msg.correlation_id, outcome);
        self.deliver(out).await;
    }

    async fn on_progress(&self, connection_id: ConnectionId, msg: &Message) {
        let Some(agent_id) = self.agent_for(connection_id, msg).await else {
            return;
        };
        let Ok(Progress { task_id, progress }) = msg.payload_as::<Progress>() else {
            warn!(agent_id = %agent_id, "Bad PROGRESS payload dropped");
            return;
        };
        let out = self
            .plane
            .progress(task_id, &agent_id, msg.correlation_id, progress);
        self.deliver(out).await;
    }

    async fn on_task_result(&self, connection_id: ConnectionId, msg: &Message) {
        let Some(agent_id) = self.agent_for(connection_id, msg).await else {
            return;
        };
        let Ok(TaskResult { task_id, output }) = msg.payload_as::<TaskResult>() else {
            warn!(agent_id = %agent_id, "Bad TASK_RESULT payload dropped");
            return;
        };
        let out = self.plane.report_result(
            task_id,
            &agent_id,
            msg.correlation_id,
            Outcome::Success(output),
        );
        self.deliver(out).await;
    }

    async fn on_task_error(&self, connection_id: ConnectionId, msg: &Message) {
        let Some(agent_id) = self.agent_for(connection_id, msg).await else {
            return;
        };
        let Ok(error) = msg.payload_as::<TaskError>() else {
            warn!(agent_id = %agent_id, "Bad TASK_ERROR payload dropped");
            return;
        };
        let Some(task_id) = error.task_id else {
            warn!(agent_id = %agent_id, "TASK_ERROR without task_id dropped");
            return;
        };
        let outcome = Outcome::Failure {
            reason: error.reason,
            message: error.message,
        };
        let out = self
            .plane
            .report_result(task_id, &agent_id, msg.correlation_id, outcome);
        self.deliver(out).await;
    }

    /// The agent bound to this connection; agent-only messages from other
    /// peers are dropped.
    async fn agent_for(&self, connection_id: ConnectionId, msg: &Message) -> Option<String> {
        let agent_id = self.connections.agent_of(connection_id).await;
        if agent_id.is_none() {
            warn!(
                connection_id = %connection_id,
                kind = %msg.kind,
                "Agent message from unregistered connection dropped"
            );
        }
        agent_id
    }

    async fn reply<P: WirePayload>(
        &self,
        connection_id: ConnectionId,
        request_id: Uuid,
        payload: &P,
    ) {
        let msg = Message::reply(request_id, payload);
        match msg.encode() {
            Ok(frame) => {
                if !self.connections.send(connection_id, &frame).await {
                    warn!(connection_id = %connection_id, kind = %msg.kind, "Reply undeliverable");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode reply"),
        }
    }

    /// Push every effect to its destination. Undeliverable messages are
    /// logged delivery failures; the task state is already settled.
    pub async fn deliver(&self, out: Vec<Outbound>) {
        for effect in out {
            match effect {
                Outbound::ToAgent { agent_id, message } => {
                    let Ok(frame) = message.encode() else {
                        warn!(agent_id = %agent_id, "Failed to encode agent message");
                        continue;
                    };
                    if !self.connections.send_to_agent(&agent_id, &frame).await {
                        warn!(
                            agent_id = %agent_id,
                            kind = %message.kind,
                            "Delivery to agent failed"
                        );
                    }
                }
                Outbound::ToSubmitter {
                    connection_id,
                    message,
                } => {
                    let Ok(frame) = message.encode() else {
                        warn!(connection_id = %connection_id, "Failed to encode submitter message");
                        continue;
                    };
                    if !self.connections.send(connection_id, &frame).await {
                        warn!(
                            connection_id = %connection_id,
                            kind = %message.kind,
                            "Delivery to submitter failed"
                        );
                    }
                }
                Outbound::Persist(record) => {
                    let recorder = self.recorder.clone();
                    tokio::spawn(async move {
                        if let Err(e) = recorder.record(&record).await {
                            warn!(task_id = %record.task_id, error = %e, "Failed to record task");
                        }
                    });
                }
                Outbound::Disconnect { agent_id } => {
                    // Dropping the connection ends its send task, which
                    // closes the socket.
                    if let Some(conn) = self.connections.remove_agent(&agent_id).await {
                        info!(
                            agent_id = %agent_id,
                            connection_id = %conn.id,
                            "Closing connection of expired agent"
                        );
                        self.plane.submitter_disconnected(conn.id);
                    }
                }
            }
        }
    }

    /// Cleanup after a connection closed: requeue work from an agent, and
    /// orphan tasks submitted over it.
    pub async fn connection_closed(&self, connection_id: ConnectionId) {
        let Some(conn) = self.connections.remove(connection_id).await else {
            return;
        };
        if let Some(agent_id) = conn.agent_id {
            info!(agent_id = %agent_id, "Agent connection lost");
            let out = self.plane.deregister_agent(&agent_id);
            self.deliver(out).await;
        }
        self.plane.submitter_disconnected(connection_id);
    }

    /// Cancel all in-flight work and notify peers.
    pub async fn shutdown(&self) {
        let out = self.plane.shutdown();
        self.deliver(out).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use chrono::Duration;
    use switchyard_core::config::{LivenessConfig, QueueConfig};
    use switchyard_core::Capability;
    use switchyard_orchestrator::NoopRecorder;
    use tokio::sync::mpsc;

    fn router() -> MessageRouter {
        let plane = ControlPlane::with_parts(
            QueueConfig::default(),
            LivenessConfig {
                heartbeat_interval_ms: 10,
                liveness_threshold_ms: 20,
                unavailable_grace_ms: 20,
            },
        );
        MessageRouter::new(
            Arc::new(plane),
            ConnectionManager::new(),
            Arc::new(NoopRecorder),
        )
    }

    async fn open(router: &MessageRouter) -> (ConnectionId, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        router.connections().add(Connection::new(id, tx)).await;
        (id, rx)
    }

    async fn register(
        router: &MessageRouter,
        connection_id: ConnectionId,
        rx: &mut mpsc::UnboundedReceiver<String>,
        agent_id: &str,
    ) -> Ack {
        let msg = Message::from_payload(
            agent_id,
            &Register {
                agent_id: Some(agent_id.into()),
                capabilities: vec![Capability::Reasoning],
                max_concurrent: 1,
            },
        );
        router.handle_message(connection_id, msg).await;
        let frame = rx.recv().await.unwrap();
        Message::decode(&frame).unwrap().payload_as().unwrap()
    }

    #[tokio::test]
    async fn test_expired_agent_connection_closed_and_id_reusable() {
        let router = router();
        let (first, mut first_rx) = open(&router).await;
        assert!(register(&router, first, &mut first_rx, "a1").await.ok);
        let since = router.plane().agent("a1").unwrap().last_heartbeat;

        let out = router.plane().tick_at(since + Duration::milliseconds(100));
        router.deliver(out).await;
        assert!(router.connections().state(first).await.is_some());

        let out = router.plane().tick_at(since + Duration::milliseconds(200));
        router.deliver(out).await;
        assert!(router.plane().agent("a1").is_none());
        assert!(router.connections().state(first).await.is_none());
        assert_eq!(router.connections().agent_count().await, 0);
        // Outbound queue released, so the socket's send task ends.
        assert!(first_rx.recv().await.is_none());

        let (second, mut second_rx) = open(&router).await;
        let ack = register(&router, second, &mut second_rx, "a1").await;
        assert!(ack.ok, "re-registration refused: {:?}", ack.message);
        assert_eq!(
            router.connections().agent_of(second).await.as_deref(),
            Some("a1")
        );
    }

    #[tokio::test]
    async fn test_oversized_submit_timeout_rejected() {
        let router = router();
        let (conn, mut rx) = open(&router).await;
        let submit = Message::from_payload(
            "peer",
            &SubmitTask {
                capability: Capability::Reasoning,
                payload: serde_json::json!({}),
                priority: 0,
                max_attempts: None,
                timeout_ms: Some(u64::MAX),
            },
        );
        router.handle_message(conn, submit).await;
        let reply = Message::decode(&rx.recv().await.unwrap()).unwrap();
        let ack: Ack = reply.payload_as().unwrap();
        assert!(!ack.ok);
        assert_eq!(ack.reason, Some(ErrorReason::InvalidRequest));
        assert_eq!(router.plane().stats().tasks.in_flight(), 0);
    }
}
