use crate::transport::{self, Transport};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::payload::{
    Ack, Assign, Cancel, Deregister, Heartbeat, Progress, Register, TaskError, TaskResult,
};
use switchyard_core::{
    Capability, ErrorReason, Message, MessageType, SwitchyardError, SwitchyardResult, WirePayload,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What an agent declares when it registers.
#[derive(Debug, Clone)]
pub struct Registration {
    /// Requested identity; the broker assigns one when absent.
    pub agent_id: Option<String>,
    /// Skills offered.
    pub capabilities: Vec<Capability>,
    /// Tasks held at once.
    pub max_concurrent: u32,
    /// Sent as a bearer token when the broker requires one.
    pub api_key: Option<String>,
    /// How long to wait for the registration ACK.
    pub ack_timeout: Duration,
}

impl Registration {
    /// Registration without a requested id or API key.
    pub fn new(capabilities: impl IntoIterator<Item = Capability>, max_concurrent: u32) -> Self {
        Self {
            agent_id: None,
            capabilities: capabilities.into_iter().collect(),
            max_concurrent,
            api_key: None,
            ack_timeout: Duration::from_secs(30),
        }
    }

    /// Request a specific agent id.
    pub fn with_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Authenticate with `api_key`.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

/// A task pushed to this agent.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    /// Task being worked.
    pub task_id: Uuid,
    /// Capability it requires.
    pub capability: Capability,
    /// Submitter's payload.
    pub payload: serde_json::Value,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Result must arrive by then.
    pub deadline: DateTime<Utc>,
    /// `message_id` of the ASSIGN; every reply is correlated to it.
    pub assignment_id: Uuid,
}

/// Something the broker asked of this agent.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// New work.
    Assigned(Assignment),
    /// Stop working on a task (cancelled or timed out).
    Cancelled {
        /// Task to abandon.
        task_id: Uuid,
    },
}

type AckWaiters = Arc<Mutex<HashMap<Uuid, oneshot::Sender<Ack>>>>;

/// Connection used by a worker process: receives assignments and reports
/// progress and results.
pub struct AgentClient {
    agent_id: String,
    outbound: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedReceiver<AgentEvent>,
    waiters: AckWaiters,
    ack_timeout: Duration,
}

impl AgentClient {
    /// Connect and register. Fails with [`SwitchyardError::Rejected`] when
    /// the broker refuses the registration (for example a duplicate id).
    pub async fn connect(url: &str, registration: Registration) -> SwitchyardResult<Self> {
        let Transport { outbound, inbound } =
            Transport::open(url, registration.api_key.as_deref()).await?;
        let waiters: AckWaiters = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, events) = mpsc::unbounded_channel();
        tokio::spawn(read_loop(inbound, waiters.clone(), events_tx));

        let sender = registration
            .agent_id
            .clone()
            .unwrap_or_else(|| "unregistered".into());
        let msg = Message::from_payload(
            sender,
            &Register {
                agent_id: registration.agent_id,
                capabilities: registration.capabilities,
                max_concurrent: registration.max_concurrent,
            },
        );
        let ack = request(&outbound, &waiters, &msg, registration.ack_timeout).await?;
        let agent_id = match (ack.ok, ack.agent_id.clone()) {
            (true, Some(id)) => id,
            _ => {
                return Err(SwitchyardError::Rejected {
                    reason: ack.reason.unwrap_or(ErrorReason::InvalidRequest),
                    message: ack.message.unwrap_or_default(),
                })
            }
        };
        info!(agent_id = %agent_id, "Agent registered with broker");

        Ok(Self {
            agent_id,
            outbound,
            events,
            waiters,
            ack_timeout: registration.ack_timeout,
        })
    }

    /// Identity granted by the broker.
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Next assignment or cancellation; `None` once the connection closes.
    pub async fn next_event(&mut self) -> Option<AgentEvent> {
        self.events.recv().await
    }

    /// Next assignment, skipping cancellations.
    pub async fn next_assignment(&mut self) -> Option<Assignment> {
        loop {
            match self.events.recv().await? {
                AgentEvent::Assigned(a) => return Some(a),
                AgentEvent::Cancelled { task_id } => {
                    debug!(task_id = %task_id, "Cancellation skipped");
                }
            }
        }
    }

    /// Accept an assignment; the task moves to RUNNING.
    pub fn ack(&self, assignment: &Assignment) -> SwitchyardResult<()> {
        self.reply(assignment, &Ack::task(assignment.task_id))
    }

    /// Relay intermediate output to the submitter.
    pub fn progress(
        &self,
        assignment: &Assignment,
        progress: serde_json::Value,
    ) -> SwitchyardResult<()> {
        self.reply(
            assignment,
            &Progress {
                task_id: assignment.task_id,
                progress,
            },
        )
    }

    /// Report success.
    pub fn complete(
        &self,
        assignment: &Assignment,
        output: serde_json::Value,
    ) -> SwitchyardResult<()> {
        self.reply(
            assignment,
            &TaskResult {
                task_id: assignment.task_id,
                output,
            },
        )
    }

    /// Report a failed attempt. The broker retries or fails the task.
    pub fn fail(
        &self,
        assignment: &Assignment,
        message: impl Into<String>,
    ) -> SwitchyardResult<()> {
        self.reply(
            assignment,
            &TaskError::new(
                Some(assignment.task_id),
                ErrorReason::AgentFailure,
                message,
            ),
        )
    }

    /// Send one liveness ping.
    pub fn heartbeat(&self) -> SwitchyardResult<()> {
        let msg = Message::from_payload(self.agent_id.clone(), &Heartbeat::default());
        transport::send(&self.outbound, &msg)
    }

    /// Send heartbeats every `interval` until the connection closes.
    pub fn spawn_heartbeat(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let outbound = self.outbound.clone();
        let agent_id = self.agent_id.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let msg = Message::from_payload(agent_id.clone(), &Heartbeat::default());
                if transport::send(&outbound, &msg).is_err() {
                    debug!(agent_id = %agent_id, "Heartbeat loop stopped");
                    break;
                }
            }
        })
    }

    /// Leave the broker. Tasks still held are requeued there.
    pub async fn deregister(self) -> SwitchyardResult<()> {
        let msg = Message::from_payload(self.agent_id.clone(), &Deregister::default());
        let ack = request(&self.outbound, &self.waiters, &msg, self.ack_timeout).await?;
        if ack.ok {
            info!(agent_id = %self.agent_id, "Agent deregistered");
            Ok(())
        } else {
            Err(SwitchyardError::Rejected {
                reason: ack.reason.unwrap_or(ErrorReason::InvalidRequest),
                message: ack.message.unwrap_or_default(),
            })
        }
    }

    fn reply<P: WirePayload>(&self, assignment: &Assignment, payload: &P) -> SwitchyardResult<()> {
        let msg = Message::from_payload(self.agent_id.clone(), payload)
            .correlated(assignment.assignment_id);
        transport::send(&self.outbound, &msg)
    }
}

async fn request(
    outbound: &mpsc::UnboundedSender<String>,
    waiters: &AckWaiters,
    msg: &Message,
    timeout: Duration,
) -> SwitchyardResult<Ack> {
    let (tx, rx) = oneshot::channel();
    waiters.lock().insert(msg.message_id, tx);
    if let Err(e) = transport::send(outbound, msg) {
        waiters.lock().remove(&msg.message_id);
        return Err(e);
    }
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(ack)) => Ok(ack),
        Ok(Err(_)) => Err(SwitchyardError::Transport("connection closed".into())),
        Err(_) => {
            waiters.lock().remove(&msg.message_id);
            Err(SwitchyardError::ClientTimeout(timeout))
        }
    }
}

async fn read_loop(
    mut inbound: mpsc::UnboundedReceiver<Message>,
    waiters: AckWaiters,
    events: mpsc::UnboundedSender<AgentEvent>,
) {
    while let Some(msg) = inbound.recv().await {
        match msg.kind {
            MessageType::Assign => match msg.payload_as::<Assign>() {
                Ok(assign) => {
                    let assignment = Assignment {
                        task_id: assign.task_id,
                        capability: assign.capability,
                        payload: assign.payload,
                        attempt: assign.attempt,
                        deadline: assign.deadline,
                        assignment_id: msg.message_id,
                    };
                    if events.send(AgentEvent::Assigned(assignment)).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Bad ASSIGN payload"),
            },
            MessageType::Cancel => {
                if let Ok(Cancel { task_id }) = msg.payload_as::<Cancel>() {
                    let _ = events.send(AgentEvent::Cancelled { task_id });
                }
            }
            MessageType::Ack => {
                let waiter = msg
                    .correlation_id
                    .and_then(|id| waiters.lock().remove(&id));
                match (waiter, msg.payload_as::<Ack>()) {
                    (Some(tx), Ok(ack)) => {
                        let _ = tx.send(ack);
                    }
                    (None, _) => debug!("Uncorrelated ACK ignored"),
                    (Some(_), Err(e)) => warn!(error = %e, "Bad ACK payload"),
                }
            }
            other => debug!(kind = %other, "Unexpected message for agent ignored"),
        }
    }
    waiters.lock().clear();
    debug!("Agent connection closed");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use switchyard_core::BROKER_SENDER;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::WebSocketStream;

    type Ws = WebSocketStream<TcpStream>;

    async fn listen() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    async fn accept(listener: &TcpListener) -> Ws {
        let (stream, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    }

    async fn recv(ws: &mut Ws) -> Message {
        loop {
            if let WsMessage::Text(text) = ws.next().await.unwrap().unwrap() {
                return Message::decode(&text).unwrap();
            }
        }
    }

    async fn send(ws: &mut Ws, msg: &Message) {
        ws.send(WsMessage::Text(msg.encode().unwrap())).await.unwrap();
    }

    /// Accepts one agent and grants `agent_id`.
    async fn accept_registration(listener: &TcpListener, agent_id: &str) -> (Ws, Register) {
        let mut ws = accept(listener).await;
        let register = recv(&mut ws).await;
        assert_eq!(register.kind, MessageType::Register);
        let body: Register = register.payload_as().unwrap();
        send(&mut ws, &Message::reply(register.message_id, &Ack::agent(agent_id))).await;
        (ws, body)
    }

    #[tokio::test]
    async fn test_register_assign_complete() {
        let (listener, url) = listen().await;
        let task_id = Uuid::new_v4();
        let broker = tokio::spawn(async move {
            let (mut ws, register) = accept_registration(&listener, "agent-7").await;
            assert!(register.agent_id.is_none());
            assert_eq!(register.max_concurrent, 2);

            let assign = Message::from_payload(
                BROKER_SENDER,
                &Assign {
                    task_id,
                    capability: Capability::WebSearch,
                    payload: json!({"q": "rust"}),
                    attempt: 1,
                    deadline: Utc::now(),
                },
            );
            let assignment_id = assign.message_id;
            send(&mut ws, &assign).await;

            let ack = recv(&mut ws).await;
            assert_eq!(ack.kind, MessageType::Ack);
            assert_eq!(ack.correlation_id, Some(assignment_id));
            assert_eq!(ack.sender_id, "agent-7");

            let progress = recv(&mut ws).await;
            assert_eq!(progress.kind, MessageType::Progress);

            let result = recv(&mut ws).await;
            assert_eq!(result.kind, MessageType::TaskResult);
            assert_eq!(result.correlation_id, Some(assignment_id));
            let body: TaskResult = result.payload_as().unwrap();
            assert_eq!(body.output, json!({"hits": 3}));
            ws
        });

        let mut agent = AgentClient::connect(&url, Registration::new([Capability::WebSearch], 2))
            .await
            .unwrap();
        assert_eq!(agent.agent_id(), "agent-7");

        let assignment = agent.next_assignment().await.unwrap();
        assert_eq!(assignment.task_id, task_id);
        assert_eq!(assignment.attempt, 1);
        agent.ack(&assignment).unwrap();
        agent.progress(&assignment, json!({"pct": 10})).unwrap();
        agent.complete(&assignment, json!({"hits": 3})).unwrap();
        drop(broker.await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let (listener, url) = listen().await;
        let broker = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            let register = recv(&mut ws).await;
            let ack = Ack::rejected(ErrorReason::DuplicateAgent, "agent-1 already registered");
            send(&mut ws, &Message::reply(register.message_id, &ack)).await;
            ws
        });

        let registration = Registration::new([Capability::Reasoning], 1).with_id("agent-1");
        let err = AgentClient::connect(&url, registration).await.err().unwrap();
        assert!(matches!(
            err,
            SwitchyardError::Rejected {
                reason: ErrorReason::DuplicateAgent,
                ..
            }
        ));
        drop(broker.await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_event_and_failure_report() {
        let (listener, url) = listen().await;
        let task_id = Uuid::new_v4();
        let broker = tokio::spawn(async move {
            let (mut ws, _) = accept_registration(&listener, "agent-2").await;
            let assign = Message::from_payload(
                BROKER_SENDER,
                &Assign {
                    task_id,
                    capability: Capability::CodeExec,
                    payload: json!({}),
                    attempt: 2,
                    deadline: Utc::now(),
                },
            );
            send(&mut ws, &assign).await;
            let error = recv(&mut ws).await;
            assert_eq!(error.kind, MessageType::TaskError);
            assert_eq!(error.correlation_id, Some(assign.message_id));
            let body: TaskError = error.payload_as().unwrap();
            assert_eq!(body.reason, ErrorReason::AgentFailure);

            send(&mut ws, &Message::from_payload(BROKER_SENDER, &Cancel { task_id })).await;
            ws
        });

        let mut agent = AgentClient::connect(&url, Registration::new([Capability::CodeExec], 1))
            .await
            .unwrap();
        let assignment = match agent.next_event().await.unwrap() {
            AgentEvent::Assigned(a) => a,
            other => panic!("expected assignment, got {other:?}"),
        };
        agent.fail(&assignment, "sandbox crashed").unwrap();
        assert_eq!(
            agent.next_event().await.unwrap(),
            AgentEvent::Cancelled { task_id }
        );
        drop(broker.await.unwrap());
    }

    #[tokio::test]
    async fn test_heartbeat_and_deregister() {
        let (listener, url) = listen().await;
        let broker = tokio::spawn(async move {
            let (mut ws, _) = accept_registration(&listener, "agent-3").await;
            let mut heartbeats = 0;
            loop {
                let msg = recv(&mut ws).await;
                match msg.kind {
                    MessageType::Heartbeat => heartbeats += 1,
                    MessageType::Deregister => {
                        send(&mut ws, &Message::reply(msg.message_id, &Ack::agent("agent-3")))
                            .await;
                        break;
                    }
                    other => panic!("unexpected {other}"),
                }
            }
            heartbeats
        });

        let agent = AgentClient::connect(&url, Registration::new([Capability::Reasoning], 1))
            .await
            .unwrap();
        agent.heartbeat().unwrap();
        let beat = agent.spawn_heartbeat(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        beat.abort();
        agent.deregister().await.unwrap();

        assert!(broker.await.unwrap() >= 2);
    }
}
