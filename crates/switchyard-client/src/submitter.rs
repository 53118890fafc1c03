use crate::transport::{self, Transport};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::payload::{Ack, Cancel, Progress, SubmitTask, TaskError, TaskResult};
use switchyard_core::{
    Capability, ErrorReason, Message, MessageType, SwitchyardError, SwitchyardResult,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Client-side timing and identity.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `sender_id` on outgoing envelopes.
    pub sender_id: String,
    /// How long to wait for the broker to ACK a request.
    pub ack_timeout: Duration,
    /// Ceiling on waiting for a task's final result.
    pub result_timeout: Duration,
    /// Sent as `Authorization: Bearer <key>` when set.
    pub api_key: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            sender_id: "orchestrator".into(),
            ack_timeout: Duration::from_secs(30),
            result_timeout: Duration::from_secs(600),
            api_key: None,
        }
    }
}

/// A task to submit.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Required capability.
    pub capability: Capability,
    /// Opaque to the broker.
    pub payload: serde_json::Value,
    /// Higher runs first.
    pub priority: i32,
    /// Overrides the broker's retry budget.
    pub max_attempts: Option<u32>,
    /// Overrides the broker's per-attempt timeout.
    pub timeout: Option<Duration>,
}

impl SubmitRequest {
    /// Request with default priority and broker-side limits.
    pub fn new(capability: impl Into<Capability>, payload: serde_json::Value) -> Self {
        Self {
            capability: capability.into(),
            payload,
            priority: 0,
            max_attempts: None,
            timeout: None,
        }
    }

    /// Set the priority.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry budget.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set the per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// How a submitted task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Agent output.
    Completed(serde_json::Value),
    /// Terminal failure with attempt history.
    Failed(TaskError),
    /// Cancelled before it finished.
    Cancelled,
}

struct PendingSubmission {
    task_id: Option<Uuid>,
    capability: Capability,
    accepted: Option<oneshot::Sender<SwitchyardResult<Uuid>>>,
    outcome: Option<oneshot::Sender<SwitchyardResult<TaskOutcome>>>,
    progress: mpsc::UnboundedSender<serde_json::Value>,
}

#[derive(Default)]
struct Shared {
    /// Keyed by the SUBMIT_TASK `message_id`.
    submissions: HashMap<Uuid, PendingSubmission>,
    /// Plain request/ACK exchanges, keyed by request `message_id`.
    acks: HashMap<Uuid, oneshot::Sender<Ack>>,
    closed: bool,
}

/// Connection used by an orchestrator to submit tasks and await their
/// correlated results.
pub struct SubmitterClient {
    outbound: mpsc::UnboundedSender<String>,
    shared: Arc<Mutex<Shared>>,
    config: ClientConfig,
}

impl SubmitterClient {
    /// Connect with [`ClientConfig::default`].
    pub async fn connect(url: &str) -> SwitchyardResult<Self> {
        Self::connect_with(url, ClientConfig::default()).await
    }

    /// Connect with explicit settings.
    pub async fn connect_with(url: &str, config: ClientConfig) -> SwitchyardResult<Self> {
        let Transport { outbound, inbound } =
            Transport::open(url, config.api_key.as_deref()).await?;
        let shared = Arc::new(Mutex::new(Shared::default()));
        tokio::spawn(read_loop(inbound, shared.clone()));
        info!(url = %url, sender_id = %config.sender_id, "Submitter connected");
        Ok(Self {
            outbound,
            shared,
            config,
        })
    }

    /// Submit a task and wait for the broker to accept it. Rejections
    /// (backpressure, shutdown, bad request) surface as
    /// [`SwitchyardError::Rejected`].
    pub async fn submit(&self, request: SubmitRequest) -> SwitchyardResult<PendingTask> {
        let capability = request.capability.clone();
        let payload = SubmitTask {
            capability: request.capability,
            payload: request.payload,
            priority: request.priority,
            max_attempts: request.max_attempts,
            timeout_ms: request
                .timeout
                .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
        };
        let msg = Message::from_payload(self.config.sender_id.clone(), &payload);
        let submission_id = msg.message_id;

        let (accepted_tx, accepted_rx) = oneshot::channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        {
            let mut shared = self.shared.lock();
            if shared.closed {
                return Err(SwitchyardError::Transport("connection closed".into()));
            }
            shared.submissions.insert(
                submission_id,
                PendingSubmission {
                    task_id: None,
                    capability: capability.clone(),
                    accepted: Some(accepted_tx),
                    outcome: Some(outcome_tx),
                    progress: progress_tx,
                },
            );
        }

        if let Err(e) = transport::send(&self.outbound, &msg) {
            self.shared.lock().submissions.remove(&submission_id);
            return Err(e);
        }

        let task_id = match tokio::time::timeout(self.config.ack_timeout, accepted_rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(SwitchyardError::Transport("connection closed".into())),
            Err(_) => {
                self.shared.lock().submissions.remove(&submission_id);
                return Err(SwitchyardError::ClientTimeout(self.config.ack_timeout));
            }
        };
        debug!(task_id = %task_id, submission_id = %submission_id, "Task accepted");

        Ok(PendingTask {
            task_id,
            submission_id,
            capability,
            outcome: outcome_rx,
            progress: Some(progress_rx),
            ceiling: self.config.result_timeout,
            shared: self.shared.clone(),
        })
    }

    /// Ask the broker to cancel a task. Its handle resolves to
    /// [`TaskOutcome::Cancelled`].
    pub async fn cancel(&self, task: &PendingTask) -> SwitchyardResult<()> {
        self.cancel_by_id(task.task_id).await
    }

    /// Cancel by id; the task need not have been submitted over this
    /// connection.
    pub async fn cancel_by_id(&self, task_id: Uuid) -> SwitchyardResult<()> {
        let msg = Message::from_payload(self.config.sender_id.clone(), &Cancel { task_id });
        let ack = self.request(&msg).await?;
        if !ack.ok {
            return Err(rejection(ack));
        }
        let mut shared = self.shared.lock();
        let submission = shared
            .submissions
            .iter()
            .find(|(_, p)| p.task_id == Some(task_id))
            .map(|(id, _)| *id);
        if let Some(mut pending) = submission.and_then(|id| shared.submissions.remove(&id)) {
            if let Some(tx) = pending.outcome.take() {
                let _ = tx.send(Ok(TaskOutcome::Cancelled));
            }
        }
        Ok(())
    }

    /// Submit and wait for the final outcome.
    pub async fn run(&self, request: SubmitRequest) -> SwitchyardResult<TaskOutcome> {
        self.submit(request).await?.wait().await
    }

    /// Outstanding submissions.
    pub fn pending_count(&self) -> usize {
        self.shared.lock().submissions.len()
    }

    /// Whether the broker connection has dropped.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    async fn request(&self, msg: &Message) -> SwitchyardResult<Ack> {
        let (tx, rx) = oneshot::channel();
        {
            let mut shared = self.shared.lock();
            if shared.closed {
                return Err(SwitchyardError::Transport("connection closed".into()));
            }
            shared.acks.insert(msg.message_id, tx);
        }
        if let Err(e) = transport::send(&self.outbound, msg) {
            self.shared.lock().acks.remove(&msg.message_id);
            return Err(e);
        }
        match tokio::time::timeout(self.config.ack_timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(SwitchyardError::Transport("connection closed".into())),
            Err(_) => {
                self.shared.lock().acks.remove(&msg.message_id);
                Err(SwitchyardError::ClientTimeout(self.config.ack_timeout))
            }
        }
    }
}

/// Handle to an accepted task.
pub struct PendingTask {
    task_id: Uuid,
    submission_id: Uuid,
    capability: Capability,
    outcome: oneshot::Receiver<SwitchyardResult<TaskOutcome>>,
    progress: Option<mpsc::UnboundedReceiver<serde_json::Value>>,
    ceiling: Duration,
    shared: Arc<Mutex<Shared>>,
}

impl PendingTask {
    /// Broker-assigned task id.
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// Progress updates relayed from the agent. Can be taken once.
    pub fn take_progress(&mut self) -> Option<mpsc::UnboundedReceiver<serde_json::Value>> {
        self.progress.take()
    }

    /// Override the client-side ceiling for this task.
    pub fn with_ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = ceiling;
        self
    }

    /// Wait for TASK_RESULT or TASK_ERROR, or fail with
    /// [`SwitchyardError::ClientTimeout`] after the ceiling.
    pub async fn wait(self) -> SwitchyardResult<TaskOutcome> {
        match tokio::time::timeout(self.ceiling, self.outcome).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(SwitchyardError::Transport("connection closed".into())),
            Err(_) => {
                self.shared.lock().submissions.remove(&self.submission_id);
                warn!(
                    task_id = %self.task_id,
                    ceiling_ms = self.ceiling.as_millis() as u64,
                    "Gave up waiting for task"
                );
                Err(SwitchyardError::ClientTimeout(self.ceiling))
            }
        }
    }

    /// Like [`wait`](Self::wait), but a failed or cancelled task comes
    /// back as its typed error.
    pub async fn output(self) -> SwitchyardResult<serde_json::Value> {
        let capability = self.capability.clone();
        match self.wait().await? {
            TaskOutcome::Completed(output) => Ok(output),
            TaskOutcome::Failed(error) => Err(error.into_error(&capability)),
            TaskOutcome::Cancelled => Err(SwitchyardError::Rejected {
                reason: ErrorReason::Cancelled,
                message: "task cancelled".into(),
            }),
        }
    }
}

fn rejection(ack: Ack) -> SwitchyardError {
    SwitchyardError::Rejected {
        reason: ack.reason.unwrap_or(ErrorReason::InvalidRequest),
        message: ack.message.unwrap_or_default(),
    }
}

async fn read_loop(mut inbound: mpsc::UnboundedReceiver<Message>, shared: Arc<Mutex<Shared>>) {
    while let Some(msg) = inbound.recv().await {
        let Some(correlation) = msg.correlation_id else {
            debug!(kind = %msg.kind, "Uncorrelated message ignored");
            continue;
        };
        let mut state = shared.lock();
        match msg.kind {
            MessageType::Ack => {
                let Ok(ack) = msg.payload_as::<Ack>() else {
                    warn!("Bad ACK payload from broker");
                    continue;
                };
                if let Some(tx) = state.acks.remove(&correlation) {
                    let _ = tx.send(ack);
                    continue;
                }
                let Some(pending) = state.submissions.get_mut(&correlation) else {
                    continue;
                };
                let Some(tx) = pending.accepted.take() else {
                    continue;
                };
                match ack.task_id.filter(|_| ack.ok) {
                    Some(task_id) => {
                        pending.task_id = Some(task_id);
                        let _ = tx.send(Ok(task_id));
                    }
                    None => {
                        state.submissions.remove(&correlation);
                        let _ = tx.send(Err(rejection(ack)));
                    }
                }
            }
            MessageType::TaskResult => {
                let Some(mut pending) = state.submissions.remove(&correlation) else {
                    debug!(correlation_id = %correlation, "Result for unknown submission");
                    continue;
                };
                let outcome = msg
                    .payload_as::<TaskResult>()
                    .map(|r| TaskOutcome::Completed(r.output));
                if let Some(tx) = pending.outcome.take() {
                    let _ = tx.send(outcome);
                }
            }
            MessageType::TaskError => {
                let Some(mut pending) = state.submissions.remove(&correlation) else {
                    debug!(correlation_id = %correlation, "Error for unknown submission");
                    continue;
                };
                let error = msg.payload_as::<TaskError>();
                if let Some(tx) = pending.accepted.take() {
                    // Terminal before the ACK was seen: submit fails with
                    // the broker's reason.
                    let rejected = match &error {
                        Ok(e) => e.clone().into_error(&pending.capability),
                        Err(e) => SwitchyardError::MalformedMessage(e.to_string()),
                    };
                    let _ = tx.send(Err(rejected));
                }
                let outcome = error.map(|e| {
                    if e.reason == ErrorReason::Cancelled {
                        TaskOutcome::Cancelled
                    } else {
                        TaskOutcome::Failed(e)
                    }
                });
                if let Some(tx) = pending.outcome.take() {
                    let _ = tx.send(outcome);
                }
            }
            MessageType::Progress => {
                if let (Some(pending), Ok(p)) = (
                    state.submissions.get(&correlation),
                    msg.payload_as::<Progress>(),
                ) {
                    let _ = pending.progress.send(p.progress);
                }
            }
            other => debug!(kind = %other, "Unexpected message for submitter ignored"),
        }
    }

    // Connection lost: every outstanding handle fails.
    let mut state = shared.lock();
    state.closed = true;
    let lost = state.submissions.len();
    let gone = || SwitchyardError::Transport("connection lost".into());
    for (_, mut pending) in state.submissions.drain() {
        if let Some(tx) = pending.accepted.take() {
            let _ = tx.send(Err(gone()));
        }
        if let Some(tx) = pending.outcome.take() {
            let _ = tx.send(Err(gone()));
        }
    }
    state.acks.clear();
    if lost > 0 {
        warn!(pending = lost, "Broker connection lost with tasks outstanding");
    } else {
        info!("Broker connection closed");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::WebSocketStream;

    async fn listen() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
        let (stream, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    }

    async fn recv(ws: &mut WebSocketStream<TcpStream>) -> Message {
        loop {
            match ws.next().await.unwrap().unwrap() {
                WsMessage::Text(text) => return Message::decode(&text).unwrap(),
                _ => continue,
            }
        }
    }

    async fn send(ws: &mut WebSocketStream<TcpStream>, msg: &Message) {
        ws.send(WsMessage::Text(msg.encode().unwrap())).await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_and_complete() {
        let (listener, url) = listen().await;
        let task_id = Uuid::new_v4();
        let broker = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            let submit = recv(&mut ws).await;
            assert_eq!(submit.kind, MessageType::SubmitTask);
            let body: SubmitTask = submit.payload_as().unwrap();
            assert_eq!(body.priority, 5);
            assert_eq!(body.timeout_ms, Some(2_000));
            send(&mut ws, &Message::reply(submit.message_id, &Ack::task(task_id))).await;
            let progress = Progress {
                task_id,
                progress: json!({"pct": 50}),
            };
            send(&mut ws, &Message::reply(submit.message_id, &progress)).await;
            let result = TaskResult {
                task_id,
                output: json!({"answer": 42}),
            };
            send(&mut ws, &Message::reply(submit.message_id, &result)).await;
            ws
        });

        let client = SubmitterClient::connect(&url).await.unwrap();
        let request = SubmitRequest::new("reasoning", json!({"q": "?"}))
            .priority(5)
            .timeout(Duration::from_secs(2));
        let mut pending = client.submit(request).await.unwrap();
        assert_eq!(pending.task_id(), task_id);

        let mut progress = pending.take_progress().unwrap();
        assert_eq!(progress.recv().await.unwrap(), json!({"pct": 50}));
        assert!(pending.take_progress().is_none());

        let outcome = pending.wait().await.unwrap();
        assert_eq!(outcome, TaskOutcome::Completed(json!({"answer": 42})));
        assert_eq!(client.pending_count(), 0);
        drop(broker.await.unwrap());
    }

    #[tokio::test]
    async fn test_rejected_submission() {
        let (listener, url) = listen().await;
        let broker = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            let submit = recv(&mut ws).await;
            let ack = Ack::rejected(ErrorReason::QueueFull, "queue is full");
            send(&mut ws, &Message::reply(submit.message_id, &ack)).await;
            ws
        });

        let client = SubmitterClient::connect(&url).await.unwrap();
        let err = client
            .submit(SubmitRequest::new("web_search", json!({})))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            SwitchyardError::Rejected {
                reason: ErrorReason::QueueFull,
                ..
            }
        ));
        assert_eq!(client.pending_count(), 0);
        drop(broker.await.unwrap());
    }

    #[tokio::test]
    async fn test_terminal_error_and_cancel_mapping() {
        let (listener, url) = listen().await;
        let failed = Uuid::new_v4();
        let cancelled = Uuid::new_v4();
        let broker = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            let first = recv(&mut ws).await;
            send(&mut ws, &Message::reply(first.message_id, &Ack::task(failed))).await;
            let second = recv(&mut ws).await;
            send(&mut ws, &Message::reply(second.message_id, &Ack::task(cancelled))).await;

            let exhausted = TaskError::new(
                Some(failed),
                ErrorReason::TaskRetryExhausted,
                "all attempts failed",
            );
            send(&mut ws, &Message::reply(first.message_id, &exhausted)).await;
            let cancel = TaskError::new(Some(cancelled), ErrorReason::Cancelled, "cancelled");
            send(&mut ws, &Message::reply(second.message_id, &cancel)).await;
            ws
        });

        let client = SubmitterClient::connect(&url).await.unwrap();
        let a = client
            .submit(SubmitRequest::new("code_exec", json!({})))
            .await
            .unwrap();
        let b = client
            .submit(SubmitRequest::new("code_exec", json!({})))
            .await
            .unwrap();

        match a.wait().await.unwrap() {
            TaskOutcome::Failed(e) => assert_eq!(e.reason, ErrorReason::TaskRetryExhausted),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(b.wait().await.unwrap(), TaskOutcome::Cancelled);
        drop(broker.await.unwrap());
    }

    #[tokio::test]
    async fn test_output_maps_terminal_failures() {
        let (listener, url) = listen().await;
        let timed_out = Uuid::new_v4();
        let starved = Uuid::new_v4();
        let broker = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            let first = recv(&mut ws).await;
            send(&mut ws, &Message::reply(first.message_id, &Ack::task(timed_out))).await;
            let second = recv(&mut ws).await;
            send(&mut ws, &Message::reply(second.message_id, &Ack::task(starved))).await;

            let mut timeout = TaskError::new(Some(timed_out), ErrorReason::TaskTimeout, "late");
            timeout.attempts = vec![switchyard_core::payload::AttemptRecord {
                attempt: 1,
                agent_id: "a1".into(),
                reason: ErrorReason::TaskTimeout,
                message: "deadline passed".into(),
                at: chrono::Utc::now(),
            }];
            send(&mut ws, &Message::reply(first.message_id, &timeout)).await;
            let mismatch =
                TaskError::new(Some(starved), ErrorReason::CapabilityMismatch, "no agent");
            send(&mut ws, &Message::reply(second.message_id, &mismatch)).await;
            ws
        });

        let client = SubmitterClient::connect(&url).await.unwrap();
        let a = client
            .submit(SubmitRequest::new("reasoning", json!({})))
            .await
            .unwrap();
        let b = client
            .submit(SubmitRequest::new("translate", json!({})))
            .await
            .unwrap();

        assert!(matches!(
            a.output().await.unwrap_err(),
            SwitchyardError::TaskTimeout { attempts: 1 }
        ));
        match b.output().await.unwrap_err() {
            SwitchyardError::CapabilityMismatch(cap) => assert_eq!(cap, "translate"),
            other => panic!("expected capability mismatch, got {other:?}"),
        }
        drop(broker.await.unwrap());
    }

    #[tokio::test]
    async fn test_error_before_ack_keeps_broker_reason() {
        let (listener, url) = listen().await;
        let broker = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            let submit = recv(&mut ws).await;
            let error = TaskError::new(None, ErrorReason::Shutdown, "broker draining");
            send(&mut ws, &Message::reply(submit.message_id, &error)).await;
            let second = recv(&mut ws).await;
            let error = TaskError::new(None, ErrorReason::InvalidRequest, "bad payload");
            send(&mut ws, &Message::reply(second.message_id, &error)).await;
            ws
        });

        let client = SubmitterClient::connect(&url).await.unwrap();
        let err = client
            .submit(SubmitRequest::new("reasoning", json!({})))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SwitchyardError::ShuttingDown));

        let err = client
            .submit(SubmitRequest::new("reasoning", json!({})))
            .await
            .err()
            .unwrap();
        match err {
            SwitchyardError::Rejected { reason, message } => {
                assert_eq!(reason, ErrorReason::InvalidRequest);
                assert_eq!(message, "bad payload");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(client.pending_count(), 0);
        drop(broker.await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_resolves_handle() {
        let (listener, url) = listen().await;
        let task_id = Uuid::new_v4();
        let broker = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            let submit = recv(&mut ws).await;
            send(&mut ws, &Message::reply(submit.message_id, &Ack::task(task_id))).await;
            let cancel = recv(&mut ws).await;
            assert_eq!(cancel.kind, MessageType::Cancel);
            let body: Cancel = cancel.payload_as().unwrap();
            assert_eq!(body.task_id, task_id);
            send(&mut ws, &Message::reply(cancel.message_id, &Ack::task(task_id))).await;
            ws
        });

        let client = SubmitterClient::connect(&url).await.unwrap();
        let pending = client
            .submit(SubmitRequest::new("reasoning", json!({})))
            .await
            .unwrap();
        client.cancel(&pending).await.unwrap();
        assert_eq!(pending.wait().await.unwrap(), TaskOutcome::Cancelled);
        drop(broker.await.unwrap());
    }

    #[tokio::test]
    async fn test_connection_loss_fails_pending() {
        let (listener, url) = listen().await;
        let broker = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            let submit = recv(&mut ws).await;
            send(&mut ws, &Message::reply(submit.message_id, &Ack::task(Uuid::new_v4()))).await;
            ws.close(None).await.unwrap();
        });

        let client = SubmitterClient::connect(&url).await.unwrap();
        let pending = client
            .submit(SubmitRequest::new("reasoning", json!({})))
            .await
            .unwrap();
        broker.await.unwrap();

        let err = pending.wait().await.unwrap_err();
        assert!(matches!(err, SwitchyardError::Transport(_)));
        assert!(client.is_closed());
        assert!(client
            .submit(SubmitRequest::new("reasoning", json!({})))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_wait_ceiling() {
        let (listener, url) = listen().await;
        let broker = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            let submit = recv(&mut ws).await;
            send(&mut ws, &Message::reply(submit.message_id, &Ack::task(Uuid::new_v4()))).await;
            ws
        });

        let client = SubmitterClient::connect(&url).await.unwrap();
        let pending = client
            .submit(SubmitRequest::new("reasoning", json!({})))
            .await
            .unwrap()
            .with_ceiling(Duration::from_millis(50));
        let _ws = broker.await.unwrap();

        let err = pending.wait().await.unwrap_err();
        assert!(matches!(err, SwitchyardError::ClientTimeout(_)));
        assert_eq!(client.pending_count(), 0);
    }
}
