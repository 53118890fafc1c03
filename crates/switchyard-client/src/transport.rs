use futures_util::{SinkExt, StreamExt};
use switchyard_core::{Message, SwitchyardError, SwitchyardResult};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

/// Both halves of an open broker connection: encoded frames go out through
/// `outbound`, decoded envelopes arrive on `inbound`. `inbound` yields
/// `None` once the socket closes.
pub(crate) struct Transport {
    /// Encoded frames to write.
    pub outbound: mpsc::UnboundedSender<String>,
    /// Decoded envelopes read from the socket.
    pub inbound: mpsc::UnboundedReceiver<Message>,
}

impl Transport {
    /// Connect and spawn the reader and writer tasks.
    pub async fn open(url: &str, api_key: Option<&str>) -> SwitchyardResult<Self> {
        let mut request = url
            .into_client_request()
            .map_err(|e| SwitchyardError::Transport(format!("Invalid broker URL '{url}': {e}")))?;
        if let Some(key) = api_key {
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| SwitchyardError::Transport(format!("Invalid API key: {e}")))?;
            request.headers_mut().insert("authorization", value);
        }

        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| SwitchyardError::Transport(format!("Connect to {url} failed: {e}")))?;
        debug!(url = %url, "Connected to broker");
        let (mut sink, mut stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if sink.send(WsMessage::Text(frame)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let (in_tx, in_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(Ok(frame)) = stream.next().await {
                let decoded = match frame {
                    WsMessage::Text(text) => Message::decode(&text),
                    WsMessage::Binary(bytes) => Message::decode_bytes(&bytes),
                    WsMessage::Close(_) => break,
                    _ => continue,
                };
                match decoded {
                    Ok(msg) => {
                        if in_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Dropped malformed frame from broker"),
                }
            }
            debug!("Broker connection closed");
        });

        Ok(Self {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Encode and queue a message.
pub(crate) fn send(
    outbound: &mpsc::UnboundedSender<String>,
    msg: &Message,
) -> SwitchyardResult<()> {
    let frame = msg.encode()?;
    outbound
        .send(frame)
        .map_err(|_| SwitchyardError::Transport("connection closed".into()))
}
