//! WebSocket client for the signaling relay

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::protocol::{ClientMessage, ServerMessage};
use super::{EndpointId, RelayEvent, Signal, Signaler};

/// How long to wait for the relay to assign us an identity
const WELCOME_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;

/// Connected relay client. Dropping it closes the write half; the reader task
/// ends when the relay closes the socket.
pub struct RelayClient {
    local_id: EndpointId,
    ws_write: Mutex<WsWrite>,
}

impl RelayClient {
    /// Connect to the relay and wait for it to assign our endpoint id.
    ///
    /// Returns the client and the stream of relay events. The first event on
    /// the stream is the `Welcome` carrying our id, followed by the peer snapshot.
    pub async fn connect(address: &str) -> Result<(Self, mpsc::Receiver<RelayEvent>)> {
        log::info!("Connecting to signaling relay: {}", address);

        let (ws_stream, _) = connect_async(address)
            .await
            .with_context(|| format!("Failed to connect to relay at {}", address))?;
        let (ws_write, mut ws_read) = ws_stream.split();

        // The relay speaks first: our id, then the peer snapshot
        let local_id = timeout(WELCOME_TIMEOUT, read_welcome(&mut ws_read))
            .await
            .context("Timed out waiting for relay welcome")??;
        log::info!("Connected to relay as {}", local_id);

        let (event_tx, event_rx) = mpsc::channel(256);
        let _ = event_tx
            .send(RelayEvent::Welcome {
                id: local_id.clone(),
            })
            .await;

        tokio::spawn(async move {
            while let Some(msg_result) = ws_read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(server_msg) => {
                            if event_tx.send(RelayEvent::from(server_msg)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            log::warn!("Failed to parse relay message: {} - {}", e, text);
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        log::error!("Relay WebSocket error: {}", e);
                        break;
                    }
                }
            }
            let _ = event_tx.send(RelayEvent::Disconnected).await;
        });

        Ok((
            Self {
                local_id,
                ws_write: Mutex::new(ws_write),
            },
            event_rx,
        ))
    }

    /// Close the relay connection
    pub async fn close(&self) {
        let mut ws_write = self.ws_write.lock().await;
        let _ = ws_write.send(Message::Close(None)).await;
    }

    async fn send_raw(&self, msg: &ClientMessage) -> Result<()> {
        let json = serde_json::to_string(msg)?;
        self.ws_write
            .lock()
            .await
            .send(Message::Text(json))
            .await
            .context("Failed to send message to relay")?;
        Ok(())
    }
}

/// Read until the relay's welcome message
async fn read_welcome(ws_read: &mut SplitStream<WsStream>) -> Result<EndpointId> {
    while let Some(msg_result) = ws_read.next().await {
        match msg_result.context("Relay WebSocket error")? {
            Message::Text(text) => {
                let msg: ServerMessage =
                    serde_json::from_str(&text).context("Failed to parse relay welcome")?;
                match msg {
                    ServerMessage::Welcome { id } => return Ok(id),
                    other => anyhow::bail!("Expected welcome from relay, got {:?}", other),
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    anyhow::bail!("Relay connection closed before welcome")
}

#[async_trait]
impl Signaler for RelayClient {
    fn local_id(&self) -> &EndpointId {
        &self.local_id
    }

    async fn send(&self, signal: Signal, to: &EndpointId) -> Result<()> {
        log::debug!("Sending {} to {}", signal.kind(), to.short());
        self.send_raw(&ClientMessage::new(signal, to.clone())).await
    }
}
