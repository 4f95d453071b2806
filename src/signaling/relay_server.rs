//! Signaling relay server
//!
//! Forwards offers, answers and ICE candidates between connected endpoints and
//! broadcasts membership changes. It never takes part in the data path.
//!
//! On connect an endpoint receives, in order:
//! 1. `{"type":"welcome","id":"<uuid>"}`
//! 2. `{"type":"peers","peers":[...]}` (everyone else currently connected)
//!
//! and every other endpoint receives `{"type":"peer-joined","id":"<uuid>"}`.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use uuid::Uuid;

use super::protocol::{ClientMessage, ServerMessage};
use super::EndpointId;

/// Connected endpoints and their outbound queues
#[derive(Default, Clone)]
pub struct RelayState {
    peers: Arc<Mutex<HashMap<EndpointId, mpsc::UnboundedSender<ServerMessage>>>>,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new endpoint: assigns its id, queues welcome + snapshot for
    /// it and announces it to everyone else.
    pub fn join(&self, tx: mpsc::UnboundedSender<ServerMessage>) -> EndpointId {
        let id = EndpointId::new(Uuid::new_v4().to_string());
        let mut peers = self.lock();

        let mut existing: Vec<EndpointId> = peers.keys().cloned().collect();
        existing.sort();

        let _ = tx.send(ServerMessage::Welcome { id: id.clone() });
        let _ = tx.send(ServerMessage::Peers { peers: existing });

        for other in peers.values() {
            let _ = other.send(ServerMessage::PeerJoined { id: id.clone() });
        }
        peers.insert(id.clone(), tx);
        id
    }

    /// Remove an endpoint and announce its departure. Unknown ids are ignored.
    pub fn leave(&self, id: &EndpointId) {
        let mut peers = self.lock();
        if peers.remove(id).is_none() {
            return;
        }
        for other in peers.values() {
            let _ = other.send(ServerMessage::PeerLeft { id: id.clone() });
        }
    }

    /// Deliver a signal from `from` to its destination.
    /// Returns false when the destination is not connected.
    pub fn route(&self, from: &EndpointId, msg: ClientMessage) -> bool {
        let peers = self.lock();
        let Some(dest) = peers.get(msg.destination()) else {
            return false;
        };
        dest.send(msg.into_delivery(from.clone())).is_ok()
    }

    pub fn peer_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<EndpointId, mpsc::UnboundedSender<ServerMessage>>> {
        // A poisoned map only means another connection task panicked mid-update;
        // the map itself is still consistent.
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Bind and run the relay until the task is dropped
pub async fn run_relay(listen: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind relay on {}", listen))?;
    log::info!("Signaling relay listening on ws://{}", listener.local_addr()?);
    serve(listener, RelayState::new()).await
}

/// Accept connections on an already bound listener
pub async fn serve(listener: TcpListener, state: RelayState) -> Result<()> {
    loop {
        let (stream, addr) = listener.accept().await.context("Failed to accept connection")?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, state).await {
                log::warn!("Relay connection {} ended with error: {:#}", addr, e);
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, state: RelayState) -> Result<()> {
    let ws_stream = accept_async(stream)
        .await
        .context("WebSocket handshake failed")?;
    let (mut ws_write, mut ws_read) = ws_stream.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let id = state.join(tx);
    log::info!("Endpoint connected: {} ({})", id, addr);

    let forward_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    log::error!("Failed to serialize relay message: {}", e);
                    continue;
                }
            };
            if ws_write.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg_result) = ws_read.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(client_msg) => {
                    let dest = client_msg.destination().clone();
                    log::debug!("{} -> {}", id.short(), dest.short());
                    if !state.route(&id, client_msg) {
                        log::warn!("Dropping signal from {} to unknown endpoint {}", id, dest);
                    }
                }
                Err(e) => log::warn!("Invalid message from {}: {}", id, e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                log::debug!("WebSocket error from {}: {}", id, e);
                break;
            }
        }
    }

    state.leave(&id);
    forward_task.abort();
    log::info!("Endpoint disconnected: {}", id);
    Ok(())
}
