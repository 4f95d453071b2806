//! In-process relay hub and loopback connector for integration tests

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use peer_drop::channel::memory::{self, MemoryChannel, MemoryReceiver};
use peer_drop::channel::{ChannelEvent, ChannelMessage};
use peer_drop::config::Config;
use peer_drop::connector::{ConnectorFactory, PeerConnector, PeerEvent, PeerEventSender, Role, FILE_CHANNEL_LABEL};
use peer_drop::signaling::{EndpointId, IceCandidate, RelayEvent, SessionDescription, Signal, Signaler};
use peer_drop::sink::FileSink;
use peer_drop::transfer::ReceivedFile;
use peer_drop::{Notification, SessionController, SessionHandle};

// =============================================================================
// Relay hub
// =============================================================================

#[derive(Default)]
pub struct MemoryRelay {
    endpoints: Mutex<HashMap<EndpointId, mpsc::Sender<RelayEvent>>>,
}

impl MemoryRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn join(self: &Arc<Self>, name: &str) -> (Arc<MemorySignaler>, mpsc::Receiver<RelayEvent>) {
        let id = EndpointId::from(name);
        let (tx, rx) = mpsc::channel(4096);
        let mut endpoints = self.endpoints.lock().unwrap();

        let mut others: Vec<EndpointId> = endpoints.keys().cloned().collect();
        others.sort();
        tx.try_send(RelayEvent::Welcome { id: id.clone() }).unwrap();
        tx.try_send(RelayEvent::Peers(others)).unwrap();
        for other in endpoints.values() {
            let _ = other.try_send(RelayEvent::PeerJoined(id.clone()));
        }
        endpoints.insert(id.clone(), tx);

        (
            Arc::new(MemorySignaler {
                id,
                relay: self.clone(),
            }),
            rx,
        )
    }

    pub fn leave(&self, id: &EndpointId) {
        let mut endpoints = self.endpoints.lock().unwrap();
        if endpoints.remove(id).is_some() {
            for other in endpoints.values() {
                let _ = other.try_send(RelayEvent::PeerLeft(id.clone()));
            }
        }
    }

    fn deliver(&self, from: &EndpointId, to: &EndpointId, signal: Signal) {
        let endpoints = self.endpoints.lock().unwrap();
        if let Some(dest) = endpoints.get(to) {
            let _ = dest.try_send(RelayEvent::Signal {
                from: from.clone(),
                signal,
            });
        }
    }
}

pub struct MemorySignaler {
    id: EndpointId,
    relay: Arc<MemoryRelay>,
}

#[async_trait]
impl Signaler for MemorySignaler {
    fn local_id(&self) -> &EndpointId {
        &self.id
    }

    async fn send(&self, signal: Signal, to: &EndpointId) -> Result<()> {
        self.relay.deliver(&self.id, to, signal);
        Ok(())
    }
}

// =============================================================================
// Loopback connector
// =============================================================================

struct PendingLink {
    offerer_events: PeerEventSender,
    offerer_end: Option<(Arc<MemoryChannel>, MemoryReceiver)>,
    answerer: Option<(PeerEventSender, Arc<MemoryChannel>, MemoryReceiver)>,
}

/// Pairs offerers and answerers through the SDP text, then opens an
/// in-memory channel between them once the offerer applies the answer.
#[derive(Default)]
pub struct LoopbackNetwork {
    links: Mutex<HashMap<String, PendingLink>>,
    next_token: AtomicU64,
    /// Binary messages forwarded to answerers
    binary_to_answerer: Arc<AtomicUsize>,
    /// Stop delivering to the answerer after this many binary messages
    hold_after: Mutex<Option<usize>>,
    /// Never open channels
    stall: AtomicBool,
    pub candidates_added: AtomicUsize,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn hold_answerer_after(&self, binary_messages: usize) {
        *self.hold_after.lock().unwrap() = Some(binary_messages);
    }

    pub fn stall_channels(&self) {
        self.stall.store(true, Ordering::SeqCst);
    }

    pub fn binary_messages_to_answerer(&self) -> usize {
        self.binary_to_answerer.load(Ordering::SeqCst)
    }

    pub fn factory(self: &Arc<Self>) -> Arc<LoopbackFactory> {
        Arc::new(LoopbackFactory { net: self.clone() })
    }
}

fn spawn_forwarder(
    mut rx: MemoryReceiver,
    events: PeerEventSender,
    counter: Option<Arc<AtomicUsize>>,
    hold_after: Option<usize>,
) {
    tokio::spawn(async move {
        let mut forwarded_binary = 0usize;
        loop {
            if hold_after == Some(forwarded_binary) {
                std::future::pending::<()>().await;
            }
            let Some(event) = rx.recv().await else {
                return;
            };
            if let ChannelEvent::Message(ChannelMessage::Binary(_)) = &event {
                forwarded_binary += 1;
                if let Some(counter) = &counter {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }
            if !events.send(PeerEvent::Channel(event)) {
                return;
            }
        }
    });
}

pub struct LoopbackFactory {
    net: Arc<LoopbackNetwork>,
}

#[async_trait]
impl ConnectorFactory for LoopbackFactory {
    async fn create(&self, role: Role, events: PeerEventSender) -> Result<Box<dyn PeerConnector>> {
        Ok(Box::new(LoopbackConnector {
            net: self.net.clone(),
            role,
            events,
            token: Mutex::new(None),
        }))
    }
}

struct LoopbackConnector {
    net: Arc<LoopbackNetwork>,
    role: Role,
    events: PeerEventSender,
    token: Mutex<Option<String>>,
}

#[async_trait]
impl PeerConnector for LoopbackConnector {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let token = format!("loopback-{}", self.net.next_token.fetch_add(1, Ordering::SeqCst));
        self.net.links.lock().unwrap().insert(
            token.clone(),
            PendingLink {
                offerer_events: self.events.clone(),
                offerer_end: None,
                answerer: None,
            },
        );
        *self.token.lock().unwrap() = Some(token.clone());

        self.events.send(PeerEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:{} 1 udp 1 127.0.0.1 9 typ host", token),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }));
        self.events.send(PeerEvent::GatheringComplete);
        Ok(SessionDescription::offer(token))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let token = self
            .token
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no remote offer"))?;
        let mut links = self.net.links.lock().unwrap();
        let link = links
            .get_mut(&token)
            .ok_or_else(|| anyhow::anyhow!("unknown offer {}", token))?;

        let (a, a_rx, b, b_rx) = memory::pair(FILE_CHANNEL_LABEL);
        link.offerer_end = Some((Arc::new(a), a_rx));
        link.answerer = Some((self.events.clone(), Arc::new(b), b_rx));
        self.events.send(PeerEvent::GatheringComplete);
        Ok(SessionDescription::answer(token))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        match self.role {
            Role::Answerer => {
                *self.token.lock().unwrap() = Some(description.sdp);
                Ok(())
            }
            Role::Offerer => {
                if self.net.stall.load(Ordering::SeqCst) {
                    return Ok(());
                }
                let link = self
                    .net
                    .links
                    .lock()
                    .unwrap()
                    .remove(&description.sdp)
                    .ok_or_else(|| anyhow::anyhow!("unknown answer {}", description.sdp))?;
                let (offerer_channel, offerer_rx) = link
                    .offerer_end
                    .ok_or_else(|| anyhow::anyhow!("answer before channel"))?;
                let (answerer_events, answerer_channel, answerer_rx) = link
                    .answerer
                    .ok_or_else(|| anyhow::anyhow!("answer before channel"))?;

                let hold_after = *self.net.hold_after.lock().unwrap();
                spawn_forwarder(
                    answerer_rx,
                    answerer_events.clone(),
                    Some(self.net.binary_to_answerer.clone()),
                    hold_after,
                );
                spawn_forwarder(offerer_rx, link.offerer_events.clone(), None, None);

                // Answerer first so its open precedes any data from the offerer
                answerer_events.send(PeerEvent::ChannelOpen(answerer_channel));
                link.offerer_events.send(PeerEvent::ChannelOpen(offerer_channel));
                Ok(())
            }
        }
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<()> {
        self.net.candidates_added.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {}
}

// =============================================================================
// Sink and controller helpers
// =============================================================================

#[derive(Default)]
pub struct MemorySink {
    pub files: Mutex<Vec<ReceivedFile>>,
}

#[async_trait]
impl FileSink for MemorySink {
    async fn deliver(&self, file: ReceivedFile) -> Result<String> {
        let location = format!("memory://{}", file.metadata.name);
        self.files.lock().unwrap().push(file);
        Ok(location)
    }
}

pub struct Endpoint {
    pub id: EndpointId,
    pub handle: SessionHandle,
    pub notifications: mpsc::UnboundedReceiver<Notification>,
    pub sink: Arc<MemorySink>,
}

pub fn endpoint(relay: &Arc<MemoryRelay>, net: &Arc<LoopbackNetwork>, name: &str, config: Config) -> Endpoint {
    let (signaler, events) = relay.join(name);
    let sink = Arc::new(MemorySink::default());
    let (handle, notifications) =
        SessionController::spawn(config, signaler, events, net.factory(), sink.clone());
    Endpoint {
        id: EndpointId::from(name),
        handle,
        notifications,
        sink,
    }
}

/// Wait for the first notification matching `pred`, returning everything
/// seen up to and including it.
pub async fn wait_for<F>(
    notifications: &mut mpsc::UnboundedReceiver<Notification>,
    mut pred: F,
) -> Vec<Notification>
where
    F: FnMut(&Notification) -> bool,
{
    let mut seen = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(n) = notifications.recv().await {
            let done = pred(&n);
            seen.push(n);
            if done {
                return true;
            }
        }
        false
    })
    .await;
    assert!(
        matches!(result, Ok(true)),
        "expected notification never arrived; saw {:?}",
        seen
    );
    seen
}

pub fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
