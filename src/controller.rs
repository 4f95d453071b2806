//! Session controller
//!
//! One task owns the negotiator, the live session and the transfer engine.
//! Commands from [`SessionHandle`]s, relay events, connector events and
//! outbound-transfer completions are all consumed by that task's loop, so no
//! two reactions for a session ever overlap. Outbound file data is pumped by
//! a spawned task that the loop cancels on teardown.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::channel::{wait_for_drain, ChannelEvent, ChannelMessage};
use crate::config::Config;
use crate::connector::{ConnectorFactory, PeerEvent, Role, SessionEvent};
use crate::error::SessionError;
use crate::negotiator::{NegotiationState, Negotiator};
use crate::signaling::{EndpointId, RelayEvent, Signal, Signaler};
use crate::sink::FileSink;
use crate::transfer::{send_file, FileSource, InboundUpdate, SendOptions, TransferEngine, TransferMetadata};

const COMMAND_QUEUE_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    UserDisconnect,
    PeerLeft,
    ChannelClosed,
    ChannelError(String),
    ConnectionFailed(String),
    NegotiationTimeout,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::UserDisconnect => f.write_str("disconnected"),
            CloseReason::PeerLeft => f.write_str("peer left"),
            CloseReason::ChannelClosed => f.write_str("channel closed"),
            CloseReason::ChannelError(e) => write!(f, "channel error: {}", e),
            CloseReason::ConnectionFailed(e) => write!(f, "connection failed: {}", e),
            CloseReason::NegotiationTimeout => f.write_str("negotiation timed out"),
        }
    }
}

/// Everything the UI layer gets to hear about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Our identity at the relay
    Identity(EndpointId),
    Peers(Vec<EndpointId>),
    PeerJoined(EndpointId),
    PeerLeft(EndpointId),
    RelayDisconnected,
    Connecting {
        peer: EndpointId,
        role: Role,
    },
    Connected {
        peer: EndpointId,
    },
    SessionClosed {
        peer: EndpointId,
        reason: CloseReason,
    },
    ReceiveStarted(TransferMetadata),
    Progress {
        direction: Direction,
        name: String,
        bytes: u64,
        percent: u8,
    },
    FileReceived {
        metadata: TransferMetadata,
        bytes: u64,
        location: String,
    },
    FileSent(TransferMetadata),
    TransferAborted {
        direction: Direction,
        reason: String,
    },
    Error(SessionError),
}

/// Snapshot of the controller's view of the world
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub local_id: Option<EndpointId>,
    pub peers: Vec<EndpointId>,
    pub state: NegotiationState,
    pub remote: Option<EndpointId>,
    pub role: Option<Role>,
    pub sending: bool,
    pub receiving: Option<TransferMetadata>,
}

enum Command {
    Connect {
        peer: EndpointId,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    SendFile {
        source: FileSource,
        reply: oneshot::Sender<Result<TransferMetadata, SessionError>>,
    },
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
}

/// Cloneable front end of a running [`SessionController`]
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Command>,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| SessionError::ControllerStopped)?;
        reply_rx.await.map_err(|_| SessionError::ControllerStopped)
    }

    /// Start negotiating with `peer` as the offerer. Returns once the offer
    /// is sent; watch for [`Notification::Connected`].
    pub async fn connect(&self, peer: EndpointId) -> Result<(), SessionError> {
        self.request(|reply| Command::Connect { peer, reply }).await?
    }

    /// Tear down the current session, if any. Always safe to call.
    pub async fn disconnect(&self) {
        let _ = self.request(|reply| Command::Disconnect { reply }).await;
    }

    /// Send a file over the open channel. Resolves when `file-end` has been
    /// sent and the channel buffer has drained, or when the transfer fails.
    pub async fn send_file(&self, source: FileSource) -> Result<TransferMetadata, SessionError> {
        self.request(|reply| Command::SendFile { source, reply }).await?
    }

    pub async fn status(&self) -> Result<SessionStatus, SessionError> {
        self.request(|reply| Command::Status { reply }).await
    }
}

struct OutboundTransfer {
    id: u64,
    cancel: CancellationToken,
    reply: Option<oneshot::Sender<Result<TransferMetadata, SessionError>>>,
}

struct OutboundDone {
    id: u64,
    result: Result<TransferMetadata, SessionError>,
}

pub struct SessionController {
    config: Config,
    negotiator: Negotiator,
    engine: TransferEngine,
    sink: Arc<dyn FileSink>,
    notify: mpsc::UnboundedSender<Notification>,
    local_id: Option<EndpointId>,
    peers: BTreeSet<EndpointId>,
    outbound: Option<OutboundTransfer>,
    next_outbound_id: u64,
    done_tx: mpsc::UnboundedSender<OutboundDone>,
    connect_deadline: Option<Instant>,
}

impl SessionController {
    /// Start the controller task.
    ///
    /// `relay_events` is the inbound half of `signaler`. The task runs until
    /// every [`SessionHandle`] is dropped.
    pub fn spawn(
        config: Config,
        signaler: Arc<dyn Signaler>,
        relay_events: mpsc::Receiver<RelayEvent>,
        factory: Arc<dyn ConnectorFactory>,
        sink: Arc<dyn FileSink>,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<Notification>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        let controller = SessionController {
            config,
            negotiator: Negotiator::new(signaler, factory, events_tx),
            engine: TransferEngine::new(),
            sink,
            notify: notify_tx,
            local_id: None,
            peers: BTreeSet::new(),
            outbound: None,
            next_outbound_id: 1,
            done_tx,
            connect_deadline: None,
        };
        tokio::spawn(controller.run(cmd_rx, relay_events, events_rx, done_rx));

        (SessionHandle { tx: cmd_tx }, notify_rx)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut relay_events: mpsc::Receiver<RelayEvent>,
        mut session_events: mpsc::UnboundedReceiver<SessionEvent>,
        mut done_rx: mpsc::UnboundedReceiver<OutboundDone>,
    ) {
        let mut relay_open = true;
        loop {
            let deadline = self.connect_deadline;
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                event = relay_events.recv(), if relay_open => match event {
                    Some(event) => self.handle_relay_event(event).await,
                    None => relay_open = false,
                },
                Some(event) = session_events.recv() => self.handle_session_event(event).await,
                Some(done) = done_rx.recv() => self.handle_outbound_done(done),
                _ = sleep_until(deadline) => self.handle_connect_timeout().await,
            }
        }

        self.teardown(CloseReason::UserDisconnect).await;
        log::debug!("Session controller stopped");
    }

    fn emit(&self, notification: Notification) {
        let _ = self.notify.send(notification);
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { peer, reply } => {
                let result = self.negotiator.connect(&peer).await;
                if result.is_ok() {
                    self.connect_deadline = Some(Instant::now() + self.config.connect_timeout);
                    self.emit(Notification::Connecting {
                        peer,
                        role: Role::Offerer,
                    });
                }
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                self.teardown(CloseReason::UserDisconnect).await;
                let _ = reply.send(());
            }
            Command::SendFile { source, reply } => self.start_send(source, reply),
            Command::Status { reply } => {
                let session = self.negotiator.session();
                let _ = reply.send(SessionStatus {
                    local_id: self.local_id.clone(),
                    peers: self.peers.iter().cloned().collect(),
                    state: self.negotiator.state(),
                    remote: session.map(|s| s.remote_id.clone()),
                    role: session.map(|s| s.role),
                    sending: self.outbound.is_some(),
                    receiving: self.engine.inbound_metadata().cloned(),
                });
            }
        }
    }

    fn start_send(
        &mut self,
        mut source: FileSource,
        reply: oneshot::Sender<Result<TransferMetadata, SessionError>>,
    ) {
        let Some(channel) = self.negotiator.open_channel() else {
            let _ = reply.send(Err(SessionError::NotConnected));
            return;
        };
        if self.outbound.is_some() {
            let _ = reply.send(Err(SessionError::TransferInProgress));
            return;
        }

        let id = self.next_outbound_id;
        self.next_outbound_id += 1;
        let cancel = CancellationToken::new();
        self.outbound = Some(OutboundTransfer {
            id,
            cancel: cancel.clone(),
            reply: Some(reply),
        });

        let options = SendOptions {
            chunk_size: self.config.chunk_size,
            buffered_amount_high: self.config.buffered_amount_high,
        };
        let notify = self.notify.clone();
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let name = source.metadata.name.clone();
            let result = send_file(channel.as_ref(), &mut source, options, &cancel, |bytes, percent| {
                let _ = notify.send(Notification::Progress {
                    direction: Direction::Outbound,
                    name: name.clone(),
                    bytes,
                    percent,
                });
            })
            .await;
            if result.is_ok() {
                wait_for_drain(channel.as_ref(), &cancel).await;
            }
            let _ = done_tx.send(OutboundDone { id, result });
        });
    }

    fn handle_outbound_done(&mut self, done: OutboundDone) {
        // Teardown already settled this transfer
        if self.outbound.as_ref().map(|o| o.id) != Some(done.id) {
            return;
        }
        let Some(mut outbound) = self.outbound.take() else {
            return;
        };

        match &done.result {
            Ok(metadata) => {
                log::info!("Sent {}", metadata.name);
                self.emit(Notification::FileSent(metadata.clone()));
            }
            Err(e) => {
                log::warn!("Outbound transfer failed: {}", e);
                self.emit(Notification::TransferAborted {
                    direction: Direction::Outbound,
                    reason: e.to_string(),
                });
            }
        }
        if let Some(reply) = outbound.reply.take() {
            let _ = reply.send(done.result);
        }
    }

    async fn handle_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Welcome { id } => {
                self.local_id = Some(id.clone());
                self.emit(Notification::Identity(id));
            }
            RelayEvent::Peers(peers) => {
                let local = self.local_id.clone();
                self.peers = peers
                    .into_iter()
                    .filter(|p| Some(p) != local.as_ref())
                    .collect();
                self.emit(Notification::Peers(self.peers.iter().cloned().collect()));
            }
            RelayEvent::PeerJoined(id) => {
                if Some(&id) != self.local_id.as_ref() {
                    self.peers.insert(id.clone());
                    self.emit(Notification::PeerJoined(id));
                }
            }
            RelayEvent::PeerLeft(id) => {
                self.peers.remove(&id);
                self.negotiator.forget_peer(&id);
                let in_session = self
                    .negotiator
                    .session()
                    .map(|s| s.remote_id == id)
                    .unwrap_or(false);
                self.emit(Notification::PeerLeft(id));
                if in_session {
                    self.teardown(CloseReason::PeerLeft).await;
                }
            }
            RelayEvent::Signal { from, signal } => self.handle_signal(from, signal).await,
            RelayEvent::Disconnected => {
                log::warn!("Signaling relay connection lost");
                self.emit(Notification::RelayDisconnected);
            }
        }
    }

    async fn handle_signal(&mut self, from: EndpointId, signal: Signal) {
        match signal {
            Signal::Offer(offer) => match self.negotiator.handle_offer(&from, offer).await {
                Ok(()) => {
                    self.connect_deadline = Some(Instant::now() + self.config.connect_timeout);
                    self.emit(Notification::Connecting {
                        peer: from,
                        role: Role::Answerer,
                    });
                }
                Err(e) => {
                    log::warn!("Offer from {} refused: {}", from.short(), e);
                    self.emit(Notification::Error(e));
                }
            },
            Signal::Answer(answer) => {
                if let Err(e) = self.negotiator.handle_answer(&from, answer).await {
                    log::warn!("Answer from {} rejected: {}", from.short(), e);
                    self.emit(Notification::Error(e.clone()));
                    if let SessionError::Negotiation(reason) = e {
                        self.teardown(CloseReason::ConnectionFailed(reason)).await;
                    }
                }
            }
            Signal::IceCandidate(candidate) => {
                self.negotiator.handle_remote_candidate(&from, candidate).await;
            }
        }
    }

    async fn handle_session_event(&mut self, SessionEvent { generation, event }: SessionEvent) {
        if !self.negotiator.is_current(generation) {
            log::debug!("Dropping stale event from session generation {}", generation);
            if let PeerEvent::ChannelOpen(channel) = event {
                channel.close().await;
            }
            return;
        }

        match event {
            PeerEvent::LocalCandidate(candidate) => self.negotiator.local_candidate(candidate).await,
            PeerEvent::GatheringComplete => self.negotiator.gathering_complete().await,
            PeerEvent::ChannelOpen(channel) => {
                if let Some(peer) = self.negotiator.channel_opened(channel) {
                    log::info!("Data channel open with {}", peer.short());
                    self.connect_deadline = None;
                    self.engine.reset();
                    self.emit(Notification::Connected { peer });
                }
            }
            PeerEvent::Channel(ChannelEvent::Message(ChannelMessage::Text(text))) => {
                let update = self.engine.handle_text(&text);
                self.handle_inbound(update).await;
            }
            PeerEvent::Channel(ChannelEvent::Message(ChannelMessage::Binary(data))) => {
                let update = self.engine.handle_binary(data);
                self.handle_inbound(update).await;
            }
            PeerEvent::Channel(ChannelEvent::Closed) => {
                self.teardown(CloseReason::ChannelClosed).await;
            }
            PeerEvent::Channel(ChannelEvent::Error(e)) => {
                self.emit(Notification::Error(SessionError::Channel(e.clone())));
                self.teardown(CloseReason::ChannelError(e)).await;
            }
            PeerEvent::ConnectionFailed(reason) => {
                self.emit(Notification::Error(SessionError::Negotiation(reason.clone())));
                self.teardown(CloseReason::ConnectionFailed(reason)).await;
            }
        }
    }

    async fn handle_inbound(&mut self, update: Result<InboundUpdate, SessionError>) {
        match update {
            Ok(InboundUpdate::Started {
                metadata,
                abandoned,
            }) => {
                if let Some(old) = abandoned {
                    self.emit(Notification::TransferAborted {
                        direction: Direction::Inbound,
                        reason: format!("{} superseded by a new transfer", old.name),
                    });
                }
                let size = metadata.size;
                let name = metadata.name.clone();
                self.emit(Notification::ReceiveStarted(metadata));
                if size > 0 {
                    self.emit(Notification::Progress {
                        direction: Direction::Inbound,
                        name,
                        bytes: 0,
                        percent: 0,
                    });
                }
            }
            Ok(InboundUpdate::Progress {
                name,
                bytes,
                percent,
            }) => {
                self.emit(Notification::Progress {
                    direction: Direction::Inbound,
                    name,
                    bytes,
                    percent,
                });
            }
            Ok(InboundUpdate::Completed(file)) => {
                let metadata = file.metadata.clone();
                let bytes = file.data.len() as u64;
                match self.sink.deliver(file).await {
                    Ok(location) => self.emit(Notification::FileReceived {
                        metadata,
                        bytes,
                        location,
                    }),
                    Err(e) => {
                        log::error!("Failed to deliver {}: {:#}", metadata.name, e);
                        self.emit(Notification::Error(SessionError::Io(format!("{:#}", e))));
                    }
                }
            }
            Ok(InboundUpdate::Ignored) => log::debug!("Ignoring repeated file-end"),
            Err(e) => {
                log::warn!("Protocol violation on inbound transfer: {}", e);
                let abandoned = self.engine.reset();
                self.emit(Notification::Error(e.clone()));
                if abandoned.is_some() {
                    self.emit(Notification::TransferAborted {
                        direction: Direction::Inbound,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    async fn handle_connect_timeout(&mut self) {
        self.connect_deadline = None;
        if self.negotiator.state() == NegotiationState::Connected {
            return;
        }
        log::warn!(
            "No open channel after {:?}, giving up",
            self.config.connect_timeout
        );
        self.emit(Notification::Error(SessionError::Negotiation(
            "timed out waiting for the channel to open".to_string(),
        )));
        self.teardown(CloseReason::NegotiationTimeout).await;
    }

    /// Converge point for every way a session ends. A no-op without a session.
    async fn teardown(&mut self, reason: CloseReason) {
        self.connect_deadline = None;

        if let Some(mut outbound) = self.outbound.take() {
            outbound.cancel.cancel();
            self.emit(Notification::TransferAborted {
                direction: Direction::Outbound,
                reason: reason.to_string(),
            });
            if let Some(reply) = outbound.reply.take() {
                let _ = reply.send(Err(SessionError::Cancelled));
            }
        }

        if let Some(metadata) = self.engine.reset() {
            log::warn!("Abandoning incomplete transfer of {}", metadata.name);
            self.emit(Notification::TransferAborted {
                direction: Direction::Inbound,
                reason: reason.to_string(),
            });
        }

        if let Some(peer) = self.negotiator.teardown().await {
            self.emit(Notification::SessionClosed { peer, reason });
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
