//! Channel-negotiation capability
//!
//! A [`PeerConnector`] turns exchanged descriptions and candidates into one
//! open [`DataChannel`]. Everything it discovers asynchronously (local
//! candidates, the channel opening, channel traffic, failure) is pushed
//! through the [`PeerEventSender`] it was created with.

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::channel::{ChannelEvent, DataChannel};
use crate::signaling::{IceCandidate, SessionDescription};

/// Label of the single data channel a session uses
pub const FILE_CHANNEL_LABEL: &str = "file-transfer";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Offerer => f.write_str("offerer"),
            Role::Answerer => f.write_str("answerer"),
        }
    }
}

pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    /// No further local candidates will be reported
    GatheringComplete,
    ChannelOpen(Arc<dyn DataChannel>),
    Channel(ChannelEvent),
    ConnectionFailed(String),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            PeerEvent::GatheringComplete => f.write_str("GatheringComplete"),
            PeerEvent::ChannelOpen(ch) => f.debug_tuple("ChannelOpen").field(&ch.label()).finish(),
            PeerEvent::Channel(ev) => f.debug_tuple("Channel").field(ev).finish(),
            PeerEvent::ConnectionFailed(r) => f.debug_tuple("ConnectionFailed").field(r).finish(),
        }
    }
}

/// A [`PeerEvent`] stamped with the session generation that produced it
#[derive(Debug)]
pub struct SessionEvent {
    pub generation: u64,
    pub event: PeerEvent,
}

/// Handed to a connector at creation; every event it sends carries the
/// generation of the session the connector belongs to.
#[derive(Clone)]
pub struct PeerEventSender {
    generation: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl PeerEventSender {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { generation, tx }
    }

    /// Returns false once the controller is gone
    pub fn send(&self, event: PeerEvent) -> bool {
        self.tx
            .send(SessionEvent {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Produce an offer and set it as the local description
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Produce an answer and set it as the local description
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Release the connection. Safe to call more than once.
    async fn close(&self);
}

#[async_trait]
pub trait ConnectorFactory: Send + Sync {
    async fn create(&self, role: Role, events: PeerEventSender) -> Result<Box<dyn PeerConnector>>;
}
