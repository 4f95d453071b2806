//! Relay wire messages (JSON over WebSocket)
//!
//! Endpoints address signals with `to`; the relay rewrites them into `from`
//! before delivery. Every message carries a kebab-case `type` field.

use serde::{Deserialize, Serialize};

use super::{EndpointId, IceCandidate, RelayEvent, SessionDescription, Signal};

/// Messages sent from the relay to an endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Welcome {
        id: EndpointId,
    },
    Peers {
        peers: Vec<EndpointId>,
    },
    PeerJoined {
        id: EndpointId,
    },
    PeerLeft {
        id: EndpointId,
    },
    Offer {
        offer: SessionDescription,
        from: EndpointId,
    },
    Answer {
        answer: SessionDescription,
        from: EndpointId,
    },
    IceCandidate {
        candidate: IceCandidate,
        from: EndpointId,
    },
}

/// Messages sent from an endpoint to the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Offer {
        offer: SessionDescription,
        to: EndpointId,
    },
    Answer {
        answer: SessionDescription,
        to: EndpointId,
    },
    IceCandidate {
        candidate: IceCandidate,
        to: EndpointId,
    },
}

impl ClientMessage {
    pub fn new(signal: Signal, to: EndpointId) -> Self {
        match signal {
            Signal::Offer(offer) => ClientMessage::Offer { offer, to },
            Signal::Answer(answer) => ClientMessage::Answer { answer, to },
            Signal::IceCandidate(candidate) => ClientMessage::IceCandidate { candidate, to },
        }
    }

    pub fn destination(&self) -> &EndpointId {
        match self {
            ClientMessage::Offer { to, .. }
            | ClientMessage::Answer { to, .. }
            | ClientMessage::IceCandidate { to, .. } => to,
        }
    }

    /// Rewrite into the message the destination receives
    pub fn into_delivery(self, from: EndpointId) -> ServerMessage {
        match self {
            ClientMessage::Offer { offer, .. } => ServerMessage::Offer { offer, from },
            ClientMessage::Answer { answer, .. } => ServerMessage::Answer { answer, from },
            ClientMessage::IceCandidate { candidate, .. } => {
                ServerMessage::IceCandidate { candidate, from }
            }
        }
    }
}

impl From<ServerMessage> for RelayEvent {
    fn from(msg: ServerMessage) -> Self {
        match msg {
            ServerMessage::Welcome { id } => RelayEvent::Welcome { id },
            ServerMessage::Peers { peers } => RelayEvent::Peers(peers),
            ServerMessage::PeerJoined { id } => RelayEvent::PeerJoined(id),
            ServerMessage::PeerLeft { id } => RelayEvent::PeerLeft(id),
            ServerMessage::Offer { offer, from } => RelayEvent::Signal {
                from,
                signal: Signal::Offer(offer),
            },
            ServerMessage::Answer { answer, from } => RelayEvent::Signal {
                from,
                signal: Signal::Answer(answer),
            },
            ServerMessage::IceCandidate { candidate, from } => RelayEvent::Signal {
                from,
                signal: Signal::IceCandidate(candidate),
            },
        }
    }
}
