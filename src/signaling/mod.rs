//! Signaling: exchanging session descriptions and ICE candidates with a peer
//!
//! The [`Signaler`] trait is the outgoing half of a signaling client; incoming
//! traffic arrives as [`RelayEvent`]s on the receiver handed out when the
//! client is created. Two implementations exist:
//! - [`relay_client::RelayClient`]: WebSocket client for the `peer-drop relay`
//! - [`manual::ManualSignaler`]: copy/paste blocks, no server at all

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod manual;
pub mod protocol;
pub mod relay_client;
pub mod relay_server;

/// Identity of an endpoint at the relay. Assigned by the relay, never by the peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for log lines and status output
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for EndpointId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// One side's proposed or accepted connection parameters (browser
/// `RTCSessionDescriptionInit` shape)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One reachable network path (browser `RTCIceCandidateInit` shape)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Endpoint-to-endpoint signaling payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
}

impl Signal {
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Offer(_) => "offer",
            Signal::Answer(_) => "answer",
            Signal::IceCandidate(_) => "ice-candidate",
        }
    }
}

/// Everything a signaling client can report
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Our own identity, assigned by the relay
    Welcome { id: EndpointId },
    /// Snapshot of the other endpoints, delivered once on connect
    Peers(Vec<EndpointId>),
    PeerJoined(EndpointId),
    PeerLeft(EndpointId),
    Signal { from: EndpointId, signal: Signal },
    /// The relay connection is gone; no further events follow
    Disconnected,
}

/// Outgoing half of a signaling client.
///
/// Delivery is best-effort and fire-and-forget; there is no acknowledgment
/// layer. Ordering is only what the underlying transport gives per socket.
#[async_trait]
pub trait Signaler: Send + Sync {
    /// Our identity at the relay
    fn local_id(&self) -> &EndpointId;

    async fn send(&self, signal: Signal, to: &EndpointId) -> Result<()>;

    /// Local candidate gathering finished for the session with `to`.
    /// Trickling signalers have nothing to do here.
    async fn candidates_complete(&self, _to: &EndpointId) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_uses_browser_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 192.168.1.2 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        };
        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json["sdpMid"], "0");
        assert_eq!(json["sdpMLineIndex"], 0);
        assert!(json.get("usernameFragment").is_none());
    }

    #[test]
    fn test_description_type_field() {
        let json = serde_json::to_string(&SessionDescription::answer("v=0")).unwrap();
        assert_eq!(json, r#"{"type":"answer","sdp":"v=0"}"#);
    }

    #[test]
    fn test_endpoint_short() {
        assert_eq!(EndpointId::from("abcdefghijkl").short(), "abcdefgh");
        assert_eq!(EndpointId::from("abc").short(), "abc");
    }
}
