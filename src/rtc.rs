//! WebRTC connector built on webrtc-rs
//!
//! One peer connection per session with a single ordered, reliable data
//! channel labelled `file-transfer`. The offerer creates the channel; the
//! answerer adopts the one announced through `on_data_channel`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::channel::{ChannelEvent, ChannelMessage, DataChannel};
use crate::connector::{ConnectorFactory, PeerConnector, PeerEvent, PeerEventSender, Role, FILE_CHANNEL_LABEL};
use crate::error::SessionError;
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};

/// Builds [`WebRtcPeer`]s with a fixed set of ICE servers
pub struct WebRtcConnectorFactory {
    ice_servers: Vec<String>,
}

impl WebRtcConnectorFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl ConnectorFactory for WebRtcConnectorFactory {
    async fn create(&self, role: Role, events: PeerEventSender) -> Result<Box<dyn PeerConnector>> {
        let ice_servers = if self.ice_servers.is_empty() {
            // Host candidates only
            vec![]
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let peer = WebRtcPeer::new(ice_servers, role, events).await?;
        Ok(Box::new(peer))
    }
}

/// WebRTC peer connection wrapper
pub struct WebRtcPeer {
    peer_connection: Arc<RTCPeerConnection>,
    data_channel: Option<Arc<RTCDataChannel>>,
    closed: AtomicBool,
}

impl WebRtcPeer {
    async fn new(ice_servers: Vec<RTCIceServer>, role: Role, events: PeerEventSender) -> Result<Self> {
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .context("Failed to register default codecs")?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .context("Failed to register interceptors")?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer_connection = Arc::new(
            api.new_peer_connection(config)
                .await
                .context("Failed to create peer connection")?,
        );

        // Trickle every candidate as soon as it is found
        let ice_events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let ice_events = ice_events.clone();
            Box::pin(async move {
                match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => {
                            ice_events.send(PeerEvent::LocalCandidate(from_rtc_candidate(init)));
                        }
                        Err(e) => log::warn!("Failed to serialize local ICE candidate: {}", e),
                    },
                    None => {
                        ice_events.send(PeerEvent::GatheringComplete);
                    }
                }
            })
        }));

        let state_events = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let state_events = state_events.clone();
                Box::pin(async move {
                    match state {
                        RTCPeerConnectionState::Connected => {
                            log::info!("WebRTC connection established");
                        }
                        RTCPeerConnectionState::Disconnected => {
                            log::warn!("WebRTC connection disconnected");
                        }
                        RTCPeerConnectionState::Failed => {
                            log::error!("WebRTC connection failed");
                            state_events.send(PeerEvent::ConnectionFailed(
                                "peer connection failed".to_string(),
                            ));
                        }
                        RTCPeerConnectionState::Closed => {
                            log::debug!("WebRTC connection closed");
                        }
                        _ => {}
                    }
                })
            },
        ));

        let data_channel = match role {
            Role::Offerer => {
                let dc = peer_connection
                    .create_data_channel(
                        FILE_CHANNEL_LABEL,
                        Some(RTCDataChannelInit {
                            ordered: Some(true),
                            ..Default::default()
                        }),
                    )
                    .await
                    .context("Failed to create data channel")?;
                wire_data_channel(&dc, events);
                Some(dc)
            }
            Role::Answerer => {
                let dc_events = events;
                peer_connection.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let dc_events = dc_events.clone();
                    Box::pin(async move {
                        if dc.label() != FILE_CHANNEL_LABEL {
                            log::warn!("Ignoring unexpected data channel '{}'", dc.label());
                            return;
                        }
                        wire_data_channel(&dc, dc_events);
                    })
                }));
                None
            }
        };

        Ok(Self {
            peer_connection,
            data_channel,
            closed: AtomicBool::new(false),
        })
    }
}

/// Forward a data channel's lifecycle and traffic into the session's event queue
fn wire_data_channel(dc: &Arc<RTCDataChannel>, events: PeerEventSender) {
    let announced = Arc::new(AtomicBool::new(false));

    let open_events = events.clone();
    let weak: Weak<RTCDataChannel> = Arc::downgrade(dc);
    let open_announced = announced.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            if let Some(dc) = weak.upgrade() {
                if !open_announced.swap(true, Ordering::SeqCst) {
                    log::debug!("Data channel '{}' opened", dc.label());
                    open_events.send(PeerEvent::ChannelOpen(Arc::new(RtcDataChannel::new(dc))));
                }
            }
        })
    }));

    let msg_events = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let msg_events = msg_events.clone();
        Box::pin(async move {
            let message = if msg.is_string {
                ChannelMessage::Text(String::from_utf8_lossy(&msg.data).into_owned())
            } else {
                ChannelMessage::Binary(msg.data)
            };
            msg_events.send(PeerEvent::Channel(ChannelEvent::Message(message)));
        })
    }));

    let err_events = events.clone();
    let label = dc.label().to_string();
    dc.on_error(Box::new(move |err| {
        log::error!("Data channel '{}' error: {}", label, err);
        err_events.send(PeerEvent::Channel(ChannelEvent::Error(err.to_string())));
        Box::pin(async {})
    }));

    let close_events = events.clone();
    let label = dc.label().to_string();
    dc.on_close(Box::new(move || {
        log::debug!("Data channel '{}' closed", label);
        close_events.send(PeerEvent::Channel(ChannelEvent::Closed));
        Box::pin(async {})
    }));

    // Adopted channels may already be open by the time handlers are attached
    if dc.ready_state() == RTCDataChannelState::Open && !announced.swap(true, Ordering::SeqCst) {
        events.send(PeerEvent::ChannelOpen(Arc::new(RtcDataChannel::new(dc.clone()))));
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_rtc_candidate(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_m_line_index,
        username_fragment: candidate.username_fragment,
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp).context("Invalid offer SDP"),
        SdpKind::Answer => {
            RTCSessionDescription::answer(description.sdp).context("Invalid answer SDP")
        }
    }
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => anyhow::bail!("Unsupported local description type: {}", other),
    }
}

#[async_trait]
impl PeerConnector for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .context("Failed to create offer")?;
        self.peer_connection
            .set_local_description(offer.clone())
            .await
            .context("Failed to set local description")?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .context("Failed to create answer")?;
        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .context("Failed to set local description")?;
        from_rtc_description(answer)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_remote_description(to_rtc_description(description)?)
            .await
            .context("Failed to set remote description")
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.peer_connection
            .add_ice_candidate(to_rtc_candidate(candidate))
            .await
            .context("Failed to add ICE candidate")
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(dc) = &self.data_channel {
            let _ = dc.close().await;
        }
        if let Err(e) = self.peer_connection.close().await {
            log::debug!("Failed to close peer connection: {}", e);
        }
    }
}

/// [`DataChannel`] over an `RTCDataChannel`
pub struct RtcDataChannel {
    label: String,
    inner: Arc<RTCDataChannel>,
}

impl RtcDataChannel {
    fn new(inner: Arc<RTCDataChannel>) -> Self {
        Self {
            label: inner.label().to_string(),
            inner,
        }
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.inner.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<(), SessionError> {
        self.inner
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| SessionError::Channel(e.to_string()))
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), SessionError> {
        self.inner
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|e| SessionError::Channel(e.to_string()))
    }

    async fn buffered_amount(&self) -> usize {
        self.inner.buffered_amount().await
    }

    async fn close(&self) {
        if let Err(e) = self.inner.close().await {
            log::debug!("Failed to close data channel '{}': {}", self.label, e);
        }
    }
}
