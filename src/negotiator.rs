//! Connection-establishment state machine
//!
//! ```text
//! offerer:  Idle -> OfferCreated -----------------> Connected
//! answerer: Idle -> OfferReceived -> AnswerCreated -> Connected
//!           any state -> Closed -> (session discarded) Idle
//! ```
//!
//! `Connected` is entered only when the connector reports the channel open;
//! applying the answer merely completes the negotiation parameters.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::channel::DataChannel;
use crate::connector::{ConnectorFactory, PeerConnector, PeerEventSender, Role, SessionEvent};
use crate::error::SessionError;
use crate::signaling::{EndpointId, IceCandidate, SessionDescription, Signal, Signaler};

/// Early candidates kept per sender before its offer arrives
const MAX_EARLY_CANDIDATES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    OfferCreated,
    OfferReceived,
    AnswerCreated,
    Connected,
    Closed,
}

/// The single live (or pending) connection
pub struct Session {
    pub local_id: EndpointId,
    pub remote_id: EndpointId,
    pub role: Role,
    pub state: NegotiationState,
    pub generation: u64,
    connector: Box<dyn PeerConnector>,
    channel: Option<Arc<dyn DataChannel>>,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
}

pub struct Negotiator {
    signaler: Arc<dyn Signaler>,
    factory: Arc<dyn ConnectorFactory>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    next_generation: u64,
    session: Option<Session>,
    early_candidates: HashMap<EndpointId, Vec<IceCandidate>>,
}

impl Negotiator {
    pub fn new(
        signaler: Arc<dyn Signaler>,
        factory: Arc<dyn ConnectorFactory>,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            signaler,
            factory,
            events_tx,
            next_generation: 1,
            session: None,
            early_candidates: HashMap::new(),
        }
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn state(&self) -> NegotiationState {
        self.session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(NegotiationState::Idle)
    }

    /// Whether an event stamped with `generation` belongs to the live session
    pub fn is_current(&self, generation: u64) -> bool {
        self.session
            .as_ref()
            .map(|s| s.generation == generation)
            .unwrap_or(false)
    }

    /// The open channel, if the session reached `Connected`
    pub fn open_channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.session
            .as_ref()
            .filter(|s| s.state == NegotiationState::Connected)
            .and_then(|s| s.channel.clone())
    }

    async fn new_session(&mut self, remote_id: &EndpointId, role: Role) -> Result<Session, SessionError> {
        let generation = self.next_generation;
        self.next_generation += 1;

        let events = PeerEventSender::new(generation, self.events_tx.clone());
        let connector = self
            .factory
            .create(role, events)
            .await
            .map_err(SessionError::negotiation)?;

        Ok(Session {
            local_id: self.signaler.local_id().clone(),
            remote_id: remote_id.clone(),
            role,
            state: NegotiationState::Idle,
            generation,
            connector,
            channel: None,
            remote_description_set: false,
            pending_candidates: Vec::new(),
        })
    }

    /// Offerer path: create the session, produce an offer and send it.
    pub async fn connect(&mut self, peer: &EndpointId) -> Result<(), SessionError> {
        if self.session.is_some() {
            return Err(SessionError::AlreadyConnected);
        }

        let mut session = self.new_session(peer, Role::Offerer).await?;
        session.state = NegotiationState::OfferCreated;
        // Candidates this peer sent earlier belong to an older attempt
        self.early_candidates.remove(peer);

        let offer = match session.connector.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                session.connector.close().await;
                return Err(SessionError::negotiation(e));
            }
        };
        log::info!("Sending offer to {}", peer.short());
        self.session = Some(session);

        if let Err(e) = self.signaler.send(Signal::Offer(offer), peer).await {
            self.teardown().await;
            return Err(SessionError::relay(e));
        }
        Ok(())
    }

    /// Answerer path: adopt the offer, answer it and flush early candidates.
    pub async fn handle_offer(
        &mut self,
        from: &EndpointId,
        offer: SessionDescription,
    ) -> Result<(), SessionError> {
        if let Some(session) = &self.session {
            log::warn!(
                "Rejecting offer from {}: already in a session with {}",
                from.short(),
                session.remote_id.short()
            );
            return Err(SessionError::AlreadyInSession);
        }

        let mut session = self.new_session(from, Role::Answerer).await?;
        session.state = NegotiationState::OfferReceived;

        let answer = match Self::answer_offer(&mut session, offer).await {
            Ok(answer) => answer,
            Err(e) => {
                session.connector.close().await;
                return Err(e);
            }
        };
        session.state = NegotiationState::AnswerCreated;

        let early = self.early_candidates.remove(from).unwrap_or_default();
        if !early.is_empty() {
            log::debug!("Applying {} early candidate(s) from {}", early.len(), from.short());
        }
        for candidate in early {
            if let Err(e) = session.connector.add_ice_candidate(candidate).await {
                log::warn!("Failed to add early ICE candidate: {:#}", e);
            }
        }

        log::info!("Sending answer to {}", from.short());
        self.session = Some(session);

        if let Err(e) = self.signaler.send(Signal::Answer(answer), from).await {
            self.teardown().await;
            return Err(SessionError::relay(e));
        }
        Ok(())
    }

    async fn answer_offer(
        session: &mut Session,
        offer: SessionDescription,
    ) -> Result<SessionDescription, SessionError> {
        session
            .connector
            .set_remote_description(offer)
            .await
            .map_err(SessionError::negotiation)?;
        session.remote_description_set = true;
        session
            .connector
            .create_answer()
            .await
            .map_err(SessionError::negotiation)
    }

    /// Apply the answer to our pending offer.
    pub async fn handle_answer(
        &mut self,
        from: &EndpointId,
        answer: SessionDescription,
    ) -> Result<(), SessionError> {
        let Some(session) = self.session.as_mut() else {
            return Err(SessionError::UnexpectedAnswer { from: from.clone() });
        };
        if session.role != Role::Offerer
            || &session.remote_id != from
            || session.state != NegotiationState::OfferCreated
            || session.remote_description_set
        {
            return Err(SessionError::UnexpectedAnswer { from: from.clone() });
        }

        session
            .connector
            .set_remote_description(answer)
            .await
            .map_err(SessionError::negotiation)?;
        session.remote_description_set = true;
        log::debug!("Applied answer from {}", from.short());

        for candidate in std::mem::take(&mut session.pending_candidates) {
            if let Err(e) = session.connector.add_ice_candidate(candidate).await {
                log::warn!("Failed to add queued ICE candidate: {:#}", e);
            }
        }
        Ok(())
    }

    /// Apply a remote candidate, or queue it until it can be applied.
    pub async fn handle_remote_candidate(&mut self, from: &EndpointId, candidate: IceCandidate) {
        match self.session.as_mut() {
            Some(session) if &session.remote_id == from => {
                if session.remote_description_set {
                    if let Err(e) = session.connector.add_ice_candidate(candidate).await {
                        log::warn!("Failed to add ICE candidate from {}: {:#}", from.short(), e);
                    }
                } else {
                    session.pending_candidates.push(candidate);
                }
            }
            _ => {
                let queue = self.early_candidates.entry(from.clone()).or_default();
                if queue.len() >= MAX_EARLY_CANDIDATES {
                    log::warn!("Dropping early candidate from {}: queue full", from.short());
                } else {
                    queue.push(candidate);
                }
            }
        }
    }

    /// Forward a freshly gathered local candidate to the remote peer.
    pub async fn local_candidate(&self, candidate: IceCandidate) {
        let Some(session) = &self.session else {
            return;
        };
        if let Err(e) = self
            .signaler
            .send(Signal::IceCandidate(candidate), &session.remote_id)
            .await
        {
            log::warn!("Failed to send ICE candidate: {:#}", e);
        }
    }

    pub async fn gathering_complete(&self) {
        let Some(session) = &self.session else {
            return;
        };
        log::debug!("ICE gathering complete");
        if let Err(e) = self.signaler.candidates_complete(&session.remote_id).await {
            log::warn!("Failed to publish gathered candidates: {:#}", e);
        }
    }

    /// The connector reported the data channel open. Returns the peer.
    pub fn channel_opened(&mut self, channel: Arc<dyn DataChannel>) -> Option<EndpointId> {
        let session = self.session.as_mut()?;
        session.channel = Some(channel);
        session.state = NegotiationState::Connected;
        Some(session.remote_id.clone())
    }

    /// Forget queued candidates from an endpoint that left the relay
    pub fn forget_peer(&mut self, peer: &EndpointId) {
        self.early_candidates.remove(peer);
    }

    /// Close the channel, release the connector and discard the session.
    /// Returns the peer the session was with; `None` means there was nothing
    /// to tear down.
    pub async fn teardown(&mut self) -> Option<EndpointId> {
        let mut session = self.session.take()?;
        session.state = NegotiationState::Closed;
        if let Some(channel) = session.channel.take() {
            channel.close().await;
        }
        session.connector.close().await;
        log::info!("Session with {} closed", session.remote_id.short());
        Some(session.remote_id)
    }
}
