//! Error types for sessions and transfers

use thiserror::Error;

use crate::signaling::EndpointId;

/// Errors surfaced by the session controller, negotiator and transfer engine.
///
/// None of these are fatal to the process: every failure path returns the
/// controller to an idle or still-connected state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// `connect` was called while a session already exists
    #[error("Already connected to a peer")]
    AlreadyConnected,

    /// An offer arrived while a session already exists
    #[error("Already in a session")]
    AlreadyInSession,

    /// An answer arrived with no offer pending for that peer
    #[error("Unexpected answer from {from}")]
    UnexpectedAnswer { from: EndpointId },

    /// A data chunk arrived before any file metadata
    #[error("Received file chunk before metadata")]
    ChunkBeforeMetadata,

    /// `file-end` arrived without a usable transfer behind it
    #[error("Incomplete transfer: {reason}")]
    IncompleteTransfer { reason: String },

    /// A second outbound transfer was requested while one is still running
    #[error("A transfer is already in progress")]
    TransferInProgress,

    /// `send_file` was called without an open channel
    #[error("Not connected to a peer")]
    NotConnected,

    /// A text message on the data channel was not a known control message
    #[error("Malformed control message: {0}")]
    MalformedControl(String),

    /// Offer/answer/candidate handling failed in the connector
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// The data channel rejected a send or closed underneath us
    #[error("Data channel failure: {0}")]
    Channel(String),

    /// The signaling relay could not deliver a message
    #[error("Signaling relay failure: {0}")]
    Relay(String),

    /// Reading the local file failed
    #[error("I/O error: {0}")]
    Io(String),

    /// The transfer was abandoned by a teardown
    #[error("Transfer cancelled")]
    Cancelled,

    /// The controller task is gone
    #[error("Session controller stopped")]
    ControllerStopped,
}

impl SessionError {
    /// Refused actions: nothing changed, the caller may simply retry later.
    pub fn is_policy_violation(&self) -> bool {
        matches!(
            self,
            SessionError::AlreadyConnected
                | SessionError::AlreadyInSession
                | SessionError::TransferInProgress
                | SessionError::NotConnected
        )
    }

    /// Misbehaving peer: the current transfer is aborted, the process continues.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            SessionError::UnexpectedAnswer { .. }
                | SessionError::ChunkBeforeMetadata
                | SessionError::IncompleteTransfer { .. }
                | SessionError::MalformedControl(_)
        )
    }

    pub(crate) fn negotiation(err: anyhow::Error) -> Self {
        SessionError::Negotiation(format!("{:#}", err))
    }

    pub(crate) fn relay(err: anyhow::Error) -> Self {
        SessionError::Relay(format!("{:#}", err))
    }
}

/// Error returned when a command is interrupted by Ctrl+C.
///
/// The CLI exits with code 130 (128 + SIGINT) when it sees this.
#[derive(Error, Debug, Clone, Copy)]
#[error("Interrupted")]
pub struct Interrupted;

/// Check if an error is an Interrupted error.
pub fn is_interrupted(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Interrupted>().is_some()
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Io(err.to_string())
    }
}
