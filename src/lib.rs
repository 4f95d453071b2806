//! peer-drop: direct peer-to-peer file transfer over WebRTC data channels
//!
//! Two endpoints find each other through a small signaling relay (or a
//! copy/paste exchange), negotiate one ordered, reliable data channel and
//! move a file across it as a metadata message, binary fragments and an
//! end marker.

pub mod app;
pub mod channel;
pub mod config;
pub mod connector;
pub mod controller;
pub mod error;
pub mod negotiator;
pub mod rtc;
pub mod signaling;
pub mod sink;
pub mod transfer;

pub use config::Config;
pub use controller::{Notification, SessionController, SessionHandle};
pub use error::SessionError;
