//! Byte-message channel abstraction
//!
//! A [`DataChannel`] is the outbound half of an ordered, reliable channel.
//! Inbound traffic is reported as [`ChannelEvent`]s through whatever event
//! path the connector that opened the channel provides.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::SessionError;

pub mod memory;

/// Backpressure poll interval
const BUFFER_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Message(ChannelMessage),
    Closed,
    Error(String),
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: String) -> Result<(), SessionError>;

    async fn send_binary(&self, data: Bytes) -> Result<(), SessionError>;

    /// Bytes accepted by `send_*` but not yet handed to the network
    async fn buffered_amount(&self) -> usize;

    /// Close the channel. Closing twice is a no-op.
    async fn close(&self);
}

/// Wait until `next` more bytes fit under the `high` water mark.
///
/// An empty buffer always admits the next message, so a message larger than
/// `high` cannot stall forever.
pub async fn wait_for_buffer_space(
    channel: &dyn DataChannel,
    next: usize,
    high: usize,
    cancel: &CancellationToken,
) -> Result<(), SessionError> {
    let mut logged = false;
    loop {
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        if !channel.is_open() {
            return Err(SessionError::Channel(format!(
                "channel '{}' closed during backpressure wait",
                channel.label()
            )));
        }

        let buffered = channel.buffered_amount().await;
        if buffered == 0 || buffered + next <= high {
            return Ok(());
        }
        if !logged {
            log::debug!(
                "Applying backpressure on '{}': buffered={} next={} high={}",
                channel.label(),
                buffered,
                next,
                high
            );
            logged = true;
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            _ = tokio::time::sleep(BUFFER_POLL_INTERVAL) => {}
        }
    }
}

/// Wait until everything queued on the channel has been handed off, the
/// channel closes, or the wait is cancelled.
pub async fn wait_for_drain(channel: &dyn DataChannel, cancel: &CancellationToken) {
    while channel.is_open() && channel.buffered_amount().await > 0 {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(BUFFER_POLL_INTERVAL) => {}
        }
    }
}
