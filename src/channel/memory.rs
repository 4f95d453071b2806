//! In-process channel pair
//!
//! Ordered and reliable like an SCTP data channel in its default mode. Bytes
//! stay "buffered" on the sending side until the other side receives them,
//! so backpressure behaves the way it does on a real channel.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{ChannelEvent, ChannelMessage, DataChannel};
use crate::error::SessionError;

struct Link {
    closed: AtomicBool,
}

pub struct MemoryChannel {
    label: String,
    link: Arc<Link>,
    /// Bytes we sent that the peer has not received yet
    outbound: Arc<AtomicUsize>,
    peer_tx: mpsc::UnboundedSender<ChannelEvent>,
    own_tx: mpsc::UnboundedSender<ChannelEvent>,
}

/// Inbound side of one [`MemoryChannel`] end
pub struct MemoryReceiver {
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
    /// The peer's outbound counter
    inbound: Arc<AtomicUsize>,
}

/// Create a connected pair: `(a, a_events, b, b_events)`.
/// `a_events` yields what `b` sends and vice versa.
pub fn pair(label: &str) -> (MemoryChannel, MemoryReceiver, MemoryChannel, MemoryReceiver) {
    let link = Arc::new(Link {
        closed: AtomicBool::new(false),
    });
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let a_out = Arc::new(AtomicUsize::new(0));
    let b_out = Arc::new(AtomicUsize::new(0));

    let a = MemoryChannel {
        label: label.to_string(),
        link: link.clone(),
        outbound: a_out.clone(),
        peer_tx: b_tx.clone(),
        own_tx: a_tx.clone(),
    };
    let b = MemoryChannel {
        label: label.to_string(),
        link,
        outbound: b_out.clone(),
        peer_tx: a_tx,
        own_tx: b_tx,
    };
    (
        a,
        MemoryReceiver {
            rx: a_rx,
            inbound: b_out,
        },
        b,
        MemoryReceiver {
            rx: b_rx,
            inbound: a_out,
        },
    )
}

fn message_len(msg: &ChannelMessage) -> usize {
    match msg {
        ChannelMessage::Text(text) => text.len(),
        ChannelMessage::Binary(data) => data.len(),
    }
}

impl MemoryChannel {
    fn send(&self, msg: ChannelMessage) -> Result<(), SessionError> {
        if self.link.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Channel(format!(
                "channel '{}' is closed",
                self.label
            )));
        }
        let len = message_len(&msg);
        self.outbound.fetch_add(len, Ordering::SeqCst);
        if self.peer_tx.send(ChannelEvent::Message(msg)).is_err() {
            self.outbound.fetch_sub(len, Ordering::SeqCst);
            return Err(SessionError::Channel(format!(
                "channel '{}' peer is gone",
                self.label
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        !self.link.closed.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: String) -> Result<(), SessionError> {
        self.send(ChannelMessage::Text(text))
    }

    async fn send_binary(&self, data: Bytes) -> Result<(), SessionError> {
        self.send(ChannelMessage::Binary(data))
    }

    async fn buffered_amount(&self) -> usize {
        self.outbound.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.link.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.peer_tx.send(ChannelEvent::Closed);
        let _ = self.own_tx.send(ChannelEvent::Closed);
    }
}

impl MemoryReceiver {
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        let event = self.rx.recv().await?;
        if let ChannelEvent::Message(msg) = &event {
            self.inbound.fetch_sub(message_len(msg), Ordering::SeqCst);
        }
        Some(event)
    }
}
