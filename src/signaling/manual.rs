//! Manual signaling via copy/paste blocks
//!
//! No relay is involved: each side prints one block holding its session
//! description and every candidate gathered so far, and the user carries it to
//! the other side. Blocks are base64url(JSON + CRC32) wrapped at 76 columns
//! between SSH-key style markers.
//!
//! Because the block is a one-shot bundle, candidates are buffered until
//! gathering reports complete or `ice_gather_timeout` elapses, whichever comes
//! first. Candidates found after that are lost.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use super::{EndpointId, IceCandidate, RelayEvent, SdpKind, SessionDescription, Signal, Signaler};

/// Identity used for ourselves in manual mode
pub const MANUAL_LOCAL_ID: &str = "local";

/// The only remote endpoint manual mode knows about
pub const MANUAL_PEER_ID: &str = "manual-peer";

/// Line width for wrapped output (safe for most terminals)
const LINE_WIDTH: usize = 76;

const OFFER_BEGIN_MARKER: &str = "-----BEGIN PEER-DROP OFFER-----";
const OFFER_END_MARKER: &str = "-----END PEER-DROP OFFER-----";
const ANSWER_BEGIN_MARKER: &str = "-----BEGIN PEER-DROP ANSWER-----";
const ANSWER_END_MARKER: &str = "-----END PEER-DROP ANSWER-----";

/// Maximum number of retry attempts for interactive input
const MAX_INPUT_RETRIES: usize = 5;

/// Payload of one copy/paste block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualBlock {
    pub description: SessionDescription,
    pub candidates: Vec<IceCandidate>,
}

impl ManualBlock {
    /// Replay the block as relay events from the manual peer: the
    /// description first, then each candidate.
    pub fn into_events(self) -> Vec<RelayEvent> {
        let from = EndpointId::from(MANUAL_PEER_ID);
        let description = match self.description.kind {
            SdpKind::Offer => Signal::Offer(self.description),
            SdpKind::Answer => Signal::Answer(self.description),
        };
        std::iter::once(description)
            .chain(self.candidates.into_iter().map(Signal::IceCandidate))
            .map(|signal| RelayEvent::Signal {
                from: from.clone(),
                signal,
            })
            .collect()
    }
}

/// Events a manual session starts with, standing in for the relay handshake
pub fn initial_events() -> Vec<RelayEvent> {
    vec![
        RelayEvent::Welcome {
            id: EndpointId::from(MANUAL_LOCAL_ID),
        },
        RelayEvent::Peers(vec![EndpointId::from(MANUAL_PEER_ID)]),
    ]
}

#[derive(Default)]
struct Outgoing {
    description: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    published: bool,
}

/// Copy/paste [`Signaler`]. Published blocks (markers included) come out of
/// the receiver returned by [`ManualSignaler::new`].
pub struct ManualSignaler {
    local_id: EndpointId,
    gather_timeout: Duration,
    outgoing: Arc<Mutex<Outgoing>>,
    published_tx: mpsc::UnboundedSender<String>,
}

impl ManualSignaler {
    pub fn new(gather_timeout: Duration) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (published_tx, published_rx) = mpsc::unbounded_channel();
        (
            Self {
                local_id: EndpointId::from(MANUAL_LOCAL_ID),
                gather_timeout,
                outgoing: Arc::new(Mutex::new(Outgoing::default())),
                published_tx,
            },
            published_rx,
        )
    }
}

/// Publish the buffered description once. Later calls are no-ops.
fn publish(outgoing: &Mutex<Outgoing>, published_tx: &mpsc::UnboundedSender<String>) {
    let block = {
        let mut state = outgoing.lock().unwrap_or_else(|e| e.into_inner());
        if state.published {
            return;
        }
        let Some(description) = state.description.clone() else {
            return;
        };
        state.published = true;
        ManualBlock {
            description,
            candidates: std::mem::take(&mut state.candidates),
        }
    };

    log::debug!(
        "Publishing {:?} block with {} candidate(s)",
        block.description.kind,
        block.candidates.len()
    );
    match encode_block(&block) {
        Ok(text) => {
            let _ = published_tx.send(text);
        }
        Err(e) => log::error!("Failed to encode signaling block: {:#}", e),
    }
}

#[async_trait]
impl Signaler for ManualSignaler {
    fn local_id(&self) -> &EndpointId {
        &self.local_id
    }

    async fn send(&self, signal: Signal, _to: &EndpointId) -> Result<()> {
        let mut state = self.outgoing.lock().unwrap_or_else(|e| e.into_inner());
        match signal {
            Signal::Offer(description) | Signal::Answer(description) => {
                if state.description.is_some() {
                    anyhow::bail!("Manual signaling carries a single description per run");
                }
                state.description = Some(description);
                drop(state);

                // Bounded wait for gathering
                let outgoing = self.outgoing.clone();
                let published_tx = self.published_tx.clone();
                let gather_timeout = self.gather_timeout;
                tokio::spawn(async move {
                    tokio::time::sleep(gather_timeout).await;
                    let pending = outgoing.lock().map(|s| !s.published).unwrap_or(false);
                    if pending {
                        log::warn!(
                            "ICE gathering not complete after {:?}, publishing what we have",
                            gather_timeout
                        );
                    }
                    publish(&outgoing, &published_tx);
                });
            }
            Signal::IceCandidate(candidate) => {
                if state.published {
                    log::warn!("Candidate discovered after the block was published, not delivered");
                } else {
                    state.candidates.push(candidate);
                }
            }
        }
        Ok(())
    }

    async fn candidates_complete(&self, _to: &EndpointId) -> Result<()> {
        publish(&self.outgoing, &self.published_tx);
        Ok(())
    }
}

fn markers(kind: SdpKind) -> (&'static str, &'static str) {
    match kind {
        SdpKind::Offer => (OFFER_BEGIN_MARKER, OFFER_END_MARKER),
        SdpKind::Answer => (ANSWER_BEGIN_MARKER, ANSWER_END_MARKER),
    }
}

/// Wrap an ASCII string to multiple lines of the given width
fn wrap_lines(s: &str, width: usize) -> String {
    s.as_bytes()
        .chunks(width)
        .map(String::from_utf8_lossy)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Encode a block as marker-framed base64url(JSON + CRC32)
pub fn encode_block(block: &ManualBlock) -> Result<String> {
    let json = serde_json::to_string(block).context("Failed to serialize signaling block")?;
    let json_bytes = json.as_bytes();
    let checksum = crc32fast::hash(json_bytes);
    let mut payload = json_bytes.to_vec();
    payload.extend_from_slice(&checksum.to_be_bytes());
    let encoded = URL_SAFE_NO_PAD.encode(&payload);

    let (begin, end) = markers(block.description.kind);
    Ok(format!("{}\n{}\n{}", begin, wrap_lines(&encoded, LINE_WIDTH), end))
}

/// Decode the base64 text found between markers and verify its checksum
pub fn decode_payload(encoded: &str) -> Result<ManualBlock> {
    let decoded = URL_SAFE_NO_PAD
        .decode(encoded)
        .context("Invalid code format")?;

    // Need at least CRC32 (4 bytes) + minimal JSON
    if decoded.len() < 4 + 2 {
        anyhow::bail!("Code too short (got {} bytes, need at least 6)", decoded.len());
    }

    let (json_bytes, checksum_bytes) = decoded.split_at(decoded.len() - 4);
    let mut expected = [0u8; 4];
    expected.copy_from_slice(checksum_bytes);
    if u32::from_be_bytes(expected) != crc32fast::hash(json_bytes) {
        anyhow::bail!("Checksum mismatch - code may have been corrupted during copy/paste");
    }

    serde_json::from_slice(json_bytes).context("Failed to parse signaling block")
}

/// Extract base64 payload between explicit BEGIN/END markers
fn extract_marked_payload<I>(lines: I, begin: &str, end: &str) -> Result<String>
where
    I: IntoIterator<Item = String>,
{
    let mut in_payload = false;
    let mut collected = Vec::new();

    for line in lines {
        let trimmed = line.trim();

        if trimmed.is_empty() && !in_payload {
            continue;
        }

        if trimmed == begin {
            if in_payload {
                anyhow::bail!("Duplicate BEGIN marker found.");
            }
            in_payload = true;
            continue;
        }

        if trimmed == end {
            if !in_payload {
                anyhow::bail!("END marker found before BEGIN marker.");
            }
            let joined = collected.join("");
            if joined.is_empty() {
                anyhow::bail!("No payload found between markers.");
            }
            return Ok(joined);
        }

        if !in_payload {
            anyhow::bail!("Unexpected text before BEGIN marker.");
        }

        if !trimmed.is_empty() {
            collected.push(trimmed.to_string());
        }
    }

    if !in_payload {
        anyhow::bail!("Missing BEGIN marker.");
    }
    anyhow::bail!("Missing END marker.");
}

/// Read one block of the expected kind from `input`.
///
/// Reading stops at the END marker so the rest of the input stays unread.
pub fn read_block<R: BufRead>(input: &mut R, kind: SdpKind) -> Result<ManualBlock> {
    let (begin, end) = markers(kind);
    let mut collected = Vec::new();
    let mut line = String::new();
    loop {
        line.clear();
        let n = input.read_line(&mut line).context("Failed to read line")?;
        if n == 0 {
            break;
        }
        let is_end = line.trim() == end;
        collected.push(line.clone());
        if is_end {
            break;
        }
    }
    if collected.is_empty() {
        anyhow::bail!("EOF reached while reading input");
    }

    let encoded = extract_marked_payload(collected, begin, end)?;
    let block = decode_payload(&encoded)?;
    if block.description.kind != kind {
        anyhow::bail!(
            "Block markers say {:?} but payload carries {:?}",
            kind,
            block.description.kind
        );
    }
    Ok(block)
}

/// Prompt on stderr and read a block from stdin, retrying on malformed input.
/// Blocking; run it under `spawn_blocking`.
pub fn read_block_interactive(prompt: &str, kind: SdpKind) -> Result<ManualBlock> {
    let stdin = std::io::stdin();
    let mut input = stdin.lock();
    let mut retries = 0;

    loop {
        eprintln!("{}", prompt);
        std::io::stderr().flush().context("Failed to flush stderr")?;

        match read_block(&mut input, kind) {
            Ok(block) => return Ok(block),
            Err(err) => {
                // EOF or closed stdin: retrying cannot help
                let err_str = format!("{:#}", err);
                if err_str.contains("Failed to read line") || err_str.contains("EOF") {
                    return Err(err);
                }
                retries += 1;
                if retries >= MAX_INPUT_RETRIES {
                    return Err(err).context(format!(
                        "Failed to read valid input after {} attempts",
                        MAX_INPUT_RETRIES
                    ));
                }
                eprintln!("{:#}\nPlease try again.\n", err);
            }
        }
    }
}
