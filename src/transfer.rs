//! File transfer protocol over an open data channel
//!
//! Two message shapes share one ordered, reliable channel:
//! - text: JSON control messages, `{"type":"file-metadata",...}` and `{"type":"file-end"}`
//! - binary: one fragment of the active outbound file, in send order
//!
//! A transfer is exactly one metadata message, `ceil(size / chunk_size)`
//! fragments and one `file-end`. There is no acknowledgment message.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::channel::{wait_for_buffer_space, DataChannel};
use crate::error::SessionError;

/// MIME type used when the extension says nothing
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMetadata {
    pub name: String,
    pub size: u64,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    FileMetadata(TransferMetadata),
    FileEnd,
}

impl ControlMessage {
    pub fn to_json(&self) -> Result<String, SessionError> {
        serde_json::to_string(self).map_err(|e| SessionError::MalformedControl(e.to_string()))
    }

    pub fn parse(text: &str) -> Result<Self, SessionError> {
        serde_json::from_str(text).map_err(|e| SessionError::MalformedControl(e.to_string()))
    }
}

/// Number of data messages for a file of `size` bytes
pub fn num_chunks(size: u64, chunk_size: usize) -> u64 {
    if size == 0 || chunk_size == 0 {
        return 0;
    }
    size.div_ceil(chunk_size as u64)
}

/// `round(done / total * 100)`, capped at 100. An empty file is complete.
pub fn progress_percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let percent = (done as f64 / total as f64 * 100.0).round();
    percent.min(100.0) as u8
}

/// Format bytes in human-readable format
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

// ============================================================================
// Sending
// ============================================================================

/// A file ready to be sent: its metadata plus a reader positioned at byte 0
pub struct FileSource {
    pub metadata: TransferMetadata,
    reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl FileSource {
    pub async fn open(path: &Path) -> Result<Self, SessionError> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| SessionError::Io(format!("{} has no file name", path.display())))?;
        let mime_type = mime_guess::from_path(path)
            .first_raw()
            .unwrap_or(DEFAULT_MIME_TYPE)
            .to_string();

        Ok(Self {
            metadata: TransferMetadata {
                name,
                size,
                mime_type,
            },
            reader: Box::new(file),
        })
    }

    pub fn from_bytes(name: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            metadata: TransferMetadata {
                name: name.into(),
                size: data.len() as u64,
                mime_type: mime_type.into(),
            },
            reader: Box::new(std::io::Cursor::new(data)),
        }
    }
}

impl std::fmt::Debug for FileSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSource")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    pub chunk_size: usize,
    pub buffered_amount_high: usize,
}

/// Send one file: metadata, fragments in order, then `file-end`.
///
/// `on_progress(bytes_sent, percent)` runs after every fragment. Cancellation
/// abandons the transfer without sending `file-end`.
pub async fn send_file<F>(
    channel: &dyn DataChannel,
    source: &mut FileSource,
    options: SendOptions,
    cancel: &CancellationToken,
    mut on_progress: F,
) -> Result<TransferMetadata, SessionError>
where
    F: FnMut(u64, u8) + Send,
{
    if options.chunk_size == 0 {
        return Err(SessionError::Io("chunk size must be greater than zero".to_string()));
    }

    let metadata = source.metadata.clone();
    let total = metadata.size;
    log::info!(
        "Sending {} ({}) as {} chunk(s)",
        metadata.name,
        format_bytes(total),
        num_chunks(total, options.chunk_size)
    );

    channel
        .send_text(ControlMessage::FileMetadata(metadata.clone()).to_json()?)
        .await?;

    let mut buffer = vec![0u8; options.chunk_size];
    let mut sent: u64 = 0;
    while sent < total {
        let len = (total - sent).min(options.chunk_size as u64) as usize;
        wait_for_buffer_space(channel, len, options.buffered_amount_high, cancel).await?;

        source
            .reader
            .read_exact(&mut buffer[..len])
            .await
            .map_err(|e| SessionError::Io(format!("Failed to read {}: {}", metadata.name, e)))?;

        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        channel
            .send_binary(Bytes::copy_from_slice(&buffer[..len]))
            .await?;
        sent += len as u64;
        on_progress(sent, progress_percent(sent, total));
    }

    let end = ControlMessage::FileEnd.to_json()?;
    tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(SessionError::Cancelled),
        result = channel.send_text(end) => result?,
    }
    log::debug!("Sent file-end for {}", metadata.name);
    Ok(metadata)
}

// ============================================================================
// Receiving
// ============================================================================

/// A completed inbound transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub metadata: TransferMetadata,
    pub data: Bytes,
}

struct InboundTransfer {
    metadata: TransferMetadata,
    bytes: u64,
    chunks: Vec<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundUpdate {
    /// New metadata arrived; `abandoned` is the partial transfer it replaced
    Started {
        metadata: TransferMetadata,
        abandoned: Option<TransferMetadata>,
    },
    Progress {
        name: String,
        bytes: u64,
        percent: u8,
    },
    Completed(ReceivedFile),
    /// Repeated `file-end`
    Ignored,
}

/// Receive-side reassembly. One inbound transfer at a time.
#[derive(Default)]
pub struct TransferEngine {
    inbound: Option<InboundTransfer>,
    /// The last message was a `file-end` that closed a transfer
    just_finished: bool,
}

impl TransferEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inbound_metadata(&self) -> Option<&TransferMetadata> {
        self.inbound.as_ref().map(|t| &t.metadata)
    }

    /// Drop any partial inbound transfer
    pub fn reset(&mut self) -> Option<TransferMetadata> {
        self.just_finished = false;
        self.inbound.take().map(|t| t.metadata)
    }

    pub fn handle_text(&mut self, text: &str) -> Result<InboundUpdate, SessionError> {
        let finished_before = std::mem::replace(&mut self.just_finished, false);
        match ControlMessage::parse(text)? {
            ControlMessage::FileMetadata(metadata) => {
                let abandoned = self.inbound.take().map(|t| t.metadata);
                if let Some(old) = &abandoned {
                    log::warn!("Abandoning incomplete transfer of {}", old.name);
                }
                log::info!(
                    "Receiving {} ({}, {})",
                    metadata.name,
                    format_bytes(metadata.size),
                    metadata.mime_type
                );
                self.inbound = Some(InboundTransfer {
                    metadata: metadata.clone(),
                    bytes: 0,
                    chunks: Vec::new(),
                });
                Ok(InboundUpdate::Started {
                    metadata,
                    abandoned,
                })
            }
            ControlMessage::FileEnd => {
                let Some(transfer) = self.inbound.take() else {
                    if finished_before {
                        self.just_finished = true;
                        return Ok(InboundUpdate::Ignored);
                    }
                    return Err(SessionError::IncompleteTransfer {
                        reason: "file-end without file-metadata".to_string(),
                    });
                };
                let file = self.finish(transfer)?;
                self.just_finished = true;
                Ok(InboundUpdate::Completed(file))
            }
        }
    }

    pub fn handle_binary(&mut self, data: Bytes) -> Result<InboundUpdate, SessionError> {
        self.just_finished = false;
        let transfer = self
            .inbound
            .as_mut()
            .ok_or(SessionError::ChunkBeforeMetadata)?;
        transfer.bytes += data.len() as u64;
        transfer.chunks.push(data);
        Ok(InboundUpdate::Progress {
            name: transfer.metadata.name.clone(),
            bytes: transfer.bytes,
            percent: progress_percent(transfer.bytes, transfer.metadata.size),
        })
    }

    fn finish(&self, transfer: InboundTransfer) -> Result<ReceivedFile, SessionError> {
        let InboundTransfer {
            metadata,
            bytes,
            chunks,
        } = transfer;

        if metadata.size > 0 && bytes == 0 {
            return Err(SessionError::IncompleteTransfer {
                reason: format!("no data received for {} ({} bytes expected)", metadata.name, metadata.size),
            });
        }
        if bytes != metadata.size {
            log::warn!(
                "Size mismatch for {}: expected {} bytes, received {}",
                metadata.name,
                metadata.size,
                bytes
            );
        }

        let mut data = BytesMut::with_capacity(bytes as usize);
        for chunk in chunks {
            data.extend_from_slice(&chunk);
        }
        Ok(ReceivedFile {
            metadata,
            data: data.freeze(),
        })
    }
}
