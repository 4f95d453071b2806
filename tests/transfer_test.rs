use bytes::Bytes;
use std::io::Write;
use tokio_util::sync::CancellationToken;

use peer_drop::channel::memory::{pair, MemoryReceiver};
use peer_drop::channel::{ChannelEvent, ChannelMessage, DataChannel};
use peer_drop::transfer::{
    send_file, ControlMessage, FileSource, InboundUpdate, SendOptions, TransferEngine,
};
use peer_drop::SessionError;

const OPTIONS: SendOptions = SendOptions {
    chunk_size: 16384,
    buffered_amount_high: 1024 * 1024,
};

/// Drain everything currently queued on `rx`
async fn collect_messages(rx: &mut MemoryReceiver, count: usize) -> Vec<ChannelMessage> {
    let mut messages = Vec::with_capacity(count);
    while messages.len() < count {
        match rx.recv().await {
            Some(ChannelEvent::Message(msg)) => messages.push(msg),
            Some(other) => panic!("unexpected event {:?}", other),
            None => break,
        }
    }
    messages
}

fn feed(engine: &mut TransferEngine, msg: ChannelMessage) -> Result<InboundUpdate, SessionError> {
    match msg {
        ChannelMessage::Text(text) => engine.handle_text(&text),
        ChannelMessage::Binary(data) => engine.handle_binary(data),
    }
}

// =============================================================================
// Sender framing
// =============================================================================

#[tokio::test]
async fn test_send_splits_into_fragments() {
    let (a, _a_rx, _b, mut b_rx) = pair("file-transfer");
    let data: Vec<u8> = (0..100_000u32).map(|i| (i % 256) as u8).collect();
    let mut source = FileSource::from_bytes("x.bin", "application/octet-stream", data);

    let mut progress = Vec::new();
    let cancel = CancellationToken::new();
    send_file(&a, &mut source, OPTIONS, &cancel, |bytes, percent| {
        progress.push((bytes, percent))
    })
    .await
    .unwrap();

    // metadata + ceil(100000 / 16384) fragments + file-end
    let messages = collect_messages(&mut b_rx, 9).await;
    assert_eq!(messages.len(), 9);

    match &messages[0] {
        ChannelMessage::Text(text) => {
            assert_eq!(
                text,
                r#"{"type":"file-metadata","name":"x.bin","size":100000,"mimeType":"application/octet-stream"}"#
            );
        }
        other => panic!("expected metadata, got {:?}", other),
    }
    let sizes: Vec<usize> = messages[1..8]
        .iter()
        .map(|m| match m {
            ChannelMessage::Binary(data) => data.len(),
            other => panic!("expected fragment, got {:?}", other),
        })
        .collect();
    assert_eq!(sizes, vec![16384, 16384, 16384, 16384, 16384, 16384, 1696]);
    assert_eq!(messages[8], ChannelMessage::Text(r#"{"type":"file-end"}"#.to_string()));

    // Every fragment reports round(min(n * chunk, size) / size * 100)
    let expected: Vec<(u64, u8)> = (1..=7u64)
        .map(|n| {
            let bytes = (n * 16384).min(100_000);
            (bytes, (bytes as f64 / 100_000.0 * 100.0).round() as u8)
        })
        .collect();
    assert_eq!(progress, expected);
    assert_eq!(
        progress.iter().map(|&(_, p)| p).collect::<Vec<_>>(),
        vec![16, 33, 49, 66, 82, 98, 100]
    );
}

#[tokio::test]
async fn test_send_empty_file() {
    let (a, _a_rx, _b, mut b_rx) = pair("file-transfer");
    let mut source = FileSource::from_bytes("empty.txt", "text/plain", Vec::new());

    let mut calls = 0;
    send_file(&a, &mut source, OPTIONS, &CancellationToken::new(), |_, _| calls += 1)
        .await
        .unwrap();
    assert_eq!(calls, 0);

    let messages = collect_messages(&mut b_rx, 2).await;
    assert!(matches!(&messages[0], ChannelMessage::Text(t) if t.contains("file-metadata")));
    assert_eq!(messages[1], ChannelMessage::Text(r#"{"type":"file-end"}"#.to_string()));
    assert_eq!(a.buffered_amount().await, 0);
}

#[tokio::test]
async fn test_send_on_closed_channel_fails() {
    let (a, _a_rx, b, _b_rx) = pair("file-transfer");
    b.close().await;

    let mut source = FileSource::from_bytes("x.bin", "application/octet-stream", vec![1; 10]);
    let err = send_file(&a, &mut source, OPTIONS, &CancellationToken::new(), |_, _| {})
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Channel(_)));
}

#[tokio::test]
async fn test_cancelled_send_skips_file_end() {
    let (a, _a_rx, _b, mut b_rx) = pair("file-transfer");
    let options = SendOptions {
        chunk_size: 4,
        buffered_amount_high: 8,
    };
    let cancel = CancellationToken::new();
    let mut source = FileSource::from_bytes("x.bin", "application/octet-stream", vec![7; 64]);

    // Nobody drains the receiver, so the sender parks on backpressure
    let sender_cancel = cancel.clone();
    let task = tokio::spawn(async move {
        send_file(&a, &mut source, options, &sender_cancel, |_, _| {}).await
    });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    cancel.cancel();

    assert_eq!(task.await.unwrap().unwrap_err(), SessionError::Cancelled);

    let mut saw_end = false;
    while let Ok(Some(event)) =
        tokio::time::timeout(std::time::Duration::from_millis(20), b_rx.recv()).await
    {
        if let ChannelEvent::Message(ChannelMessage::Text(text)) = event {
            saw_end |= text.contains("file-end");
        }
    }
    assert!(!saw_end);
}

#[tokio::test]
async fn test_cancel_before_file_end_suppresses_it() {
    let (a, _a_rx, _b, mut b_rx) = pair("file-transfer");
    let mut source = FileSource::from_bytes("empty.txt", "text/plain", Vec::new());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = send_file(&a, &mut source, OPTIONS, &cancel, |_, _| {})
        .await
        .unwrap_err();
    assert_eq!(err, SessionError::Cancelled);

    let messages = collect_messages(&mut b_rx, 1).await;
    assert!(matches!(&messages[0], ChannelMessage::Text(t) if t.contains("file-metadata")));
    let next = tokio::time::timeout(std::time::Duration::from_millis(20), b_rx.recv()).await;
    assert!(next.is_err(), "file-end sent after cancellation: {:?}", next);
}

// =============================================================================
// Receiver reassembly
// =============================================================================

#[tokio::test]
async fn test_send_and_reassemble() {
    let (a, _a_rx, _b, mut b_rx) = pair("file-transfer");
    let data: Vec<u8> = (0..50_000u32).map(|i| (i * 7 % 256) as u8).collect();
    let mut source = FileSource::from_bytes("photo.jpg", "image/jpeg", data.clone());

    send_file(&a, &mut source, OPTIONS, &CancellationToken::new(), |_, _| {})
        .await
        .unwrap();

    let mut engine = TransferEngine::new();
    let mut percents = Vec::new();
    let mut received = None;
    for msg in collect_messages(&mut b_rx, 6).await {
        match feed(&mut engine, msg).unwrap() {
            InboundUpdate::Started { metadata, abandoned } => {
                assert_eq!(metadata.name, "photo.jpg");
                assert_eq!(metadata.mime_type, "image/jpeg");
                assert!(abandoned.is_none());
            }
            InboundUpdate::Progress { percent, .. } => percents.push(percent),
            InboundUpdate::Completed(file) => received = Some(file),
            InboundUpdate::Ignored => panic!("nothing should be ignored"),
        }
    }

    assert_eq!(percents, vec![33, 66, 98, 100]);
    let file = received.unwrap();
    assert_eq!(file.metadata.size, 50_000);
    assert_eq!(&file.data[..], &data[..]);
    assert!(engine.inbound_metadata().is_none());
}

#[test]
fn test_file_end_without_metadata() {
    let mut engine = TransferEngine::new();
    let err = engine
        .handle_text(&ControlMessage::FileEnd.to_json().unwrap())
        .unwrap_err();
    assert!(matches!(err, SessionError::IncompleteTransfer { .. }));
    assert!(err.is_protocol_violation());
}

#[test]
fn test_chunk_before_metadata() {
    let mut engine = TransferEngine::new();
    let err = engine.handle_binary(Bytes::from_static(b"data")).unwrap_err();
    assert_eq!(err, SessionError::ChunkBeforeMetadata);
    assert!(engine.inbound_metadata().is_none());
}

#[test]
fn test_malformed_control_message() {
    let mut engine = TransferEngine::new();
    let err = engine.handle_text("not json").unwrap_err();
    assert!(matches!(err, SessionError::MalformedControl(_)));

    let err = engine.handle_text(r#"{"type":"file-resume"}"#).unwrap_err();
    assert!(matches!(err, SessionError::MalformedControl(_)));
}

// =============================================================================
// File sources
// =============================================================================

#[tokio::test]
async fn test_file_source_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.txt");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(b"hello from disk").unwrap();
    drop(file);

    let mut source = FileSource::open(&path).await.unwrap();
    assert_eq!(source.metadata.name, "notes.txt");
    assert_eq!(source.metadata.size, 15);
    assert_eq!(source.metadata.mime_type, "text/plain");

    let (a, _a_rx, _b, mut b_rx) = pair("file-transfer");
    send_file(&a, &mut source, OPTIONS, &CancellationToken::new(), |_, _| {})
        .await
        .unwrap();
    let messages = collect_messages(&mut b_rx, 3).await;
    assert_eq!(
        messages[1],
        ChannelMessage::Binary(Bytes::from_static(b"hello from disk"))
    );
}

#[tokio::test]
async fn test_unknown_extension_uses_default_mime() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blob.zzqx");
    std::fs::write(&path, [0u8; 4]).unwrap();

    let source = FileSource::open(&path).await.unwrap();
    assert_eq!(source.metadata.mime_type, "application/octet-stream");
}

#[tokio::test]
async fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = FileSource::open(&dir.path().join("missing.bin")).await.unwrap_err();
    assert!(matches!(err, SessionError::Io(_)));
}
