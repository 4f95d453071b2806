//! Command flows behind the `peer-drop` binary

use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::controller::{Direction, Notification, SessionController, SessionHandle};
use crate::error::{Interrupted, SessionError};
use crate::rtc::WebRtcConnectorFactory;
use crate::signaling::manual::{self, ManualSignaler, MANUAL_PEER_ID};
use crate::signaling::relay_client::RelayClient;
use crate::signaling::relay_server;
use crate::signaling::{EndpointId, RelayEvent, SdpKind};
use crate::sink::DirectorySink;
use crate::transfer::{format_bytes, FileSource};

/// How long `peers` waits for the relay's snapshot
const PEERS_TIMEOUT: Duration = Duration::from_secs(10);

type Notifications = mpsc::UnboundedReceiver<Notification>;

pub async fn run_relay(listen: SocketAddr) -> Result<()> {
    tokio::select! {
        result = relay_server::run_relay(listen) => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nRelay stopped");
            Err(Interrupted.into())
        }
    }
}

/// Connect to the relay and print the other endpoints, one per line
pub async fn run_peers(config: Config) -> Result<()> {
    let (handle, mut notifications, client) = start_relay_session(&config, PathBuf::from(".")).await?;

    let peers = tokio::time::timeout(PEERS_TIMEOUT, async {
        while let Some(notification) = notifications.recv().await {
            match notification {
                Notification::Peers(peers) => return Ok(peers),
                Notification::RelayDisconnected => break,
                _ => {}
            }
        }
        anyhow::bail!("Relay closed the connection before sending the peer list")
    })
    .await
    .context("Timed out waiting for peer list")??;

    if peers.is_empty() {
        eprintln!("No other peers connected");
    }
    for peer in peers {
        println!("{}", peer);
    }
    handle.disconnect().await;
    client.close().await;
    Ok(())
}

pub async fn run_send(config: Config, peer: EndpointId, path: &Path) -> Result<()> {
    let source = FileSource::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let (handle, notifications, client) = start_relay_session(&config, PathBuf::from(".")).await?;

    let result = with_interrupt(&handle, async {
        handle.connect(peer.clone()).await?;
        eprintln!("Offer sent to {}, waiting for the channel to open...", peer);
        send_when_connected(&handle, notifications, source).await
    })
    .await;
    client.close().await;
    result
}

pub async fn run_receive(config: Config, output: PathBuf, once: bool) -> Result<()> {
    let (handle, notifications, client) = start_relay_session(&config, output.clone()).await?;
    eprintln!("Saving received files to {}", output.display());

    let result = with_interrupt(&handle, async {
        receive_loop(&handle, notifications, once).await
    })
    .await;
    client.close().await;
    result
}

pub async fn run_send_manual(config: Config, path: &Path) -> Result<()> {
    let source = FileSource::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let (handle, notifications, mut published, events_tx) =
        start_manual_session(&config, PathBuf::from(".")).await?;

    with_interrupt(&handle, async {
        eprintln!("Ask the receiver to run: peer-drop receive-manual");
        eprintln!("Gathering network candidates...");
        handle.connect(EndpointId::from(MANUAL_PEER_ID)).await?;

        let offer = published
            .recv()
            .await
            .context("Offer was never published")?;
        eprintln!("\nCopy this block to the receiver:\n");
        println!("{}", offer);
        eprintln!();

        spawn_block_reader(
            "Paste the receiver's answer (including BEGIN/END markers):",
            SdpKind::Answer,
            events_tx,
        );
        send_when_connected(&handle, notifications, source).await
    })
    .await
}

pub async fn run_receive_manual(config: Config, output: PathBuf) -> Result<()> {
    let (handle, notifications, mut published, events_tx) =
        start_manual_session(&config, output).await?;

    with_interrupt(&handle, async {
        spawn_block_reader(
            "Paste the sender's offer (including BEGIN/END markers):",
            SdpKind::Offer,
            events_tx,
        );

        tokio::spawn(async move {
            if let Some(answer) = published.recv().await {
                eprintln!("\nCopy this block back to the sender:\n");
                println!("{}", answer);
                eprintln!("\nWaiting for connection...");
            }
        });

        receive_loop(&handle, notifications, true).await
    })
    .await
}

async fn start_relay_session(
    config: &Config,
    output: PathBuf,
) -> Result<(SessionHandle, Notifications, Arc<RelayClient>)> {
    let (client, events) = RelayClient::connect(&config.relay_address).await?;
    let client = Arc::new(client);
    let (handle, notifications) = SessionController::spawn(
        config.clone(),
        client.clone(),
        events,
        Arc::new(WebRtcConnectorFactory::new(config.ice_servers.clone())),
        Arc::new(DirectorySink::new(output)),
    );
    Ok((handle, notifications, client))
}

async fn start_manual_session(
    config: &Config,
    output: PathBuf,
) -> Result<(
    SessionHandle,
    Notifications,
    mpsc::UnboundedReceiver<String>,
    mpsc::Sender<RelayEvent>,
)> {
    let (signaler, published) = ManualSignaler::new(config.ice_gather_timeout);
    let (events_tx, events_rx) = mpsc::channel(64);
    for event in manual::initial_events() {
        events_tx
            .send(event)
            .await
            .context("Failed to queue initial events")?;
    }

    let (handle, notifications) = SessionController::spawn(
        config.clone(),
        Arc::new(signaler),
        events_rx,
        Arc::new(WebRtcConnectorFactory::new(config.ice_servers.clone())),
        Arc::new(DirectorySink::new(output)),
    );
    Ok((handle, notifications, published, events_tx))
}

/// Read the remote block from stdin off the async runtime and replay it
fn spawn_block_reader(prompt: &'static str, kind: SdpKind, events: mpsc::Sender<RelayEvent>) {
    tokio::spawn(async move {
        let result =
            tokio::task::spawn_blocking(move || manual::read_block_interactive(prompt, kind)).await;
        match result {
            Ok(Ok(block)) => {
                for event in block.into_events() {
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
            Ok(Err(e)) => {
                log::error!("Failed to read signaling block: {:#}", e);
                let _ = events.send(RelayEvent::Disconnected).await;
            }
            Err(e) => log::error!("Signaling block reader panicked: {}", e),
        }
    });
}

/// Run `flow`; on Ctrl+C tear the session down and report [`Interrupted`]
async fn with_interrupt<F>(handle: &SessionHandle, flow: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let result = tokio::select! {
        result = flow => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nInterrupted, closing session...");
            Err(Interrupted.into())
        }
    };
    handle.disconnect().await;
    result
}

/// Refusals are expected traffic; peer misbehavior and transport failures are not
fn report_error(err: &SessionError) {
    if err.is_policy_violation() {
        log::info!("Refused: {}", err);
    } else if err.is_protocol_violation() {
        log::warn!("Peer protocol violation: {}", err);
    } else {
        log::error!("{}", err);
    }
}

async fn send_when_connected(
    handle: &SessionHandle,
    mut notifications: Notifications,
    source: FileSource,
) -> Result<()> {
    loop {
        match notifications.recv().await {
            Some(Notification::Connected { peer }) => {
                eprintln!("Connected to {}", peer);
                break;
            }
            Some(Notification::SessionClosed { reason, .. }) => {
                anyhow::bail!("Session closed before the channel opened: {}", reason)
            }
            Some(Notification::RelayDisconnected) => {
                anyhow::bail!("Signaling connection lost before the channel opened")
            }
            Some(Notification::Error(e)) => report_error(&e),
            Some(_) => {}
            None => return Err(SessionError::ControllerStopped.into()),
        }
    }

    let total = source.metadata.size;
    let name = source.metadata.name.clone();
    eprintln!("Sending {} ({})", name, format_bytes(total));

    let send = handle.send_file(source);
    tokio::pin!(send);
    let result = loop {
        tokio::select! {
            result = &mut send => break result,
            Some(notification) = notifications.recv() => {
                if let Notification::Progress { direction: Direction::Outbound, bytes, percent, .. } = notification {
                    eprint!(
                        "\r   Progress: {:>3}% ({} / {})",
                        percent,
                        format_bytes(bytes),
                        format_bytes(total)
                    );
                }
            }
        }
    };
    eprintln!();

    let metadata = result.with_context(|| format!("Failed to send {}", name))?;
    eprintln!("Sent {} ({})", metadata.name, format_bytes(metadata.size));
    Ok(())
}

async fn receive_loop(handle: &SessionHandle, mut notifications: Notifications, once: bool) -> Result<()> {
    let mut total = 0;
    while let Some(notification) = notifications.recv().await {
        match notification {
            Notification::Identity(id) => eprintln!("Waiting for offers as {}", id),
            Notification::Connecting { peer, .. } => eprintln!("Incoming connection from {}", peer),
            Notification::Connected { peer } => eprintln!("Connected to {}", peer),
            Notification::ReceiveStarted(metadata) => {
                total = metadata.size;
                eprintln!(
                    "Receiving {} ({}, {})",
                    metadata.name,
                    format_bytes(metadata.size),
                    metadata.mime_type
                );
            }
            Notification::Progress {
                direction: Direction::Inbound,
                bytes,
                percent,
                ..
            } => {
                eprint!(
                    "\r   Progress: {:>3}% ({} / {})",
                    percent,
                    format_bytes(bytes),
                    format_bytes(total)
                );
            }
            Notification::FileReceived {
                metadata, location, ..
            } => {
                eprintln!("\nReceived {} -> {}", metadata.name, location);
                if once {
                    handle.disconnect().await;
                    return Ok(());
                }
            }
            Notification::TransferAborted { reason, .. } => {
                eprintln!("\nTransfer aborted: {}", reason)
            }
            Notification::SessionClosed { peer, reason } => {
                eprintln!("Session with {} closed: {}", peer, reason)
            }
            Notification::Error(e) => report_error(&e),
            Notification::RelayDisconnected => anyhow::bail!("Signaling connection lost"),
            _ => {}
        }
    }
    Err(SessionError::ControllerStopped.into())
}
