//! peer-drop: direct peer-to-peer file transfer over WebRTC

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use peer_drop::app;
use peer_drop::config::Config;
use peer_drop::error::is_interrupted;
use peer_drop::signaling::EndpointId;

#[derive(Parser)]
#[command(name = "peer-drop")]
#[command(about = "Direct peer-to-peer file transfer over WebRTC data channels")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    options: Options,

    /// Use verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Args)]
struct Options {
    /// JSON config file (camelCase keys, e.g. relayAddress, chunkSize)
    #[arg(long, value_name = "PATH", global = true, env = "PEER_DROP_CONFIG")]
    config: Option<PathBuf>,

    /// Signaling relay address [default: ws://127.0.0.1:8081]
    #[arg(long, global = true, env = "PEER_DROP_RELAY")]
    relay: Option<String>,

    /// Fragment size in bytes for file data
    #[arg(long, global = true)]
    chunk_size: Option<usize>,

    /// Send-buffer high water mark in bytes; sending pauses above it
    #[arg(long, value_name = "BYTES", global = true)]
    buffer_high: Option<usize>,

    /// STUN/TURN server URL (can be specified multiple times)
    #[arg(long = "ice-server", value_name = "URL", global = true)]
    ice_servers: Vec<String>,

    /// Only use host candidates (direct LAN, no STUN)
    #[arg(long, global = true, conflicts_with = "ice_servers")]
    no_stun: bool,

    /// Seconds to wait for the data channel to open
    #[arg(long, value_name = "SECS", global = true)]
    connect_timeout: Option<u64>,

    /// Seconds to wait for candidate gathering before publishing a manual block
    #[arg(long, value_name = "SECS", global = true)]
    ice_gather_timeout: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the signaling relay
    Relay {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:8081")]
        listen: SocketAddr,
    },

    /// List the other endpoints connected to the relay
    Peers,

    /// Send a file to a peer connected to the relay
    Send {
        /// Endpoint id of the receiver (see `peer-drop peers`)
        peer: String,

        /// Path to the file to send
        file: PathBuf,
    },

    /// Wait for incoming files
    Receive {
        /// Output directory (defaults to current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Exit after the first received file
        #[arg(long)]
        once: bool,
    },

    /// Send a file using manual signaling (copy/paste blocks)
    SendManual {
        /// Path to the file to send
        file: PathBuf,
    },

    /// Receive a file using manual signaling (copy/paste blocks)
    ReceiveManual {
        /// Output directory (defaults to current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

impl Options {
    fn into_config(self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        if let Some(relay) = self.relay {
            config.relay_address = relay;
        }
        if let Some(chunk_size) = self.chunk_size {
            config.set_chunk_size(chunk_size);
        }
        if let Some(high) = self.buffer_high {
            config.buffered_amount_high = high;
        }
        if self.no_stun {
            config.ice_servers.clear();
        } else if !self.ice_servers.is_empty() {
            config.ice_servers = self.ice_servers;
        }
        if let Some(secs) = self.ice_gather_timeout {
            config.ice_gather_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.connect_timeout {
            config.connect_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() {
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(async_main()) {
        // Exit with 128 + SIGINT (2) = 130, standard Unix convention
        if is_interrupted(&e) {
            std::process::exit(130);
        }
        eprintln!("Error: {:?}", e);
        std::process::exit(1);
    }
}

async fn async_main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging with filters for noisy internal modules
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = format!(
        "{},webrtc_ice=error,webrtc_sctp=warn,webrtc_mdns=error",
        log_level
    );
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&filter)).init();

    let config = cli.options.into_config()?;
    let output_dir = |output: Option<PathBuf>| output.unwrap_or_else(|| PathBuf::from("."));

    match cli.command {
        Commands::Relay { listen } => app::run_relay(listen).await,
        Commands::Peers => app::run_peers(config).await,
        Commands::Send { peer, file } => {
            let peer = peer.trim();
            if peer.is_empty() {
                anyhow::bail!("Peer id is required");
            }
            app::run_send(config, EndpointId::from(peer), &file).await
        }
        Commands::Receive { output, once } => app::run_receive(config, output_dir(output), once).await,
        Commands::SendManual { file } => app::run_send_manual(config, &file).await,
        Commands::ReceiveManual { output } => app::run_receive_manual(config, output_dir(output)).await,
    }
}
