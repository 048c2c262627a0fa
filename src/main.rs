//! polljoin - peer-to-peer data channels negotiated through a polling relay

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use polljoin::network::{
    generate_client_name, ChannelEvent, ChannelPair, DataChannel, EndReason, HostNegotiator,
    HttpRelay, JoinNegotiator, PeerConnection, RelayConfig, WebRtcEngine,
};

/// How long the host waits for an opened channel after the session ends
const HANDOFF_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "polljoin")]
#[command(about = "Peer-to-peer data channels negotiated through a polling relay")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Signaling relay base URL
    #[arg(long, global = true, env = "POLLJOIN_RELAY")]
    relay: Option<String>,

    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Delay between relay polls in milliseconds
    #[arg(long, global = true)]
    interval_ms: Option<u64>,

    /// Number of relay polls before giving up
    #[arg(long, global = true)]
    attempts: Option<u32>,

    /// STUN server URL (repeatable)
    #[arg(long, global = true)]
    stun: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Host a session and wait for clients
    Host {
        /// Name announced to the relay
        #[arg(short, long)]
        name: Option<String>,

        /// List the session publicly on the relay
        #[arg(long)]
        public: bool,
    },

    /// Join a session by name
    Join {
        /// Session name printed by the host
        session: String,

        /// Client name (generated if omitted)
        #[arg(short, long)]
        name: Option<String>,

        /// Send a single message and exit (non-interactive mode)
        #[arg(short = 'm', long)]
        message: Option<String>,

        /// Seconds to keep printing replies after sending --message
        #[arg(long, default_value = "5")]
        linger: u64,
    },
}

fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    // RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("polljoin={},webrtc=warn", level)));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// File config (or defaults) with command line overrides applied
fn load_config(cli: &Cli) -> Result<RelayConfig> {
    let mut config = match &cli.config {
        Some(path) => RelayConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => RelayConfig::default(),
    };

    if let Some(relay) = &cli.relay {
        config.relay_url = relay.clone();
    }
    if let Some(interval_ms) = cli.interval_ms {
        config.poll_interval_ms = interval_ms;
    }
    if let Some(attempts) = cli.attempts {
        config.max_attempts = attempts;
    }
    if !cli.stun.is_empty() {
        config.ice_servers = cli.stun.clone();
    }

    config.validate()?;
    Ok(config)
}

/// Cancel `token` on Ctrl+C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted");
            token.cancel();
        }
    });
}

async fn run_host(mut config: RelayConfig, name: Option<String>, public: bool) -> Result<()> {
    if let Some(name) = name {
        config.host_name = name;
    }
    config.public |= public;

    let transport = Arc::new(HttpRelay::new(&config.relay_url)?);
    let engine = Arc::new(WebRtcEngine::new());
    let host = HostNegotiator::new(transport, engine, config.negotiation_config());

    let session = host.open_session().await?;
    println!("\nSession: {}", session.session_name);
    println!("Join with: polljoin join {}\n", session.session_name);

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let ended = host.run(&session, tx, cancel.clone()).await?;

    match ended.reason {
        EndReason::Connected => {}
        EndReason::Exhausted => {
            bail!("No client connected after {} polls", ended.attempts);
        }
        EndReason::Cancelled => return Ok(()),
    }

    for client in &ended.clients {
        info!("{}: {:?}", client.client_name, client.state);
    }

    // The first channel may still be opening
    let first = match tokio::time::timeout(HANDOFF_TIMEOUT, rx.recv()).await {
        Ok(Some(pair)) => pair,
        _ => bail!("Client connected but its data channel never opened"),
    };

    let (pairs_tx, pairs_rx) = mpsc::unbounded_channel();
    let _ = pairs_tx.send(first);
    tokio::spawn(async move {
        while let Some(pair) = rx.recv().await {
            if pairs_tx.send(pair).is_err() {
                break;
            }
        }
    });

    chat(pairs_rx, cancel).await;
    Ok(())
}

async fn run_join(
    config: RelayConfig,
    session: String,
    name: Option<String>,
    message: Option<String>,
    linger: u64,
) -> Result<()> {
    let client_name = name.unwrap_or_else(generate_client_name);

    let transport = Arc::new(HttpRelay::new(&config.relay_url)?);
    let engine = Arc::new(WebRtcEngine::new());
    let mut negotiator = JoinNegotiator::new(transport, engine, config.negotiation_config());

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let pair = negotiator
        .join_session(&session, &client_name, cancel.clone())
        .await
        .with_context(|| format!("Failed to join session {}", session))?;

    println!("\nConnected to {} as {}", session, client_name);

    if let Some(text) = message {
        send_once(pair, &text, Duration::from_secs(linger)).await?;
        return Ok(());
    }

    let (pairs_tx, pairs_rx) = mpsc::unbounded_channel();
    let _ = pairs_tx.send(pair);
    chat(pairs_rx, cancel).await;
    Ok(())
}

/// Send one message, print replies for `linger`, then disconnect
async fn send_once(mut pair: ChannelPair, text: &str, linger: Duration) -> Result<()> {
    pair.channel.send_text(text).await?;
    println!("You: {}", text);

    let deadline = tokio::time::sleep(linger);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = pair.events.recv() => match event {
                Some(ChannelEvent::Message(reply)) => println!("Peer: {}", reply),
                Some(ChannelEvent::Open) => {}
                Some(ChannelEvent::Closed) | None => {
                    println!("Peer closed the channel");
                    break;
                }
            },
        }
    }

    if let Err(e) = pair.connection.close().await {
        warn!("Failed to close connection: {}", e);
    }
    Ok(())
}

/// Relay stdin lines to every connected peer and print what they send back
async fn chat(mut pairs: mpsc::UnboundedReceiver<ChannelPair>, cancel: CancellationToken) {
    let (incoming_tx, mut incoming_rx) = mpsc::unbounded_channel::<(usize, ChannelEvent)>();
    let mut peers: Vec<(Arc<dyn PeerConnection>, Arc<dyn DataChannel>)> = Vec::new();
    let mut pairs_open = true;
    let mut stdin_open = true;

    let stdin = tokio::io::stdin();
    let mut stdin_reader = BufReader::new(stdin).lines();

    println!("Type a message and press Enter to send.");
    println!("Press Ctrl+C to stop.\n");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Shutting down...");
                break;
            }
            pair = pairs.recv(), if pairs_open => match pair {
                Some(ChannelPair { connection, channel, mut events }) => {
                    let peer = peers.len() + 1;
                    println!("Peer {} joined", peer);
                    peers.push((connection, channel));

                    let tx = incoming_tx.clone();
                    tokio::spawn(async move {
                        while let Some(event) = events.recv().await {
                            if tx.send((peer, event)).is_err() {
                                break;
                            }
                        }
                        let _ = tx.send((peer, ChannelEvent::Closed));
                    });
                }
                None => pairs_open = false,
            },
            Some((peer, event)) = incoming_rx.recv() => match event {
                ChannelEvent::Message(text) => println!("Peer {}: {}", peer, text),
                ChannelEvent::Closed => println!("Peer {} left", peer),
                ChannelEvent::Open => {}
            },
            line_result = stdin_reader.next_line(), if stdin_open => {
                match line_result {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        for (_, channel) in &peers {
                            if let Err(e) = channel.send_text(line).await {
                                warn!("Failed to send message: {}", e);
                            }
                        }
                        println!("You: {}", line);
                    }
                    Ok(None) => {
                        info!("stdin closed");
                        stdin_open = false;
                    }
                    Err(e) => {
                        warn!("stdin error: {}", e);
                        stdin_open = false;
                    }
                }
            }
        }
    }

    for (connection, _) in peers {
        if let Err(e) = connection.close().await {
            warn!("Failed to close connection: {}", e);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = load_config(&cli)?;
    info!("Using relay {}", config.relay_url);

    match cli.command {
        Commands::Host { name, public } => {
            run_host(config, name, public).await?;
        }
        Commands::Join {
            session,
            name,
            message,
            linger,
        } => {
            run_join(config, session, name, message, linger).await?;
        }
    }

    Ok(())
}
