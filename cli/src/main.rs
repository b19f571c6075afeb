// peerlink: relay server and peer tools
//
// Runs a relay, or connects to one as a peer to send events, watch them
// arrive, or move bytes over a stream.

mod config;
mod values;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use peerlink_core::{PeerClient, RelayServer, StreamOptions, TcpAcceptor};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Chunk size for `pipe`
const PIPE_CHUNK: usize = 16 * 1024;

#[derive(Parser)]
#[command(name = "peerlink")]
#[command(about = "Peer-to-peer messaging and streams through a relay", long_about = None)]
#[command(version)]
struct Cli {
    /// Relay address (overrides the configured one)
    #[arg(short, long, global = true)]
    relay: Option<String>,

    /// Peer id to register as (overrides the configured one)
    #[arg(short, long, global = true)]
    id: Option<String>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a relay server
    Relay {
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Let a reconnecting peer evict its old connection
        #[arg(long)]
        overwrite: bool,
    },
    /// List peers registered with the relay
    Peers,
    /// Send an event to a peer
    Send {
        to: String,
        event: String,
        /// JSON array of arguments
        args: Option<String>,
        /// Wait for the receiver's acknowledgement and print it
        #[arg(long)]
        ack: bool,
    },
    /// Print events as they arrive
    Listen {
        /// Event names to listen for
        #[arg(required = true)]
        events: Vec<String>,
    },
    /// Send stdin to a peer over a stream
    Pipe { to: String },
    /// Accept one stream and copy it to stdout
    Recv {
        /// Only accept a stream from this peer
        #[arg(long)]
        from: Option<String>,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let config = config::Config::load()?;

    match cli.command {
        Commands::Relay {
            port,
            host,
            overwrite,
        } => cmd_relay(&config, &host, port, overwrite).await,
        Commands::Config { action } => cmd_config(config, action),
        command => {
            let client = connect(&config, cli.relay.as_deref(), cli.id.as_deref()).await?;
            let result = match command {
                Commands::Peers => cmd_peers(&client).await,
                Commands::Send {
                    to,
                    event,
                    args,
                    ack,
                } => cmd_send(&client, &to, &event, args.as_deref(), ack).await,
                Commands::Listen { events } => cmd_listen(&client, events).await,
                Commands::Pipe { to } => cmd_pipe(&client, &to).await,
                Commands::Recv { from } => cmd_recv(&client, from.as_deref()).await,
                Commands::Relay { .. } | Commands::Config { .. } => Ok(()),
            };
            client.disconnect();
            result
        }
    }
}

async fn connect(config: &config::Config, relay: Option<&str>, id: Option<&str>) -> Result<PeerClient> {
    let address = relay.unwrap_or(&config.relay_address);
    let peer_id = match id.map(str::to_string).or_else(|| config.peer_id.clone()) {
        Some(id) => id,
        None => format!("peerlink-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
    };

    let client = PeerClient::connect_tcp(address, &peer_id, config.peer_config())
        .await
        .with_context(|| format!("Failed to join relay at {} as {}", address, peer_id))?;
    eprintln!(
        "{} Connected to {} as {}",
        "✓".green(),
        address.bright_cyan(),
        peer_id.bright_yellow()
    );
    Ok(client)
}

async fn cmd_relay(config: &config::Config, host: &str, port: Option<u16>, overwrite: bool) -> Result<()> {
    let port = port.unwrap_or(config.listen_port);
    let bind = format!("{}:{}", host, port);
    let acceptor = TcpAcceptor::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    let local = acceptor.local_addr().context("Failed to read bound address")?;

    let relay = RelayServer::with_config(config.relay_config(overwrite));
    tracing::info!("relay listening on {}", local);
    println!("{}", "Relay running".bold());
    println!("  Address:   {}", format!("tcp://{}", local).bright_cyan());
    println!(
        "  Overwrite: {}",
        if relay.config().client_overwrite {
            "evict incumbent".yellow()
        } else {
            "refuse newcomer".green()
        }
    );
    println!("  Press Ctrl+C to stop");

    let server = relay.clone();
    let serving = tokio::spawn(async move { server.serve(acceptor).await });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl+C")?;
    serving.abort();
    relay.shutdown("relay shutting down");

    let stats = relay.get_stats();
    println!();
    println!("{}", "Relay stopped".bold());
    println!("  Events forwarded: {}", stats.events_forwarded);
    println!("  Acks relayed:     {}", stats.acks_relayed);
    println!("  Bytes relayed:    {}", stats.bytes_relayed);
    println!("  Failures:         {}", stats.forward_failures);
    println!("  Refused:          {}", stats.connections_refused);
    Ok(())
}

async fn cmd_peers(client: &PeerClient) -> Result<()> {
    let peers = client
        .addressing()
        .list_peers()
        .await
        .context("Failed to list peers")?;

    println!("{} ({} connected)", "Peers".bold(), peers.len());
    for peer in peers {
        if peer == client.peer_id() {
            println!("  {} {} {}", "•".bright_green(), peer.bright_cyan(), "(you)".dimmed());
        } else {
            println!("  {} {}", "•".bright_green(), peer.bright_cyan());
        }
    }
    Ok(())
}

async fn cmd_send(
    client: &PeerClient,
    to: &str,
    event: &str,
    args: Option<&str>,
    ack: bool,
) -> Result<()> {
    let args = values::parse_args(args)?;

    if ack {
        let reply = client
            .addressing()
            .emit_to_with_ack(to, event, args)
            .await
            .with_context(|| format!("{} did not acknowledge {}", to, event))?;
        println!("{} {} acknowledged: {}", "✓".green(), to.bright_cyan(), values::render(&reply));
        return Ok(());
    }

    client.addressing().emit_to(to, event, args)?;
    // Give the relay a moment to report an unknown target
    if let Ok(Some(err)) = tokio::time::timeout(Duration::from_millis(500), client.next_error()).await {
        anyhow::bail!("Failed to send {} to {}: {}", event, to, err);
    }
    println!("{} Sent {} to {}", "✓".green(), event.bright_yellow(), to.bright_cyan());
    Ok(())
}

async fn cmd_listen(client: &PeerClient, events: Vec<String>) -> Result<()> {
    for event in events {
        client.addressing().on_any(event, |mut incoming| {
            println!(
                "{} {} {}",
                incoming.from.bright_cyan(),
                incoming.event.bright_yellow(),
                values::render(&incoming.args)
            );
            incoming.reply(vec![peerlink_core::Value::Bool(true)]);
        });
    }
    eprintln!("{}", "Listening (Ctrl+C to stop)".dimmed());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = client.closed() => anyhow::bail!("Relay closed the connection"),
            err = client.next_error() => match err {
                Some(err) => eprintln!("{} {}", "!".red(), err),
                None => return Ok(()),
            },
        }
    }
}

async fn cmd_pipe(client: &PeerClient, to: &str) -> Result<()> {
    let channel = client
        .streams()
        .add_stream(to, StreamOptions::default())
        .await
        .with_context(|| format!("Failed to open a stream to {}", to))?;

    let mut stdin = tokio::io::stdin();
    let mut buf = vec![0u8; PIPE_CHUNK];
    loop {
        let n = stdin.read(&mut buf).await.context("Failed to read stdin")?;
        if n == 0 {
            break;
        }
        channel
            .write(buf[..n].to_vec())
            .await
            .context("Stream closed by peer")?;
    }

    let sent = channel.bytes_written();
    channel.destroy();
    eprintln!("{} Sent {} bytes to {}", "✓".green(), sent, to.bright_cyan());
    Ok(())
}

async fn cmd_recv(client: &PeerClient, from: Option<&str>) -> Result<()> {
    let mut listener = match from {
        Some(peer) => client.streams().listen_from(peer),
        None => client.streams().listen(),
    };
    eprintln!("{}", "Waiting for a stream (Ctrl+C to stop)".dimmed());

    let channel = tokio::select! {
        _ = tokio::signal::ctrl_c() => return Ok(()),
        channel = listener.accept() => channel.context("Connection closed before a stream arrived")?,
    };
    eprintln!("{} Stream from {}", "✓".green(), channel.remote().bright_cyan());

    let mut stdout = tokio::io::stdout();
    while let Some(chunk) = channel.read().await {
        stdout.write_all(&chunk).await.context("Failed to write stdout")?;
    }
    stdout.flush().await.context("Failed to flush stdout")?;
    eprintln!("{} Received {} bytes", "✓".green(), channel.bytes_read());
    Ok(())
}

fn cmd_config(mut config: config::Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<22} {}", key.bright_cyan(), value);
            }
            println!();
            println!(
                "  {}",
                config::Config::config_file()?.display().to_string().dimmed()
            );
        }
    }

    Ok(())
}
