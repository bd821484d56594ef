mod cli;
mod config;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use config::Config;
use peerdrop_protocol::format::{format_file_size, format_speed};
use peerdrop_protocol::transport::{TcpListenerTransport, TcpTransportFactory};
use peerdrop_protocol::{
    ConnectionEvent, NodeEvents, OutgoingFile, PeerNode, Severity, TransferEvent,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

fn build_node(config: &Config) -> (PeerNode, NodeEvents) {
    let factory = TcpTransportFactory::new(&config.node.peer_id, &config.node.username)
        .with_address_book(config.address_book())
        .with_connect_timeout(config.connect_timeout());
    PeerNode::new(config.node_config(), Arc::new(factory))
}

/// Listen for peers and receive files until Ctrl-C
async fn serve(config: Config, connect: Vec<String>) -> Result<()> {
    let listen_addr = config.listen_addr()?;
    let listener = TcpListenerTransport::bind(listen_addr)
        .await
        .with_context(|| format!("Failed to listen on {}", listen_addr))?;
    info!(
        "Listening on {} as {} ({})",
        listener.local_addr()?,
        config.node.username,
        config.node.peer_id
    );

    let (node, mut events) = build_node(&config);

    let (channels_tx, mut channels) = mpsc::unbounded_channel();
    let accept_task = listener.spawn_accept_loop(channels_tx);

    for peer in &connect {
        if let Err(e) = node.connect(peer).await {
            warn!("Could not connect to {}: {}", peer, e);
        }
    }

    loop {
        tokio::select! {
            Some(channel) = channels.recv() => node.accept(channel).await,
            Some(notification) = events.notifications.recv() => match notification.severity {
                Severity::Info => info!("{}: {}", notification.title, notification.description),
                Severity::Error => warn!("{}: {}", notification.title, notification.description),
            },
            Some(event) = events.connections.recv() => log_connection_event(&event),
            Some(event) = events.transfers.recv() => handle_transfer_event(&node, &config, event).await,
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to wait for Ctrl-C")?;
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    accept_task.abort();
    node.shutdown().await;
    Ok(())
}

fn log_connection_event(event: &ConnectionEvent) {
    match event {
        ConnectionEvent::Updated {
            connection_id,
            latency_ms,
            quality,
        } => debug!("{}: {} ms ({})", connection_id, latency_ms, quality),
        other => debug!("{:?}", other),
    }
}

async fn handle_transfer_event(node: &PeerNode, config: &Config, event: TransferEvent) {
    match event {
        TransferEvent::Progress {
            transfer_id,
            percent,
            speed,
            ..
        } => debug!("{}: {}% at {}", transfer_id, percent, format_speed(speed)),
        TransferEvent::Received {
            transfer_id,
            file_name,
            size,
            ..
        } => {
            info!("Received {} ({})", file_name, format_file_size(size));
            if !config.transfer.auto_save {
                return;
            }
            match node
                .save_received(&transfer_id, &config.transfer.download_dir)
                .await
            {
                Ok(path) => {
                    info!("Saved to {}", path.display());
                    node.remove_received(&transfer_id).await;
                }
                Err(e) => error!("Could not save {}: {}", file_name, e.user_message()),
            }
        }
        TransferEvent::Failed {
            transfer_id,
            connection_id,
            error,
        } => warn!("Transfer {} to {} failed: {}", transfer_id, connection_id, error),
        _ => {}
    }
}

/// Connect, send every file to every reachable target, then exit
async fn send(config: Config, to: Vec<String>, files: Vec<PathBuf>) -> Result<()> {
    let mut outgoing = Vec::with_capacity(files.len());
    for path in &files {
        let file = OutgoingFile::from_path(path)
            .await
            .with_context(|| format!("Cannot send {}", path.display()))?;
        outgoing.push(file);
    }

    let (node, _events) = build_node(&config);

    let mut targets = Vec::new();
    for peer in &to {
        match node.connect(peer).await {
            Ok(()) => targets.push(peer.clone()),
            Err(e) => warn!("Could not connect to {}: {}", peer, e.user_message()),
        }
    }
    if targets.is_empty() {
        bail!("None of the requested peers could be reached");
    }

    let mut failures = 0;
    for file in outgoing {
        let name = file.name.clone();
        let size = file.size;
        let handle = node.send_file(file, &targets).await?;
        for outcome in handle.wait().await {
            match outcome.result {
                Ok(()) => println!(
                    "Sent {} ({}) to {}",
                    name,
                    format_file_size(size),
                    outcome.connection_id
                ),
                Err(e) => {
                    failures += 1;
                    eprintln!(
                        "Failed to send {} to {}: {}",
                        name,
                        outcome.connection_id,
                        e.user_message()
                    );
                    if e.is_recoverable() {
                        eprintln!("The connection may recover; run the command again to retry.");
                    }
                }
            }
        }
    }

    node.shutdown().await;
    if failures > 0 {
        bail!("{} transfer(s) failed", failures);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli::init_logging(&cli).context("Failed to initialize logging")?;

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    info!("Configuration loaded");

    match cli.command {
        Command::Serve { connect } => serve(config, connect).await,
        Command::Send { to, files } => send(config, to, files).await,
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}
