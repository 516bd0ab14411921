//! relaybridge daemon
//!
//! Subscribes to relay events addressed to this node, feeds them one at a
//! time to a local worker over NDJSON stdio, and publishes each response
//! back to its sender.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use relaybridge_core::config::{Config, default_key_path, load_config};
use relaybridge_core::tracing_init::{default_filter, init_tracing};
use relaybridge_crypto::{IdentityKeyPair, parse_public_hex};
use relaybridge_daemon::bridge::{BridgeCoordinator, BridgeSettings, RelayPublisher};
use relaybridge_daemon::relay::{Filter, RelayConnector, RelaySettings, WebSocketTransport};
use relaybridge_daemon::subprocess::WorkerSupervisor;

/// Buffer between the relay subscription and the coordinator.
const INBOUND_BUFFER: usize = 256;
/// Buffer between the worker supervisor and the coordinator.
const WORKER_EVENT_BUFFER: usize = 256;

#[derive(Parser, Debug)]
#[command(name = "relaybridge-daemon")]
#[command(version, about = "relaybridge daemon - relay to worker bridge")]
struct Args {
    /// Settings file (JSON). Defaults to the per-user settings file when present.
    #[arg(long, env = "RELAYBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Relay WebSocket URL (ws:// or wss://)
    #[arg(long, env = "RELAYBRIDGE_RELAY_URL")]
    relay_url: Option<String>,

    /// Hex public key that receives responses without a reply address
    #[arg(long, env = "RELAYBRIDGE_DEFAULT_RECIPIENT")]
    default_recipient: Option<String>,

    /// Hex-encoded secret key. Takes precedence over the key file.
    #[arg(long, env = "RELAYBRIDGE_SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    /// Identity key file, generated when missing
    #[arg(long, env = "RELAYBRIDGE_KEY_PATH")]
    key_path: Option<PathBuf>,

    /// Worker executable
    #[arg(long, env = "RELAYBRIDGE_WORKER_COMMAND")]
    worker_command: Option<String>,

    /// Worker arguments
    #[arg(long, env = "RELAYBRIDGE_WORKER_ARGS", value_delimiter = ',')]
    worker_args: Option<Vec<String>>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, env = "RELAYBRIDGE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "RELAYBRIDGE_LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// Flags and their environment variables override the settings file.
    fn apply(self, config: &mut Config) {
        if let Some(url) = self.relay_url {
            config.relay.url = url;
        }
        if let Some(recipient) = self.default_recipient {
            config.relay.default_recipient = Some(recipient);
        }
        if let Some(key) = self.secret_key {
            config.identity.secret_key = Some(key);
        }
        if let Some(path) = self.key_path {
            config.identity.key_path = Some(path);
        }
        if let Some(command) = self.worker_command {
            config.worker.command = command;
        }
        if let Some(args) = self.worker_args {
            config.worker.args = args;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if self.log_json {
            config.logging.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    init_tracing(
        &default_filter("relaybridge_daemon", &config.logging.level),
        config.logging.json,
    );

    let keys = Arc::new(load_identity(&config)?);
    if let Some(recipient) = &config.relay.default_recipient {
        parse_public_hex(recipient)
            .map_err(|e| anyhow::anyhow!("Invalid default recipient: {e}"))?;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pubkey = %keys.public_hex(),
        relay = %config.relay.url,
        worker = %config.worker.command,
        "Starting relaybridge-daemon"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (worker_tx, worker_rx) = mpsc::channel(WORKER_EVENT_BUFFER);
    let supervisor = Arc::new(WorkerSupervisor::new(config.worker.clone(), worker_tx));
    if let Err(e) = supervisor.start().await {
        warn!(error = %e, "Worker failed to start, retrying in background");
    }

    let connector = RelayConnector::new(
        RelaySettings::from_config(&config.relay),
        Arc::new(WebSocketTransport),
        shutdown_rx.clone(),
    );
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
    let filter = Filter::addressed_to(config.relay.event_kind, keys.public_hex());
    let subscription_id = connector.subscribe(filter, inbound_tx).await;
    info!(subscription_id = %subscription_id, "Subscribed to addressed events");
    if let Err(e) = connector.connect().await {
        warn!(error = %e, "Relay unreachable, retrying in background");
    }

    let publisher = Arc::new(RelayPublisher::new(
        connector.clone(),
        Arc::clone(&keys),
        config.relay.event_kind,
    ));
    let coordinator = BridgeCoordinator::new(
        BridgeSettings::from_config(&config),
        Arc::clone(&supervisor),
        publisher,
    );
    let bridge_handle = tokio::spawn(coordinator.run(inbound_rx, worker_rx, shutdown_rx));

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Notify systemd that the daemon is ready (unix only).
    // The `true` parameter unsets $NOTIFY_SOCKET so restarted workers
    // don't accidentally notify systemd.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    connector.close().await;
    supervisor.stop().await;
    let _ = bridge_handle.await;

    info!("Daemon stopped");
    Ok(())
}

/// Secret key from hex when configured, otherwise from the key file.
fn load_identity(config: &Config) -> anyhow::Result<IdentityKeyPair> {
    if let Some(hex_key) = &config.identity.secret_key {
        return IdentityKeyPair::from_secret_hex(hex_key)
            .map_err(|e| anyhow::anyhow!("Invalid secret key: {e}"));
    }

    let path = match &config.identity.key_path {
        Some(path) => path.clone(),
        None => default_key_path()
            .ok_or_else(|| anyhow::anyhow!("Cannot determine identity key path"))?,
    };
    info!(path = %path.display(), "Loading identity key");
    Ok(IdentityKeyPair::load_or_generate(&path)?)
}
