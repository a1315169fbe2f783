//! rendezvous-demo: two participants find each other through a shared key,
//! negotiate a data channel, and exchange messages.
//!
//! Both participants run in this process over an in-memory rendezvous store
//! and a loopback transport, so the whole discovery and negotiation flow can
//! be watched in the logs.

use anyhow::{Context, Result, bail};
use clap::Parser;
use rendezvous_core::{
    DataConnection, InMemoryRendezvous, LoopbackNetwork, NegotiationEvent, NegotiationState,
    NegotiatorConfig, SharedKey,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rendezvous-demo")]
#[command(about = "Connect two in-process participants through a shared rendezvous key")]
struct Args {
    /// Shared rendezvous key both participants use
    #[arg(short, long, default_value = "demo")]
    key: String,

    /// Message each participant sends once connected
    #[arg(short, long, default_value = "hello")]
    message: String,

    /// JSON negotiator configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Reflection/relay helper address (repeatable, overrides the config)
    #[arg(long = "ice-server")]
    ice_servers: Vec<String>,

    /// Break the connection after the exchange and wait for recovery
    #[arg(long)]
    simulate_disconnect: bool,

    /// Seconds to wait for each step
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

type Events = mpsc::UnboundedReceiver<(&'static str, NegotiationEvent)>;

/// Drain events until `done` accepts one, failing after `wait`.
async fn wait_for(
    events: &mut Events,
    wait: Duration,
    what: &str,
    mut done: impl FnMut(&'static str, &NegotiationEvent) -> bool,
) -> Result<()> {
    let found = timeout(wait, async {
        while let Some((name, event)) = events.recv().await {
            debug!("{} event: {:?}", name, event);
            if done(name, &event) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);

    if !found {
        bail!("Timed out waiting for {}", what);
    }
    Ok(())
}

fn is_message(event: &NegotiationEvent, expected: &[u8]) -> bool {
    matches!(event, NegotiationEvent::MessageReceived { data } if data == expected)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,rendezvous_core=debug"
    } else {
        "info,rendezvous_core=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &args.config {
        Some(path) => NegotiatorConfig::load(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => NegotiatorConfig::default(),
    };
    if !args.ice_servers.is_empty() {
        config.ice_servers = args.ice_servers.clone();
    }

    let key = SharedKey::new(args.key.clone()).context("Invalid rendezvous key")?;
    let wait = Duration::from_secs(args.timeout_secs);
    info!("Starting rendezvous-demo on key {}", key);

    let store = InMemoryRendezvous::new();
    let network = LoopbackNetwork::new();
    let (event_tx, mut events) = mpsc::unbounded_channel();

    let mut participants = Vec::new();
    for name in ["first", "second"] {
        let conn = DataConnection::builder(key.clone())
            .config(config.clone())
            .open(Arc::new(store.clone()), Arc::new(network.clone()))
            .await
            .with_context(|| format!("Failed to open {} participant", name))?;
        info!("{} participant is {}", name, conn.participant_id());

        let tx = event_tx.clone();
        let subscription = conn.subscribe(move |event| {
            if let NegotiationEvent::MessageReceived { data } = &event {
                info!("{} received: {}", name, String::from_utf8_lossy(data));
            }
            let _ = tx.send((name, event));
        });
        participants.push((name, conn, subscription));
    }

    for (name, conn, _) in &participants {
        timeout(wait, conn.connected())
            .await
            .with_context(|| format!("Timed out connecting {}", name))??;
    }
    info!("Both participants connected");

    let message = args.message.as_bytes();
    for (name, conn, _) in &participants {
        conn.send(message)
            .await
            .with_context(|| format!("Failed to send from {}", name))?;
    }
    let mut delivered = HashSet::new();
    wait_for(&mut events, wait, "messages", |name, event| {
        if is_message(event, message) {
            delivered.insert(name);
        }
        delivered.len() == participants.len()
    })
    .await?;
    info!("Message delivered both ways");

    if args.simulate_disconnect {
        info!("Simulating connectivity loss");
        network.disconnect_all();

        let mut reconnected = HashSet::new();
        wait_for(&mut events, wait, "reconnection", |name, event| {
            if matches!(
                event,
                NegotiationEvent::StateChanged {
                    to: NegotiationState::Connected,
                    ..
                }
            ) {
                reconnected.insert(name);
            }
            reconnected.len() == participants.len()
        })
        .await?;
        info!("Both participants reconnected");

        let (name, conn, _) = &participants[0];
        conn.send(message)
            .await
            .with_context(|| format!("Failed to send from {} after reconnect", name))?;
        wait_for(&mut events, wait, "message after reconnect", |name, event| {
            name == "second" && is_message(event, message)
        })
        .await?;
    }

    for (_, conn, _) in &participants {
        conn.close().await;
    }
    info!("Shutting down");
    Ok(())
}
