//! CLI for cluster operations

use clap::{Parser, Subcommand};
use nodered_cluster::common::{parse_duration, resolve_identity, KeyCodec, ValueCodec};
use nodered_cluster::transport::RedisTransport;
use nodered_cluster::{Config, ConfigStore, ContextStore, LeaderLock, NodeRole, ReleaseLeaderAction, ResourceKind, Transport};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "nrcluster")]
#[command(about = "Inspect and operate a Node-RED cluster store")]
#[command(version)]
struct Cli {
    /// Configuration file (falls back to NRCLUSTER_CONFIG, then nodered-cluster.toml;
    /// a missing file means worker defaults)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Store host
    #[arg(long)]
    host: Option<String>,

    /// Store port
    #[arg(long)]
    port: Option<u16>,

    /// Identity used for acquire/release
    #[arg(long)]
    identity: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Leader lock operations
    Leader {
        #[command(subcommand)]
        action: LeaderAction,
    },

    /// Show the stored revision of a resource
    Revision {
        /// flows, credentials, settings, sessions, packages or project
        kind: ResourceKind,
    },

    /// Context inspection
    Context {
        #[command(subcommand)]
        action: ContextAction,
    },
}

#[derive(Subcommand)]
enum LeaderAction {
    /// Show the current holder
    Status,
    /// Release the lock if this identity holds it
    Release,
    /// Take the lock if it is free
    Acquire {
        /// Lease length, e.g. `30s` or `5m` (defaults to leader.lease_ms)
        #[arg(long, value_parser = parse_duration)]
        lease: Option<Duration>,
    },
}

#[derive(Subcommand)]
enum ContextAction {
    /// List top-level keys of a scope
    Keys {
        /// global, a flow id, or node:flow
        scope: String,
    },
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load_with_role(cli.config.as_deref(), NodeRole::Worker)?;
    if let Some(host) = &cli.host {
        config.store.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.store.port = port;
    }
    if cli.identity.is_some() {
        config.identity = cli.identity.clone();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let transport: Arc<dyn Transport> = Arc::new(RedisTransport::connect(&config.store, config.timeout()).await?);
    let keys = KeyCodec::new(config.key_prefix.clone());
    let codec = ValueCodec::with_threshold(config.compression());
    let lock_key = keys.singleton(&config.leader.lock_name);

    match cli.command {
        Commands::Leader { action } => match action {
            LeaderAction::Status => {
                match LeaderLock::new(transport.clone()).current_holder(&lock_key).await? {
                    Some(holder) => println!("{}: held by {}", lock_key, holder),
                    None => println!("{}: free", lock_key),
                }
            }
            LeaderAction::Release => {
                let action =
                    ReleaseLeaderAction::new(transport.clone(), Some(lock_key.as_str()), config.identity.as_deref());
                let report = action.release().await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            LeaderAction::Acquire { lease } => {
                let identity = resolve_identity(config.identity.as_deref());
                let lease = lease.unwrap_or_else(|| config.leader.lease());
                let lock = LeaderLock::new(transport.clone());
                if lock.try_acquire(&lock_key, &identity, lease).await? {
                    println!("{}: acquired by {} for {:?}", lock_key, identity, lease);
                } else {
                    let holder = lock.current_holder(&lock_key).await?.unwrap_or_default();
                    println!("{}: held by {}", lock_key, holder);
                }
            }
        },

        Commands::Revision { kind } => {
            let store = ConfigStore::new(transport.clone(), keys, codec);
            let record = store.get(kind).await?;
            println!("{}: revision {}", kind, record.revision);
            if record.revision > 0 {
                println!("  updated at {}", record.updated_at.to_rfc3339());
            }
        }

        Commands::Context { action } => match action {
            ContextAction::Keys { scope } => {
                let context = ContextStore::new(transport.clone(), keys, codec);
                for key in context.keys(&scope).await? {
                    println!("{}", key);
                }
            }
        },
    }

    transport.close().await?;
    Ok(())
}
