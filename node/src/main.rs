//! MERIDIAN Node Binary

use anyhow::Context;
use clap::{Parser, Subcommand};
use meridian_core::{GroupConfig, NodeConfig, PeerConfig, ProtocolKind};
use meridian_crypto::KeyPair;
use meridian_node::{start_api_server, LogBackend, NodeRuntime};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "meridian-node")]
#[command(about = "MERIDIAN Node - multi-protocol replicated consensus")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node
    Run {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Key file (defaults to <data_dir>/node_key.json)
        #[arg(short, long)]
        key: Option<PathBuf>,

        /// API listen address, overrides the config
        #[arg(long)]
        api_addr: Option<String>,

        /// Data directory, overrides the config
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Keep group logs in memory only
        #[arg(long)]
        memory: bool,
    },

    /// Generate a new keypair
    Keygen {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write keys and configs for a local multi-node cluster
    Devnet {
        /// Output directory, one subdirectory per node
        #[arg(short, long)]
        output: PathBuf,

        /// Number of nodes
        #[arg(long, default_value = "4")]
        nodes: usize,

        /// First API port; node i listens on base_port + i
        #[arg(long, default_value = "8080")]
        base_port: u16,

        /// Crash-fault-tolerant shard groups
        #[arg(long, default_value = "2")]
        shards: u32,
    },
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            key,
            api_addr,
            data_dir,
            memory,
        } => {
            let mut config = match config {
                Some(path) => NodeConfig::load(&path)?,
                None => NodeConfig::default(),
            };
            if let Some(addr) = api_addr {
                config.api.listen_addr = addr;
            }
            if let Some(dir) = data_dir {
                config.data_dir = dir;
            }
            init_logging(&config.log_level);
            info!(name = %config.name, "Starting MERIDIAN node");

            let key_path = key.unwrap_or_else(|| config.data_dir.join("node_key.json"));
            let keypair = load_or_create_keypair(&key_path)?;
            let backend = if memory { LogBackend::Memory } else { LogBackend::Sled };

            let runtime = Arc::new(NodeRuntime::new(config.clone(), keypair, backend)?);
            runtime.start();

            if config.api.enabled {
                let server = start_api_server(runtime.clone(), &config.api.listen_addr);
                tokio::select! {
                    result = server => {
                        if let Err(e) = result {
                            error!("API server failed: {}", e);
                        }
                    }
                    _ = tokio::signal::ctrl_c() => info!("Interrupted"),
                }
            } else {
                tokio::signal::ctrl_c().await?;
                info!("Interrupted");
            }

            runtime.shutdown().await;
        }

        Commands::Keygen { output } => {
            let keypair = KeyPair::generate();
            let json = serde_json::to_string_pretty(&key_file(&keypair))?;

            match output {
                Some(path) => {
                    std::fs::write(&path, &json)?;
                    println!("Keypair saved to: {}", path.display());
                }
                None => {
                    println!("{}", json);
                }
            }
        }

        Commands::Devnet {
            output,
            nodes,
            base_port,
            shards,
        } => {
            write_devnet(&output, nodes, base_port, shards)?;
            println!("Devnet with {} nodes written to: {}", nodes, output.display());
        }
    }

    Ok(())
}

fn key_file(keypair: &KeyPair) -> serde_json::Value {
    serde_json::json!({
        "node_id": keypair.node_id().to_hex(),
        "public_key": keypair.public_key().to_hex(),
        "secret_key": hex::encode(keypair.secret_bytes()),
    })
}

fn load_or_create_keypair(key_path: &Path) -> anyhow::Result<KeyPair> {
    if key_path.exists() {
        let content = std::fs::read_to_string(key_path)?;
        let value: serde_json::Value = serde_json::from_str(&content)?;
        let secret_hex = value
            .get("secret_key")
            .and_then(|v| v.as_str())
            .with_context(|| format!("{} has no secret_key", key_path.display()))?;
        let keypair = KeyPair::from_hex(secret_hex)?;
        info!("Loaded keypair from {}", key_path.display());
        return Ok(keypair);
    }

    if let Some(parent) = key_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let keypair = KeyPair::generate();
    std::fs::write(key_path, serde_json::to_string_pretty(&key_file(&keypair))?)?;
    info!("Generated new keypair, saved to {}", key_path.display());

    Ok(keypair)
}

/// Shard groups 1..=shards are crash-fault-tolerant; with four or more
/// nodes a Byzantine group follows them
fn write_devnet(output: &Path, nodes: usize, base_port: u16, shards: u32) -> anyhow::Result<()> {
    anyhow::ensure!(nodes > 0, "a devnet needs at least one node");
    let keys: Vec<KeyPair> = (0..nodes).map(|_| KeyPair::generate()).collect();
    let members: Vec<String> = keys.iter().map(|k| k.node_id().to_hex()).collect();

    let mut groups: Vec<GroupConfig> = (1..=shards.max(1))
        .map(|id| GroupConfig {
            id,
            kind: ProtocolKind::CrashFaultTolerant,
            members: members.clone(),
        })
        .collect();
    if nodes >= 4 {
        groups.push(GroupConfig {
            id: shards.max(1) + 1,
            kind: ProtocolKind::ByzantineFaultTolerant,
            members: members.clone(),
        });
    }

    for (i, keypair) in keys.iter().enumerate() {
        let dir = output.join(format!("node-{}", i));
        std::fs::create_dir_all(&dir)?;

        let mut config = NodeConfig {
            name: format!("node-{}", i),
            data_dir: dir.join("data"),
            groups: groups.clone(),
            ..Default::default()
        };
        config.api.listen_addr = format!("127.0.0.1:{}", base_port as usize + i);
        config.sharding.shard_count = shards.max(1);
        config.transport.peers = keys
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(j, peer)| PeerConfig {
                node_id: peer.node_id().to_hex(),
                public_key: peer.public_key().to_hex(),
                url: format!("http://127.0.0.1:{}", base_port as usize + j),
            })
            .collect();
        config.validate()?;

        std::fs::write(dir.join("config.json"), serde_json::to_string_pretty(&config)?)?;
        std::fs::write(
            dir.join("node_key.json"),
            serde_json::to_string_pretty(&key_file(keypair))?,
        )?;
    }
    Ok(())
}
