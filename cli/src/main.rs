//! MERIDIAN CLI - Command Line Interface

mod commands;

use clap::{Parser, Subcommand};
use commands::{describe_response, parse_add, parse_put, ApiClient, WriteRequest};
use meridian_consensus::TxOutcome;
use meridian_core::ClientRequestId;
use meridian_state::{KvCommand, KvWrite};

#[derive(Parser)]
#[command(name = "meridian")]
#[command(about = "MERIDIAN - consensus node client")]
#[command(version)]
struct Cli {
    /// Node URL
    #[arg(short, long, default_value = "http://127.0.0.1:8080")]
    node: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Node status and every hosted group
    Status,

    /// One group's status
    Group {
        /// Group id
        id: u32,
    },

    /// Set a key in one group
    Put {
        group: u32,
        key: String,
        value: String,

        /// Idempotency key (uuid); resubmitting it never applies twice
        #[arg(long)]
        request_id: Option<String>,
    },

    /// Add to a counter in one group
    Add {
        group: u32,
        key: String,
        #[arg(allow_hyphen_values = true)]
        delta: i64,

        #[arg(long)]
        request_id: Option<String>,
    },

    /// Read a key from the node's replica of a group
    Get { group: u32, key: String },

    /// Apply writes atomically across shards
    Tx {
        /// key=value
        #[arg(long = "put", value_parser = parse_put)]
        puts: Vec<WriteRequest>,

        /// key=delta
        #[arg(long = "add", value_parser = parse_add, allow_hyphen_values = true)]
        adds: Vec<WriteRequest>,

        /// Keys to delete
        #[arg(long = "delete")]
        deletes: Vec<String>,
    },

    /// Alerts raised by this node's groups
    Alerts,
}

fn request_id(raw: Option<String>) -> anyhow::Result<ClientRequestId> {
    match raw {
        Some(raw) => Ok(ClientRequestId::parse(&raw)?),
        None => Ok(ClientRequestId::new()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let api_client = ApiClient::new(&cli.node)?;

    match cli.command {
        Commands::Status => {
            let status = api_client.status().await?;
            println!("MERIDIAN Node Status");
            println!("====================");
            println!("Name:       {}", status.name);
            println!("Node ID:    {}", truncate(&status.node_id, 16));
            println!("Peer Count: {}", status.peer_count);
            println!();
            println!(
                "{:<8} {:<24} {:<10} {:>6} {:>8} {:>8}  {}",
                "Group", "Kind", "Role", "Epoch", "Commit", "Applied", "Health"
            );
            for g in status.groups {
                let health = if g.halted {
                    "halted".to_string()
                } else if g.recovering {
                    "recovering".to_string()
                } else {
                    format!("{:.0}%", g.quorum_health * 100.0)
                };
                println!(
                    "{:<8} {:<24} {:<10} {:>6} {:>8} {:>8}  {}",
                    g.group.0,
                    g.kind.to_string(),
                    g.role.to_string(),
                    g.epoch,
                    g.commit_index,
                    g.last_applied,
                    health
                );
            }
        }

        Commands::Group { id } => {
            let status = api_client.group_status(id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Commands::Put {
            group,
            key,
            value,
            request_id: raw,
        } => {
            let id = request_id(raw)?;
            let ack = api_client.propose(group, &KvCommand::put(key, value), id).await?;
            println!("Request:   {}", ack.request_id);
            println!("Index:     {}{}", ack.index, if ack.duplicate { " (duplicate)" } else { "" });
            println!("Result:    {}", describe_response(&ack));
        }

        Commands::Add {
            group,
            key,
            delta,
            request_id: raw,
        } => {
            let id = request_id(raw)?;
            let command = KvCommand::Write(KvWrite::Add {
                key: key.into_bytes(),
                delta,
            });
            let ack = api_client.propose(group, &command, id).await?;
            println!("Request:   {}", ack.request_id);
            println!("Index:     {}{}", ack.index, if ack.duplicate { " (duplicate)" } else { "" });
            println!("Result:    {}", describe_response(&ack));
        }

        Commands::Get { group, key } => match api_client.read(group, &key).await? {
            Some(value) => println!("{}", value),
            None => {
                eprintln!("{}: not found", key);
                std::process::exit(1);
            }
        },

        Commands::Tx { puts, adds, deletes } => {
            let mut writes = puts;
            writes.extend(adds);
            writes.extend(deletes.into_iter().map(|key| WriteRequest::Delete { key }));
            anyhow::ensure!(!writes.is_empty(), "give at least one --put, --add or --delete");

            match api_client.transact(writes).await? {
                TxOutcome::Applied { shard } => println!("Applied on {}", shard),
                TxOutcome::Committed { tx_id } => println!("Committed {}", tx_id),
                TxOutcome::Aborted { tx_id, reason } => {
                    eprintln!("Aborted {}: {}", tx_id, reason);
                    std::process::exit(1);
                }
            }
        }

        Commands::Alerts => {
            let alerts = api_client.alerts().await?;
            if alerts.is_empty() {
                println!("No alerts.");
            }
            for alert in alerts {
                println!("{}  {}  {:?}", alert.at, alert.group, alert.kind);
            }
        }
    }

    Ok(())
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len])
    }
}
