//! CLI for cluster operations
//!
//! Thin HTTP client over the per-role surfaces: locks, queues, cache and
//! node health.

use clap::{Parser, Subcommand};
use serde_json::json;

#[derive(Parser)]
#[command(name = "minicoord")]
#[command(about = "minicoord distributed coordination CLI")]
#[command(version)]
struct Cli {
    /// Node URL (any node of the target ensemble)
    #[arg(long, default_value = "http://localhost:7000")]
    node: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lock operations
    Lock {
        #[command(subcommand)]
        command: LockCommands,
    },

    /// Queue operations
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Cache operations
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Node health
    Health {},

    /// Node status (Raft term, commit index, peers)
    Status {},
}

#[derive(Subcommand)]
enum LockCommands {
    /// Acquire a lock
    Acquire {
        /// Resource to lock
        resource: String,

        /// Client id
        #[arg(long)]
        client: String,

        /// shared or exclusive
        #[arg(long, default_value = "exclusive")]
        mode: String,

        /// Wait timeout in milliseconds (block until grant or timeout)
        #[arg(long)]
        wait_ms: Option<u64>,

        /// Lease ttl in milliseconds
        #[arg(long)]
        ttl_ms: Option<u64>,
    },

    /// Release a lock
    Release {
        /// Resource to unlock
        resource: String,

        /// Client id
        #[arg(long)]
        client: String,
    },

    /// Show one lock
    Status {
        /// Resource to inspect
        resource: String,
    },

    /// List all held locks
    List {},
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Enqueue a JSON message
    Enqueue {
        /// Queue name
        queue: String,

        /// Message (JSON; a bare string is accepted)
        message: String,
    },

    /// Dequeue one message
    Dequeue {
        /// Queue name
        queue: String,
    },

    /// Acknowledge a delivered message
    Ack {
        /// Message id
        msg_id: String,
    },

    /// Show one queue's depth
    Status {
        /// Queue name
        queue: String,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Read a key
    Get {
        /// Key
        key: String,
    },

    /// Write a key
    Put {
        /// Key
        key: String,

        /// Value
        value: String,
    },

    /// Delete a key
    Delete {
        /// Key
        key: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Lock { command } => match command {
            LockCommands::Acquire {
                resource,
                client: client_id,
                mode,
                wait_ms,
                ttl_ms,
            } => {
                let resp = client
                    .post(format!("{}/locks/acquire", cli.node))
                    .json(&json!({
                        "resource": resource,
                        "client_id": client_id,
                        "mode": mode,
                        "wait_timeout_ms": wait_ms,
                        "ttl_ms": ttl_ms,
                    }))
                    .send()
                    .await?;
                print_json(resp).await?;
            }

            LockCommands::Release {
                resource,
                client: client_id,
            } => {
                let resp = client
                    .post(format!("{}/locks/release", cli.node))
                    .json(&json!({ "resource": resource, "client_id": client_id }))
                    .send()
                    .await?;
                print_json(resp).await?;
            }

            LockCommands::Status { resource } => {
                let resp = reqwest::get(format!("{}/locks/{}", cli.node, resource)).await?;
                print_json(resp).await?;
            }

            LockCommands::List {} => {
                let resp = reqwest::get(format!("{}/locks", cli.node)).await?;
                print_json(resp).await?;
            }
        },

        Commands::Queue { command } => match command {
            QueueCommands::Enqueue { queue, message } => {
                let message: serde_json::Value = serde_json::from_str(&message)
                    .unwrap_or(serde_json::Value::String(message));
                let resp = client
                    .post(format!("{}/queue/enqueue", cli.node))
                    .json(&json!({ "queue_name": queue, "message": message }))
                    .send()
                    .await?;
                print_json(resp).await?;
            }

            QueueCommands::Dequeue { queue } => {
                let resp = client
                    .post(format!("{}/queue/dequeue", cli.node))
                    .json(&json!({ "queue_name": queue }))
                    .send()
                    .await?;
                print_json(resp).await?;
            }

            QueueCommands::Ack { msg_id } => {
                let resp = client
                    .post(format!("{}/queue/ack", cli.node))
                    .json(&json!({ "msg_id": msg_id }))
                    .send()
                    .await?;
                print_json(resp).await?;
            }

            QueueCommands::Status { queue } => {
                let resp = reqwest::get(format!("{}/queue/status/{}", cli.node, queue)).await?;
                print_json(resp).await?;
            }
        },

        Commands::Cache { command } => match command {
            CacheCommands::Get { key } => {
                let resp = reqwest::get(format!("{}/cache/{}", cli.node, key)).await?;
                print_json(resp).await?;
            }

            CacheCommands::Put { key, value } => {
                let resp = client
                    .put(format!("{}/cache/{}", cli.node, key))
                    .body(value)
                    .send()
                    .await?;
                print_json(resp).await?;
            }

            CacheCommands::Delete { key } => {
                let resp = client
                    .delete(format!("{}/cache/{}", cli.node, key))
                    .send()
                    .await?;
                print_json(resp).await?;
            }
        },

        Commands::Health {} => {
            let resp = reqwest::get(format!("{}/health", cli.node)).await?;
            print_json(resp).await?;
        }

        Commands::Status {} => {
            let resp = reqwest::get(format!("{}/status", cli.node)).await?;
            print_json(resp).await?;
        }
    }

    Ok(())
}

async fn print_json(resp: reqwest::Response) -> anyhow::Result<()> {
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
    println!("{} {}", status, serde_json::to_string_pretty(&body)?);
    Ok(())
}
