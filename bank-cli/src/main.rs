//! # bank: operator CLI for the adaptive reasoning bank
//!
//! Subcommands map one-to-one onto the bank's programmatic surface:
//! `insert` and `outcome` write patterns, `recommend` queries the
//! learner, `stats` reads strategy statistics, and `serve` runs a bus
//! node that gossips and serves snapshots to trusted peers.

mod commands;
mod config;
mod keys;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bank", version, about = "Adaptive reasoning bank")]
struct Cli {
    /// Path to a toml configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the store directory from the config
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create (or verify) the store and print its parameters
    Init {
        /// Embedding dimension to fix at creation
        #[arg(long)]
        embedding_dim: Option<usize>,
    },
    /// Insert a pattern, optionally with its outcome
    Insert {
        /// Task description
        task: String,
        /// Context tag
        #[arg(long)]
        context: String,
        /// Strategy identifier
        #[arg(long)]
        strategy: String,
        /// Embedding as comma-separated floats
        #[arg(long)]
        embedding: String,
        /// Outcome success flag; omit for no outcome yet
        #[arg(long)]
        success: Option<bool>,
        /// Outcome score in [0, 1]
        #[arg(long, default_value_t = 0.5)]
        score: f32,
        /// Outcome duration in milliseconds
        #[arg(long, default_value_t = 0)]
        duration_ms: u64,
        /// Outcome notes
        #[arg(long, default_value = "")]
        notes: String,
    },
    /// Attach an outcome to a committed pattern
    Outcome {
        /// Pattern id (hex)
        id: String,
        /// Success flag
        #[arg(long)]
        success: bool,
        /// Score in [0, 1]
        #[arg(long)]
        score: f32,
        /// Duration in milliseconds
        #[arg(long, default_value_t = 0)]
        duration_ms: u64,
        /// Notes
        #[arg(long, default_value = "")]
        notes: String,
    },
    /// Fetch a pattern by id
    Get {
        /// Pattern id (hex)
        id: String,
    },
    /// Recommend a strategy for a task
    Recommend {
        /// Task description
        task: String,
        /// Restrict retrieval to this context
        #[arg(long)]
        context: Option<String>,
        /// Embedding as comma-separated floats
        #[arg(long)]
        embedding: String,
        /// Neighbor count
        #[arg(long)]
        k: Option<usize>,
        /// Similarity floor
        #[arg(long)]
        min_similarity: Option<f32>,
    },
    /// Strategy statistics for a context
    Stats {
        /// Context tag
        context: String,
    },
    /// Run a bus node serving this store to trusted peers
    Serve {
        /// Listen address
        #[arg(long, default_value = "127.0.0.1:7440")]
        listen: String,
        /// File holding the node's signing key seed (created if absent)
        #[arg(long, default_value = "bank.key")]
        key_file: PathBuf,
        /// Trusted peer public keys (hex), repeatable
        #[arg(long = "trust")]
        trusted: Vec<String>,
        /// Peers to dial on startup, repeatable
        #[arg(long = "peer")]
        peers: Vec<String>,
        /// Spend cap on the capability this node presents
        #[arg(long, default_value_t = 1024)]
        spend_cap: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = config::load(cli.config.as_deref(), cli.data_dir)?;

    match cli.command {
        Command::Init { embedding_dim } => commands::init(config, embedding_dim).await,
        Command::Insert {
            task,
            context,
            strategy,
            embedding,
            success,
            score,
            duration_ms,
            notes,
        } => {
            commands::insert(
                config, task, context, strategy, embedding, success, score, duration_ms, notes,
            )
            .await
        }
        Command::Outcome {
            id,
            success,
            score,
            duration_ms,
            notes,
        } => commands::outcome(config, id, success, score, duration_ms, notes).await,
        Command::Get { id } => commands::get(config, id).await,
        Command::Recommend {
            task,
            context,
            embedding,
            k,
            min_similarity,
        } => commands::recommend(config, task, context, embedding, k, min_similarity).await,
        Command::Stats { context } => commands::stats(config, context).await,
        Command::Serve {
            listen,
            key_file,
            trusted,
            peers,
            spend_cap,
        } => commands::serve(config, listen, key_file, trusted, peers, spend_cap).await,
    }
}
