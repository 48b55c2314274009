//! Subcommand implementations over the bank's programmatic surface.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{Duration, Utc};
use rand::Rng;
use serde_json::json;

use bank_bus::BusNode;
use bank_core::bank::ReasoningBank;
use bank_core::capability::{issue_capability, Keyring};
use bank_core::config::BankConfig;
use bank_core::storage::PatternStore;
use bank_core::types::{Outcome, PatternId, ScopeSet};
use bank_storage_redb::RedbPatternStore;

use crate::keys;

/// Open the durable store named by the configuration.
async fn open_store(config: &BankConfig) -> anyhow::Result<Arc<RedbPatternStore>> {
    let dir = config
        .data_dir
        .clone()
        .context("no data_dir configured")?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("creating data dir {}", dir.display()))?;
    let store = RedbPatternStore::open(
        &dir.join("bank.redb"),
        config.similarity_metric,
        config.embedding_dim,
    )
    .await?;
    Ok(Arc::new(store))
}

async fn open_bank(config: BankConfig) -> anyhow::Result<(ReasoningBank, Arc<RedbPatternStore>)> {
    let store = open_store(&config).await?;
    let bank = ReasoningBank::with_store(config, Arc::clone(&store) as Arc<dyn PatternStore>);
    Ok((bank, store))
}

fn parse_embedding(raw: &str) -> anyhow::Result<Vec<f32>> {
    raw.split(',')
        .map(|part| {
            part.trim()
                .parse::<f32>()
                .with_context(|| format!("bad embedding component `{part}`"))
        })
        .collect()
}

fn parse_id(raw: &str) -> anyhow::Result<PatternId> {
    raw.parse().map_err(|e: String| anyhow::anyhow!(e))
}

fn print_json(value: &serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

pub async fn init(config: BankConfig, embedding_dim: Option<usize>) -> anyhow::Result<()> {
    let mut config = config;
    if embedding_dim.is_some() {
        config.embedding_dim = embedding_dim;
    }
    let (_, store) = open_bank(config).await?;
    print_json(&json!({
        "patterns": store.pattern_count().await?,
        "embedding_dim": store.embedding_dim().await?,
        "healthy": store.health_check().await?,
    }));
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn insert(
    config: BankConfig,
    task: String,
    context: String,
    strategy: String,
    embedding: String,
    success: Option<bool>,
    score: f32,
    duration_ms: u64,
    notes: String,
) -> anyhow::Result<()> {
    let (bank, _) = open_bank(config).await?;
    let embedding = parse_embedding(&embedding)?;
    let outcome = success.map(|success| Outcome::new(success, score, duration_ms, notes));
    let id = bank
        .store_pattern(&task, &context, &strategy, embedding, outcome)
        .await?;
    print_json(&json!({ "id": id.to_string() }));
    Ok(())
}

pub async fn outcome(
    config: BankConfig,
    id: String,
    success: bool,
    score: f32,
    duration_ms: u64,
    notes: String,
) -> anyhow::Result<()> {
    let (bank, _) = open_bank(config).await?;
    let id = parse_id(&id)?;
    bank.attach_outcome(id, Outcome::new(success, score, duration_ms, notes))
        .await?;
    print_json(&json!({ "id": id.to_string(), "attached": true }));
    Ok(())
}

pub async fn get(config: BankConfig, id: String) -> anyhow::Result<()> {
    let (bank, _) = open_bank(config).await?;
    let pattern = bank.get_pattern(parse_id(&id)?).await?;
    print_json(&serde_json::to_value(&pattern)?);
    Ok(())
}

pub async fn recommend(
    config: BankConfig,
    task: String,
    context: Option<String>,
    embedding: String,
    k: Option<usize>,
    min_similarity: Option<f32>,
) -> anyhow::Result<()> {
    let (bank, _) = open_bank(config).await?;
    let embedding = parse_embedding(&embedding)?;
    let rec = bank
        .recommend(&task, context.as_deref(), &embedding, k, min_similarity)
        .await?;
    print_json(&json!({
        "strategy": rec.strategy,
        "confidence": rec.confidence,
        "supporting": rec.supporting_pattern_ids.iter().map(ToString::to_string).collect::<Vec<_>>(),
        "rationale": rec.rationale_summary,
        "similarity": {
            "min": rec.similarity_distribution.min,
            "mean": rec.similarity_distribution.mean,
            "max": rec.similarity_distribution.max,
        },
    }));
    Ok(())
}

pub async fn stats(config: BankConfig, context: String) -> anyhow::Result<()> {
    let (bank, _) = open_bank(config).await?;
    let rows = bank.strategy_stats(&context).await?;
    print_json(&serde_json::to_value(&rows)?);
    Ok(())
}

pub async fn serve(
    config: BankConfig,
    listen: String,
    key_file: PathBuf,
    trusted: Vec<String>,
    peers: Vec<String>,
    spend_cap: u32,
) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let signing = keys::load_or_generate(&key_file)?;
    let public_key = signing.verifying_key().to_bytes();

    let mut keyring = Keyring::new();
    // Trust ourselves so self-issued capabilities verify locally
    keyring.trust(public_key);
    for peer in &trusted {
        keyring.trust(keys::parse_public_key(peer)?);
    }

    let node = BusNode::new(
        Arc::clone(&store) as Arc<dyn PatternStore>,
        signing.clone(),
        keyring,
        config,
    );

    let mut nonce = [0u8; 16];
    rand::rng().fill_bytes(&mut nonce);
    let now = Utc::now();
    node.set_local_capability(issue_capability(
        &signing,
        public_key,
        ScopeSet::all(),
        now - Duration::minutes(1),
        now + Duration::days(30),
        spend_cap,
        nonce,
    ));

    let addr = node.listen(&listen).await?;
    println!("listening on {addr} as {}", hex::encode(public_key));

    for peer in &peers {
        match node.connect(peer).await {
            Ok(session) => {
                println!("connected to {peer} ({})", hex::encode(session.peer_key()));
            }
            Err(e) => eprintln!("failed to connect to {peer}: {e}"),
        }
    }

    tokio::signal::ctrl_c().await?;
    println!("shutting down");
    node.close_all().await;
    Ok(())
}
