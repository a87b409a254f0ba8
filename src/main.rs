/// Transfer Indexer
///
/// Tracks ERC20 transfers across many chains by polling block-explorer APIs,
/// persisting normalised events into PostgreSQL and computing analytics over them.
mod analytics;
mod backfill;
mod cli;
mod config;
mod db;
mod error;
mod etl;
mod facade;
mod health;
mod keys;
mod models;
mod pipeline;
mod rpc;
mod store;

use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use analytics::fallback::SampleConfig;
use backfill::{BackfillConfig, Reconciler};
use cli::{Cli, Command};
use config::Settings;
use db::Database;
use facade::{AnalyticsQuery, Facade, StoreHandle};
use health::HealthConfig;
use keys::ApiKeyPool;
use models::Chain;
use pipeline::{ChainPipeline, PipelineConfig};
use rpc::ProviderClient;
use store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    cli.validate()?;

    let mut settings = Settings::from_env().context("Invalid configuration in environment")?;
    if let Some(url) = &cli.database_url {
        settings.database_url = Some(url.clone());
    }
    if let Some(path) = &cli.chains_config {
        settings.chains_config = path.clone();
    }

    match &cli.command {
        Command::Migrate => {
            let database = connect_database(&settings).await?;
            println!("📋 Running database migrations...");
            database.migrate().await?;
            println!("✅ Database schema is up to date");
            Ok(())
        }
        Command::Run { page_size, interval, with_backfill, from_genesis, .. } => {
            let config = PipelineConfig {
                page_size: *page_size,
                idle_interval: Duration::from_secs(*interval),
                start_at_head: !*from_genesis,
                ..PipelineConfig::default()
            };
            run(&cli, &settings, config, *with_backfill).await
        }
        Command::Backfill { chunk_blocks, refresh_target, .. } => {
            let config = BackfillConfig {
                chunk_blocks: *chunk_blocks,
                refresh_target: *refresh_target,
                ..BackfillConfig::default()
            };
            run_backfill(&cli, &settings, config).await
        }
        Command::Analytics { range, chain, decimals } => {
            let query = AnalyticsQuery {
                time_range: Some(range.clone()),
                chain_id: Some(chain.clone()),
                decimals: decimals.clone(),
            };
            let facade = build_facade(&settings).await?;
            let body = facade.respond(&query).await;
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }
        Command::Health => {
            let facade = build_facade(&settings).await?;
            let report = facade.health().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

/// Live ingestion for every selected chain until Ctrl-C
async fn run(cli: &Cli, settings: &Settings, pipeline_config: PipelineConfig, with_backfill: bool) -> Result<()> {
    println!("🚀 Starting transfer indexer...");

    let chains = selected_chains(cli, settings)?;
    let database = Arc::new(connect_database(settings).await?);
    database.migrate().await?;

    let env_keys = config::env_keys(&chains);
    let merged = pipeline::merge_keys(&env_keys, &database.load_api_keys().await?);
    let live_keys = key_pool(settings, &chains, &merged);
    let client = Arc::new(ProviderClient::new(live_keys.clone(), settings.request_timeout)?);
    let store: Arc<dyn Store> = database.clone();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_ctrl_c(shutdown_tx);

    let mut pools = vec![live_keys.clone()];
    let mut background = Vec::new();

    if with_backfill {
        // separate credentials so history never starves the live loops
        let backfill_keys = Arc::new(ApiKeyPool::with_keys(settings.key_backoff, &merged));
        pools.push(backfill_keys.clone());
        let source = Arc::new(ProviderClient::new(backfill_keys, settings.request_timeout)?);
        // fresh chains only get a cursor after their first live tick
        let backfill_config = BackfillConfig { live_wait: Some(Duration::from_secs(15)), ..BackfillConfig::default() };
        let reconciler = Reconciler::new(source, store.clone(), backfill_config);
        let backfill_chains = chains.clone();
        let rx = shutdown_rx.clone();

        background.push(tokio::spawn(async move {
            for (chain_id, result) in reconciler.run_all(&backfill_chains, Some(&rx)).await {
                if let Err(e) = result {
                    tracing::error!(chain_id, "Backfill stopped: {:#}", e);
                }
            }
        }));
    }

    background.push(tokio::spawn(pipeline::run_credential_refresh(
        pools,
        database.clone(),
        env_keys,
        settings.credential_refresh,
        shutdown_rx.clone(),
    )));

    let pipelines: Vec<ChainPipeline> = chains
        .into_iter()
        .map(|chain| {
            ChainPipeline::new(chain, client.clone(), store.clone(), pipeline_config.clone())
                .with_key_pool(live_keys.clone())
        })
        .collect();

    let states = pipelines.iter().map(|p| (p.chain().name.clone(), p.subscribe_state())).collect();
    background.push(tokio::spawn(pipeline::report_states(states, Duration::from_secs(60), shutdown_rx.clone())));

    println!("⛓️  Ingesting {} chains (Ctrl-C to stop)", pipelines.len());
    pipeline::run_all(pipelines, shutdown_rx).await;

    for handle in background {
        handle.abort();
    }

    println!("\n✨ Indexer stopped");
    Ok(())
}

async fn run_backfill(cli: &Cli, settings: &Settings, backfill_config: BackfillConfig) -> Result<()> {
    let chains = selected_chains(cli, settings)?;
    let database = Arc::new(connect_database(settings).await?);
    database.migrate().await?;

    let merged = pipeline::merge_keys(&config::env_keys(&chains), &database.load_api_keys().await?);
    let keys = key_pool(settings, &chains, &merged);
    let source = Arc::new(ProviderClient::new(keys, settings.request_timeout)?);
    let reconciler = Reconciler::new(source, database, backfill_config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_ctrl_c(shutdown_tx);

    println!("🔍 Backfilling {} chains...", chains.len());
    let mut failed = 0;

    for (chain_id, result) in reconciler.run_all(&chains, Some(&shutdown_rx)).await {
        match result {
            Ok(report) if report.skipped => {
                println!(
                    "⏭️  Chain {}: nothing to do (target block {})",
                    chain_id,
                    format_number(report.target_block)
                );
            }
            Ok(report) => {
                println!(
                    "✅ Chain {}: {} new transfers, blocks {}..{} ({})",
                    chain_id,
                    format_number(report.inserted),
                    format_number(report.resumed_from),
                    format_number(report.target_block),
                    report.status
                );
            }
            Err(e) => {
                failed += 1;
                println!("❌ Chain {}: {:#}", chain_id, e);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("Backfill failed for {} chain(s); rerun to resume from the checkpoint", failed);
    }
    Ok(())
}

/// Facade for read-only commands; a missing database degrades to sampling
async fn build_facade(settings: &Settings) -> Result<Facade> {
    let chains = config::load_chains(&settings.chains_config)?;

    let (handle, stored_keys) = match connect_database(settings).await {
        Ok(database) => {
            let initialized = database.is_initialized().await.unwrap_or(false);
            let stored_keys = if initialized {
                database.load_api_keys().await.unwrap_or_default()
            } else {
                HashMap::new()
            };
            let store: Arc<dyn Store> = Arc::new(database);
            (Some(StoreHandle { store, initialized }), stored_keys)
        }
        Err(e) => {
            tracing::warn!("Database unavailable, analytics will use a realtime sample: {:#}", e);
            (None, HashMap::new())
        }
    };

    let merged = pipeline::merge_keys(&config::env_keys(&chains), &stored_keys);
    let keys = key_pool(settings, &chains, &merged);
    let source = Arc::new(ProviderClient::new(keys, settings.request_timeout)?);
    let health = HealthConfig { stale_after: settings.stale_after, min_ready_transfers: settings.min_ready_transfers };

    Ok(Facade::new(handle, source, chains, health, SampleConfig::default()))
}

async fn connect_database(settings: &Settings) -> Result<Database> {
    let database_url = settings
        .database_url
        .as_deref()
        .context("DATABASE_URL not found in environment. Please check your .env file")?;

    let database = Database::new(database_url).await?;
    database.test_connection().await?;
    tracing::info!("Connected to PostgreSQL");
    Ok(database)
}

fn selected_chains(cli: &Cli, settings: &Settings) -> Result<Vec<Chain>> {
    let chains: Vec<Chain> = config::load_chains(&settings.chains_config)?
        .into_iter()
        .filter(|chain| cli.selects_chain(chain.id))
        .collect();

    if chains.is_empty() {
        anyhow::bail!("No configured chain matches the --chain selection");
    }
    Ok(chains)
}

fn key_pool(settings: &Settings, chains: &[Chain], keys: &HashMap<String, Vec<String>>) -> Arc<ApiKeyPool> {
    let pool = ApiKeyPool::with_keys(settings.key_backoff, keys);
    for chain in chains {
        if pool.key_count(&chain.provider) == 0 {
            tracing::warn!(
                chain = %chain.name,
                provider = %chain.provider,
                "No API keys configured (set {}), chain will stay paused",
                config::key_var_name(&chain.provider)
            );
        }
    }
    Arc::new(pool)
}

fn spawn_ctrl_c(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n🛑 Shutting down...");
            shutdown.send_replace(true);
        }
    });
}

/// Format a number with thousand separators
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();

    for (count, c) in s.chars().rev().enumerate() {
        if count > 0 && count % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }

    result.chars().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(1234), "1,234");
        assert_eq!(format_number(100_000), "100,000");
        assert_eq!(format_number(19_876_543), "19,876,543");
    }
}
