/// Pipeline Module
///
/// One ingestion loop per chain: Extract -> Load -> advance cursor, with
/// exponential backoff on failure and a paused state when no credentials are
/// usable. Loops share nothing but the key pool, so a failing chain never
/// delays another.
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::db::Database;
use crate::error::FetchError;
use crate::etl::extract::{extract_step, ExtractedStep};
use crate::keys::ApiKeyPool;
use crate::models::{Chain, ChainCursor};
use crate::rpc::{PageRequest, SortOrder, TransferSource};
use crate::store::Store;

/// Where a chain's loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Fetching,
    Persisting,
    Backoff,
    Paused,
    Stopped,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoopState::Idle => "idle",
            LoopState::Fetching => "fetching",
            LoopState::Persisting => "persisting",
            LoopState::Backoff => "backoff",
            LoopState::Paused => "paused",
            LoopState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Configuration for the ingestion loops
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub page_size: usize,
    /// Delay between ticks while a backlog remains
    pub poll_interval: Duration,
    /// Delay after a short page (caught up with the head)
    pub idle_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// How often a paused chain rechecks credentials without a refresh signal
    pub pause_recheck: Duration,
    /// A chain with no cursor yet starts at its newest transfer instead of genesis
    pub start_at_head: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            page_size: 1_000,
            poll_interval: Duration::from_secs(2),
            idle_interval: Duration::from_secs(30),
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(600),
            pause_recheck: Duration::from_secs(60),
            start_at_head: true,
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Progressed { fetched: usize, inserted: u64, last_block: u64, caught_up: bool },
    SkippedBackoff { until: DateTime<Utc> },
    Paused,
    Failed { message: String, consecutive_failures: u32, backoff_until: DateTime<Utc> },
}

/// Exponential backoff for the n-th consecutive failure, capped
pub fn backoff_delay(consecutive_failures: u32, base: Duration, max: Duration) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(20);
    base.saturating_mul(1u32 << exponent).min(max)
}

/// Ingestion loop for a single chain
pub struct ChainPipeline {
    chain: Chain,
    source: Arc<dyn TransferSource>,
    store: Arc<dyn Store>,
    keys: Option<Arc<ApiKeyPool>>,
    config: PipelineConfig,
    state: watch::Sender<LoopState>,
}

impl ChainPipeline {
    /// Create a new pipeline instance
    pub fn new(chain: Chain, source: Arc<dyn TransferSource>, store: Arc<dyn Store>, config: PipelineConfig) -> Self {
        let (state, _) = watch::channel(LoopState::Idle);
        Self { chain, source, store, keys: None, config, state }
    }

    /// Wake from the paused state as soon as this pool's keys are replaced
    pub fn with_key_pool(mut self, keys: Arc<ApiKeyPool>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: LoopState) {
        self.state.send_replace(state);
    }

    /// First block the next fetch should ask for
    fn next_start_block(&self, last_block: u64, ever_succeeded: bool) -> u64 {
        if last_block == 0 && !ever_succeeded {
            0
        } else {
            last_block + 1
        }
    }

    /// Block a fresh chain starts from: the head, or else the newest transfer
    async fn seed_start_block(&self) -> Result<u64, FetchError> {
        if let Some(head) = self.source.head_block(&self.chain).await? {
            return Ok(head);
        }
        let mut request = PageRequest::ascending(0, None, 1);
        request.sort = SortOrder::Desc;
        let newest = self.source.fetch_page(&self.chain, &request).await?;
        Ok(newest.events.first().map(|e| e.block_number).unwrap_or(0))
    }

    async fn fetch_step(&self, cursor: &ChainCursor) -> Result<(u64, ExtractedStep), FetchError> {
        let fresh = cursor.last_block_number == 0 && cursor.last_success_at.is_none();
        let start_block = if fresh && self.config.start_at_head {
            let seeded = self.seed_start_block().await?;
            tracing::info!(chain = %self.chain.name, "Starting live ingestion at block {}", seeded);
            seeded
        } else {
            self.next_start_block(cursor.last_block_number, cursor.last_success_at.is_some())
        };

        let step = extract_step(self.source.as_ref(), &self.chain, start_block, None, self.config.page_size).await?;
        Ok((start_block, step))
    }

    /// Run one Idle -> Fetching -> Persisting -> Idle cycle
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickOutcome> {
        let cursor = self.store.load_cursor(self.chain.id).await?;

        if cursor.in_backoff(now) {
            self.set_state(LoopState::Backoff);
            return Ok(TickOutcome::SkippedBackoff { until: cursor.backoff_until.unwrap_or(now) });
        }

        self.set_state(LoopState::Fetching);

        let (start_block, step) = match self.fetch_step(&cursor).await {
            Ok(fetched) => fetched,
            Err(e) if e.is_credential_exhaustion() => {
                tracing::warn!(
                    chain = %self.chain.name,
                    provider = %self.chain.provider,
                    "No usable credentials, pausing chain"
                );
                self.set_state(LoopState::Paused);
                return Ok(TickOutcome::Paused);
            }
            Err(e) => {
                if e.is_rate_limited() {
                    tracing::warn!(chain = %self.chain.name, "Rate limit outlasted in-place retries");
                }
                let start_block = self.next_start_block(cursor.last_block_number, cursor.last_success_at.is_some());
                return self.fail(cursor.consecutive_failures, start_block, e.to_string(), now).await;
            }
        };

        self.set_state(LoopState::Persisting);
        let inserted = match self.store.insert_transfers(&step.events).await {
            Ok(inserted) => inserted,
            Err(e) => return self.fail(cursor.consecutive_failures, start_block, format!("{:#}", e), now).await,
        };

        let last_block =
            step.complete_through.unwrap_or(start_block.saturating_sub(1)).max(cursor.last_block_number);
        let updated = self.store.record_success(self.chain.id, last_block, now).await?;

        tracing::debug!(
            chain = %self.chain.name,
            start_block,
            end_block = updated.last_block_number,
            fetched = step.events.len(),
            inserted,
            "Tick complete"
        );
        if inserted > 0 {
            tracing::info!(
                chain = %self.chain.name,
                "Stored {} new transfers, cursor at block {}",
                inserted,
                updated.last_block_number
            );
        }

        self.set_state(LoopState::Idle);
        Ok(TickOutcome::Progressed {
            fetched: step.events.len(),
            inserted,
            last_block: updated.last_block_number,
            caught_up: step.exhausted,
        })
    }

    async fn fail(
        &self,
        previous_failures: u32,
        start_block: u64,
        message: String,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome> {
        let delay = backoff_delay(previous_failures + 1, self.config.backoff_base, self.config.backoff_max);
        let backoff_until = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        let cursor = self.store.record_failure(self.chain.id, now, backoff_until).await?;

        tracing::error!(
            chain = %self.chain.name,
            provider = %self.chain.provider,
            start_block,
            consecutive_failures = cursor.consecutive_failures,
            backoff_secs = delay.as_secs(),
            "Ingestion tick failed: {}",
            message
        );

        self.set_state(LoopState::Backoff);
        Ok(TickOutcome::Failed { message, consecutive_failures: cursor.consecutive_failures, backoff_until })
    }

    /// Tick until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            chain = %self.chain.name,
            chain_id = self.chain.id,
            provider = %self.chain.provider,
            kind = self.chain.kind.as_str(),
            "Starting ingestion loop"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let now = Utc::now();
            let outcome = self.tick(now).await;
            let paused = matches!(outcome, Ok(TickOutcome::Paused));

            let wait = match outcome {
                Ok(TickOutcome::Progressed { caught_up: true, .. }) => self.config.idle_interval,
                Ok(TickOutcome::Progressed { caught_up: false, .. }) => self.config.poll_interval,
                Ok(TickOutcome::SkippedBackoff { until }) | Ok(TickOutcome::Failed { backoff_until: until, .. }) => {
                    (until - now).to_std().unwrap_or(Duration::ZERO).min(self.config.backoff_max)
                }
                Ok(TickOutcome::Paused) => self.config.pause_recheck,
                Err(e) => {
                    tracing::error!(chain = %self.chain.name, "Cursor store error: {:#}", e);
                    self.config.idle_interval
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = wait_for_keys(self.keys.as_deref()), if paused => {
                    tracing::info!(chain = %self.chain.name, "Credentials refreshed, resuming chain");
                }
                _ = shutdown.changed() => break,
            }
        }

        self.set_state(LoopState::Stopped);
        tracing::info!(chain = %self.chain.name, "Ingestion loop stopped");
    }
}

async fn wait_for_keys(keys: Option<&ApiKeyPool>) {
    match keys {
        Some(pool) => pool.changed().await,
        None => std::future::pending::<()>().await,
    }
}

/// Run every chain's loop concurrently until shutdown
pub async fn run_all(pipelines: Vec<ChainPipeline>, shutdown: watch::Receiver<bool>) {
    let handles: Vec<_> = pipelines
        .into_iter()
        .map(|pipeline| {
            let name = pipeline.chain().name.clone();
            (name, tokio::spawn(pipeline.run(shutdown.clone())))
        })
        .collect();

    for (name, handle) in handles {
        if let Err(e) = handle.await {
            tracing::error!(chain = %name, "Ingestion task panicked: {}", e);
        }
    }
}

/// Log every loop's state on a fixed interval
pub async fn report_states(
    states: Vec<(String, watch::Receiver<LoopState>)>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }

        let summary: Vec<String> =
            states.iter().map(|(name, state)| format!("{}={}", name, *state.borrow())).collect();
        tracing::info!("Loop states: {}", summary.join(" "));
    }
}

/// Periodically reload credentials from the database and environment
///
/// Replacing a pool's keys wakes any chain paused on that pool.
pub async fn run_credential_refresh(
    pools: Vec<Arc<ApiKeyPool>>,
    database: Arc<Database>,
    env_keys: HashMap<String, Vec<String>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }

        let merged = match database.load_api_keys().await {
            Ok(stored) => merge_keys(&env_keys, &stored),
            Err(e) => {
                tracing::warn!("Credential refresh failed, keeping current keys: {:#}", e);
                continue;
            }
        };

        for pool in &pools {
            for (provider, secrets) in &merged {
                pool.replace_keys(provider, secrets.clone());
            }
        }
        tracing::debug!(providers = merged.len(), "Credentials refreshed");
    }
}

/// Union of two provider -> keys maps, preserving first-seen order
pub fn merge_keys(
    first: &HashMap<String, Vec<String>>,
    second: &HashMap<String, Vec<String>>,
) -> HashMap<String, Vec<String>> {
    let mut merged: HashMap<String, Vec<String>> = first.clone();
    for (provider, secrets) in second {
        let entry = merged.entry(provider.clone()).or_default();
        for secret in secrets {
            if !entry.contains(secret) {
                entry.push(secret.clone());
            }
        }
    }
    merged
}
