/// Health Module
///
/// Per-chain snapshots derived from the cursor and stored counts. `ready`
/// gates whether analytics are served from the store or from a live sample.
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::analytics::ChainFilter;
use crate::models::{Chain, ChainCursor, ChainSnapshot};
use crate::store::Store;

pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_MIN_READY_TRANSFERS: u64 = 100;

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub stale_after: Duration,
    /// Stored transfers needed before a chain counts as ready
    pub min_ready_transfers: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { stale_after: DEFAULT_STALE_AFTER, min_ready_transfers: DEFAULT_MIN_READY_TRANSFERS }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub store_initialized: bool,
    pub total_transfers: u64,
    /// Store initialized and the combined dataset meets the minimum
    pub ready: bool,
    pub chains: Vec<ChainSnapshot>,
}

impl HealthReport {
    /// Whether reads for `filter` may be served from the store
    pub fn ready_for(&self, filter: ChainFilter) -> bool {
        match filter {
            ChainFilter::All => self.ready,
            ChainFilter::Chain(id) => self.chains.iter().any(|c| c.chain_id == id && c.ready),
        }
    }

    /// Report for when the store cannot be reached at all
    pub fn unavailable(chains: &[Chain], now: DateTime<Utc>) -> Self {
        let snapshots = chains
            .iter()
            .map(|chain| ChainSnapshot {
                chain_id: chain.id,
                chain_name: chain.name.clone(),
                last_block_number: 0,
                total_transfers: 0,
                lag_seconds: None,
                ready: false,
                stale: true,
                consecutive_failures: 0,
                backoff_until: None,
            })
            .collect();
        Self { generated_at: now, store_initialized: false, total_transfers: 0, ready: false, chains: snapshots }
    }
}

/// Derive one chain's snapshot
pub fn snapshot(
    chain: &Chain,
    cursor: &ChainCursor,
    total_transfers: u64,
    latest_transfer_at: Option<DateTime<Utc>>,
    store_initialized: bool,
    config: &HealthConfig,
    now: DateTime<Utc>,
) -> ChainSnapshot {
    let stale = match cursor.last_success_at {
        Some(at) => (now - at).to_std().map_or(false, |elapsed| elapsed > config.stale_after),
        None => true,
    };

    ChainSnapshot {
        chain_id: chain.id,
        chain_name: chain.name.clone(),
        last_block_number: cursor.last_block_number,
        total_transfers,
        lag_seconds: latest_transfer_at.map(|at| (now - at).num_seconds().max(0)),
        ready: store_initialized && total_transfers >= config.min_ready_transfers,
        stale,
        consecutive_failures: cursor.consecutive_failures,
        backoff_until: cursor.backoff_until,
    }
}

/// Snapshot every configured chain
pub async fn collect(
    store: &dyn Store,
    chains: &[Chain],
    store_initialized: bool,
    config: &HealthConfig,
    now: DateTime<Utc>,
) -> Result<HealthReport> {
    let mut snapshots = Vec::with_capacity(chains.len());

    for chain in chains {
        let filter = ChainFilter::Chain(chain.id);
        let (cursor, total, latest) = tokio::try_join!(
            store.load_cursor(chain.id),
            store.count_transfers(filter),
            store.latest_transfer_at(filter),
        )?;
        snapshots.push(snapshot(chain, &cursor, total, latest, store_initialized, config, now));
    }

    let total_transfers = store.count_transfers(ChainFilter::All).await?;
    Ok(HealthReport {
        generated_at: now,
        store_initialized,
        total_transfers,
        ready: store_initialized && total_transfers >= config.min_ready_transfers,
        chains: snapshots,
    })
}
