/// Storage Module
///
/// Traits the ingestion loop, the reconciler and the analytics engine are
/// written against. PostgreSQL (`db::Database`) is the durable implementation;
/// [`memory::MemoryStore`] backs the realtime sample and the tests.
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::analytics::{
    AddressVolume, AnalyticsScope, ChainFilter, ChainVolume, DailyAggregate, PeriodTotals, WhaleTransfer,
};
use crate::models::{BackfillProgress, ChainCursor, TransferEvent};

/// Append-only transfer events, unique on (chain_id, tx_hash, log_index)
#[async_trait]
pub trait TransferStore: Send + Sync {
    /// Insert-or-ignore; returns how many rows were new
    async fn insert_transfers(&self, events: &[TransferEvent]) -> Result<u64>;

    async fn count_transfers(&self, chain: ChainFilter) -> Result<u64>;

    async fn latest_transfer_at(&self, chain: ChainFilter) -> Result<Option<DateTime<Utc>>>;
}

/// Per-chain progress owned by the ingestion loop and the reconciler
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Current cursor, a zeroed one if the chain was never ingested
    async fn load_cursor(&self, chain_id: u64) -> Result<ChainCursor>;

    /// Advance to `last_block` (never backwards) and clear the failure state
    async fn record_success(&self, chain_id: u64, last_block: u64, at: DateTime<Utc>) -> Result<ChainCursor>;

    /// Increment the failure count and install a backoff window
    async fn record_failure(
        &self,
        chain_id: u64,
        at: DateTime<Utc>,
        backoff_until: DateTime<Utc>,
    ) -> Result<ChainCursor>;

    async fn load_backfill(&self, chain_id: u64) -> Result<Option<BackfillProgress>>;

    async fn save_backfill(&self, progress: &BackfillProgress) -> Result<()>;
}

/// Side-effect free reads for the analytics engine
#[async_trait]
pub trait AnalyticsReader: Send + Sync {
    /// Earliest and latest transfer time for the filter
    async fn time_bounds(&self, chain: ChainFilter) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>>;

    /// Days with activity only; zero-filling is the engine's job
    async fn daily_rows(&self, scope: &AnalyticsScope) -> Result<Vec<DailyAggregate>>;

    async fn period_totals(&self, scope: &AnalyticsScope) -> Result<PeriodTotals>;

    /// Per-chain volume over the scope's time range, across all chains
    async fn chain_volumes(&self, scope: &AnalyticsScope) -> Result<Vec<ChainVolume>>;

    /// Addresses ranked by sent plus received volume
    async fn top_addresses(&self, scope: &AnalyticsScope, limit: usize) -> Result<Vec<AddressVolume>>;

    /// Single transfers ranked by value
    async fn top_transfers(&self, scope: &AnalyticsScope, limit: usize) -> Result<Vec<WhaleTransfer>>;
}

/// Everything the running indexer needs from one backend
pub trait Store: TransferStore + CursorStore + AnalyticsReader {}

impl<T: TransferStore + CursorStore + AnalyticsReader> Store for T {}
