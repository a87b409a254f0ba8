/// In-memory store
///
/// Same contract as the PostgreSQL store: unique (chain, tx, log) keys,
/// monotonic cursors, and the analytics reads computed in Rust.
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use super::{AnalyticsReader, CursorStore, TransferStore};
use crate::analytics::{
    AddressVolume, AnalyticsScope, ChainFilter, ChainVolume, DailyAggregate, PeriodTotals, WhaleTransfer,
};
use crate::models::{BackfillProgress, ChainCursor, TransferEvent};

type EventKey = (u64, String, u64);

#[derive(Debug, Default)]
struct State {
    transfers: BTreeMap<EventKey, TransferEvent>,
    cursors: HashMap<u64, ChainCursor>,
    backfill: HashMap<u64, BackfillProgress>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of stored transfers matching the scope
    fn scoped(&self, scope: &AnalyticsScope, chain: ChainFilter) -> Vec<TransferEvent> {
        let state = self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        state
            .transfers
            .values()
            .filter(|e| chain.matches(e.chain_id) && scope.contains(e.timestamp))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TransferStore for MemoryStore {
    async fn insert_transfers(&self, events: &[TransferEvent]) -> Result<u64> {
        let mut state = self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut inserted = 0;
        for event in events {
            let (chain_id, tx_hash, log_index) = event.key();
            let key = (chain_id, tx_hash.to_string(), log_index);
            if !state.transfers.contains_key(&key) {
                state.transfers.insert(key, event.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn count_transfers(&self, chain: ChainFilter) -> Result<u64> {
        let state = self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(state.transfers.keys().filter(|(chain_id, _, _)| chain.matches(*chain_id)).count() as u64)
    }

    async fn latest_transfer_at(&self, chain: ChainFilter) -> Result<Option<DateTime<Utc>>> {
        let state = self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(state.transfers.values().filter(|e| chain.matches(e.chain_id)).map(|e| e.timestamp).max())
    }
}

#[async_trait]
impl CursorStore for MemoryStore {
    async fn load_cursor(&self, chain_id: u64) -> Result<ChainCursor> {
        let state = self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(state.cursors.get(&chain_id).cloned().unwrap_or_else(|| ChainCursor::new(chain_id)))
    }

    async fn record_success(&self, chain_id: u64, last_block: u64, at: DateTime<Utc>) -> Result<ChainCursor> {
        let mut state = self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let cursor = state.cursors.entry(chain_id).or_insert_with(|| ChainCursor::new(chain_id));
        cursor.last_block_number = cursor.last_block_number.max(last_block);
        cursor.last_success_at = Some(at);
        cursor.consecutive_failures = 0;
        cursor.backoff_until = None;
        Ok(cursor.clone())
    }

    async fn record_failure(
        &self,
        chain_id: u64,
        at: DateTime<Utc>,
        backoff_until: DateTime<Utc>,
    ) -> Result<ChainCursor> {
        let mut state = self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let cursor = state.cursors.entry(chain_id).or_insert_with(|| ChainCursor::new(chain_id));
        cursor.consecutive_failures += 1;
        cursor.last_error_at = Some(at);
        cursor.backoff_until = Some(backoff_until);
        Ok(cursor.clone())
    }

    async fn load_backfill(&self, chain_id: u64) -> Result<Option<BackfillProgress>> {
        let state = self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(state.backfill.get(&chain_id).cloned())
    }

    async fn save_backfill(&self, progress: &BackfillProgress) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.backfill.insert(progress.chain_id, progress.clone());
        Ok(())
    }
}

#[async_trait]
impl AnalyticsReader for MemoryStore {
    async fn time_bounds(&self, chain: ChainFilter) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let state = self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let times = || state.transfers.values().filter(|e| chain.matches(e.chain_id)).map(|e| e.timestamp);
        Ok(times().min().zip(times().max()))
    }

    async fn daily_rows(&self, scope: &AnalyticsScope) -> Result<Vec<DailyAggregate>> {
        let mut days: BTreeMap<NaiveDate, (u64, f64, HashSet<String>)> = BTreeMap::new();
        for event in self.scoped(scope, scope.chain) {
            let entry = days.entry(event.timestamp.date_naive()).or_default();
            entry.0 += 1;
            entry.1 += event.value_scaled(scope.decimals);
            entry.2.insert(event.from.clone());
            entry.2.insert(event.to.clone());
        }

        Ok(days
            .into_iter()
            .map(|(day, (transfer_count, volume, addresses))| DailyAggregate {
                day,
                transfer_count,
                volume,
                unique_addresses: addresses.len() as u64,
            })
            .collect())
    }

    async fn period_totals(&self, scope: &AnalyticsScope) -> Result<PeriodTotals> {
        let mut totals = PeriodTotals::default();
        let mut addresses = HashSet::new();
        for event in self.scoped(scope, scope.chain) {
            totals.transfers += 1;
            totals.volume += event.value_scaled(scope.decimals);
            addresses.insert(event.from);
            addresses.insert(event.to);
        }
        totals.active_addresses = addresses.len() as u64;
        Ok(totals)
    }

    async fn chain_volumes(&self, scope: &AnalyticsScope) -> Result<Vec<ChainVolume>> {
        let mut chains: BTreeMap<u64, ChainVolume> = BTreeMap::new();
        for event in self.scoped(scope, ChainFilter::All) {
            let entry = chains
                .entry(event.chain_id)
                .or_insert(ChainVolume { chain_id: event.chain_id, transfers: 0, volume: 0.0 });
            entry.transfers += 1;
            entry.volume += event.value_scaled(scope.decimals);
        }
        Ok(chains.into_values().collect())
    }

    async fn top_addresses(&self, scope: &AnalyticsScope, limit: usize) -> Result<Vec<AddressVolume>> {
        let mut by_address: HashMap<String, AddressVolume> = HashMap::new();
        for event in self.scoped(scope, scope.chain) {
            let value = event.value_scaled(scope.decimals);
            for (address, sent) in [(event.from.clone(), true), (event.to.clone(), false)] {
                let entry = by_address.entry(address.clone()).or_insert_with(|| AddressVolume {
                    address,
                    sent_volume: 0.0,
                    received_volume: 0.0,
                    total_volume: 0.0,
                    transfer_count: 0,
                });
                if sent {
                    entry.sent_volume += value;
                } else {
                    entry.received_volume += value;
                }
                entry.total_volume += value;
                entry.transfer_count += 1;
            }
        }

        let mut ranked: Vec<AddressVolume> = by_address.into_values().collect();
        ranked.sort_by(|a, b| b.total_volume.total_cmp(&a.total_volume).then_with(|| a.address.cmp(&b.address)));
        ranked.truncate(limit);
        Ok(ranked)
    }

    async fn top_transfers(&self, scope: &AnalyticsScope, limit: usize) -> Result<Vec<WhaleTransfer>> {
        let mut ranked: Vec<WhaleTransfer> = self
            .scoped(scope, scope.chain)
            .into_iter()
            .map(|e| WhaleTransfer {
                chain_id: e.chain_id,
                value: e.value_scaled(scope.decimals),
                tx_hash: e.tx_hash,
                block_number: e.block_number,
                from: e.from,
                to: e.to,
                timestamp: e.timestamp,
            })
            .collect();
        ranked.sort_by(|a, b| b.value.total_cmp(&a.value).then_with(|| a.tx_hash.cmp(&b.tx_hash)));
        ranked.truncate(limit);
        Ok(ranked)
    }
}
