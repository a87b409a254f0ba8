/// Realtime Sample
///
/// Used when the transfer store is unreachable or not ready yet. Pulls the
/// newest transfers for a few chains straight from the providers into a
/// throwaway in-memory store and runs the normal engine over it.
use chrono::NaiveDate;
use futures::future::join_all;

use super::engine::{AnalyticsEngine, AnalyticsRequest, AnalyticsResponse, CacheStatus};
use super::ChainFilter;
use crate::error::{AnalyticsError, FetchError};
use crate::models::{Chain, TransferEvent};
use crate::rpc::{newest_window, PageRequest, SortOrder, TransferSource};
use crate::store::memory::MemoryStore;
use crate::store::TransferStore;

#[derive(Debug, Clone)]
pub struct SampleConfig {
    pub max_chains: usize,
    pub pages_per_chain: u32,
    pub page_size: usize,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self { max_chains: 3, pages_per_chain: 2, page_size: 100 }
    }
}

pub struct RealtimeSampler<'a> {
    source: &'a dyn TransferSource,
    chains: &'a [Chain],
    config: SampleConfig,
}

impl<'a> RealtimeSampler<'a> {
    pub fn new(source: &'a dyn TransferSource, chains: &'a [Chain], config: SampleConfig) -> Self {
        Self { source, chains, config }
    }

    fn selected_chains(&self, filter: ChainFilter) -> Result<Vec<&'a Chain>, AnalyticsError> {
        let selected: Vec<&Chain> =
            self.chains.iter().filter(|c| filter.matches(c.id)).take(self.config.max_chains.max(1)).collect();

        if selected.is_empty() {
            return Err(match filter {
                ChainFilter::Chain(id) => AnalyticsError::InvalidChain(id.to_string()),
                ChainFilter::All => AnalyticsError::Sample("no chains configured".to_string()),
            });
        }
        Ok(selected)
    }

    /// Newest transfers for one chain, at most `pages_per_chain` pages
    async fn sample_chain(&self, chain: &Chain) -> Result<Vec<TransferEvent>, FetchError> {
        let (start_block, end_block) = newest_window(self.source, chain).await?;
        let mut events = Vec::new();

        for page in 1..=self.config.pages_per_chain {
            let request =
                PageRequest { page, page_size: self.config.page_size, sort: SortOrder::Desc, start_block, end_block };
            let fetched = self.source.fetch_page(chain, &request).await?;
            let short = !chain.kind.paginates() || fetched.received < request.clamped(chain.kind).page_size;
            events.extend(fetched.events);
            if short {
                break;
            }
        }

        Ok(events)
    }

    /// Load a bounded sample for `filter` into a fresh in-memory store
    pub async fn sample(&self, filter: ChainFilter) -> Result<MemoryStore, AnalyticsError> {
        let chains = self.selected_chains(filter)?;
        let results = join_all(chains.iter().map(|chain| self.sample_chain(chain))).await;

        let store = MemoryStore::new();
        let mut failures = Vec::new();
        let mut sampled = 0;

        for (chain, result) in chains.iter().zip(results) {
            match result {
                Ok(events) => {
                    sampled += store.insert_transfers(&events).await.map_err(AnalyticsError::Store)?;
                }
                Err(e) => {
                    tracing::warn!(chain = %chain.name, provider = %chain.provider, "Sample fetch failed: {}", e);
                    failures.push(format!("{}: {}", chain.name, e));
                }
            }
        }

        if failures.len() == chains.len() {
            return Err(AnalyticsError::Sample(failures.join("; ")));
        }

        tracing::info!(chains = chains.len(), transfers = sampled, "Collected realtime sample");
        Ok(store)
    }

    /// Analytics over a fresh sample, labelled as such
    pub async fn compute(
        &self,
        request: AnalyticsRequest,
        today: NaiveDate,
    ) -> Result<AnalyticsResponse, AnalyticsError> {
        let store = self.sample(request.chain).await?;
        AnalyticsEngine::new(&store).compute(request, today, CacheStatus::RealtimeSample).await
    }

    /// Bounded per-chain totals for the sampled chains; failed counts are skipped
    pub async fn estimated_totals(&self, filter: ChainFilter) -> Result<Vec<(u64, u64)>, AnalyticsError> {
        let chains = self.selected_chains(filter)?;
        let counts = join_all(chains.iter().map(|chain| self.source.fetch_total_count(chain))).await;

        Ok(chains
            .iter()
            .zip(counts)
            .filter_map(|(chain, count)| match count {
                Ok(total) => Some((chain.id, total)),
                Err(e) => {
                    tracing::warn!(chain = %chain.name, "Total count failed: {}", e);
                    None
                }
            })
            .collect())
    }
}
