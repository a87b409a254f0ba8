/// Backfill Module
///
/// Fills history from block 0 (or the last checkpoint) up to the live
/// ingestion cursor captured when the run starts. Progress is checkpointed
/// after every batch so an interrupted run resumes instead of rescanning.
/// Overlap with the live loop is harmless: both writers hit the same unique
/// key and duplicates are dropped by the store.
use anyhow::Result;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::etl::extract::extract_step;
use crate::models::{BackfillProgress, BackfillStatus, Chain};
use crate::rpc::TransferSource;
use crate::store::Store;

pub const DEFAULT_CHUNK_BLOCKS: u64 = 100_000;

#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Width of each block-range chunk
    pub chunk_blocks: u64,
    pub page_size: usize,
    /// Extend a completed backfill up to the current live cursor
    pub refresh_target: bool,
    /// Poll interval while waiting for live ingestion to set a cursor; `None` skips the chain instead
    pub live_wait: Option<Duration>,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self { chunk_blocks: DEFAULT_CHUNK_BLOCKS, page_size: 10_000, refresh_target: false, live_wait: None }
    }
}

/// Outcome of one reconciler run for a chain
#[derive(Debug, Clone, PartialEq)]
pub struct BackfillReport {
    pub chain_id: u64,
    pub target_block: u64,
    pub resumed_from: u64,
    /// Rows that were new in this run
    pub inserted: u64,
    pub status: BackfillStatus,
    pub skipped: bool,
}

pub struct Reconciler {
    source: Arc<dyn TransferSource>,
    store: Arc<dyn Store>,
    config: BackfillConfig,
}

impl Reconciler {
    /// `source` should draw from its own key pool, separate from live ingestion
    pub fn new(source: Arc<dyn TransferSource>, store: Arc<dyn Store>, config: BackfillConfig) -> Self {
        Self { source, store, config }
    }

    fn skipped(progress: &BackfillProgress) -> BackfillReport {
        BackfillReport {
            chain_id: progress.chain_id,
            target_block: progress.target_block,
            resumed_from: progress.resume_block(),
            inserted: 0,
            status: progress.status,
            skipped: true,
        }
    }

    /// Poll until the live cursor leaves block 0, or shutdown
    async fn wait_for_live_cursor(
        &self,
        chain: &Chain,
        every: Duration,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> Result<u64> {
        let mut shutdown = shutdown.cloned();
        tracing::info!(chain = %chain.name, "Waiting for live ingestion to set a cursor before backfilling");

        loop {
            let cursor = self.store.load_cursor(chain.id).await?;
            if cursor.last_block_number > 0 {
                return Ok(cursor.last_block_number);
            }
            match shutdown.as_mut() {
                Some(rx) => {
                    if *rx.borrow() {
                        return Ok(0);
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(every) => {}
                        _ = rx.changed() => {}
                    }
                }
                None => tokio::time::sleep(every).await,
            }
        }
    }

    /// Reconcile one chain, stopping early between batches on shutdown
    pub async fn run_chain(&self, chain: &Chain, shutdown: Option<&watch::Receiver<bool>>) -> Result<BackfillReport> {
        let cursor = self.store.load_cursor(chain.id).await?;
        let mut live_target = cursor.last_block_number;

        let mut progress = match self.store.load_backfill(chain.id).await? {
            Some(progress) => progress,
            None => {
                if live_target == 0 {
                    if let Some(every) = self.config.live_wait {
                        live_target = self.wait_for_live_cursor(chain, every, shutdown).await?;
                    }
                }
                if live_target == 0 {
                    tracing::warn!(chain = %chain.name, "Live ingestion has not advanced yet, nothing to backfill");
                    return Ok(Self::skipped(&BackfillProgress::new(chain.id, 0)));
                }
                BackfillProgress::new(chain.id, live_target)
            }
        };

        if progress.status == BackfillStatus::Completed {
            if !self.config.refresh_target || live_target <= progress.target_block {
                tracing::info!(chain = %chain.name, target = progress.target_block, "Backfill already completed");
                return Ok(Self::skipped(&progress));
            }
            tracing::info!(
                chain = %chain.name,
                "Extending completed backfill from {} to {}",
                progress.target_block,
                live_target
            );
            progress.target_block = live_target;
        }

        let resumed_from = progress.resume_block();
        let target = progress.target_block;
        let mut inserted = 0u64;

        progress.status = BackfillStatus::Running;
        self.store.save_backfill(&progress).await?;

        tracing::info!(
            chain = %chain.name,
            provider = %chain.provider,
            start_block = resumed_from,
            end_block = target,
            "Backfill started"
        );

        let mut chunk_start = resumed_from;
        while chunk_start <= target {
            let chunk_end = chunk_start.saturating_add(self.config.chunk_blocks.max(1) - 1).min(target);
            let mut start = chunk_start;

            loop {
                let step = extract_step(self.source.as_ref(), chain, start, Some(chunk_end), self.config.page_size)
                    .await
                    .map_err(|e| {
                        tracing::error!(
                            chain = %chain.name,
                            provider = %chain.provider,
                            start_block = start,
                            end_block = chunk_end,
                            "Backfill batch failed: {}",
                            e
                        );
                        e
                    })?;

                let new_rows = self.store.insert_transfers(&step.events).await?;
                let through = step.complete_through.unwrap_or(chunk_end);

                inserted += new_rows;
                progress.total_backfilled += new_rows;
                progress.last_processed_block = Some(progress.last_processed_block.map_or(through, |b| b.max(through)));
                self.store.save_backfill(&progress).await?;

                tracing::debug!(
                    chain = %chain.name,
                    start_block = start,
                    end_block = through,
                    fetched = step.events.len(),
                    inserted = new_rows,
                    "Backfill batch stored"
                );

                if step.exhausted || through >= chunk_end {
                    break;
                }
                start = through + 1;
            }

            if shutdown.map_or(false, |rx| *rx.borrow()) {
                tracing::info!(chain = %chain.name, checkpoint = chunk_end, "Backfill interrupted, checkpoint saved");
                return Ok(BackfillReport {
                    chain_id: chain.id,
                    target_block: target,
                    resumed_from,
                    inserted,
                    status: BackfillStatus::Running,
                    skipped: false,
                });
            }

            tracing::info!(
                chain = %chain.name,
                "Backfilled through block {} of {} ({} new transfers so far)",
                chunk_end,
                target,
                inserted
            );

            match chunk_end.checked_add(1) {
                Some(next) => chunk_start = next,
                None => break,
            }
        }

        progress.status = BackfillStatus::Completed;
        self.store.save_backfill(&progress).await?;
        tracing::info!(chain = %chain.name, inserted, total = progress.total_backfilled, "Backfill completed");

        Ok(BackfillReport {
            chain_id: chain.id,
            target_block: target,
            resumed_from,
            inserted,
            status: BackfillStatus::Completed,
            skipped: false,
        })
    }

    /// Reconcile several chains concurrently; one chain failing leaves the others running
    pub async fn run_all(
        &self,
        chains: &[Chain],
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> Vec<(u64, Result<BackfillReport>)> {
        let runs = chains.iter().map(|chain| async move { (chain.id, self.run_chain(chain, shutdown).await) });
        join_all(runs).await
    }
}
