/// Extract Module
///
/// Walks a block window forward one step at a time. A step fetches the first
/// ascending page from `start_block`; when the page is full the step only
/// claims the blocks it has seen completely, paging through a single
/// overflowing block if necessary, so no transfer is skipped when the cursor
/// moves past a block.
use crate::error::FetchError;
use crate::models::{Chain, TransferEvent};
use crate::rpc::{PageRequest, SortOrder, TransferSource, RESULT_WINDOW};

/// Result of one extraction step
#[derive(Debug, Clone)]
pub struct ExtractedStep {
    pub events: Vec<TransferEvent>,
    /// Highest block whose transfers are all in `events` (or were already stored)
    pub complete_through: Option<u64>,
    /// The window up to `end_block` (or the head) held no further rows
    pub exhausted: bool,
    pub pages: u32,
}

/// Fetch the next step of `[start_block, end_block]`
///
/// Providers that refuse wide block ranges are walked in bounded windows up
/// to `end_block` or the head; a rejected window is halved and retried.
pub async fn extract_step(
    source: &dyn TransferSource,
    chain: &Chain,
    start_block: u64,
    end_block: Option<u64>,
    page_size: usize,
) -> Result<ExtractedStep, FetchError> {
    let Some(mut range) = chain.kind.max_block_range() else {
        return extract_window(source, chain, start_block, end_block, page_size).await;
    };
    let limit = match end_block {
        Some(end) => Some(end),
        None => source.head_block(chain).await?,
    };
    let Some(limit) = limit else {
        return extract_window(source, chain, start_block, end_block, page_size).await;
    };

    if start_block > limit {
        return Ok(ExtractedStep { events: Vec::new(), complete_through: None, exhausted: true, pages: 0 });
    }

    loop {
        let window_end = limit.min(start_block.saturating_add(range - 1));
        match extract_window(source, chain, start_block, Some(window_end), page_size).await {
            Ok(mut step) => {
                step.exhausted &= window_end == limit;
                return Ok(step);
            }
            Err(e) if e.is_range_too_large() && range > 1 => {
                range = (range / 2).max(1);
                tracing::warn!(
                    chain = %chain.name,
                    start_block,
                    "Provider rejected the block window, narrowing to {} blocks: {}",
                    range,
                    e
                );
            }
            Err(e) => return Err(e),
        }
    }
}

async fn extract_window(
    source: &dyn TransferSource,
    chain: &Chain,
    start_block: u64,
    end_block: Option<u64>,
    page_size: usize,
) -> Result<ExtractedStep, FetchError> {
    let page_size = page_size.clamp(1, chain.kind.max_page_size());
    let first = PageRequest::ascending(start_block, end_block, page_size);
    let fetched = source.fetch_page(chain, &first).await?;
    let mut events = fetched.events;
    let mut pages = 1;

    if !chain.kind.paginates() || fetched.received < page_size {
        let complete_through = match end_block {
            Some(end) => Some(end),
            None => events.last().map(|e| e.block_number),
        };
        return Ok(ExtractedStep { events, complete_through, exhausted: true, pages });
    }

    // Full page: the last block may continue on the next page
    let (Some(first_block), Some(last_block)) =
        (events.first().map(|e| e.block_number), events.last().map(|e| e.block_number))
    else {
        tracing::warn!(
            chain = %chain.name,
            start_block,
            "Full page held no usable transfers, retrying on the next tick"
        );
        return Ok(ExtractedStep { events, complete_through: None, exhausted: true, pages });
    };

    if first_block < last_block {
        return Ok(ExtractedStep { events, complete_through: Some(last_block - 1), exhausted: false, pages });
    }

    // The whole page is one block: page through that block alone
    let max_pages = (RESULT_WINDOW / page_size).max(1) as u32;
    let mut page = 2;
    let mut block_exhausted = false;

    while page <= max_pages {
        let request = PageRequest {
            page,
            page_size,
            sort: SortOrder::Asc,
            start_block: last_block,
            end_block: Some(last_block),
        };
        let more = source.fetch_page(chain, &request).await?;
        pages += 1;
        let short = more.received < page_size;
        events.extend(more.events);

        if short {
            block_exhausted = true;
            break;
        }
        page += 1;
    }

    if !block_exhausted {
        tracing::warn!(
            chain = %chain.name,
            block = last_block,
            "Block holds more transfers than the provider result window ({}), moving on",
            RESULT_WINDOW
        );
    }

    Ok(ExtractedStep {
        events,
        complete_through: Some(last_block),
        exhausted: end_block == Some(last_block),
        pages,
    })
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn test_short_page_is_exhausted() {
        let source = ScriptedSource::new(vec![transfer(1, 5, 0), transfer(1, 9, 0)]);
        let step = extract_step(&source, &chain(1), 1, None, 10).await.unwrap();

        assert!(step.exhausted);
        assert_eq!(step.events.len(), 2);
        assert_eq!(step.complete_through, Some(9));
    }

    #[tokio::test]
    async fn test_full_page_claims_only_complete_blocks() {
        let events = vec![transfer(1, 5, 0), transfer(1, 6, 0), transfer(1, 7, 0), transfer(1, 7, 1)];
        let source = ScriptedSource::new(events);
        let step = extract_step(&source, &chain(1), 1, None, 3).await.unwrap();

        assert!(!step.exhausted);
        assert_eq!(step.events.len(), 3);
        assert_eq!(step.complete_through, Some(6));
    }

    #[tokio::test]
    async fn test_single_block_overflow_is_paged_exhaustively() {
        let events: Vec<_> = (0..7).map(|i| transfer(1, 42, i)).chain([transfer(1, 43, 0)]).collect();
        let source = ScriptedSource::new(events);
        let step = extract_step(&source, &chain(1), 42, None, 3).await.unwrap();

        assert_eq!(step.events.len(), 7);
        assert!(step.events.iter().all(|e| e.block_number == 42));
        assert_eq!(step.complete_through, Some(42));
        assert_eq!(step.pages, 3);
        assert!(!step.exhausted);
    }

    #[tokio::test]
    async fn test_duplicate_rows_do_not_shorten_a_full_page() {
        let events = vec![
            transfer(1, 10, 0),
            transfer(1, 10, 0),
            transfer(1, 11, 0),
            transfer(1, 11, 1),
            transfer(1, 12, 0),
        ];
        let source = ScriptedSource::new(events);
        let chain = chain(1);

        let mut stored = std::collections::BTreeSet::new();
        let mut start = 10;
        for _ in 0..10 {
            let step = extract_step(&source, &chain, start, None, 3).await.unwrap();
            stored.extend(step.events.iter().map(|e| (e.block_number, e.log_index)));
            if step.exhausted {
                break;
            }
            start = step.complete_through.unwrap() + 1;
        }

        let stored: Vec<_> = stored.into_iter().collect();
        assert_eq!(stored, vec![(10, 0), (11, 0), (11, 1), (12, 0)]);
    }

    #[tokio::test]
    async fn test_block_window_is_bounded_and_narrowed_on_rejection() {
        let source = ScriptedSource::new(vec![transfer(7, 120, 0), transfer(7, 900, 0)]);
        *source.head.lock().unwrap() = Some(10_000);
        *source.max_range.lock().unwrap() = Some(500);

        let step = extract_step(&source, &rpc_chain(7), 0, None, 100).await.unwrap();

        let windows: Vec<Option<u64>> = source.requests.lock().unwrap().iter().map(|r| r.end_block).collect();
        assert_eq!(windows, vec![Some(1_999), Some(999), Some(499)]);
        assert_eq!(step.events.len(), 1);
        assert_eq!(step.complete_through, Some(499));
        assert!(!step.exhausted);
    }

    #[tokio::test]
    async fn test_block_window_stops_at_head() {
        let source = ScriptedSource::new(vec![transfer(7, 9_990, 0)]);
        *source.head.lock().unwrap() = Some(10_000);

        let step = extract_step(&source, &rpc_chain(7), 9_500, None, 100).await.unwrap();

        assert_eq!(source.requests.lock().unwrap()[0].end_block, Some(10_000));
        assert_eq!(step.complete_through, Some(10_000));
        assert!(step.exhausted);
    }

    #[tokio::test]
    async fn test_start_past_head_requests_nothing() {
        let source = ScriptedSource::new(Vec::new());
        *source.head.lock().unwrap() = Some(50);

        let step = extract_step(&source, &rpc_chain(7), 51, None, 100).await.unwrap();

        assert_eq!(source.request_count(), 0);
        assert_eq!(step.complete_through, None);
        assert!(step.exhausted);
    }

    #[tokio::test]
    async fn test_empty_bounded_window_completes_to_end() {
        let source = ScriptedSource::new(Vec::new());
        let step = extract_step(&source, &chain(1), 100, Some(200), 10).await.unwrap();
        assert!(step.exhausted);
        assert_eq!(step.complete_through, Some(200));
    }
}
