/// Transform Module
///
/// Parses provider quantities and enforces the ordering precondition the
/// cursor logic relies on.
use std::collections::HashSet;

use crate::models::{Chain, TransferEvent};
use crate::rpc::{PageRequest, SortOrder};

/// Parse a decimal or `0x`-prefixed hex quantity
pub fn parse_quantity(value: &str) -> Option<u64> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) if hex.is_empty() => Some(0),
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

/// Drop rows outside the requested block window, dedupe, and sort
///
/// Providers are expected to return rows in the requested order already;
/// anything else is repaired here so cursor advancement never skips blocks.
pub fn enforce_order(chain: &Chain, request: &PageRequest, rows: Vec<TransferEvent>) -> Vec<TransferEvent> {
    let received = rows.len();
    let mut seen = HashSet::new();
    let mut kept: Vec<TransferEvent> = rows
        .into_iter()
        .filter(|e| {
            e.block_number >= request.start_block && request.end_block.map_or(true, |end| e.block_number <= end)
        })
        .filter(|e| seen.insert((e.tx_hash.clone(), e.log_index)))
        .collect();

    if kept.len() != received {
        tracing::warn!(
            chain = %chain.name,
            start_block = request.start_block,
            end_block = ?request.end_block,
            "Dropped {} out-of-window or duplicate rows from provider page",
            received - kept.len()
        );
    }

    let already_sorted = kept.windows(2).all(|w| match request.sort {
        SortOrder::Asc => (w[0].block_number, w[0].log_index) <= (w[1].block_number, w[1].log_index),
        SortOrder::Desc => (w[0].block_number, w[0].log_index) >= (w[1].block_number, w[1].log_index),
    });

    if !already_sorted {
        tracing::warn!(chain = %chain.name, "Provider returned an unordered page, reordering");
        kept.sort_by_key(|e| (e.block_number, e.log_index));
        if request.sort == SortOrder::Desc {
            kept.reverse();
        }
    }

    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProviderKind;
    use chrono::Utc;

    fn chain() -> Chain {
        Chain {
            id: 1,
            name: "ethereum".into(),
            provider: "etherscan".into(),
            kind: ProviderKind::Etherscan,
            base_url: String::new(),
            contract_address: String::new(),
            decimals: 18,
        }
    }

    fn event(block: u64, tx: &str, log_index: u64) -> TransferEvent {
        TransferEvent {
            chain_id: 1,
            block_number: block,
            tx_hash: tx.into(),
            log_index,
            timestamp: Utc::now(),
            from: "0xa".into(),
            to: "0xb".into(),
            value_raw: "1".into(),
            method_id: None,
            raw_payload: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("1234"), Some(1234));
        assert_eq!(parse_quantity("0x1f"), Some(31));
        assert_eq!(parse_quantity("0x"), Some(0));
        assert_eq!(parse_quantity("nope"), None);
    }

    #[test]
    fn test_enforce_order_reorders_and_filters() {
        let request = PageRequest::ascending(10, Some(20), 100);
        let rows = vec![event(15, "0x2", 0), event(12, "0x1", 1), event(9, "0x0", 0), event(12, "0x1", 1)];
        let ordered = enforce_order(&chain(), &request, rows);

        let blocks: Vec<u64> = ordered.iter().map(|e| e.block_number).collect();
        assert_eq!(blocks, vec![12, 15]);
    }

    #[test]
    fn test_enforce_order_descending() {
        let mut request = PageRequest::ascending(0, None, 100);
        request.sort = SortOrder::Desc;
        let ordered = enforce_order(&chain(), &request, vec![event(1, "0x1", 0), event(3, "0x3", 0)]);
        assert_eq!(ordered[0].block_number, 3);
    }
}
