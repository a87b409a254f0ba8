/// Data Models Module
///
/// This module defines the core data structures used throughout the application.
/// These models represent token transfer events, per-chain ingestion progress and
/// the derived health snapshots built from them.
use chrono::{DateTime, Utc};
use ethers::types::U256;
use ethers::utils::format_units;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Widest `eth_getLogs` window requested from a JSON-RPC node
pub const JSON_RPC_BLOCK_RANGE: u64 = 2_000;

/// Adapter family and service tier of an upstream block-explorer API
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Etherscan-compatible API on a paid plan
    EtherscanPro,
    /// Etherscan-compatible API on a constrained (free or clone) plan
    Etherscan,
    /// Plain JSON-RPC node answering `eth_getLogs`
    JsonRpc,
}

impl ProviderKind {
    /// Largest page the provider will serve, whatever the caller asks for
    pub fn max_page_size(&self) -> usize {
        match self {
            Self::EtherscanPro => 10_000,
            Self::Etherscan => 1_000,
            Self::JsonRpc => 10_000,
        }
    }

    /// Whether later pages exist; nodes answer a whole block window at once
    pub fn paginates(&self) -> bool {
        !matches!(self, Self::JsonRpc)
    }

    /// Widest block window a single request may cover, if the provider limits it
    pub fn max_block_range(&self) -> Option<u64> {
        match self {
            Self::JsonRpc => Some(JSON_RPC_BLOCK_RANGE),
            Self::EtherscanPro | Self::Etherscan => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::EtherscanPro => "etherscan_pro",
            Self::Etherscan => "etherscan",
            Self::JsonRpc => "json_rpc",
        }
    }
}

/// A tracked network, loaded from configuration at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chain {
    pub id: u64,
    pub name: String,
    /// Credential pool name, e.g. "etherscan" or "alchemy"
    pub provider: String,
    pub kind: ProviderKind,
    pub base_url: String,
    pub contract_address: String,
    #[serde(default = "default_decimals")]
    pub decimals: u32,
}

fn default_decimals() -> u32 {
    18
}

/// A single ERC20 transfer, immutable once stored
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferEvent {
    pub chain_id: u64,
    pub block_number: u64,
    pub tx_hash: String,
    pub log_index: u64,
    pub timestamp: DateTime<Utc>,
    pub from: String,
    pub to: String,
    /// Unscaled token amount as a decimal string (uint256 does not fit in any primitive)
    pub value_raw: String,
    pub method_id: Option<String>,
    pub raw_payload: serde_json::Value,
}

impl TransferEvent {
    /// Identity used for deduplication: (chain, tx hash, log index)
    pub fn key(&self) -> (u64, &str, u64) {
        (self.chain_id, self.tx_hash.as_str(), self.log_index)
    }

    /// Value scaled by `decimals`, lossy for very large amounts
    pub fn value_scaled(&self, decimals: u32) -> f64 {
        scale_raw_value(&self.value_raw, decimals)
    }
}

/// Parse an unscaled decimal token amount; empty strings are rejected
pub fn parse_amount(raw: &str) -> Option<U256> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    U256::from_dec_str(raw).ok()
}

/// Convert a raw integer amount string into token units
pub fn scale_raw_value(raw: &str, decimals: u32) -> f64 {
    parse_amount(raw)
        .and_then(|value| format_units(value, decimals).ok())
        .and_then(|units| units.parse::<f64>().ok())
        .unwrap_or(0.0)
}

/// Durable per-chain ingestion progress
#[derive(Debug, Clone, PartialEq)]
pub struct ChainCursor {
    pub chain_id: u64,
    pub last_block_number: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub backoff_until: Option<DateTime<Utc>>,
}

impl ChainCursor {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            last_block_number: 0,
            last_success_at: None,
            last_error_at: None,
            consecutive_failures: 0,
            backoff_until: None,
        }
    }

    /// True while the chain must not be polled
    pub fn in_backoff(&self, now: DateTime<Utc>) -> bool {
        self.backoff_until.map(|until| until > now).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackfillStatus {
    Pending,
    Running,
    Completed,
}

impl BackfillStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "completed" => Self::Completed,
            _ => Self::Pending,
        }
    }
}

impl fmt::Display for BackfillStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reconciler checkpoint, one row per chain
#[derive(Debug, Clone, PartialEq)]
pub struct BackfillProgress {
    pub chain_id: u64,
    pub target_block: u64,
    /// Highest block fully processed, `None` before the first batch
    pub last_processed_block: Option<u64>,
    pub total_backfilled: u64,
    pub status: BackfillStatus,
}

impl BackfillProgress {
    pub fn new(chain_id: u64, target_block: u64) -> Self {
        Self {
            chain_id,
            target_block,
            last_processed_block: None,
            total_backfilled: 0,
            status: BackfillStatus::Pending,
        }
    }

    /// First block the next batch should start from
    pub fn resume_block(&self) -> u64 {
        self.last_processed_block.map(|b| b + 1).unwrap_or(0)
    }
}

/// Derived point-in-time ingestion health of one chain
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChainSnapshot {
    pub chain_id: u64,
    pub chain_name: String,
    pub last_block_number: u64,
    pub total_transfers: u64,
    pub lag_seconds: Option<i64>,
    pub ready: bool,
    pub stale: bool,
    pub consecutive_failures: u32,
    pub backoff_until: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_caps() {
        assert_eq!(ProviderKind::EtherscanPro.max_page_size(), 10_000);
        assert_eq!(ProviderKind::Etherscan.max_page_size(), 1_000);
    }

    #[test]
    fn test_scale_raw_value() {
        assert_eq!(scale_raw_value("1500000000000000000", 18), 1.5);
        assert_eq!(scale_raw_value("250", 2), 2.5);
        assert_eq!(scale_raw_value("garbage", 18), 0.0);
        // wider than u128
        assert_eq!(scale_raw_value("1000000000000000000000000000000000000000000", 36), 1_000_000.0);
    }

    #[test]
    fn test_parse_amount_rejects_non_decimal() {
        assert_eq!(parse_amount("1000"), Some(U256::from(1000u64)));
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("  "), None);
        assert_eq!(parse_amount("0x10"), None);
        assert_eq!(parse_amount("-5"), None);
    }

    #[test]
    fn test_block_range_limits() {
        assert_eq!(ProviderKind::JsonRpc.max_block_range(), Some(JSON_RPC_BLOCK_RANGE));
        assert_eq!(ProviderKind::Etherscan.max_block_range(), None);
        assert!(!ProviderKind::JsonRpc.paginates());
        assert!(ProviderKind::EtherscanPro.paginates());
    }

    #[test]
    fn test_backfill_resume_block() {
        let mut progress = BackfillProgress::new(1, 500);
        assert_eq!(progress.resume_block(), 0);
        progress.last_processed_block = Some(99);
        assert_eq!(progress.resume_block(), 100);
    }

    #[test]
    fn test_provider_kind_deserialize() {
        let kind: ProviderKind = serde_json::from_str("\"etherscan_pro\"").unwrap();
        assert_eq!(kind, ProviderKind::EtherscanPro);
    }
}
