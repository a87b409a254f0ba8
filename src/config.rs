/// Configuration Module
///
/// Settings come from the environment (after `.env` is loaded) with CLI flags
/// taking precedence in `main`. The chain list is a JSON file; credentials
/// are `<PROVIDER>_API_KEYS` comma lists merged with the `api_keys` table.
use anyhow::{bail, Context, Result};
use ethers::types::Address;
use std::collections::{HashMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::models::Chain;

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: Option<String>,
    pub chains_config: PathBuf,
    pub key_backoff: Duration,
    pub request_timeout: Duration,
    pub stale_after: Duration,
    pub min_ready_transfers: u64,
    pub credential_refresh: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let secs = |name: &str, default: u64| -> Result<Duration> {
            parse_var(&lookup, name, default).map(Duration::from_secs)
        };

        Ok(Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            chains_config: lookup("CHAINS_CONFIG").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("chains.json")),
            key_backoff: secs("KEY_BACKOFF_SECS", 60)?,
            request_timeout: secs("REQUEST_TIMEOUT_SECS", 15)?,
            stale_after: secs("STALE_AFTER_SECS", 900)?,
            min_ready_transfers: parse_var(&lookup, "MIN_READY_TRANSFERS", 100)?,
            credential_refresh: secs("CREDENTIAL_REFRESH_SECS", 300)?,
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|e| anyhow::anyhow!("Invalid value for {}: '{}' ({})", name, raw, e))
        }
        _ => Ok(default),
    }
}

/// Load and validate the chain list
pub fn load_chains(path: &Path) -> Result<Vec<Chain>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read chain config {}", path.display()))?;
    parse_chains(&raw).with_context(|| format!("Invalid chain config {}", path.display()))
}

pub fn parse_chains(raw: &str) -> Result<Vec<Chain>> {
    let chains: Vec<Chain> = serde_json::from_str(raw).context("Chain config is not a valid chain list")?;

    if chains.is_empty() {
        bail!("No chains configured");
    }

    let mut seen = HashSet::new();
    for chain in &chains {
        if !seen.insert(chain.id) {
            bail!("Duplicate chain id {}", chain.id);
        }
        if chain.base_url.trim().is_empty() {
            bail!("Chain {} has no base_url", chain.name);
        }
        if chain.contract_address.trim().is_empty() {
            bail!("Chain {} has no contract_address", chain.name);
        }
        if chain.contract_address.trim().parse::<Address>().is_err() {
            bail!("Chain {} has an invalid contract_address {}", chain.name, chain.contract_address);
        }
    }

    Ok(chains)
}

/// Environment variable holding keys for `provider`, e.g. `ETHERSCAN_API_KEYS`
pub fn key_var_name(provider: &str) -> String {
    let normalized: String =
        provider.chars().map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' }).collect();
    format!("{}_API_KEYS", normalized)
}

/// Keys from the environment for every provider the chains use
pub fn env_keys(chains: &[Chain]) -> HashMap<String, Vec<String>> {
    keys_from_lookup(chains, |name| env::var(name).ok())
}

fn keys_from_lookup(chains: &[Chain], lookup: impl Fn(&str) -> Option<String>) -> HashMap<String, Vec<String>> {
    let mut keys = HashMap::new();

    for provider in chains.iter().map(|c| c.provider.as_str()).collect::<HashSet<_>>() {
        let Some(raw) = lookup(&key_var_name(provider)) else {
            continue;
        };
        let secrets: Vec<String> =
            raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect();
        if !secrets.is_empty() {
            keys.insert(provider.to_string(), secrets);
        }
    }

    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProviderKind;

    const CHAINS: &str = r#"[
        {"id": 1, "name": "ethereum", "provider": "etherscan", "kind": "etherscan_pro",
         "base_url": "https://api.etherscan.io/v2/api",
         "contract_address": "0xdAC17F958D2ee523a2206206994597C13D831ec7", "decimals": 6},
        {"id": 10, "name": "optimism", "provider": "alchemy-op", "kind": "json_rpc",
         "base_url": "https://opt-mainnet.g.alchemy.com/v2/{apikey}",
         "contract_address": "0x94b008aA00579c1307B0EF2c499aD98a8ce58e58"}
    ]"#;

    #[test]
    fn test_parse_chains() {
        let chains = parse_chains(CHAINS).unwrap();
        assert_eq!(chains.len(), 2);
        assert_eq!(chains[0].kind, ProviderKind::EtherscanPro);
        assert_eq!(chains[0].decimals, 6);
        assert_eq!(chains[1].decimals, 18);
    }

    #[test]
    fn test_duplicate_and_empty_chain_lists_rejected() {
        assert!(parse_chains("[]").is_err());
        let dup = CHAINS.replace("\"id\": 10", "\"id\": 1");
        assert!(parse_chains(&dup).is_err());
    }

    #[test]
    fn test_malformed_contract_address_rejected() {
        let bad = CHAINS.replace("0x94b008aA00579c1307B0EF2c499aD98a8ce58e58", "0xtoken");
        let err = parse_chains(&bad).unwrap_err();
        assert!(err.to_string().contains("invalid contract_address"));
    }

    #[test]
    fn test_keys_per_provider() {
        let chains = parse_chains(CHAINS).unwrap();
        assert_eq!(key_var_name("alchemy-op"), "ALCHEMY_OP_API_KEYS");

        let keys = keys_from_lookup(&chains, |name| match name {
            "ETHERSCAN_API_KEYS" => Some(" k1, k2 ,,k3".to_string()),
            "ALCHEMY_OP_API_KEYS" => Some("".to_string()),
            _ => None,
        });
        assert_eq!(keys["etherscan"], vec!["k1", "k2", "k3"]);
        assert!(!keys.contains_key("alchemy-op"));
    }

    #[test]
    fn test_settings_defaults_and_overrides() {
        let settings = Settings::from_lookup(|name| match name {
            "STALE_AFTER_SECS" => Some("60".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(settings.stale_after, Duration::from_secs(60));
        assert_eq!(settings.key_backoff, Duration::from_secs(60));
        assert_eq!(settings.min_ready_transfers, 100);
        assert_eq!(settings.chains_config, PathBuf::from("chains.json"));

        let bad = Settings::from_lookup(|name| (name == "KEY_BACKOFF_SECS").then(|| "soon".to_string()));
        assert!(bad.is_err());
    }
}
