/// Analytics Facade
///
/// Maps raw query parameters to engine calls. Requests are served from the
/// store once it is ready for the requested chain, and from a bounded live
/// sample otherwise or when a store read fails.
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

use crate::analytics::engine::{AnalyticsEngine, AnalyticsRequest, AnalyticsResponse, CacheStatus};
use crate::analytics::fallback::{RealtimeSampler, SampleConfig};
use crate::analytics::{ChainFilter, TimeRange};
use crate::error::AnalyticsError;
use crate::health::{self, HealthConfig, HealthReport};
use crate::models::Chain;
use crate::rpc::TransferSource;
use crate::store::Store;

const MAX_DECIMALS: u32 = 36;
const DEFAULT_DECIMALS: u32 = 18;

/// Query parameters as received, all optional strings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsQuery {
    pub time_range: Option<String>,
    pub chain_id: Option<String>,
    pub decimals: Option<String>,
}

impl AnalyticsQuery {
    /// Validate against the configured chains
    ///
    /// Defaults: `30d`, all chains, and the chain's own decimals (18 for all).
    pub fn parse(&self, chains: &[Chain]) -> Result<AnalyticsRequest, AnalyticsError> {
        let range = match self.time_range.as_deref() {
            Some(raw) => raw.parse()?,
            None => TimeRange::Month,
        };

        let chain = match self.chain_id.as_deref() {
            Some(raw) => raw.parse()?,
            None => ChainFilter::All,
        };
        let configured = match chain {
            ChainFilter::Chain(id) => {
                Some(chains.iter().find(|c| c.id == id).ok_or_else(|| AnalyticsError::InvalidChain(id.to_string()))?)
            }
            ChainFilter::All => None,
        };

        let decimals = match self.decimals.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => match raw.parse::<u32>() {
                Ok(d) if d <= MAX_DECIMALS => d,
                _ => return Err(AnalyticsError::InvalidDecimals(raw.to_string())),
            },
            _ => configured.map_or(DEFAULT_DECIMALS, |c| c.decimals),
        };

        Ok(AnalyticsRequest { range, chain, decimals })
    }
}

/// The backing store plus whether its schema exists
#[derive(Clone)]
pub struct StoreHandle {
    pub store: Arc<dyn Store>,
    pub initialized: bool,
}

pub struct Facade {
    store: Option<StoreHandle>,
    source: Arc<dyn TransferSource>,
    chains: Vec<Chain>,
    health: HealthConfig,
    sample: SampleConfig,
}

impl Facade {
    /// `store` is `None` when the database could not be reached
    pub fn new(
        store: Option<StoreHandle>,
        source: Arc<dyn TransferSource>,
        chains: Vec<Chain>,
        health: HealthConfig,
        sample: SampleConfig,
    ) -> Self {
        Self { store, source, chains, health, sample }
    }

    pub async fn health(&self) -> HealthReport {
        let now = Utc::now();
        let Some(handle) = &self.store else {
            return HealthReport::unavailable(&self.chains, now);
        };

        match health::collect(handle.store.as_ref(), &self.chains, handle.initialized, &self.health, now).await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!("Health collection failed: {:#}", e);
                HealthReport::unavailable(&self.chains, now)
            }
        }
    }

    pub async fn analytics(&self, query: &AnalyticsQuery) -> Result<AnalyticsResponse, AnalyticsError> {
        let request = query.parse(&self.chains)?;
        let today = Utc::now().date_naive();

        if let Some(handle) = &self.store {
            if self.health().await.ready_for(request.chain) {
                let engine = AnalyticsEngine::new(handle.store.as_ref());
                match engine.compute(request, today, CacheStatus::PersistentCache).await {
                    Ok(response) => return Ok(response),
                    Err(e @ AnalyticsError::Store(_)) => {
                        tracing::warn!("Store read failed, serving realtime sample: {:#}", e);
                    }
                    Err(e) => return Err(e),
                }
            } else {
                tracing::info!(chain = %request.chain, "Store not ready, serving realtime sample");
            }
        }

        RealtimeSampler::new(self.source.as_ref(), &self.chains, self.sample.clone()).compute(request, today).await
    }

    /// JSON body for either outcome
    pub async fn respond(&self, query: &AnalyticsQuery) -> serde_json::Value {
        let body = match self.analytics(query).await {
            Ok(response) => serde_json::to_value(response),
            Err(e) => {
                tracing::warn!(code = e.code(), "Analytics request failed: {}", e);
                serde_json::to_value(e.to_response())
            }
        };
        body.unwrap_or_else(|e| {
            serde_json::json!({ "success": false, "error": { "code": "SERIALIZATION", "message": e.to_string() } })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etl::extract::testing::{chain, transfer, ScriptedSource};
    use crate::store::memory::MemoryStore;
    use crate::store::TransferStore;

    fn query(range: &str, chain: &str, decimals: Option<&str>) -> AnalyticsQuery {
        AnalyticsQuery {
            time_range: Some(range.into()),
            chain_id: Some(chain.into()),
            decimals: decimals.map(Into::into),
        }
    }

    fn facade(store: Option<StoreHandle>, source: Arc<ScriptedSource>, min_ready: u64) -> Facade {
        let health = HealthConfig { min_ready_transfers: min_ready, ..HealthConfig::default() };
        Facade::new(store, source, vec![chain(1), chain(56)], health, SampleConfig::default())
    }

    #[test]
    fn test_parse_defaults_and_validation() {
        let mut bsc = chain(56);
        bsc.decimals = 6;
        let chains = vec![chain(1), bsc];

        let parsed = AnalyticsQuery::default().parse(&chains).unwrap();
        assert_eq!(parsed, AnalyticsRequest { range: TimeRange::Month, chain: ChainFilter::All, decimals: 18 });

        let parsed = query("7d", "56", None).parse(&chains).unwrap();
        assert_eq!(parsed.decimals, 6);

        assert_eq!(query("1y", "all", None).parse(&chains).unwrap_err().code(), "INVALID_TIME_RANGE");
        assert_eq!(query("7d", "999", None).parse(&chains).unwrap_err().code(), "INVALID_CHAIN");
        assert_eq!(query("7d", "all", Some("40")).parse(&chains).unwrap_err().code(), "INVALID_DECIMALS");
        assert_eq!(query("7d", "all", Some("abc")).parse(&chains).unwrap_err().code(), "INVALID_DECIMALS");
    }

    #[tokio::test]
    async fn test_ready_store_serves_persistent_cache() {
        let store = Arc::new(MemoryStore::new());
        store.insert_transfers(&[transfer(1, 1, 0), transfer(1, 2, 0)]).await.unwrap();
        let source = Arc::new(ScriptedSource::new(Vec::new()));
        let handle = StoreHandle { store, initialized: true };
        let facade = facade(Some(handle), source.clone(), 2);

        let response = facade.analytics(&query("all", "1", None)).await.unwrap();
        assert_eq!(response.performance.cache_status, CacheStatus::PersistentCache);
        assert_eq!(source.request_count(), 0);
    }

    #[tokio::test]
    async fn test_unready_or_missing_store_falls_back() {
        let source = Arc::new(ScriptedSource::new(vec![transfer(1, 1, 0)]));
        let handle = StoreHandle { store: Arc::new(MemoryStore::new()), initialized: true };

        let unready = facade(Some(handle), source.clone(), 100);
        let response = unready.analytics(&query("7d", "all", None)).await.unwrap();
        assert_eq!(response.performance.cache_status, CacheStatus::RealtimeSample);

        let missing = facade(None, source, 100);
        let response = missing.analytics(&query("7d", "1", None)).await.unwrap();
        assert_eq!(response.performance.cache_status, CacheStatus::RealtimeSample);
        assert!(!missing.health().await.store_initialized);
    }

    #[tokio::test]
    async fn test_errors_render_as_codes() {
        let source = Arc::new(ScriptedSource::new(Vec::new()));
        let body = facade(None, source, 1).respond(&query("5d", "all", None)).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "INVALID_TIME_RANGE");
    }
}
