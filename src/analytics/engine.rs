/// Analytics Engine
///
/// Resolves the requested range to an inclusive day scope, issues the store
/// reads concurrently, and folds the results through the series functions
/// into one response.
use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::Serialize;
use std::time::Instant;

use super::series::{self, ChainShare, DailyPoint};
use super::{AddressVolume, AnalyticsScope, ChainFilter, PeriodTotals, TimeRange, WhaleTransfer};
use crate::error::AnalyticsError;
use crate::store::AnalyticsReader;

/// Leaderboard size for top addresses and whales
pub const LEADERBOARD_LIMIT: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalyticsRequest {
    pub range: TimeRange,
    pub chain: ChainFilter,
    pub decimals: u32,
}

/// Where the numbers came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStatus {
    PersistentCache,
    RealtimeSample,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsResponse {
    pub success: bool,
    pub time_range: String,
    pub chain_id: String,
    pub daily_data: Vec<DailyPoint>,
    pub analytics_metrics: AnalyticsMetrics,
    pub predictions: Predictions,
    pub anomalies: Anomalies,
    pub chain_distribution: Vec<ChainShare>,
    pub top_addresses: Vec<AddressVolume>,
    pub top_whales: Vec<WhaleTransfer>,
    pub performance: Performance,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsMetrics {
    pub total_transfers: u64,
    pub total_volume: f64,
    pub avg_transfer_size: f64,
    pub active_addresses: u64,
    /// Percent change against the preceding period; null for `all`
    pub transfers_change: Option<f64>,
    pub volume_change: Option<f64>,
    pub addresses_change: Option<f64>,
    pub avg_daily_transfers: f64,
    pub avg_daily_volume: f64,
    pub median_daily_transfers: f64,
    pub peak_transfer_day: Option<PeakDay>,
    pub peak_volume_day: Option<PeakDay>,
    pub latest_transfer_at: Option<DateTime<Utc>>,
    pub days_in_range: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PeakDay {
    pub date: NaiveDate,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ForecastPoint {
    pub date: NaiveDate,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct Predictions {
    pub transfers: Vec<ForecastPoint>,
    pub volume: Vec<ForecastPoint>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Spike {
    pub index: usize,
    pub date: NaiveDate,
    pub value: f64,
    pub z_score: f64,
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Anomalies {
    pub transfer_spikes: Vec<Spike>,
    pub volume_spikes: Vec<Spike>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Performance {
    pub compute_time_ms: u64,
    pub data_points: usize,
    pub cache_status: CacheStatus,
}

pub struct AnalyticsEngine<'a> {
    reader: &'a dyn AnalyticsReader,
}

impl<'a> AnalyticsEngine<'a> {
    pub fn new(reader: &'a dyn AnalyticsReader) -> Self {
        Self { reader }
    }

    /// Compute the full analytics response for `request` as of `today` (UTC)
    pub async fn compute(
        &self,
        request: AnalyticsRequest,
        today: NaiveDate,
        cache_status: CacheStatus,
    ) -> Result<AnalyticsResponse, AnalyticsError> {
        let started = Instant::now();
        let reader = self.reader;

        // `all` needs the earliest transfer before anything else can be scoped
        let known_bounds = match request.range {
            TimeRange::All => Some(reader.time_bounds(request.chain).await.map_err(AnalyticsError::Store)?),
            _ => None,
        };
        let scope = resolve_scope(request, today, known_bounds.flatten().map(|(first, _)| first));
        let previous = previous_scope(&scope, request.range);

        let bounds = async {
            match known_bounds {
                Some(bounds) => Ok(bounds),
                None => reader.time_bounds(request.chain).await,
            }
        };
        let previous_totals = async {
            match &previous {
                Some(prev) => reader.period_totals(prev).await.map(Some),
                None => Ok(None),
            }
        };

        let (rows, totals, previous_totals, volumes, top_addresses, top_whales, bounds) = tokio::try_join!(
            reader.daily_rows(&scope),
            reader.period_totals(&scope),
            previous_totals,
            reader.chain_volumes(&scope),
            reader.top_addresses(&scope, LEADERBOARD_LIMIT),
            reader.top_transfers(&scope, LEADERBOARD_LIMIT),
            bounds,
        )
        .map_err(AnalyticsError::Store)?;

        let daily_data = series::daily_timeline(scope.start, scope.end, &rows);
        debug_assert_eq!(daily_data.len(), scope.day_count());
        let metrics = build_metrics(&daily_data, &totals, previous_totals.as_ref(), bounds.map(|(_, last)| last));
        let predictions = build_predictions(&daily_data, scope.end);
        let anomalies = build_anomalies(&daily_data);

        let data_points = daily_data.len();
        Ok(AnalyticsResponse {
            success: true,
            time_range: request.range.as_str().to_string(),
            chain_id: request.chain.to_string(),
            daily_data,
            analytics_metrics: metrics,
            predictions,
            anomalies,
            chain_distribution: series::chain_distribution(&volumes),
            top_addresses,
            top_whales,
            performance: Performance {
                compute_time_ms: started.elapsed().as_millis() as u64,
                data_points,
                cache_status,
            },
            timestamp: Utc::now(),
        })
    }
}

/// Inclusive day scope for a request
///
/// Fixed ranges end today and span exactly N days. `all` starts at the day of
/// the earliest stored transfer, or today when nothing is stored.
pub fn resolve_scope(request: AnalyticsRequest, today: NaiveDate, earliest: Option<DateTime<Utc>>) -> AnalyticsScope {
    let start = match request.range.days() {
        Some(days) => today.checked_sub_days(Days::new(days - 1)).unwrap_or(today),
        None => earliest.map(|at| at.date_naive()).filter(|day| *day <= today).unwrap_or(today),
    };
    AnalyticsScope { chain: request.chain, start, end: today, decimals: request.decimals }
}

/// Period of equal length ending the day before `scope` starts
pub fn previous_scope(scope: &AnalyticsScope, range: TimeRange) -> Option<AnalyticsScope> {
    let days = range.days()?;
    let end = scope.start.checked_sub_days(Days::new(1))?;
    let start = scope.start.checked_sub_days(Days::new(days))?;
    Some(AnalyticsScope { start, end, ..*scope })
}

fn build_metrics(
    daily: &[DailyPoint],
    totals: &PeriodTotals,
    previous: Option<&PeriodTotals>,
    latest_transfer_at: Option<DateTime<Utc>>,
) -> AnalyticsMetrics {
    let transfers: Vec<f64> = daily.iter().map(|d| d.transfers as f64).collect();
    let volumes: Vec<f64> = daily.iter().map(|d| d.volume).collect();
    let days = daily.len();

    let peak = |values: &[f64]| {
        series::peak_index(values).map(|i| PeakDay { date: daily[i].date, value: values[i] })
    };
    let change = |current: f64, before: f64| Some(series::round2(series::percent_change(current, before)));

    AnalyticsMetrics {
        total_transfers: totals.transfers,
        total_volume: totals.volume,
        avg_transfer_size: if totals.transfers > 0 { totals.volume / totals.transfers as f64 } else { 0.0 },
        active_addresses: totals.active_addresses,
        transfers_change: previous.and_then(|p| change(totals.transfers as f64, p.transfers as f64)),
        volume_change: previous.and_then(|p| change(totals.volume, p.volume)),
        addresses_change: previous.and_then(|p| change(totals.active_addresses as f64, p.active_addresses as f64)),
        avg_daily_transfers: series::mean(&transfers),
        avg_daily_volume: series::mean(&volumes),
        median_daily_transfers: series::median(&transfers),
        peak_transfer_day: peak(&transfers),
        peak_volume_day: peak(&volumes),
        latest_transfer_at,
        days_in_range: days,
    }
}

fn build_predictions(daily: &[DailyPoint], last_day: NaiveDate) -> Predictions {
    let horizon = series::forecast_horizon(daily.len());
    let project = |values: Vec<f64>| -> Vec<ForecastPoint> {
        series::forecast(&values, horizon)
            .into_iter()
            .enumerate()
            .filter_map(|(i, value)| {
                let date = last_day.checked_add_days(Days::new(i as u64 + 1))?;
                Some(ForecastPoint { date, value: series::round2(value) })
            })
            .collect()
    };

    Predictions {
        transfers: project(daily.iter().map(|d| d.transfers as f64).collect()),
        volume: project(daily.iter().map(|d| d.volume).collect()),
    }
}

fn build_anomalies(daily: &[DailyPoint]) -> Anomalies {
    let spikes = |values: Vec<f64>| -> Vec<Spike> {
        series::detect_anomalies(&values)
            .into_iter()
            .map(|a| Spike { index: a.index, date: daily[a.index].date, value: a.value, z_score: a.z_score })
            .collect()
    };

    Anomalies {
        transfer_spikes: spikes(daily.iter().map(|d| d.transfers as f64).collect()),
        volume_spikes: spikes(daily.iter().map(|d| d.volume).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::{ChainVolume, DailyAggregate};
    use crate::etl::extract::testing::transfer;
    use crate::store::memory::MemoryStore;
    use crate::store::TransferStore;
    use async_trait::async_trait;

    // transfer(_, block, _) lands on 2023-11-14 for small blocks; 7200 blocks per day
    const BLOCKS_PER_DAY: u64 = 7_200;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 11, d).unwrap()
    }

    fn request(range: TimeRange, chain: ChainFilter) -> AnalyticsRequest {
        AnalyticsRequest { range, chain, decimals: 18 }
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        let mut events: Vec<_> = (1..=4).map(|b| transfer(1, b, 0)).collect();
        events.push(transfer(1, BLOCKS_PER_DAY + 1, 0));
        events.push(transfer(56, 2 * BLOCKS_PER_DAY + 1, 0));
        store.insert_transfers(&events).await.unwrap();
        store
    }

    #[test]
    fn test_resolve_fixed_scope() {
        let scope = resolve_scope(request(TimeRange::Month, ChainFilter::All), day(30), None);
        assert_eq!(scope.day_count(), 30);
        assert_eq!(scope.start, day(1));

        let previous = previous_scope(&scope, TimeRange::Month).unwrap();
        assert_eq!(previous.day_count(), 30);
        assert_eq!(previous.end, NaiveDate::from_ymd_opt(2023, 10, 31).unwrap());
        assert!(previous_scope(&scope, TimeRange::All).is_none());
    }

    #[tokio::test]
    async fn test_timeline_covers_every_day() {
        let store = seeded().await;
        let engine = AnalyticsEngine::new(&store);
        let response = engine
            .compute(request(TimeRange::Week, ChainFilter::All), day(20), CacheStatus::PersistentCache)
            .await
            .unwrap();

        assert_eq!(response.daily_data.len(), 7);
        assert_eq!(response.daily_data[0].date, day(14));
        assert_eq!(response.daily_data[0].transfers, 4);
        assert_eq!(response.daily_data[1].transfers, 1);
        assert_eq!(response.daily_data[2].transfers, 1);
        assert_eq!(response.daily_data[6].transfers, 0);

        let metrics = &response.analytics_metrics;
        assert_eq!(metrics.total_transfers, 6);
        assert_eq!(metrics.total_volume, 6.0);
        assert_eq!(metrics.avg_transfer_size, 1.0);
        assert_eq!(metrics.transfers_change, Some(100.0));
        assert_eq!(metrics.peak_transfer_day, Some(PeakDay { date: day(14), value: 4.0 }));
        assert_eq!(metrics.median_daily_transfers, 0.0);
        assert_eq!(metrics.days_in_range, 7);
        assert_eq!(response.predictions.transfers.len(), 3);
        assert_eq!(response.predictions.transfers[0].date, day(21));
        assert_eq!(response.performance.data_points, 7);
        assert_eq!(response.performance.cache_status, CacheStatus::PersistentCache);
    }

    #[tokio::test]
    async fn test_all_range_starts_at_first_transfer() {
        let store = seeded().await;
        let engine = AnalyticsEngine::new(&store);
        let response = engine
            .compute(request(TimeRange::All, ChainFilter::Chain(1)), day(18), CacheStatus::PersistentCache)
            .await
            .unwrap();

        assert_eq!(response.chain_id, "1");
        assert_eq!(response.daily_data.len(), 5);
        assert_eq!(response.analytics_metrics.total_transfers, 5);
        assert!(response.analytics_metrics.transfers_change.is_none());

        // distribution spans every chain regardless of the filter
        let chains: Vec<u64> = response.chain_distribution.iter().map(|c| c.chain_id).collect();
        assert_eq!(chains, vec![1, 56]);
        let total: f64 = response.chain_distribution.iter().map(|c| c.percentage).sum();
        assert!((total - 100.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_empty_store_yields_single_zero_day() {
        let store = MemoryStore::new();
        let engine = AnalyticsEngine::new(&store);
        let response = engine
            .compute(request(TimeRange::All, ChainFilter::All), day(18), CacheStatus::RealtimeSample)
            .await
            .unwrap();

        assert_eq!(response.daily_data.len(), 1);
        assert_eq!(response.analytics_metrics.avg_transfer_size, 0.0);
        assert!(response.anomalies.transfer_spikes.is_empty());
        assert!(response.predictions.volume.iter().all(|p| p.value == 0.0));

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["performance"]["cacheStatus"], "realtime-sample");
        assert_eq!(json["chainId"], "all");
        assert!(json["analyticsMetrics"]["transfersChange"].is_null());
    }

    struct BrokenReader;

    #[async_trait]
    impl AnalyticsReader for BrokenReader {
        async fn time_bounds(&self, _: ChainFilter) -> anyhow::Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
            Ok(None)
        }
        async fn daily_rows(&self, _: &AnalyticsScope) -> anyhow::Result<Vec<DailyAggregate>> {
            Ok(Vec::new())
        }
        async fn period_totals(&self, _: &AnalyticsScope) -> anyhow::Result<PeriodTotals> {
            Ok(PeriodTotals::default())
        }
        async fn chain_volumes(&self, _: &AnalyticsScope) -> anyhow::Result<Vec<ChainVolume>> {
            Err(anyhow::anyhow!("connection reset"))
        }
        async fn top_addresses(&self, _: &AnalyticsScope, _: usize) -> anyhow::Result<Vec<AddressVolume>> {
            Ok(Vec::new())
        }
        async fn top_transfers(&self, _: &AnalyticsScope, _: usize) -> anyhow::Result<Vec<WhaleTransfer>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_one_failed_read_fails_the_request() {
        let engine = AnalyticsEngine::new(&BrokenReader);
        let err = engine
            .compute(request(TimeRange::Week, ChainFilter::All), day(18), CacheStatus::PersistentCache)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ANALYTICS_QUERY_FAILED");
    }
}
