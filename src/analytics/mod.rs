/// Analytics Module
///
/// Computes daily series, period-over-period change, peaks, anomalies, short
/// forecasts, chain distribution and leaderboards over stored transfers.
/// - series: pure numeric functions over a daily series
/// - engine: concurrent store reads joined into one response
/// - fallback: bounded realtime sample straight from the providers
pub mod engine;
pub mod fallback;
pub mod series;

use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::error::AnalyticsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeRange {
    Week,
    Month,
    Quarter,
    /// Unbounded, from the earliest stored transfer
    All,
}

impl TimeRange {
    /// Fixed length in days, `None` for `All`
    pub fn days(&self) -> Option<u64> {
        match self {
            Self::Week => Some(7),
            Self::Month => Some(30),
            Self::Quarter => Some(90),
            Self::All => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Week => "7d",
            Self::Month => "30d",
            Self::Quarter => "90d",
            Self::All => "all",
        }
    }
}

impl FromStr for TimeRange {
    type Err = AnalyticsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "7d" => Ok(Self::Week),
            "30d" => Ok(Self::Month),
            "90d" => Ok(Self::Quarter),
            "all" => Ok(Self::All),
            other => Err(AnalyticsError::InvalidTimeRange(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainFilter {
    All,
    Chain(u64),
}

impl ChainFilter {
    pub fn chain_id(&self) -> Option<u64> {
        match self {
            Self::All => None,
            Self::Chain(id) => Some(*id),
        }
    }

    pub fn matches(&self, chain_id: u64) -> bool {
        self.chain_id().map_or(true, |id| id == chain_id)
    }
}

impl FromStr for ChainFilter {
    type Err = AnalyticsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        s.parse().map(Self::Chain).map_err(|_| AnalyticsError::InvalidChain(s.to_string()))
    }
}

impl fmt::Display for ChainFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Chain(id) => write!(f, "{}", id),
        }
    }
}

/// Chain filter plus an inclusive day range, as used by every store query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalyticsScope {
    pub chain: ChainFilter,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub decimals: u32,
}

impl AnalyticsScope {
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start.and_time(NaiveTime::MIN).and_utc()
    }

    /// Midnight after the last day
    pub fn end_time_exclusive(&self) -> DateTime<Utc> {
        let next = self.end.checked_add_days(Days::new(1)).unwrap_or(self.end);
        next.and_time(NaiveTime::MIN).and_utc()
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start_time() && at < self.end_time_exclusive()
    }

    /// Inclusive number of days
    pub fn day_count(&self) -> usize {
        ((self.end - self.start).num_days().max(-1) + 1) as usize
    }
}

/// One day of stored activity; days without transfers are absent
#[derive(Debug, Clone, PartialEq)]
pub struct DailyAggregate {
    pub day: NaiveDate,
    pub transfer_count: u64,
    pub volume: f64,
    pub unique_addresses: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeriodTotals {
    pub transfers: u64,
    pub volume: f64,
    pub active_addresses: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainVolume {
    pub chain_id: u64,
    pub transfers: u64,
    pub volume: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AddressVolume {
    pub address: String,
    pub sent_volume: f64,
    pub received_volume: f64,
    pub total_volume: f64,
    pub transfer_count: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WhaleTransfer {
    pub chain_id: u64,
    pub tx_hash: String,
    pub block_number: u64,
    pub from: String,
    pub to: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time_range() {
        assert_eq!("7d".parse::<TimeRange>().unwrap(), TimeRange::Week);
        assert_eq!("ALL".parse::<TimeRange>().unwrap(), TimeRange::All);
        assert_eq!(TimeRange::Quarter.days(), Some(90));
        assert!("1y".parse::<TimeRange>().is_err());
    }

    #[test]
    fn test_parse_chain_filter() {
        assert_eq!("all".parse::<ChainFilter>().unwrap(), ChainFilter::All);
        assert_eq!("137".parse::<ChainFilter>().unwrap(), ChainFilter::Chain(137));
        assert!("polygon".parse::<ChainFilter>().is_err());
        assert_eq!(ChainFilter::Chain(10).to_string(), "10");
    }

    #[test]
    fn test_scope_bounds() {
        let scope = AnalyticsScope {
            chain: ChainFilter::All,
            start: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2024, 3, 7).unwrap(),
            decimals: 18,
        };
        assert_eq!(scope.day_count(), 7);
        assert_eq!(scope.end_time_exclusive().to_rfc3339(), "2024-03-08T00:00:00+00:00");
        assert!(scope.contains(scope.start_time()));
        assert!(!scope.contains(scope.end_time_exclusive()));
    }
}
