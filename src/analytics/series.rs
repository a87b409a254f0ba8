/// Series Module
///
/// Pure functions over a daily series. Nothing here touches the network or
/// the database.
use chrono::{Days, NaiveDate};
use serde::Serialize;
use std::collections::HashMap;

use super::{ChainVolume, DailyAggregate};

/// One day of the zero-filled timeline
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DailyPoint {
    pub date: NaiveDate,
    pub transfers: u64,
    pub volume: f64,
    pub unique_addresses: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Anomaly {
    pub index: usize,
    pub value: f64,
    pub z_score: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChainShare {
    pub chain_id: u64,
    pub transfers: u64,
    pub volume: f64,
    pub percentage: f64,
}

/// Contiguous timeline from `start` to `end` inclusive, absent days zeroed
pub fn daily_timeline(start: NaiveDate, end: NaiveDate, rows: &[DailyAggregate]) -> Vec<DailyPoint> {
    let by_day: HashMap<NaiveDate, &DailyAggregate> = rows.iter().map(|r| (r.day, r)).collect();
    let mut points = Vec::new();
    let mut day = start;

    while day <= end {
        let point = match by_day.get(&day) {
            Some(row) => DailyPoint {
                date: day,
                transfers: row.transfer_count,
                volume: row.volume,
                unique_addresses: row.unique_addresses,
            },
            None => DailyPoint { date: day, transfers: 0, volume: 0.0, unique_addresses: 0 },
        };
        points.push(point);

        match day.checked_add_days(Days::new(1)) {
            Some(next) => day = next,
            None => break,
        }
    }

    points
}

/// Percent change of `current` against `previous`
///
/// A zero baseline yields 100 when anything happened and 0 otherwise.
pub fn percent_change(current: f64, previous: f64) -> f64 {
    if previous == 0.0 {
        return if current > 0.0 { 100.0 } else { 0.0 };
    }
    (current - previous) / previous * 100.0
}

/// Median, averaging the two middle values for even lengths; 0 when empty
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Index of the first maximum
pub fn peak_index(values: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &v) in values.iter().enumerate() {
        if best.map_or(true, |(_, max)| v > max) {
            best = Some((i, v));
        }
    }
    best.map(|(i, _)| i)
}

/// Number of points to project for a range of `days`
pub fn forecast_horizon(days: usize) -> usize {
    days.div_ceil(4).clamp(3, 7)
}

/// Naive projection: last value plus the average step of the recent points
///
/// Uses the last 2-5 observations; this is a slope extrapolation, not a
/// fitted statistical model. Projections are floored at zero.
pub fn forecast(values: &[f64], horizon: usize) -> Vec<f64> {
    let Some(&last) = values.last() else {
        return Vec::new();
    };

    let window = &values[values.len().saturating_sub(5)..];
    let slope = if window.len() >= 2 {
        window.windows(2).map(|w| w[1] - w[0]).sum::<f64>() / (window.len() - 1) as f64
    } else {
        0.0
    };

    (1..=horizon).map(|step| (last + slope * step as f64).max(0.0)).collect()
}

/// Points whose population z-score is at least 2 in magnitude
pub fn detect_anomalies(values: &[f64]) -> Vec<Anomaly> {
    if values.len() < 3 {
        return Vec::new();
    }

    let avg = mean(values);
    let variance = values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / values.len() as f64;
    let std_dev = variance.sqrt();
    if std_dev == 0.0 {
        return Vec::new();
    }

    values
        .iter()
        .enumerate()
        .filter_map(|(index, &value)| {
            let z = (value - avg) / std_dev;
            (z.abs() >= 2.0).then(|| Anomaly { index, value, z_score: round2(z) })
        })
        .collect()
}

/// Each chain's share of total volume
pub fn chain_distribution(volumes: &[ChainVolume]) -> Vec<ChainShare> {
    let total: f64 = volumes.iter().map(|v| v.volume).sum();
    let mut shares: Vec<ChainShare> = volumes
        .iter()
        .map(|v| ChainShare {
            chain_id: v.chain_id,
            transfers: v.transfers,
            volume: v.volume,
            percentage: if total > 0.0 { round2(v.volume / total * 100.0) } else { 0.0 },
        })
        .collect();
    shares.sort_by(|a, b| b.volume.total_cmp(&a.volume).then(a.chain_id.cmp(&b.chain_id)));
    shares
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
