/// Analytics Queries
///
/// Aggregations over the transfers table. Values are stored as decimal
/// strings and scaled in SQL via NUMERIC, so uint256 amounts are summed
/// exactly before the final FLOAT8 cast.
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use super::Database;
use crate::analytics::{
    AddressVolume, AnalyticsScope, ChainFilter, ChainVolume, DailyAggregate, PeriodTotals, WhaleTransfer,
};
use crate::store::AnalyticsReader;

#[derive(sqlx::FromRow)]
struct BoundsRow {
    first_at: Option<DateTime<Utc>>,
    last_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct DailyRow {
    day: NaiveDate,
    transfer_count: i64,
    volume: f64,
    unique_addresses: i64,
}

#[derive(sqlx::FromRow)]
struct TotalsRow {
    transfers: i64,
    volume: f64,
    active_addresses: i64,
}

#[derive(sqlx::FromRow)]
struct ChainVolumeRow {
    chain_id: i64,
    transfers: i64,
    volume: f64,
}

#[derive(sqlx::FromRow)]
struct AddressRow {
    address: String,
    sent_volume: f64,
    received_volume: f64,
    transfer_count: i64,
}

#[derive(sqlx::FromRow)]
struct WhaleRow {
    chain_id: i64,
    tx_hash: String,
    block_number: i64,
    from_address: String,
    to_address: String,
    value: f64,
    time_stamp: DateTime<Utc>,
}

/// Rows in scope: $1 chain filter (NULL = all), $2..$3 half-open time range
const SCOPED: &str = r#"
    SELECT chain_id, tx_hash, block_number, from_address, to_address, value::NUMERIC AS amount, time_stamp
    FROM transfers
    WHERE ($1::BIGINT IS NULL OR chain_id = $1)
      AND time_stamp >= $2
      AND time_stamp < $3
"#;

fn chain_param(chain: ChainFilter) -> Option<i64> {
    chain.chain_id().map(|id| id as i64)
}

#[async_trait]
impl AnalyticsReader for Database {
    async fn time_bounds(&self, chain: ChainFilter) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let row = sqlx::query_as::<_, BoundsRow>(
            r#"
            SELECT MIN(time_stamp) AS first_at, MAX(time_stamp) AS last_at
            FROM transfers
            WHERE ($1::BIGINT IS NULL OR chain_id = $1)
            "#,
        )
        .bind(chain_param(chain))
        .fetch_one(self.pool())
        .await
        .context("Failed to read transfer time bounds")?;

        Ok(row.first_at.zip(row.last_at))
    }

    async fn daily_rows(&self, scope: &AnalyticsScope) -> Result<Vec<DailyAggregate>> {
        let rows = sqlx::query_as::<_, DailyRow>(&format!(
            r#"
            WITH scoped AS ({SCOPED}),
            days AS (
                SELECT (time_stamp AT TIME ZONE 'UTC')::DATE AS day, from_address, to_address, amount
                FROM scoped
            ),
            addresses AS (
                SELECT day, from_address AS address FROM days
                UNION
                SELECT day, to_address AS address FROM days
            ),
            uniques AS (
                SELECT day, COUNT(*) AS unique_addresses FROM addresses GROUP BY day
            )
            SELECT d.day,
                   COUNT(*)::BIGINT AS transfer_count,
                   (COALESCE(SUM(d.amount), 0) / POWER(10::NUMERIC, $4))::FLOAT8 AS volume,
                   MAX(u.unique_addresses)::BIGINT AS unique_addresses
            FROM days d
            JOIN uniques u ON u.day = d.day
            GROUP BY d.day
            ORDER BY d.day
            "#
        ))
        .bind(chain_param(scope.chain))
        .bind(scope.start_time())
        .bind(scope.end_time_exclusive())
        .bind(scope.decimals as i32)
        .fetch_all(self.pool())
        .await
        .context("Failed to load daily aggregates")?;

        Ok(rows
            .into_iter()
            .map(|r| DailyAggregate {
                day: r.day,
                transfer_count: r.transfer_count.max(0) as u64,
                volume: r.volume,
                unique_addresses: r.unique_addresses.max(0) as u64,
            })
            .collect())
    }

    async fn period_totals(&self, scope: &AnalyticsScope) -> Result<PeriodTotals> {
        let row = sqlx::query_as::<_, TotalsRow>(&format!(
            r#"
            WITH scoped AS ({SCOPED})
            SELECT
                (SELECT COUNT(*) FROM scoped)::BIGINT AS transfers,
                (SELECT COALESCE(SUM(amount), 0) / POWER(10::NUMERIC, $4) FROM scoped)::FLOAT8 AS volume,
                (SELECT COUNT(*) FROM (
                    SELECT from_address FROM scoped UNION SELECT to_address FROM scoped
                ) a)::BIGINT AS active_addresses
            "#
        ))
        .bind(chain_param(scope.chain))
        .bind(scope.start_time())
        .bind(scope.end_time_exclusive())
        .bind(scope.decimals as i32)
        .fetch_one(self.pool())
        .await
        .context("Failed to load period totals")?;

        Ok(PeriodTotals {
            transfers: row.transfers.max(0) as u64,
            volume: row.volume,
            active_addresses: row.active_addresses.max(0) as u64,
        })
    }

    async fn chain_volumes(&self, scope: &AnalyticsScope) -> Result<Vec<ChainVolume>> {
        let rows = sqlx::query_as::<_, ChainVolumeRow>(&format!(
            r#"
            WITH scoped AS ({SCOPED})
            SELECT chain_id,
                   COUNT(*)::BIGINT AS transfers,
                   (COALESCE(SUM(amount), 0) / POWER(10::NUMERIC, $4))::FLOAT8 AS volume
            FROM scoped
            GROUP BY chain_id
            ORDER BY chain_id
            "#
        ))
        .bind(None::<i64>)
        .bind(scope.start_time())
        .bind(scope.end_time_exclusive())
        .bind(scope.decimals as i32)
        .fetch_all(self.pool())
        .await
        .context("Failed to load chain distribution")?;

        Ok(rows
            .into_iter()
            .map(|r| ChainVolume {
                chain_id: r.chain_id as u64,
                transfers: r.transfers.max(0) as u64,
                volume: r.volume,
            })
            .collect())
    }

    async fn top_addresses(&self, scope: &AnalyticsScope, limit: usize) -> Result<Vec<AddressVolume>> {
        let rows = sqlx::query_as::<_, AddressRow>(&format!(
            r#"
            WITH scoped AS ({SCOPED}),
            legs AS (
                SELECT from_address AS address, amount AS sent, 0::NUMERIC AS received FROM scoped
                UNION ALL
                SELECT to_address AS address, 0::NUMERIC AS sent, amount AS received FROM scoped
            )
            SELECT address,
                   (SUM(sent) / POWER(10::NUMERIC, $4))::FLOAT8 AS sent_volume,
                   (SUM(received) / POWER(10::NUMERIC, $4))::FLOAT8 AS received_volume,
                   COUNT(*)::BIGINT AS transfer_count
            FROM legs
            GROUP BY address
            ORDER BY SUM(sent) + SUM(received) DESC, address
            LIMIT $5
            "#
        ))
        .bind(chain_param(scope.chain))
        .bind(scope.start_time())
        .bind(scope.end_time_exclusive())
        .bind(scope.decimals as i32)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
        .context("Failed to load top addresses")?;

        Ok(rows
            .into_iter()
            .map(|r| AddressVolume {
                total_volume: r.sent_volume + r.received_volume,
                address: r.address,
                sent_volume: r.sent_volume,
                received_volume: r.received_volume,
                transfer_count: r.transfer_count.max(0) as u64,
            })
            .collect())
    }

    async fn top_transfers(&self, scope: &AnalyticsScope, limit: usize) -> Result<Vec<WhaleTransfer>> {
        let rows = sqlx::query_as::<_, WhaleRow>(&format!(
            r#"
            WITH scoped AS ({SCOPED})
            SELECT chain_id, tx_hash, block_number, from_address, to_address,
                   (amount / POWER(10::NUMERIC, $4))::FLOAT8 AS value,
                   time_stamp
            FROM scoped
            ORDER BY amount DESC, tx_hash
            LIMIT $5
            "#
        ))
        .bind(chain_param(scope.chain))
        .bind(scope.start_time())
        .bind(scope.end_time_exclusive())
        .bind(scope.decimals as i32)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
        .context("Failed to load top transfers")?;

        Ok(rows
            .into_iter()
            .map(|r| WhaleTransfer {
                chain_id: r.chain_id as u64,
                tx_hash: r.tx_hash,
                block_number: r.block_number.max(0) as u64,
                from: r.from_address,
                to: r.to_address,
                value: r.value,
                timestamp: r.time_stamp,
            })
            .collect())
    }
}
