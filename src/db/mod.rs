/// Database Module
///
/// This module handles all PostgreSQL database operations including:
/// - Connection pool management
/// - Schema migrations
/// - Chain cursors and backfill checkpoints
/// - The credential store read by the key refresher
mod analytics;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::collections::HashMap;
use std::time::Duration;

use crate::analytics::ChainFilter;
use crate::etl::load;
use crate::models::{BackfillProgress, BackfillStatus, ChainCursor, TransferEvent};
use crate::store::{CursorStore, TransferStore};

pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL database")?;

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await.context("Failed to run database migrations")?;

        tracing::info!("Database migrations completed successfully");
        Ok(())
    }

    /// Test the database connection
    pub async fn test_connection(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await.context("Database connection test failed")?;

        Ok(())
    }

    /// Whether the schema has been created
    pub async fn is_initialized(&self) -> Result<bool> {
        let exists = sqlx::query_scalar::<_, bool>("SELECT to_regclass('public.transfers') IS NOT NULL")
            .fetch_one(&self.pool)
            .await
            .context("Failed to inspect schema")?;

        Ok(exists)
    }

    /// Load enabled API keys grouped by provider
    pub async fn load_api_keys(&self) -> Result<HashMap<String, Vec<String>>> {
        let rows = sqlx::query_as::<_, ApiKeyRow>(
            "SELECT provider, secret FROM api_keys WHERE enabled ORDER BY provider, id",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to load API keys")?;

        let mut keys: HashMap<String, Vec<String>> = HashMap::new();
        for row in rows {
            keys.entry(row.provider).or_default().push(row.secret);
        }
        Ok(keys)
    }
}

/// Credential row from the api_keys table
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiKeyRow {
    pub provider: String,
    pub secret: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct CursorRow {
    chain_id: i64,
    last_block_number: i64,
    last_success_at: Option<DateTime<Utc>>,
    last_error_at: Option<DateTime<Utc>>,
    consecutive_failures: i32,
    backoff_until: Option<DateTime<Utc>>,
}

impl From<CursorRow> for ChainCursor {
    fn from(row: CursorRow) -> Self {
        Self {
            chain_id: row.chain_id as u64,
            last_block_number: row.last_block_number.max(0) as u64,
            last_success_at: row.last_success_at,
            last_error_at: row.last_error_at,
            consecutive_failures: row.consecutive_failures.max(0) as u32,
            backoff_until: row.backoff_until,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct BackfillRow {
    chain_id: i64,
    target_block: i64,
    last_processed_block: Option<i64>,
    total_backfilled: i64,
    status: String,
}

const CURSOR_COLUMNS: &str =
    "chain_id, last_block_number, last_success_at, last_error_at, consecutive_failures, backoff_until";

#[async_trait]
impl TransferStore for Database {
    async fn insert_transfers(&self, events: &[TransferEvent]) -> Result<u64> {
        load::batch_insert_transfers(&self.pool, events).await
    }

    async fn count_transfers(&self, chain: ChainFilter) -> Result<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM transfers WHERE ($1::BIGINT IS NULL OR chain_id = $1)",
        )
        .bind(chain.chain_id().map(|id| id as i64))
        .fetch_one(&self.pool)
        .await
        .context("Failed to count transfers")?;

        Ok(count.max(0) as u64)
    }

    async fn latest_transfer_at(&self, chain: ChainFilter) -> Result<Option<DateTime<Utc>>> {
        let latest = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT MAX(time_stamp) FROM transfers WHERE ($1::BIGINT IS NULL OR chain_id = $1)",
        )
        .bind(chain.chain_id().map(|id| id as i64))
        .fetch_one(&self.pool)
        .await
        .context("Failed to read latest transfer time")?;

        Ok(latest)
    }
}

#[async_trait]
impl CursorStore for Database {
    async fn load_cursor(&self, chain_id: u64) -> Result<ChainCursor> {
        let row = sqlx::query_as::<_, CursorRow>(&format!(
            "SELECT {} FROM chain_cursors WHERE chain_id = $1",
            CURSOR_COLUMNS
        ))
        .bind(chain_id as i64)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Failed to load cursor for chain {}", chain_id))?;

        Ok(row.map(ChainCursor::from).unwrap_or_else(|| ChainCursor::new(chain_id)))
    }

    async fn record_success(&self, chain_id: u64, last_block: u64, at: DateTime<Utc>) -> Result<ChainCursor> {
        let row = sqlx::query_as::<_, CursorRow>(&format!(
            r#"
            INSERT INTO chain_cursors (chain_id, last_block_number, last_success_at, consecutive_failures)
            VALUES ($1, $2, $3, 0)
            ON CONFLICT (chain_id)
            DO UPDATE SET
                last_block_number = GREATEST(chain_cursors.last_block_number, EXCLUDED.last_block_number),
                last_success_at = EXCLUDED.last_success_at,
                consecutive_failures = 0,
                backoff_until = NULL,
                updated_at = NOW()
            RETURNING {}
            "#,
            CURSOR_COLUMNS
        ))
        .bind(chain_id as i64)
        .bind(last_block as i64)
        .bind(at)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to advance cursor for chain {}", chain_id))?;

        Ok(row.into())
    }

    async fn record_failure(
        &self,
        chain_id: u64,
        at: DateTime<Utc>,
        backoff_until: DateTime<Utc>,
    ) -> Result<ChainCursor> {
        let row = sqlx::query_as::<_, CursorRow>(&format!(
            r#"
            INSERT INTO chain_cursors (chain_id, last_error_at, consecutive_failures, backoff_until)
            VALUES ($1, $2, 1, $3)
            ON CONFLICT (chain_id)
            DO UPDATE SET
                last_error_at = EXCLUDED.last_error_at,
                consecutive_failures = chain_cursors.consecutive_failures + 1,
                backoff_until = EXCLUDED.backoff_until,
                updated_at = NOW()
            RETURNING {}
            "#,
            CURSOR_COLUMNS
        ))
        .bind(chain_id as i64)
        .bind(at)
        .bind(backoff_until)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to record failure for chain {}", chain_id))?;

        Ok(row.into())
    }

    async fn load_backfill(&self, chain_id: u64) -> Result<Option<BackfillProgress>> {
        let row = sqlx::query_as::<_, BackfillRow>(
            r#"
            SELECT chain_id, target_block, last_processed_block, total_backfilled, status
            FROM backfill_progress
            WHERE chain_id = $1
            "#,
        )
        .bind(chain_id as i64)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Failed to load backfill progress for chain {}", chain_id))?;

        Ok(row.map(|r| BackfillProgress {
            chain_id: r.chain_id as u64,
            target_block: r.target_block.max(0) as u64,
            last_processed_block: r.last_processed_block.map(|b| b.max(0) as u64),
            total_backfilled: r.total_backfilled.max(0) as u64,
            status: BackfillStatus::parse(&r.status),
        }))
    }

    async fn save_backfill(&self, progress: &BackfillProgress) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO backfill_progress (chain_id, target_block, last_processed_block, total_backfilled, status)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (chain_id)
            DO UPDATE SET
                target_block = EXCLUDED.target_block,
                last_processed_block = EXCLUDED.last_processed_block,
                total_backfilled = EXCLUDED.total_backfilled,
                status = EXCLUDED.status,
                updated_at = NOW()
            "#,
        )
        .bind(progress.chain_id as i64)
        .bind(progress.target_block as i64)
        .bind(progress.last_processed_block.map(|b| b as i64))
        .bind(progress.total_backfilled as i64)
        .bind(progress.status.as_str())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save backfill progress for chain {}", progress.chain_id))?;

        Ok(())
    }
}
