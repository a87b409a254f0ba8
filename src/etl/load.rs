/// Load Module
///
/// Handles storing transfer rows into the PostgreSQL database.
use crate::models::TransferEvent;
use anyhow::{Context, Result};
use sqlx::PgPool;

/// Batch insert transfers within a database transaction
///
/// Uses INSERT ... ON CONFLICT DO NOTHING on (chain_id, tx_hash, log_index),
/// so replaying a page, or racing the reconciler over the same blocks, is a
/// no-op for rows that already exist. Rows are immutable once written.
///
/// Returns the number of rows actually inserted.
pub async fn batch_insert_transfers(pool: &PgPool, events: &[TransferEvent]) -> Result<u64> {
    if events.is_empty() {
        return Ok(0);
    }

    let mut tx = pool.begin().await?;
    let mut inserted = 0;

    for event in events {
        let result = sqlx::query(
            r#"
            INSERT INTO transfers (
                chain_id,
                block_number,
                tx_hash,
                log_index,
                time_stamp,
                from_address,
                to_address,
                value,
                method_id,
                payload
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (chain_id, tx_hash, log_index) DO NOTHING
            "#,
        )
        .bind(event.chain_id as i64)
        .bind(event.block_number as i64)
        .bind(&event.tx_hash)
        .bind(event.log_index as i64)
        .bind(event.timestamp)
        .bind(&event.from)
        .bind(&event.to)
        .bind(&event.value_raw)
        .bind(&event.method_id)
        .bind(&event.raw_payload)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("Failed to insert transfer {}:{}", event.tx_hash, event.log_index))?;

        inserted += result.rows_affected();
    }

    tx.commit().await?;

    tracing::debug!("Batch inserted {} of {} transfers", inserted, events.len());
    Ok(inserted)
}
