/// ETL Pipeline Module
///
/// This module holds the stages shared by live ingestion and the backfill reconciler:
/// - Extract: walk a block window page by page without skipping partially seen blocks
/// - Transform: normalise provider rows and enforce ascending order
/// - Load: idempotent insert of transfer rows into PostgreSQL
pub mod extract;
pub mod load;
pub mod transform;
