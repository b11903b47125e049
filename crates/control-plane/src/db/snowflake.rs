//! Snowflake ID generation.
//!
//! IDs are generated server-side by the `noetl.snowflake_id()` Postgres
//! function (64-bit: timestamp + shard + sequence), not in application code,
//! so that uniqueness holds across every control-plane replica sharing the
//! same database.

use crate::db::DbPool;
use crate::error::AppResult;

/// Generate a single Snowflake ID.
pub async fn generate(pool: &DbPool) -> AppResult<i64> {
    let row: (i64,) = sqlx::query_as("SELECT noetl.snowflake_id()")
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}

/// Generate `n` Snowflake IDs in one round trip.
pub async fn generate_many(pool: &DbPool, n: i64) -> AppResult<Vec<i64>> {
    if n <= 0 {
        return Ok(Vec::new());
    }
    let rows: Vec<(i64,)> = sqlx::query_as("SELECT noetl.snowflake_id() FROM generate_series(1, $1)")
        .bind(n)
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}
