//! # Schema Setup
//!
//! The schema ships inside the binary and is written with `CREATE ... IF NOT
//! EXISTS`, so applying it repeatedly is harmless. Concurrent callers (parallel
//! tests, several engine processes starting together) are serialized through a
//! PostgreSQL advisory lock:
//!
//! ```sql
//! SELECT pg_advisory_lock(7318349163544180)
//! ```

use sqlx::PgPool;

const SCHEMA: &str = include_str!("../../migrations/20250101000000_docbatch_schema.sql");

/// Deterministic key for the schema lock
const SCHEMA_LOCK_KEY: i64 = 7318349163544180;

pub struct DatabaseMigrations;

impl DatabaseMigrations {
    /// Apply the schema under the advisory lock
    pub async fn run_all(pool: &PgPool) -> Result<(), sqlx::Error> {
        let mut conn = pool.acquire().await?;

        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(SCHEMA_LOCK_KEY)
            .execute(&mut *conn)
            .await?;

        let result = sqlx::raw_sql(SCHEMA).execute(&mut *conn).await;

        // Always release the lock
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(SCHEMA_LOCK_KEY)
            .execute(&mut *conn)
            .await?;

        result.map(|_| ())
    }
}
