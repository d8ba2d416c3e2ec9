//! Small key-value store for state that should survive restarts.
//!
//! Backed by the UNLOGGED `app_kv` table: the scheduler's last run result and
//! last successful run time live here. Losing it on crash recovery only
//! triggers an early catch-up run.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

pub async fn get(pool: &PgPool, key: &str) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar("SELECT value FROM app_kv WHERE key = $1")
        .bind(key)
        .fetch_optional(pool)
        .await
}

pub async fn set(pool: &PgPool, key: &str, value: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO app_kv (key, value)
        VALUES ($1, $2)
        ON CONFLICT (key)
        DO UPDATE SET value = EXCLUDED.value, updated_at = now()
        "#,
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

/// A stored RFC 3339 timestamp. Unparseable values read as absent.
pub async fn get_timestamp(pool: &PgPool, key: &str) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    let value = get(pool, key).await?;
    Ok(value.and_then(|v| DateTime::parse_from_rfc3339(&v).ok().map(|dt| dt.to_utc())))
}

pub async fn set_timestamp(pool: &PgPool, key: &str, ts: DateTime<Utc>) -> Result<(), sqlx::Error> {
    set(pool, key, &ts.to_rfc3339()).await
}
