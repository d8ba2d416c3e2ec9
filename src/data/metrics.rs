//! Bulk writes and reads for `mgnrega_monthly`.

use crate::data::models::{MetricRecord, MetricRow};
use crate::fmt;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const SLOW_UPSERT_THRESHOLD: Duration = Duration::from_secs(2);

/// Bulk upsert monthly records using the UNNEST pattern.
///
/// Existing rows for the same (state, district, year, month) are overwritten
/// and their `snapshot_date` bumped. The batch is applied in one transaction.
/// Does not refresh `state_monthly_averages`.
pub async fn upsert_batch(pool: &PgPool, records: &[MetricRecord]) -> Result<u64> {
    if records.is_empty() {
        return Ok(0);
    }

    // ON CONFLICT cannot touch the same row twice in one statement; last occurrence wins.
    let mut seen = HashSet::new();
    let mut deduped: Vec<&MetricRecord> = records
        .iter()
        .rev()
        .filter(|r| seen.insert(r.key()))
        .collect();
    deduped.reverse();

    if deduped.len() < records.len() {
        debug!(
            received = records.len(),
            unique = deduped.len(),
            "Collapsed duplicate keys in batch"
        );
    }

    let state_names: Vec<&str> = deduped.iter().map(|r| r.state_name.as_str()).collect();
    let district_names: Vec<&str> = deduped.iter().map(|r| r.district_name.as_str()).collect();
    let state_codes: Vec<Option<&str>> = deduped.iter().map(|r| r.state_code.as_deref()).collect();
    let district_codes: Vec<Option<&str>> = deduped
        .iter()
        .map(|r| r.district_code.as_deref())
        .collect();
    let years: Vec<i32> = deduped.iter().map(|r| r.year).collect();
    let months: Vec<i32> = deduped.iter().map(|r| r.month).collect();
    let persondays: Vec<f64> = deduped.iter().map(|r| r.persondays).collect();
    let households: Vec<i64> = deduped.iter().map(|r| r.total_households_worked).collect();
    let avg_days: Vec<f64> = deduped.iter().map(|r| r.avg_days_per_household).collect();
    let wages: Vec<f64> = deduped.iter().map(|r| r.wages_lakhs).collect();
    let women_persondays: Vec<f64> = deduped.iter().map(|r| r.women_persondays).collect();
    let women_percentages: Vec<f64> = deduped.iter().map(|r| r.women_percentage).collect();
    let raws: Vec<&str> = deduped.iter().map(|r| r.raw.as_str()).collect();

    let start = Instant::now();
    let mut tx = pool.begin().await.context("Failed to begin upsert transaction")?;

    let result = sqlx::query(
        r#"
        INSERT INTO mgnrega_monthly (
            state_name, district_name, state_code, district_code, year, month,
            persondays, total_households_worked, avg_days_per_household,
            wages_lakhs, women_persondays, women_percentage, raw, snapshot_date
        )
        SELECT
            v.state_name, v.district_name, v.state_code, v.district_code, v.year, v.month,
            v.persondays, v.total_households_worked, v.avg_days_per_household,
            v.wages_lakhs, v.women_persondays, v.women_percentage, v.raw::jsonb, now()
        FROM UNNEST(
            $1::text[], $2::text[], $3::text[], $4::text[], $5::int4[], $6::int4[],
            $7::float8[], $8::int8[], $9::float8[], $10::float8[], $11::float8[],
            $12::float8[], $13::text[]
        ) AS v(
            state_name, district_name, state_code, district_code, year, month,
            persondays, total_households_worked, avg_days_per_household,
            wages_lakhs, women_persondays, women_percentage, raw
        )
        ON CONFLICT ON CONSTRAINT uq_mgnrega_monthly_key
        DO UPDATE SET
            state_code = EXCLUDED.state_code,
            district_code = EXCLUDED.district_code,
            persondays = EXCLUDED.persondays,
            total_households_worked = EXCLUDED.total_households_worked,
            avg_days_per_household = EXCLUDED.avg_days_per_household,
            wages_lakhs = EXCLUDED.wages_lakhs,
            women_persondays = EXCLUDED.women_persondays,
            women_percentage = EXCLUDED.women_percentage,
            raw = EXCLUDED.raw,
            snapshot_date = now()
        "#,
    )
    .bind(&state_names)
    .bind(&district_names)
    .bind(&state_codes)
    .bind(&district_codes)
    .bind(&years)
    .bind(&months)
    .bind(&persondays)
    .bind(&households)
    .bind(&avg_days)
    .bind(&wages)
    .bind(&women_persondays)
    .bind(&women_percentages)
    .bind(&raws)
    .execute(&mut *tx)
    .await
    .context("Failed to upsert metric batch")?;

    tx.commit().await.context("Failed to commit metric batch")?;

    let elapsed = start.elapsed();
    if elapsed > SLOW_UPSERT_THRESHOLD {
        warn!(
            records = deduped.len(),
            duration = fmt::duration(elapsed),
            "Slow metric upsert"
        );
    } else {
        debug!(
            records = deduped.len(),
            duration = fmt::duration(elapsed),
            "Upserted metric batch"
        );
    }

    Ok(result.rows_affected())
}

/// The most recent `limit` months for one district, newest first.
pub async fn recent_for_district(
    pool: &PgPool,
    state_name: &str,
    district_name: &str,
    limit: i64,
) -> Result<Vec<MetricRow>> {
    let rows = sqlx::query_as::<_, MetricRow>(
        r#"
        SELECT id, state_name, district_name, state_code, district_code, year, month,
               persondays, total_households_worked, avg_days_per_household,
               wages_lakhs, women_persondays, women_percentage, snapshot_date, raw
        FROM mgnrega_monthly
        WHERE state_name = $1 AND district_name = $2
        ORDER BY year DESC, month DESC
        LIMIT $3
        "#,
    )
    .bind(state_name)
    .bind(district_name)
    .bind(limit)
    .fetch_all(pool)
    .await
    .with_context(|| format!("Failed to load metrics for {district_name}, {state_name}"))?;
    Ok(rows)
}

/// When any metric row was last written.
pub async fn latest_snapshot_date(pool: &PgPool) -> Result<Option<DateTime<Utc>>> {
    let latest: Option<DateTime<Utc>> =
        sqlx::query_scalar("SELECT MAX(snapshot_date) FROM mgnrega_monthly")
            .fetch_one(pool)
            .await
            .context("Failed to read latest snapshot date")?;
    Ok(latest)
}
