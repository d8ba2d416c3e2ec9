//! The `state_monthly_averages` materialized view.

use crate::data::models::StateMonthAverage;
use crate::fmt;
use anyhow::{Context, Result};
use sqlx::PgPool;
use std::time::Instant;
use tracing::debug;

/// Rebuild the per-state monthly averages.
///
/// `CONCURRENTLY` keeps the view readable during the rebuild; readers see
/// either the previous or the new contents.
pub async fn refresh(pool: &PgPool) -> Result<()> {
    let start = Instant::now();
    sqlx::query("REFRESH MATERIALIZED VIEW CONCURRENTLY state_monthly_averages")
        .execute(pool)
        .await
        .context("Failed to refresh state_monthly_averages")?;
    debug!(duration = fmt::duration(start.elapsed()), "Refreshed state averages");
    Ok(())
}

const COLUMNS: &str = "state_name, year, month, avg_persondays, avg_households, \
    avg_days_per_household, avg_wages, avg_women_persondays, avg_women_pct, snapshot_date";

pub async fn get(
    pool: &PgPool,
    state_name: &str,
    year: i32,
    month: i32,
) -> Result<Option<StateMonthAverage>> {
    let row = sqlx::query_as::<_, StateMonthAverage>(&format!(
        "SELECT {COLUMNS} FROM state_monthly_averages \
         WHERE state_name = $1 AND year = $2 AND month = $3"
    ))
    .bind(state_name)
    .bind(year)
    .bind(month)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("Failed to load averages for {state_name} {year}-{month:02}"))?;
    Ok(row)
}

/// All months for a state, newest first.
pub async fn list_for_state(pool: &PgPool, state_name: &str) -> Result<Vec<StateMonthAverage>> {
    let rows = sqlx::query_as::<_, StateMonthAverage>(&format!(
        "SELECT {COLUMNS} FROM state_monthly_averages \
         WHERE state_name = $1 ORDER BY year DESC, month DESC"
    ))
    .bind(state_name)
    .fetch_all(pool)
    .await
    .with_context(|| format!("Failed to list averages for {state_name}"))?;
    Ok(rows)
}
