#![allow(dead_code)]

use mgnrega_tracker::data::models::MetricRecord;
use mgnrega_tracker::ingest::normalize::women_percentage;
use serde_json::json;
use sqlx::PgPool;

/// Build a `MetricRecord` with derived fields filled in consistently.
pub fn make_record(
    state: &str,
    district: &str,
    year: i32,
    month: i32,
    persondays: f64,
    women_persondays: f64,
) -> MetricRecord {
    let raw = json!({
        "state_name": state,
        "district_name": district,
        "year": year,
        "month": month,
        "persondays": persondays,
        "women_persondays": women_persondays,
    });
    MetricRecord {
        state_name: state.to_owned(),
        district_name: district.to_owned(),
        state_code: None,
        district_code: None,
        year,
        month,
        persondays,
        total_households_worked: 10,
        avg_days_per_household: 12.5,
        wages_lakhs: 3.25,
        women_persondays,
        women_percentage: women_percentage(women_persondays, persondays),
        raw: raw.to_string(),
    }
}

pub async fn count_metrics(pool: &PgPool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM mgnrega_monthly")
        .fetch_one(pool)
        .await
        .unwrap()
}

/// Insert a `districts` row and return its id.
pub async fn insert_district(pool: &PgPool, state: &str, district: &str) -> i32 {
    sqlx::query_scalar(
        "INSERT INTO districts (state_name, district_name, state_code) VALUES ($1, $2, '09') RETURNING id",
    )
    .bind(state)
    .bind(district)
    .fetch_one(pool)
    .await
    .unwrap()
}
