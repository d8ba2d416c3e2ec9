//! Row types for the metrics schema.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A normalized monthly record, keyed by (state, district, year, month).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricRecord {
    pub state_name: String,
    pub district_name: String,
    pub state_code: Option<String>,
    pub district_code: Option<String>,
    pub year: i32,
    pub month: i32,
    pub persondays: f64,
    pub total_households_worked: i64,
    pub avg_days_per_household: f64,
    pub wages_lakhs: f64,
    pub women_persondays: f64,
    /// Always derived from `women_persondays / persondays`.
    pub women_percentage: f64,
    /// The upstream record, serialized as delivered.
    pub raw: String,
}

impl MetricRecord {
    pub fn key(&self) -> (&str, &str, i32, i32) {
        (&self.state_name, &self.district_name, self.year, self.month)
    }
}

/// A persisted `mgnrega_monthly` row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct MetricRow {
    pub id: i32,
    pub state_name: String,
    pub district_name: String,
    pub state_code: Option<String>,
    pub district_code: Option<String>,
    pub year: i32,
    pub month: i32,
    pub persondays: f64,
    pub total_households_worked: i64,
    pub avg_days_per_household: f64,
    pub wages_lakhs: f64,
    pub women_persondays: f64,
    pub women_percentage: f64,
    pub snapshot_date: DateTime<Utc>,
    pub raw: serde_json::Value,
}

/// One row of the `state_monthly_averages` materialized view.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StateMonthAverage {
    pub state_name: String,
    pub year: i32,
    pub month: i32,
    pub avg_persondays: f64,
    pub avg_households: f64,
    pub avg_days_per_household: f64,
    pub avg_wages: f64,
    pub avg_women_persondays: f64,
    pub avg_women_pct: f64,
    pub snapshot_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct District {
    pub id: i32,
    pub state_name: String,
    pub district_name: String,
    pub state_code: Option<String>,
    pub district_code: Option<String>,
}
