//! Per-metric monthly series for a district, oldest month first.

use crate::data::metrics::recent_for_district;
use crate::data::models::{District, MetricRow};
use anyhow::Result;
use serde::Serialize;
use sqlx::PgPool;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendPoint {
    pub year: i32,
    pub month: i32,
    pub value: f64,
    /// `YYYY-MM`
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistrictTrends {
    pub district_name: String,
    pub trends: BTreeMap<&'static str, Vec<TrendPoint>>,
}

type Metric = (&'static str, fn(&MetricRow) -> f64);

const METRICS: [Metric; 5] = [
    ("persondays", |r: &MetricRow| r.persondays),
    ("households", |r: &MetricRow| r.total_households_worked as f64),
    ("avg_days", |r: &MetricRow| r.avg_days_per_household),
    ("wages", |r: &MetricRow| r.wages_lakhs),
    ("women_pct", |r: &MetricRow| r.women_percentage),
];

/// Build the series from rows in any order.
pub fn build(district_name: &str, rows: &[MetricRow]) -> DistrictTrends {
    let mut ordered: Vec<&MetricRow> = rows.iter().collect();
    ordered.sort_by_key(|r| (r.year, r.month));

    let trends = METRICS
        .iter()
        .map(|(name, read)| {
            let points = ordered
                .iter()
                .map(|r| TrendPoint {
                    year: r.year,
                    month: r.month,
                    value: read(r),
                    label: format!("{}-{:02}", r.year, r.month),
                })
                .collect();
            (*name, points)
        })
        .collect();

    DistrictTrends {
        district_name: district_name.to_owned(),
        trends,
    }
}

/// The district's latest `months` months as series.
pub async fn for_district(pool: &PgPool, district: &District, months: i64) -> Result<DistrictTrends> {
    let rows = recent_for_district(pool, &district.state_name, &district.district_name, months.max(1)).await?;
    Ok(build(&district.district_name, &rows))
}
