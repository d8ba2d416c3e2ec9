//! Upstream record normalization.
//!
//! data.gov.in resources name the same quantity differently between dataset
//! versions, so every canonical field probes an ordered list of aliases.

use crate::data::models::MetricRecord;
use crate::datagov::RawRecord;
use figment::Figment;
use figment::providers::{Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::{debug, warn};

/// Alias lists per canonical field, probed in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldAliases {
    pub state_name: Vec<String>,
    pub district_name: Vec<String>,
    pub state_code: Vec<String>,
    pub district_code: Vec<String>,
    pub year: Vec<String>,
    pub month: Vec<String>,
    pub persondays: Vec<String>,
    pub total_households_worked: Vec<String>,
    pub avg_days_per_household: Vec<String>,
    pub wages_lakhs: Vec<String>,
    pub women_persondays: Vec<String>,
}

fn aliases(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| (*s).to_owned()).collect()
}

impl Default for FieldAliases {
    fn default() -> Self {
        Self {
            state_name: aliases(&["state_name", "state"]),
            district_name: aliases(&["district_name", "district"]),
            state_code: aliases(&["state_code"]),
            district_code: aliases(&["district_code"]),
            year: aliases(&["year", "financial_year"]),
            month: aliases(&["month"]),
            persondays: aliases(&["persondays", "person_days"]),
            total_households_worked: aliases(&["total_households_worked", "households"]),
            avg_days_per_household: aliases(&[
                "avg_days_per_household",
                "average_days_of_employment_provided_per_household",
            ]),
            wages_lakhs: aliases(&["wages_lakhs", "total_exp_rs__in_lakhs__", "wages_disbursed"]),
            women_persondays: aliases(&["women_persondays", "women_person_days"]),
        }
    }
}

impl FieldAliases {
    /// Load overrides from a TOML file. Fields the file omits keep their defaults.
    pub fn load(path: &Path) -> Result<Self, figment::Error> {
        Self::merged(Toml::file(path))
    }

    fn merged(overrides: impl figment::Provider) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(overrides)
            .extract()
    }
}

/// Why a record was skipped.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NormalizeError {
    #[error("missing required field `{0}`")]
    Missing(&'static str),
    #[error("field `{field}` is not a scalar value: {value}")]
    Malformed { field: &'static str, value: String },
    #[error("field `{field}` is not numeric: {value}")]
    NotNumeric { field: &'static str, value: String },
    #[error("field `{field}` is out of range: {value}")]
    OutOfRange { field: &'static str, value: String },
    #[error("women person-days ({women}) exceed person-days ({total})")]
    WomenExceedTotal { women: f64, total: f64 },
    /// Postgres text and jsonb cannot store U+0000.
    #[error("field `{field}` contains a NUL character")]
    NulCharacter { field: String },
}

/// Map one upstream record onto the canonical schema.
pub fn normalize(aliases: &FieldAliases, raw: &RawRecord) -> Result<MetricRecord, NormalizeError> {
    if let Some(field) = find_nul(raw) {
        return Err(NormalizeError::NulCharacter { field });
    }

    let state_name = required_text(raw, &aliases.state_name, "state_name")?;
    let district_name = required_text(raw, &aliases.district_name, "district_name")?;
    let state_code = optional_text(raw, &aliases.state_code, "state_code")?;
    let district_code = optional_text(raw, &aliases.district_code, "district_code")?;

    let year = probe(raw, &aliases.year)
        .ok_or(NormalizeError::Missing("year"))
        .and_then(parse_year)?;
    let month = probe(raw, &aliases.month)
        .ok_or(NormalizeError::Missing("month"))
        .and_then(parse_month)?;

    let persondays = metric(raw, &aliases.persondays, "persondays")?;
    let total_households_worked = households(raw, &aliases.total_households_worked)?;
    let avg_days_per_household = metric(raw, &aliases.avg_days_per_household, "avg_days_per_household")?;
    let wages_lakhs = metric(raw, &aliases.wages_lakhs, "wages_lakhs")?;
    let women_persondays = metric(raw, &aliases.women_persondays, "women_persondays")?;

    if women_persondays > persondays {
        return Err(NormalizeError::WomenExceedTotal {
            women: women_persondays,
            total: persondays,
        });
    }

    Ok(MetricRecord {
        state_name,
        district_name,
        state_code,
        district_code,
        year,
        month,
        persondays,
        total_households_worked,
        avg_days_per_household,
        wages_lakhs,
        women_persondays,
        women_percentage: women_percentage(women_persondays, persondays),
        raw: raw.to_string(),
    })
}

/// Normalize a page, dropping (and logging) records that fail.
///
/// Returns the kept records and the number skipped.
pub fn normalize_page(aliases: &FieldAliases, page: &[RawRecord]) -> (Vec<MetricRecord>, u64) {
    let mut kept = Vec::with_capacity(page.len());
    let mut skipped = 0u64;
    for raw in page {
        match normalize(aliases, raw) {
            Ok(record) => kept.push(record),
            Err(e) => {
                skipped += 1;
                warn!(error = %e, raw = %raw, "Skipping malformed record");
            }
        }
    }
    if skipped > 0 {
        debug!(kept = kept.len(), skipped, "Normalized page with skips");
    }
    (kept, skipped)
}

/// Share of person-days worked by women, as a percentage.
pub fn women_percentage(women_persondays: f64, persondays: f64) -> f64 {
    if persondays > 0.0 {
        (women_persondays / persondays * 100.0).clamp(0.0, 100.0)
    } else {
        0.0
    }
}

/// The first key whose name or string content (at any depth) holds a NUL.
fn find_nul(raw: &RawRecord) -> Option<String> {
    fn contains_nul(value: &Value) -> bool {
        match value {
            Value::String(s) => s.contains('\0'),
            Value::Array(items) => items.iter().any(contains_nul),
            Value::Object(map) => map.iter().any(|(k, v)| k.contains('\0') || contains_nul(v)),
            _ => false,
        }
    }

    raw.iter()
        .find(|(key, value)| key.contains('\0') || contains_nul(value))
        .map(|(key, _)| key.replace('\0', "\\u0000"))
}

/// An integer, from an integral JSON number such as `4` or `4.0`.
fn integral(n: &serde_json::Number) -> Option<i64> {
    n.as_i64().or_else(|| {
        n.as_f64()
            .filter(|f| f.fract() == 0.0 && (i64::MIN as f64..=i64::MAX as f64).contains(f))
            .map(|f| f as i64)
    })
}

/// First alias whose value is neither null nor a blank string.
fn probe<'a>(raw: &'a RawRecord, aliases: &[String]) -> Option<&'a Value> {
    aliases
        .iter()
        .filter_map(|key| raw.get(key))
        .find(|value| match value {
            Value::Null => false,
            Value::String(s) => !s.trim().is_empty(),
            _ => true,
        })
}

fn text(value: &Value, field: &'static str) -> Result<String, NormalizeError> {
    match value {
        Value::String(s) => Ok(s.trim().to_owned()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(NormalizeError::Malformed {
            field,
            value: other.to_string(),
        }),
    }
}

fn required_text(raw: &RawRecord, aliases: &[String], field: &'static str) -> Result<String, NormalizeError> {
    let value = probe(raw, aliases).ok_or(NormalizeError::Missing(field))?;
    text(value, field)
}

fn optional_text(
    raw: &RawRecord,
    aliases: &[String],
    field: &'static str,
) -> Result<Option<String>, NormalizeError> {
    probe(raw, aliases).map(|v| text(v, field)).transpose()
}

/// A non-negative finite number, from a JSON number or a string like `" 1,23,456 "`.
fn number(value: &Value, field: &'static str) -> Result<f64, NormalizeError> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', "").parse::<f64>().ok(),
        _ => None,
    };
    let n = parsed.ok_or_else(|| NormalizeError::NotNumeric {
        field,
        value: value.to_string(),
    })?;
    if !n.is_finite() || n < 0.0 {
        return Err(NormalizeError::OutOfRange {
            field,
            value: value.to_string(),
        });
    }
    Ok(n)
}

/// Metric fields default to zero when no alias is present.
fn metric(raw: &RawRecord, aliases: &[String], field: &'static str) -> Result<f64, NormalizeError> {
    probe(raw, aliases).map_or(Ok(0.0), |v| number(v, field))
}

fn households(raw: &RawRecord, aliases: &[String]) -> Result<i64, NormalizeError> {
    const FIELD: &str = "total_households_worked";
    let Some(value) = probe(raw, aliases) else {
        return Ok(0);
    };
    let n = number(value, FIELD)?;
    if n.fract() != 0.0 || n > i64::MAX as f64 {
        return Err(NormalizeError::OutOfRange {
            field: FIELD,
            value: value.to_string(),
        });
    }
    Ok(n as i64)
}

/// A calendar year. Financial-year strings like `"2024-2025"` use their first year.
fn parse_year(value: &Value) -> Result<i32, NormalizeError> {
    const FIELD: &str = "year";
    let year = match value {
        Value::String(s) => {
            let digits: String = s.trim().chars().take_while(char::is_ascii_digit).collect();
            digits.parse::<i32>().ok()
        }
        Value::Number(n) => integral(n).and_then(|y| i32::try_from(y).ok()),
        _ => None,
    }
    .ok_or_else(|| NormalizeError::NotNumeric {
        field: FIELD,
        value: value.to_string(),
    })?;

    if !(1900..=2100).contains(&year) {
        return Err(NormalizeError::OutOfRange {
            field: FIELD,
            value: value.to_string(),
        });
    }
    Ok(year)
}

const MONTH_NAMES: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

/// Month 1-12, from a number, a numeric string, or an English name or abbreviation.
fn parse_month(value: &Value) -> Result<i32, NormalizeError> {
    const FIELD: &str = "month";
    let out_of_range = || NormalizeError::OutOfRange {
        field: FIELD,
        value: value.to_string(),
    };

    let month = match value {
        Value::Number(n) => integral(n).ok_or_else(out_of_range)?,
        Value::String(s) => {
            let s = s.trim();
            match s.parse::<i64>() {
                Ok(n) => n,
                Err(_) => month_from_name(s).ok_or_else(|| NormalizeError::NotNumeric {
                    field: FIELD,
                    value: value.to_string(),
                })?,
            }
        }
        other => {
            return Err(NormalizeError::Malformed {
                field: FIELD,
                value: other.to_string(),
            });
        }
    };

    if !(1..=12).contains(&month) {
        return Err(out_of_range());
    }
    Ok(month as i32)
}

fn month_from_name(name: &str) -> Option<i64> {
    let name = name.to_ascii_lowercase();
    if name.len() < 3 {
        return None;
    }
    MONTH_NAMES
        .iter()
        .position(|full| full.starts_with(name.as_str()))
        .map(|idx| idx as i64 + 1)
}
