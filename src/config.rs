//! Environment-driven configuration.
//!
//! Loaded with figment from raw environment variables (after `.env` is applied
//! by `dotenvy`). Durations accept either a bare number of seconds or a
//! suffixed string such as `500ms` or `2h`.

use custom_debug_derive::Debug;
use figment::Figment;
use figment::providers::Env;
use fundu::{DurationParser, TimeUnit};
use serde::{Deserialize, Deserializer};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[debug(skip)]
    pub database_url: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// data.gov.in API key. Ingestion is skipped cleanly when absent.
    #[serde(default)]
    #[debug(with = "crate::fmt::redacted")]
    pub datagov_key: Option<String>,
    /// data.gov.in resource id for the MGNREGA dataset.
    #[serde(default)]
    pub datagov_resource_id: Option<String>,
    #[serde(default = "default_base_url")]
    pub datagov_base_url: String,
    #[serde(default = "default_requests_per_minute")]
    pub datagov_requests_per_minute: u32,
    #[serde(default = "default_burst")]
    pub datagov_burst: u32,
    #[serde(
        default = "default_request_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub request_timeout: Duration,

    /// Comma-separated list of state names, one ingestion run per state.
    #[serde(default = "default_ingest_states")]
    pub ingest_states: String,
    #[serde(default = "default_page_size")]
    pub ingest_page_size: u32,
    #[serde(
        default = "default_courtesy_pause",
        deserialize_with = "deserialize_duration"
    )]
    pub ingest_courtesy_pause: Duration,
    /// Hour of day (UTC) at which the daily ingestion fires.
    #[serde(default = "default_ingest_hour")]
    pub ingest_hour_utc: u32,
    #[serde(
        default = "default_run_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub ingest_run_timeout: Duration,
    /// Optional TOML file overriding the upstream field alias table.
    #[serde(default)]
    pub field_aliases_path: Option<PathBuf>,

    #[serde(default = "default_max_connections")]
    pub db_max_connections: u32,
    #[serde(
        default = "default_shutdown_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub shutdown_timeout: Duration,
}

impl Config {
    /// Extract the configuration from the process environment.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new().merge(Env::raw()).extract()
    }

    /// Configured ingestion scopes, trimmed and de-duplicated in order.
    pub fn ingest_states(&self) -> Vec<String> {
        split_states(&self.ingest_states)
    }
}

fn split_states(raw: &str) -> Vec<String> {
    let mut states: Vec<String> = Vec::new();
    for state in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if !states.iter().any(|s| s == state) {
            states.push(state.to_owned());
        }
    }
    states
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_base_url() -> String {
    "https://api.data.gov.in/resource".to_owned()
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_burst() -> u32 {
    5
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_ingest_states() -> String {
    "Uttar Pradesh".to_owned()
}

fn default_page_size() -> u32 {
    500
}

fn default_courtesy_pause() -> Duration {
    Duration::from_millis(500)
}

fn default_ingest_hour() -> u32 {
    2
}

fn default_run_timeout() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}

fn default_max_connections() -> u32 {
    10
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(8)
}

const DURATION_UNITS: [TimeUnit; 5] = [
    TimeUnit::MilliSecond,
    TimeUnit::Second,
    TimeUnit::Minute,
    TimeUnit::Hour,
    TimeUnit::Day,
];

/// Parse a duration string like `30`, `500ms` or `2h`. Bare numbers are seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let parsed = DurationParser::with_time_units(&DURATION_UNITS)
        .parse(raw.trim())
        .map_err(|e| format!("invalid duration '{raw}': {e}"))?;
    Duration::try_from(parsed).map_err(|e| format!("invalid duration '{raw}': {e}"))
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};
    use std::fmt;

    struct DurationVisitor;

    impl Visitor<'_> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a number of seconds or a duration string like '500ms'")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::custom(format!("negative duration: {v}")))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
            parse_duration(v).map_err(E::custom)
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}
