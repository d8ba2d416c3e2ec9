//! Client for the data.gov.in open-data resource API.

pub mod api;
pub mod errors;
pub mod json;
pub mod middleware;
pub mod retry;

pub use api::{Credentials, DataGovApi};
pub use errors::DataGovApiError;
pub use retry::RetryPolicy;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Upstream query filters, e.g. `filters[state_name] = "Bihar"`.
pub type Filters = BTreeMap<String, String>;

/// One upstream record exactly as delivered. Key names vary across resource
/// versions, so nothing about its shape is assumed here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(Map<String, Value>);

impl RawRecord {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl From<Map<String, Value>> for RawRecord {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Serialized JSON form, used both for logging and for the stored audit copy.
impl fmt::Display for RawRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(&self.0).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

/// The response body of a resource query.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    pub records: Vec<RawRecord>,
}

/// Result of a single page request.
#[derive(Debug)]
pub enum PageFetch {
    Records(Vec<RawRecord>),
    /// Credentials or resource id are missing; nothing was requested.
    Unconfigured,
}
