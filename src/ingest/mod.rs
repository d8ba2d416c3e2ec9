//! Ingestion: page loop, normalization and scheduling.

pub mod normalize;
pub mod pipeline;
pub mod scheduler;

pub use normalize::{FieldAliases, NormalizeError};
pub use pipeline::{Pipeline, PipelineOptions, RunReport, Termination};
pub use scheduler::Scheduler;

use crate::data::models::MetricRecord;
use crate::datagov::{DataGovApi, DataGovApiError, Filters, PageFetch};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::error;

/// Where pages of raw records come from.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(
        &self,
        filters: &Filters,
        page: u32,
        page_size: u32,
    ) -> Result<PageFetch, DataGovApiError>;
}

#[async_trait]
impl PageSource for DataGovApi {
    async fn fetch_page(
        &self,
        filters: &Filters,
        page: u32,
        page_size: u32,
    ) -> Result<PageFetch, DataGovApiError> {
        DataGovApi::fetch_page(self, filters, page, page_size).await
    }
}

/// Where normalized records go.
#[async_trait]
pub trait MetricStore: Send + Sync {
    /// Write one batch atomically, returning the number of rows written.
    async fn upsert_batch(&self, records: &[MetricRecord]) -> anyhow::Result<u64>;

    /// Rebuild derived per-state aggregates.
    async fn refresh_aggregates(&self) -> anyhow::Result<()>;
}

/// One ingestion run's filter: a single state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestScope {
    pub state: String,
}

impl IngestScope {
    pub fn new(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
        }
    }

    pub fn filters(&self) -> Filters {
        Filters::from([("filters[state_name]".to_owned(), self.state.clone())])
    }
}

/// Structured result of a run, as reported to operators and persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum IngestOutcome {
    Success { records: u64 },
    Error { error: String, records: u64 },
}

impl IngestOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn records(&self) -> u64 {
        match self {
            Self::Success { records } | Self::Error { records, .. } => *records,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeOutcome {
    pub state: String,
    #[serde(flatten)]
    pub outcome: IngestOutcome,
}

/// Run every scope concurrently, one task each, returning outcomes in scope order.
///
/// A panicking run becomes an error outcome. Dropping the returned future
/// aborts any runs still in flight.
pub async fn run_scopes<S, M>(pipeline: Arc<Pipeline<S, M>>, scopes: &[IngestScope]) -> Vec<ScopeOutcome>
where
    S: PageSource + 'static,
    M: MetricStore + 'static,
{
    let mut tasks = JoinSet::new();
    let mut slots = HashMap::new();

    for (idx, scope) in scopes.iter().enumerate() {
        let pipeline = pipeline.clone();
        let scope = scope.clone();
        let handle = tasks.spawn(async move { pipeline.run(&scope).await.outcome() });
        slots.insert(handle.id(), idx);
    }

    let mut outcomes: Vec<Option<IngestOutcome>> = vec![None; scopes.len()];
    while let Some(joined) = tasks.join_next_with_id().await {
        let (id, outcome) = match joined {
            Ok((id, outcome)) => (id, outcome),
            Err(e) => {
                error!(error = %e, "Ingestion task failed");
                let outcome = IngestOutcome::Error {
                    error: format!("ingestion task failed: {e}"),
                    records: 0,
                };
                (e.id(), outcome)
            }
        };
        if let Some(&idx) = slots.get(&id) {
            outcomes[idx] = Some(outcome);
        }
    }

    scopes
        .iter()
        .zip(outcomes)
        .map(|(scope, outcome)| ScopeOutcome {
            state: scope.state.clone(),
            outcome: outcome.unwrap_or_else(|| IngestOutcome::Error {
                error: "ingestion task produced no result".to_owned(),
                records: 0,
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scope_filters_by_state_name() {
        let filters = IngestScope::new("Bihar").filters();
        assert_eq!(filters.len(), 1);
        assert_eq!(filters.get("filters[state_name]").map(String::as_str), Some("Bihar"));
    }

    #[test]
    fn outcomes_serialize_with_status_tag() {
        let success = ScopeOutcome {
            state: "Bihar".into(),
            outcome: IngestOutcome::Success { records: 12 },
        };
        assert_eq!(
            serde_json::to_value(&success).unwrap(),
            json!({ "state": "Bihar", "status": "success", "records": 12 })
        );

        let failure = IngestOutcome::Error {
            error: "boom".into(),
            records: 500,
        };
        assert_eq!(
            serde_json::to_value(&failure).unwrap(),
            json!({ "status": "error", "error": "boom", "records": 500 })
        );
    }
}
