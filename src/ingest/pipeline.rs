//! The per-scope ingestion loop.
//!
//! Pages are fetched strictly in order. Each page is normalized and written as
//! one batch before the next is requested; a page shorter than the page size
//! means the upstream is exhausted. Whatever ends the loop, the aggregate is
//! refreshed and the count of stored records is reported.

use crate::config::Config;
use crate::datagov::{DataGovApiError, PageFetch};
use crate::fmt;
use crate::ingest::normalize::{FieldAliases, normalize_page};
use crate::ingest::{IngestOutcome, IngestScope, MetricStore, PageSource};
use std::future::Future;
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub page_size: u32,
    /// Pause between successful page fetches.
    pub courtesy_pause: Duration,
    /// Upper bound on a whole run. `None` disables it.
    pub run_timeout: Option<Duration>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            page_size: 500,
            courtesy_pause: Duration::from_millis(500),
            run_timeout: Some(Duration::from_secs(2 * 60 * 60)),
        }
    }
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            page_size: config.ingest_page_size,
            courtesy_pause: config.ingest_courtesy_pause,
            run_timeout: Some(config.ingest_run_timeout).filter(|t| !t.is_zero()),
        }
    }
}

/// Why the page loop stopped.
#[derive(Debug)]
pub enum Termination {
    /// A short page was returned.
    Exhausted,
    /// The source has no credentials; nothing was fetched.
    Unconfigured,
    FetchFailed(DataGovApiError),
    StoreFailed(anyhow::Error),
    TimedOut,
}

#[derive(Debug)]
pub struct RunReport {
    pub state: String,
    /// Rows written by committed batches, including those before a failure.
    pub records_stored: u64,
    pub records_skipped: u64,
    pub pages_fetched: u32,
    pub termination: Termination,
    pub aggregates_refreshed: bool,
    pub duration: Duration,
}

impl RunReport {
    pub fn outcome(&self) -> IngestOutcome {
        let records = self.records_stored;
        match &self.termination {
            Termination::Exhausted | Termination::Unconfigured => IngestOutcome::Success { records },
            Termination::FetchFailed(e) => IngestOutcome::Error {
                error: error_chain(e),
                records,
            },
            Termination::StoreFailed(e) => IngestOutcome::Error {
                error: format!("{e:#}"),
                records,
            },
            Termination::TimedOut => IngestOutcome::Error {
                error: "run timed out".to_owned(),
                records,
            },
        }
    }
}

/// The error and its sources joined by `": "`, matching anyhow's `{:#}`.
fn error_chain(e: &DataGovApiError) -> String {
    anyhow::Chain::new(e)
        .map(|cause| cause.to_string())
        .collect::<Vec<_>>()
        .join(": ")
}

pub struct Pipeline<S, M> {
    source: S,
    store: M,
    aliases: FieldAliases,
    options: PipelineOptions,
}

impl<S: PageSource, M: MetricStore> Pipeline<S, M> {
    pub fn new(source: S, store: M, aliases: FieldAliases, options: PipelineOptions) -> Self {
        let options = PipelineOptions {
            page_size: options.page_size.max(1),
            ..options
        };
        Self {
            source,
            store,
            aliases,
            options,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Ingest every page for `scope`, then refresh aggregates.
    pub async fn run(&self, scope: &IngestScope) -> RunReport {
        let start = Instant::now();
        let deadline = self.options.run_timeout.map(|t| start + t);
        let page_size = self.options.page_size;
        let filters = scope.filters();
        let state = scope.state.as_str();

        info!(state, page_size, "Starting ingestion run");

        let mut records_stored = 0u64;
        let mut records_skipped = 0u64;
        let mut pages_fetched = 0u32;

        let termination = loop {
            let page = pages_fetched + 1;
            let fetched = match within(deadline, self.source.fetch_page(&filters, page, page_size)).await {
                Some(result) => result,
                None => break Termination::TimedOut,
            };
            let records = match fetched {
                Ok(PageFetch::Records(records)) => records,
                Ok(PageFetch::Unconfigured) => break Termination::Unconfigured,
                Err(e) => break Termination::FetchFailed(e),
            };
            pages_fetched = page;

            let (batch, skipped) = normalize_page(&self.aliases, &records);
            records_skipped += skipped;

            if !batch.is_empty() {
                match self.store.upsert_batch(&batch).await {
                    Ok(written) => records_stored += written,
                    Err(e) => break Termination::StoreFailed(e),
                }
            }

            debug!(
                state,
                page,
                fetched = records.len(),
                skipped,
                total = records_stored,
                "Processed page"
            );

            if records.len() < page_size as usize {
                break Termination::Exhausted;
            }

            if within(deadline, time::sleep(self.options.courtesy_pause))
                .await
                .is_none()
            {
                break Termination::TimedOut;
            }
        };

        match &termination {
            Termination::Exhausted | Termination::Unconfigured => {}
            Termination::FetchFailed(e) => {
                error!(state, page = pages_fetched + 1, error = ?e, "Fetch failed, ending run")
            }
            Termination::StoreFailed(e) => {
                error!(state, page = pages_fetched, error = ?e, "Batch write failed, ending run")
            }
            Termination::TimedOut => warn!(state, pages_fetched, "Run timed out"),
        }

        let aggregates_refreshed = match self.store.refresh_aggregates().await {
            Ok(()) => true,
            Err(e) => {
                warn!(state, error = ?e, "Failed to refresh aggregates");
                false
            }
        };

        let duration = start.elapsed();
        info!(
            state,
            records = records_stored,
            skipped = records_skipped,
            pages = pages_fetched,
            termination = ?termination,
            aggregates_refreshed,
            duration = fmt::duration(duration),
            "Ingestion run finished"
        );

        RunReport {
            state: scope.state.clone(),
            records_stored,
            records_skipped,
            pages_fetched,
            termination,
            aggregates_refreshed,
            duration,
        }
    }
}

/// Await `fut`, or return `None` once `deadline` passes.
async fn within<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::models::MetricRecord;
    use crate::datagov::{Filters, RawRecord};
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves scripted pages in order; once the script runs out, returns empty pages.
    struct ScriptedSource {
        pages: Mutex<VecDeque<Result<PageFetch, DataGovApiError>>>,
        requested: Mutex<Vec<(u32, u32)>>,
    }

    impl ScriptedSource {
        fn new(pages: Vec<Result<PageFetch, DataGovApiError>>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                requested: Mutex::new(Vec::new()),
            }
        }

        fn requested_pages(&self) -> Vec<u32> {
            self.requested.lock().unwrap().iter().map(|(p, _)| *p).collect()
        }
    }

    #[async_trait]
    impl PageSource for ScriptedSource {
        async fn fetch_page(
            &self,
            _filters: &Filters,
            page: u32,
            page_size: u32,
        ) -> Result<PageFetch, DataGovApiError> {
            self.requested.lock().unwrap().push((page, page_size));
            let next = self.pages.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(PageFetch::Records(Vec::new())))
        }
    }

    /// Never answers.
    struct HangingSource;

    #[async_trait]
    impl PageSource for HangingSource {
        async fn fetch_page(&self, _: &Filters, _: u32, _: u32) -> Result<PageFetch, DataGovApiError> {
            std::future::pending().await
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        batches: Mutex<Vec<Vec<MetricRecord>>>,
        fail_on_batch: Option<usize>,
        fail_refresh: bool,
        refreshes: AtomicUsize,
    }

    impl MemoryStore {
        fn batch_sizes(&self) -> Vec<usize> {
            self.batches.lock().unwrap().iter().map(Vec::len).collect()
        }
    }

    #[async_trait]
    impl MetricStore for MemoryStore {
        async fn upsert_batch(&self, records: &[MetricRecord]) -> anyhow::Result<u64> {
            let mut batches = self.batches.lock().unwrap();
            if self.fail_on_batch == Some(batches.len()) {
                anyhow::bail!("check constraint violated");
            }
            batches.push(records.to_vec());
            Ok(records.len() as u64)
        }

        async fn refresh_aggregates(&self) -> anyhow::Result<()> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            if self.fail_refresh {
                anyhow::bail!("refresh failed");
            }
            Ok(())
        }
    }

    fn record(district: &str, month: u32) -> RawRecord {
        match json!({
            "state_name": "Bihar",
            "district_name": district,
            "year": 2024,
            "month": month,
            "persondays": 1000,
            "women_persondays": 400,
        }) {
            Value::Object(map) => RawRecord::from(map),
            _ => unreachable!(),
        }
    }

    fn page(districts: &[&str]) -> Result<PageFetch, DataGovApiError> {
        Ok(PageFetch::Records(
            districts.iter().map(|d| record(d, 4)).collect(),
        ))
    }

    fn options(page_size: u32) -> PipelineOptions {
        PipelineOptions {
            page_size,
            courtesy_pause: Duration::from_millis(500),
            run_timeout: Some(Duration::from_secs(60)),
        }
    }

    fn pipeline<S: PageSource>(source: S, store: MemoryStore, page_size: u32) -> Pipeline<S, MemoryStore> {
        Pipeline::new(source, store, FieldAliases::default(), options(page_size))
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_short_page() {
        let source = ScriptedSource::new(vec![page(&["A", "B"]), page(&["C", "D"]), page(&["E"])]);
        let pipeline = pipeline(source, MemoryStore::default(), 2);
        let start = Instant::now();

        let report = pipeline.run(&IngestScope::new("Bihar")).await;

        assert!(matches!(report.termination, Termination::Exhausted));
        assert_eq!(report.records_stored, 5);
        assert_eq!(report.pages_fetched, 3);
        assert!(report.aggregates_refreshed);
        assert_eq!(pipeline.source.requested_pages(), vec![1, 2, 3]);
        assert_eq!(pipeline.store.batch_sizes(), vec![2, 2, 1]);
        // Two courtesy pauses: after page 1 and page 2, none after the short page.
        assert_eq!(start.elapsed(), Duration::from_millis(1000));
        assert_eq!(report.outcome(), IngestOutcome::Success { records: 5 });
    }

    #[tokio::test(start_paused = true)]
    async fn exact_multiple_ends_on_empty_page() {
        let source = ScriptedSource::new(vec![page(&["A", "B"])]);
        let pipeline = pipeline(source, MemoryStore::default(), 2);

        let report = pipeline.run(&IngestScope::new("Bihar")).await;

        assert!(matches!(report.termination, Termination::Exhausted));
        assert_eq!(report.records_stored, 2);
        assert_eq!(report.pages_fetched, 2);
        assert_eq!(pipeline.store.batch_sizes(), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn unconfigured_source_is_a_clean_zero() {
        let source = ScriptedSource::new(vec![Ok(PageFetch::Unconfigured)]);
        let pipeline = pipeline(source, MemoryStore::default(), 500);

        let report = pipeline.run(&IngestScope::new("Bihar")).await;

        assert!(matches!(report.termination, Termination::Unconfigured));
        assert_eq!(report.pages_fetched, 0);
        assert_eq!(report.outcome(), IngestOutcome::Success { records: 0 });
        assert_eq!(pipeline.store.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_failure_keeps_committed_total() {
        let source = ScriptedSource::new(vec![
            page(&["A", "B"]),
            Err(DataGovApiError::Upstream {
                status: 403,
                url: "/resource/x".into(),
                body: "key invalid".into(),
            }),
        ]);
        let pipeline = pipeline(source, MemoryStore::default(), 2);

        let report = pipeline.run(&IngestScope::new("Bihar")).await;

        assert!(matches!(report.termination, Termination::FetchFailed(_)));
        assert_eq!(report.records_stored, 2);
        assert!(report.aggregates_refreshed);
        match report.outcome() {
            IngestOutcome::Error { error, records } => {
                assert_eq!(records, 2);
                assert!(error.contains("403"), "unexpected error: {error}");
            }
            other => panic!("expected error outcome, got {other:?}"),
        }
    }

    #[test]
    fn fetch_error_outcome_includes_source_chain() {
        let report = RunReport {
            state: "Bihar".into(),
            records_stored: 0,
            records_skipped: 0,
            pages_fetched: 0,
            termination: Termination::FetchFailed(DataGovApiError::ParseFailed {
                status: 200,
                url: "/resource/x".into(),
                source: anyhow::anyhow!("missing field `records`"),
            }),
            aggregates_refreshed: true,
            duration: Duration::ZERO,
        };

        assert_eq!(
            report.outcome(),
            IngestOutcome::Error {
                error: "failed to parse data.gov.in response: missing field `records`".into(),
                records: 0,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn store_failure_ends_run_and_still_refreshes() {
        let store = MemoryStore {
            fail_on_batch: Some(1),
            ..MemoryStore::default()
        };
        let source = ScriptedSource::new(vec![page(&["A", "B"]), page(&["C", "D"]), page(&["E"])]);
        let pipeline = pipeline(source, store, 2);

        let report = pipeline.run(&IngestScope::new("Bihar")).await;

        assert!(matches!(report.termination, Termination::StoreFailed(_)));
        assert_eq!(report.records_stored, 2);
        assert_eq!(pipeline.source.requested_pages(), vec![1, 2]);
        assert_eq!(pipeline.store.refreshes.load(Ordering::SeqCst), 1);
        assert!(!report.outcome().is_success());
        assert_eq!(report.outcome().records(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_failure_is_soft() {
        let store = MemoryStore {
            fail_refresh: true,
            ..MemoryStore::default()
        };
        let pipeline = pipeline(ScriptedSource::new(vec![page(&["A"])]), store, 2);

        let report = pipeline.run(&IngestScope::new("Bihar")).await;

        assert!(!report.aggregates_refreshed);
        assert_eq!(report.outcome(), IngestOutcome::Success { records: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_records_are_skipped_not_fatal() {
        let bad = match json!({
            "state_name": "Bihar",
            "district_name": "Gaya",
            "year": 2024,
            "month": 4,
            "wages_lakhs": "n/a",
        }) {
            Value::Object(map) => RawRecord::from(map),
            _ => unreachable!(),
        };
        let source = ScriptedSource::new(vec![Ok(PageFetch::Records(vec![
            record("A", 4),
            bad,
            record("B", 4),
        ]))]);
        let pipeline = pipeline(source, MemoryStore::default(), 5);

        let report = pipeline.run(&IngestScope::new("Bihar")).await;

        assert!(matches!(report.termination, Termination::Exhausted));
        assert_eq!(report.records_stored, 2);
        assert_eq!(report.records_skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn page_of_only_malformed_records_writes_nothing_but_continues() {
        let mut bad = serde_json::Map::new();
        bad.insert("state_name".into(), json!("Bihar"));
        let bad = RawRecord::from(bad);
        let source = ScriptedSource::new(vec![
            Ok(PageFetch::Records(vec![bad.clone(), bad])),
            page(&["A"]),
        ]);
        let pipeline = pipeline(source, MemoryStore::default(), 2);

        let report = pipeline.run(&IngestScope::new("Bihar")).await;

        assert_eq!(report.pages_fetched, 2);
        assert_eq!(report.records_skipped, 2);
        assert_eq!(pipeline.store.batch_sizes(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn run_timeout_ends_a_hung_fetch() {
        let pipeline = pipeline(HangingSource, MemoryStore::default(), 2);

        let report = pipeline.run(&IngestScope::new("Bihar")).await;

        assert!(matches!(report.termination, Termination::TimedOut));
        assert_eq!(report.duration, Duration::from_secs(60));
        assert_eq!(
            report.outcome(),
            IngestOutcome::Error {
                error: "run timed out".into(),
                records: 0,
            }
        );
    }
}
