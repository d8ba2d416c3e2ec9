use crate::data::kv;
use anyhow::Context;
use crate::ingest::{IngestScope, MetricStore, PageSource, Pipeline, ScopeOutcome, run_scopes};
use chrono::{DateTime, NaiveTime, TimeDelta, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

// app_kv keys for scheduler state that survives restarts.
pub const KV_LAST_SUCCESS: &str = "ingest.last_success";
pub const KV_LAST_RESULT: &str = "ingest.last_result";

/// A run is overdue when the last successful one is older than this many hours.
const CATCH_UP_AFTER_HOURS: i64 = 24;

/// Runs ingestion for every configured scope once a day.
pub struct Scheduler<S, M> {
    pipeline: Arc<Pipeline<S, M>>,
    pool: PgPool,
    scopes: Vec<IngestScope>,
    hour_utc: u32,
}

impl<S, M> Scheduler<S, M>
where
    S: PageSource + 'static,
    M: MetricStore + 'static,
{
    pub fn new(pipeline: Arc<Pipeline<S, M>>, pool: PgPool, scopes: Vec<IngestScope>, hour_utc: u32) -> Self {
        Self {
            pipeline,
            pool,
            scopes,
            hour_utc: hour_utc.min(23),
        }
    }

    /// Runs the scheduler's main loop with graceful shutdown support.
    ///
    /// On shutdown, in-flight ingestion is cancelled and given up to 5 seconds
    /// to wind down before being abandoned.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let scopes: Vec<&str> = self.scopes.iter().map(|s| s.state.as_str()).collect();
        info!(hour_utc = self.hour_utc, ?scopes, "Ingestion scheduler started");

        let last_success = kv::get_timestamp(&self.pool, KV_LAST_SUCCESS)
            .await
            .unwrap_or_else(|e| {
                warn!(error = ?e, "Failed to read last ingestion timestamp");
                None
            });

        let mut next_run = if needs_catch_up(last_success, Utc::now()) {
            info!(last_success = ?last_success, "Last successful ingestion is stale, running now");
            time::Instant::now()
        } else {
            let next = next_daily_trigger(Utc::now(), self.hour_utc);
            info!(last_success = ?last_success, next_run = %next, "Ingestion is current");
            instant_at(next)
        };
        let mut current_work: Option<(tokio::task::JoinHandle<()>, CancellationToken)> = None;

        loop {
            tokio::select! {
                _ = time::sleep_until(next_run) => {
                    let next = next_daily_trigger(Utc::now(), self.hour_utc);
                    next_run = instant_at(next);

                    if let Some((ref handle, _)) = current_work
                        && !handle.is_finished()
                    {
                        warn!(next_run = %next, "Previous ingestion still running, skipping this trigger");
                        continue;
                    }

                    let cancel_token = CancellationToken::new();
                    let work_handle = tokio::spawn({
                        let pipeline = self.pipeline.clone();
                        let pool = self.pool.clone();
                        let scopes = self.scopes.clone();
                        let cancel_token = cancel_token.clone();

                        async move {
                            tokio::select! {
                                outcomes = run_scopes(pipeline, &scopes) => {
                                    record_outcomes(&pool, &outcomes, &scopes).await;
                                }
                                _ = cancel_token.cancelled() => {
                                    trace!("Ingestion cancelled");
                                }
                            }
                        }
                    });

                    current_work = Some((work_handle, cancel_token));
                    debug!(next_run = %next, "Ingestion triggered");
                }
                _ = shutdown_rx.recv() => {
                    info!("Scheduler received shutdown signal");

                    if let Some((handle, cancel_token)) = current_work.take() {
                        cancel_token.cancel();

                        if time::timeout(Duration::from_secs(5), handle).await.is_err() {
                            warn!("Ingestion did not stop within 5s, abandoning");
                        } else {
                            trace!("Ingestion stopped gracefully");
                        }
                    }

                    info!("Scheduler exiting gracefully");
                    break;
                }
            }
        }
    }
}

/// Persist the outcomes of an ingestion pass.
///
/// The last-success timestamp only advances when every scope in `scheduled`
/// has a successful outcome. A partial failure, or an ad-hoc pass over a
/// subset of states, leaves it alone so the catch-up check still fires.
pub async fn record_outcomes(pool: &PgPool, outcomes: &[ScopeOutcome], scheduled: &[IngestScope]) {
    let failed = outcomes.iter().filter(|o| !o.outcome.is_success()).count();
    let records: u64 = outcomes.iter().map(|o| o.outcome.records()).sum();

    match serde_json::to_string(outcomes) {
        Ok(json) => {
            if let Err(e) = kv::set(pool, KV_LAST_RESULT, &json).await {
                warn!(error = ?e, "Failed to persist ingestion result");
            }
        }
        Err(e) => warn!(error = ?e, "Failed to serialize ingestion result"),
    }

    if failed > 0 {
        warn!(scopes = outcomes.len(), failed, records, "Ingestion pass finished with errors");
    } else if covers_all(outcomes, scheduled) {
        info!(scopes = outcomes.len(), records, "Ingestion pass succeeded");
        if let Err(e) = kv::set_timestamp(pool, KV_LAST_SUCCESS, Utc::now()).await {
            warn!(error = ?e, "Failed to persist ingestion timestamp");
        }
    } else {
        info!(
            scopes = outcomes.len(),
            records,
            "Partial ingestion pass succeeded, last success left unchanged"
        );
    }
}

/// The most recent pass's outcomes, as persisted by [`record_outcomes`].
pub async fn last_result(pool: &PgPool) -> anyhow::Result<Option<Vec<ScopeOutcome>>> {
    let Some(json) = kv::get(pool, KV_LAST_RESULT).await? else {
        return Ok(None);
    };
    let outcomes = serde_json::from_str(&json)
        .with_context(|| format!("Failed to decode {KV_LAST_RESULT}"))?;
    Ok(Some(outcomes))
}

/// Whether every scheduled scope has a successful outcome.
fn covers_all(outcomes: &[ScopeOutcome], scheduled: &[IngestScope]) -> bool {
    scheduled.iter().all(|scope| {
        outcomes
            .iter()
            .any(|o| o.state == scope.state && o.outcome.is_success())
    })
}

/// The next `hour:00 UTC` strictly after `now`.
pub fn next_daily_trigger(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let at = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        today
    } else {
        today + TimeDelta::days(1)
    }
}

fn needs_catch_up(last_success: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    last_success.is_none_or(|ts| now - ts >= TimeDelta::hours(CATCH_UP_AFTER_HOURS))
}

/// Convert a wall-clock target into a tokio instant.
fn instant_at(target: DateTime<Utc>) -> time::Instant {
    let wait = (target - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    time::Instant::now() + wait
}
