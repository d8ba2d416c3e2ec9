use crate::cli::Command;
use crate::config::Config;
use crate::data::{PgMetricStore, aggregates, districts, kv, metrics, trends};
use crate::datagov::DataGovApi;
use crate::fmt;
use crate::ingest::scheduler::{KV_LAST_SUCCESS, last_result, record_outcomes};
use crate::ingest::{FieldAliases, IngestScope, Pipeline, PipelineOptions, Scheduler, run_scopes};
use anyhow::Context;
use serde_json::json;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{ConnectOptions, PgPool};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time;
use tracing::{error, info, warn};

type IngestPipeline = Pipeline<DataGovApi, PgMetricStore>;

/// Main application struct containing all necessary components
pub struct App {
    config: Config,
    db_pool: PgPool,
    pipeline: Arc<IngestPipeline>,
}

impl App {
    /// Connect to the database, apply migrations and build the ingestion pipeline.
    pub async fn new(config: Config) -> Result<Self, anyhow::Error> {
        let connect_options = PgConnectOptions::from_str(&config.database_url)
            .context("Failed to parse database URL")?
            .log_statements(tracing::log::LevelFilter::Debug)
            .log_slow_statements(tracing::log::LevelFilter::Warn, Duration::from_secs(1));

        let db_pool = PgPoolOptions::new()
            .min_connections(0)
            .max_connections(config.db_max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(60 * 2))
            .max_lifetime(Duration::from_secs(60 * 30))
            .connect_with(connect_options)
            .await
            .context("Failed to create database pool")?;

        info!(
            max_connections = config.db_max_connections,
            acquire_timeout = "10s",
            idle_timeout = "2m",
            max_lifetime = "30m",
            "database pool established"
        );

        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&db_pool)
            .await
            .context("Failed to run database migrations")?;
        info!("Database migrations completed successfully");

        let datagov_api =
            DataGovApi::from_config(&config).context("Failed to create data.gov.in client")?;

        let aliases = match &config.field_aliases_path {
            Some(path) => {
                let aliases = FieldAliases::load(path)
                    .with_context(|| format!("Failed to load field aliases from {}", path.display()))?;
                info!(path = %path.display(), "Loaded field alias overrides");
                aliases
            }
            None => FieldAliases::default(),
        };

        let pipeline = Pipeline::new(
            datagov_api,
            PgMetricStore::new(db_pool.clone()),
            aliases,
            PipelineOptions::from_config(&config),
        );

        Ok(App {
            config,
            db_pool,
            pipeline: Arc::new(pipeline),
        })
    }

    pub async fn run(self, command: Command) -> ExitCode {
        let code = match command {
            Command::Serve => self.serve().await,
            Command::Ingest { states } => self.ingest(states).await,
            Command::Refresh => self.refresh().await,
            Command::District { id, months } => self.show_district(id, months).await,
            Command::Districts { state } => {
                print_json("districts", districts::list(&self.db_pool, state.as_deref()).await)
            }
            Command::Trends { id, months } => print_json("trends", self.trends(id, months).await),
            Command::Averages { state } => print_json(
                "state averages",
                aggregates::list_for_state(&self.db_pool, &state).await,
            ),
            Command::Status => print_json("status", self.status().await),
        };
        self.db_pool.close().await;
        code
    }

    fn scopes(&self, states: Vec<String>) -> Vec<IngestScope> {
        let states = if states.is_empty() {
            self.config.ingest_states()
        } else {
            states
        };
        states.into_iter().map(IngestScope::new).collect()
    }

    /// Run the scheduler until Ctrl-C or SIGTERM.
    async fn serve(&self) -> ExitCode {
        let scopes = self.scopes(Vec::new());
        if scopes.is_empty() {
            error!("INGEST_STATES is empty, nothing to schedule");
            return ExitCode::FAILURE;
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let scheduler = Scheduler::new(
            self.pipeline.clone(),
            self.db_pool.clone(),
            scopes,
            self.config.ingest_hour_utc,
        );
        let mut handle = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

        tokio::select! {
            _ = shutdown_signal() => {}
            result = &mut handle => {
                error!(result = ?result, "Scheduler exited unexpectedly");
                return ExitCode::FAILURE;
            }
        }

        let _ = shutdown_tx.send(());
        let timeout = self.config.shutdown_timeout;
        let start = Instant::now();
        match time::timeout(timeout, handle).await {
            Ok(Ok(())) => {
                info!(duration = fmt::duration(start.elapsed()), "Graceful shutdown complete");
                ExitCode::SUCCESS
            }
            Ok(Err(e)) => {
                error!(error = ?e, "Scheduler task failed during shutdown");
                ExitCode::FAILURE
            }
            Err(_) => {
                warn!(timeout = fmt::duration(timeout), "Scheduler did not stop in time");
                ExitCode::FAILURE
            }
        }
    }

    /// Ingest the given states (or the configured ones) once.
    async fn ingest(&self, states: Vec<String>) -> ExitCode {
        let scopes = self.scopes(states);
        if scopes.is_empty() {
            error!("No states to ingest");
            return ExitCode::FAILURE;
        }

        let outcomes = run_scopes(self.pipeline.clone(), &scopes).await;
        record_outcomes(&self.db_pool, &outcomes, &self.scopes(Vec::new())).await;

        match serde_json::to_string_pretty(&outcomes) {
            Ok(rendered) => println!("{rendered}"),
            Err(e) => error!(error = ?e, "Failed to render outcomes"),
        }

        if outcomes.iter().all(|o| o.outcome.is_success()) {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        }
    }

    async fn refresh(&self) -> ExitCode {
        match aggregates::refresh(&self.db_pool).await {
            Ok(()) => {
                info!("State averages refreshed");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = ?e, "Failed to refresh state averages");
                ExitCode::FAILURE
            }
        }
    }

    async fn show_district(&self, id: i32, months: i64) -> ExitCode {
        match self.district_report(id, months).await {
            Ok(Some(report)) => match serde_json::to_string_pretty(&report) {
                Ok(rendered) => {
                    println!("{rendered}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!(error = ?e, "Failed to render district report");
                    ExitCode::FAILURE
                }
            },
            Ok(None) => {
                error!(id, "District not found");
                ExitCode::FAILURE
            }
            Err(e) => {
                error!(id, error = ?e, "Failed to load district report");
                ExitCode::FAILURE
            }
        }
    }

    /// The district, its most recent months, and its state's averages for the latest month.
    async fn district_report(&self, id: i32, months: i64) -> anyhow::Result<Option<serde_json::Value>> {
        let Some(district) = districts::get(&self.db_pool, id).await? else {
            return Ok(None);
        };

        let recent = metrics::recent_for_district(
            &self.db_pool,
            &district.state_name,
            &district.district_name,
            months.max(1),
        )
        .await?;

        let state_average = match recent.first() {
            Some(latest) => {
                aggregates::get(&self.db_pool, &district.state_name, latest.year, latest.month).await?
            }
            None => None,
        };
        let snapshot_date = metrics::latest_snapshot_date(&self.db_pool).await?;

        Ok(Some(json!({
            "district": district,
            "recent": recent,
            "state_average": state_average,
            "snapshot_date": snapshot_date,
        })))
    }

    async fn trends(&self, id: i32, months: i64) -> anyhow::Result<Option<trends::DistrictTrends>> {
        match districts::get(&self.db_pool, id).await? {
            Some(district) => Ok(Some(trends::for_district(&self.db_pool, &district, months).await?)),
            None => Ok(None),
        }
    }

    async fn status(&self) -> anyhow::Result<serde_json::Value> {
        let last_success = kv::get_timestamp(&self.db_pool, KV_LAST_SUCCESS).await?;
        let last_result = last_result(&self.db_pool).await?;
        Ok(json!({
            "upstream_configured": self.pipeline.source().is_configured(),
            "scheduled_states": self.config.ingest_states(),
            "last_success": last_success,
            "last_result": last_result,
        }))
    }
}

/// Print a read command's result as pretty JSON. `null` counts as not found.
fn print_json<T: serde::Serialize>(what: &str, result: anyhow::Result<T>) -> ExitCode {
    let value = match result.and_then(|v| Ok(serde_json::to_value(v)?)) {
        Ok(value) => value,
        Err(e) => {
            error!(error = ?e, "Failed to load {what}");
            return ExitCode::FAILURE;
        }
    };
    if value.is_null() {
        error!("No {what} found");
        return ExitCode::FAILURE;
    }
    match serde_json::to_string_pretty(&value) {
        Ok(rendered) => {
            println!("{rendered}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = ?e, "Failed to render {what}");
            ExitCode::FAILURE
        }
    }
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = ?e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = ?e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
