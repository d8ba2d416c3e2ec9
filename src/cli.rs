use clap::{Parser, Subcommand, ValueEnum};

/// MGNREGA district metrics ingestion service
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Log formatter to use
    #[arg(long, value_enum, default_value_t = default_tracing_format())]
    pub tracing: TracingFormat,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the daily ingestion scheduler until interrupted (default)
    Serve,
    /// Ingest now and print the per-state results as JSON
    Ingest {
        /// State to ingest; repeatable. Defaults to INGEST_STATES.
        #[arg(long = "state")]
        states: Vec<String>,
    },
    /// Rebuild the per-state monthly averages
    Refresh,
    /// Show a district's recent months alongside its state's averages
    District {
        id: i32,
        /// Number of months to show
        #[arg(long, default_value_t = 3)]
        months: i64,
    },
    /// List known districts
    Districts {
        /// Only districts in this state
        #[arg(long)]
        state: Option<String>,
    },
    /// Print a district's monthly series, oldest first
    Trends {
        id: i32,
        /// Number of months to include
        #[arg(long, default_value_t = 12)]
        months: i64,
    },
    /// Print a state's monthly averages, newest first
    Averages { state: String },
    /// Show the last ingestion pass and whether the upstream is configured
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TracingFormat {
    /// Compact human-readable output
    Pretty,
    /// One JSON object per line
    Json,
}

fn default_tracing_format() -> TracingFormat {
    if cfg!(debug_assertions) {
        TracingFormat::Pretty
    } else {
        TracingFormat::Json
    }
}
