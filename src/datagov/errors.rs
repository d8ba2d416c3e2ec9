//! Error types for the data.gov.in API client.

use crate::datagov::retry::{Disposition, Retryable};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum DataGovApiError {
    /// HTTP 429. `retry_after` is the server-suggested wait, when it sent one.
    #[error("rate limited by data.gov.in (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    /// Connection, timeout or body-read failure below the HTTP status layer.
    #[error("request to data.gov.in failed")]
    Transport(#[from] reqwest_middleware::Error),
    /// 5xx or 408; the upstream may recover on its own.
    #[error("data.gov.in returned {status} for {url}")]
    Server { status: u16, url: String },
    /// Any other non-success status. Retrying will not help.
    #[error("data.gov.in rejected request with {status} for {url}: {body}")]
    Upstream {
        status: u16,
        url: String,
        body: String,
    },
    #[error("failed to parse data.gov.in response")]
    ParseFailed {
        status: u16,
        url: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("invalid data.gov.in url")]
    InvalidUrl(#[from] url::ParseError),
}

impl Retryable for DataGovApiError {
    fn disposition(&self) -> Disposition {
        match self {
            Self::RateLimited { retry_after } => Disposition::RateLimited(*retry_after),
            Self::Transport(_) | Self::Server { .. } => Disposition::Retry,
            Self::Upstream { .. } | Self::ParseFailed { .. } | Self::InvalidUrl(_) => {
                Disposition::Fail
            }
        }
    }
}
