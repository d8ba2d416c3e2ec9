//! HTTP transport logging for the data.gov.in client.
//!
//! Only the URL path is logged. The query string carries the API key.

use crate::fmt;
use http::Extensions;
use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next, Result};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Requests slower than this are logged at warn.
const SLOW_REQUEST_THRESHOLD: Duration = Duration::from_secs(10);

pub struct TransportMiddleware;

#[async_trait::async_trait]
impl Middleware for TransportMiddleware {
    async fn handle(
        &self,
        req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        let method = req.method().to_string();
        let path = req.url().path().to_owned();
        let start = Instant::now();

        let result = next.run(req, extensions).await;
        let elapsed = start.elapsed();

        match &result {
            Ok(response) => {
                let status = response.status().as_u16();
                if elapsed > SLOW_REQUEST_THRESHOLD {
                    warn!(
                        %method,
                        %path,
                        status,
                        duration = fmt::duration(elapsed),
                        "Slow data.gov.in response"
                    );
                } else if response.status().is_success() {
                    trace!(%method, %path, status, duration = fmt::duration(elapsed), "Response");
                } else {
                    debug!(%method, %path, status, duration = fmt::duration(elapsed), "Non-success response");
                }
            }
            Err(error) => {
                warn!(
                    %method,
                    %path,
                    duration = fmt::duration(elapsed),
                    error = ?error,
                    "Request failed before a response was received"
                );
            }
        }

        result
    }
}
