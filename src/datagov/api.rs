//! Paginated resource queries against data.gov.in.

use crate::config::Config;
use crate::datagov::json::parse_json_with_context;
use crate::datagov::middleware::TransportMiddleware;
use crate::datagov::{DataGovApiError, Envelope, Filters, PageFetch, RawRecord, RetryPolicy};
use anyhow::Context;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Longest upstream error body kept in an error message.
const ERROR_BODY_LIMIT: usize = 300;

/// API key plus the resource being queried. Both are required to make requests.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    resource_id: String,
}

impl Credentials {
    /// Returns `None` (and logs what is missing) unless both parts are non-blank.
    pub fn from_parts(api_key: Option<&str>, resource_id: Option<&str>) -> Option<Self> {
        let api_key = api_key.map(str::trim).filter(|s| !s.is_empty());
        let resource_id = resource_id.map(str::trim).filter(|s| !s.is_empty());
        match (api_key, resource_id) {
            (Some(api_key), Some(resource_id)) => Some(Self {
                api_key: api_key.to_owned(),
                resource_id: resource_id.to_owned(),
            }),
            (key, resource) => {
                warn!(
                    api_key_set = key.is_some(),
                    resource_id_set = resource.is_some(),
                    "data.gov.in credentials incomplete, ingestion will be skipped"
                );
                None
            }
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("resource_id", &self.resource_id)
            .finish()
    }
}

/// Client for data.gov.in resource queries.
///
/// One instance is shared by every concurrent ingestion run, so its rate
/// limiter budgets requests across all of them.
pub struct DataGovApi {
    http: ClientWithMiddleware,
    base_url: String,
    credentials: Option<Credentials>,
    retry: RetryPolicy,
    limiter: DefaultDirectRateLimiter,
}

impl DataGovApi {
    pub fn new(
        base_url: &str,
        credentials: Option<Credentials>,
        quota: Quota,
        request_timeout: Duration,
        retry: RetryPolicy,
    ) -> anyhow::Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_owned();
        Url::parse(&base_url).with_context(|| format!("Invalid data.gov.in base URL: {base_url}"))?;

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("mgnrega-tracker/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        let http = ClientBuilder::new(client).with(TransportMiddleware).build();

        Ok(Self {
            http,
            base_url,
            credentials,
            retry,
            limiter: RateLimiter::direct(quota),
        })
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let credentials = Credentials::from_parts(
            config.datagov_key.as_deref(),
            config.datagov_resource_id.as_deref(),
        );
        let per_minute = NonZeroU32::new(config.datagov_requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.datagov_burst).unwrap_or(NonZeroU32::MIN);

        info!(
            base_url = %config.datagov_base_url,
            configured = credentials.is_some(),
            requests_per_minute = per_minute.get(),
            burst = burst.get(),
            "data.gov.in client configured"
        );

        Self::new(
            &config.datagov_base_url,
            credentials,
            Quota::per_minute(per_minute).allow_burst(burst),
            config.request_timeout,
            RetryPolicy::default(),
        )
    }

    pub fn is_configured(&self) -> bool {
        self.credentials.is_some()
    }

    /// Fetch one page (1-based) of records matching `filters`.
    ///
    /// Rate limiting and transient failures are retried here according to the
    /// client's [`RetryPolicy`]; anything returned as `Err` is final.
    pub async fn fetch_page(
        &self,
        filters: &Filters,
        page: u32,
        page_size: u32,
    ) -> Result<PageFetch, DataGovApiError> {
        let Some(credentials) = &self.credentials else {
            warn!(page, "data.gov.in credentials not set, skipping request");
            return Ok(PageFetch::Unconfigured);
        };

        let url = Url::parse(&format!("{}/{}", self.base_url, credentials.resource_id))?;
        let offset = u64::from(page.max(1) - 1) * u64::from(page_size);
        let mut query: Vec<(&str, String)> = filters
            .iter()
            .map(|(k, v)| (k.as_str(), v.clone()))
            .collect();
        query.push(("api-key", credentials.api_key.clone()));
        query.push(("format", "json".to_owned()));
        query.push(("limit", page_size.to_string()));
        query.push(("offset", offset.to_string()));

        debug!(path = url.path(), page, offset, limit = page_size, "Fetching page");

        let records = self
            .retry
            .run(|| self.request_page(&url, &query))
            .await?;
        Ok(PageFetch::Records(records))
    }

    /// A single HTTP attempt, with its status already classified.
    async fn request_page(
        &self,
        url: &Url,
        query: &[(&str, String)],
    ) -> Result<Vec<RawRecord>, DataGovApiError> {
        self.limiter.until_ready().await;

        let response = self.http.get(url.clone()).query(query).send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(DataGovApiError::RateLimited {
                retry_after: parse_retry_after(response.headers()),
            });
        }

        let body = response
            .text()
            .await
            .map_err(reqwest_middleware::Error::from)?;

        if is_transient_status(status) {
            return Err(DataGovApiError::Server {
                status: status.as_u16(),
                url: url.path().to_owned(),
            });
        }
        if !status.is_success() {
            return Err(DataGovApiError::Upstream {
                status: status.as_u16(),
                url: url.path().to_owned(),
                body: truncate_chars(&body, ERROR_BODY_LIMIT),
            });
        }

        let envelope: Envelope =
            parse_json_with_context(&body).map_err(|source| DataGovApiError::ParseFailed {
                status: status.as_u16(),
                url: url.path().to_owned(),
                source,
            })?;
        Ok(envelope.records)
    }
}

/// Server errors and request timeouts are worth retrying; other 4xx are not.
fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn http_response(status: u16, headers: &[(&str, &str)], body: &str) -> String {
        let mut response = format!(
            "HTTP/1.1 {status} Canned\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n",
            body.len()
        );
        for (name, value) in headers {
            response.push_str(&format!("{name}: {value}\r\n"));
        }
        response.push_str("\r\n");
        response.push_str(body);
        response
    }

    /// A local upstream answering each connection with the next canned response.
    /// Returns the base URL and the request lines it has seen.
    async fn fake_upstream(responses: Vec<String>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}/resource", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));

        let seen = requests.clone();
        tokio::spawn(async move {
            let mut responses = responses.into_iter();
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                let request = String::from_utf8_lossy(&buf);
                let line = request.lines().next().unwrap_or_default().to_owned();
                seen.lock().unwrap().push(line);

                let response = responses
                    .next()
                    .unwrap_or_else(|| http_response(500, &[], "script exhausted"));
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (base_url, requests)
    }

    fn client(base_url: &str, retry: RetryPolicy) -> DataGovApi {
        DataGovApi::new(
            base_url,
            Credentials::from_parts(Some("k"), Some("res")),
            Quota::per_second(NonZeroU32::new(100).unwrap()),
            Duration::from_secs(5),
            retry,
        )
        .unwrap()
    }

    fn bihar() -> Filters {
        Filters::from([("filters[state_name]".to_owned(), "Bihar".to_owned())])
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
            ..RetryPolicy::default()
        }
    }

    #[tokio::test]
    async fn page_request_carries_offset_and_merged_query() {
        let (base_url, requests) = fake_upstream(vec![http_response(
            200,
            &[],
            r#"{"records":[{"district_name":"Gaya"},{"district_name":"Patna"}]}"#,
        )])
        .await;
        let api = client(&base_url, RetryPolicy::default());

        let fetched = api.fetch_page(&bihar(), 3, 50).await.unwrap();

        let PageFetch::Records(records) = fetched else {
            panic!("expected records");
        };
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].get("district_name").unwrap(), "Patna");
        assert_eq!(
            *requests.lock().unwrap(),
            vec![
                "GET /resource/res?filters%5Bstate_name%5D=Bihar&api-key=k&format=json&limit=50&offset=100 HTTP/1.1"
                    .to_owned()
            ]
        );
    }

    #[tokio::test]
    async fn rate_limit_waits_for_retry_after_then_repeats_the_request() {
        let (base_url, requests) = fake_upstream(vec![
            http_response(429, &[("retry-after", "1")], "slow down"),
            http_response(200, &[], r#"{"records":[]}"#),
        ])
        .await;
        let api = client(&base_url, RetryPolicy::default());
        let start = std::time::Instant::now();

        let fetched = api.fetch_page(&bihar(), 1, 50).await.unwrap();

        assert!(matches!(fetched, PageFetch::Records(ref r) if r.is_empty()));
        assert!(start.elapsed() >= Duration::from_secs(1));
        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0], requests[1]);
    }

    #[tokio::test]
    async fn server_errors_are_retried_then_surfaced() {
        let (base_url, requests) = fake_upstream(vec![
            http_response(503, &[], "unavailable"),
            http_response(503, &[], "unavailable"),
        ])
        .await;
        let api = client(&base_url, quick_retry());

        let err = api.fetch_page(&bihar(), 1, 50).await.unwrap_err();

        assert!(
            matches!(err, DataGovApiError::Server { status: 503, ref url } if url == "/resource/res"),
            "unexpected error: {err:?}"
        );
        assert_eq!(requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn client_errors_fail_without_retry() {
        let (base_url, requests) =
            fake_upstream(vec![http_response(403, &[], "invalid api key")]).await;
        let api = client(&base_url, quick_retry());

        let err = api.fetch_page(&bihar(), 1, 50).await.unwrap_err();

        assert!(
            matches!(err, DataGovApiError::Upstream { status: 403, ref body, .. } if body == "invalid api key"),
            "unexpected error: {err:?}"
        );
        assert_eq!(requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_records_field_is_a_parse_failure() {
        let (base_url, requests) =
            fake_upstream(vec![http_response(200, &[], r#"{"message":"Resource id doesn't exist."}"#)]).await;
        let api = client(&base_url, quick_retry());

        let err = api.fetch_page(&bihar(), 1, 50).await.unwrap_err();

        assert!(
            matches!(err, DataGovApiError::ParseFailed { status: 200, .. }),
            "unexpected error: {err:?}"
        );
        assert_eq!(requests.lock().unwrap().len(), 1);
    }

    #[test]
    fn retry_after_parses_delta_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("3"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(3)));
    }

    #[test]
    fn retry_after_ignores_dates_and_absence() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2026 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn transient_statuses() {
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(is_transient_status(StatusCode::REQUEST_TIMEOUT));
        assert!(!is_transient_status(StatusCode::FORBIDDEN));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn credentials_require_both_parts() {
        assert!(Credentials::from_parts(Some("key"), Some("res")).is_some());
        assert!(Credentials::from_parts(Some("key"), None).is_none());
        assert!(Credentials::from_parts(Some("  "), Some("res")).is_none());
        assert!(Credentials::from_parts(None, None).is_none());
    }

    #[test]
    fn credentials_debug_hides_key() {
        let creds = Credentials::from_parts(Some("secret-key"), Some("res")).unwrap();
        assert!(!format!("{creds:?}").contains("secret-key"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("abc", 5), "abc");
        assert_eq!(truncate_chars("लखनऊ जिला", 4), "लखनऊ...");
    }

    #[tokio::test]
    async fn unconfigured_client_skips_without_requesting() {
        let api = DataGovApi::new(
            "https://api.data.gov.in/resource",
            None,
            Quota::per_second(NonZeroU32::MIN),
            Duration::from_secs(1),
            RetryPolicy::default(),
        )
        .unwrap();

        assert!(!api.is_configured());
        let result = api.fetch_page(&Filters::new(), 1, 500).await.unwrap();
        assert!(matches!(result, PageFetch::Unconfigured));
    }
}
