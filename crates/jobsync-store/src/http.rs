//! Retry classification, backoff and the polite page fetcher used by scrapers.

use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Sends the request produced by `build` until it succeeds, fails
/// permanently, or the retry budget is spent. Non-success statuses are
/// returned as responses once retries are exhausted; callers decide.
pub async fn send_with_retry<F>(
    backoff: &BackoffPolicy,
    build: F,
) -> Result<reqwest::Response, reqwest::Error>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut attempt = 0usize;
    loop {
        match build().send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success()
                    || classify_status(status) == RetryDisposition::NonRetryable
                    || attempt >= backoff.max_retries
                {
                    return Ok(resp);
                }
                warn!(%status, attempt, "retryable response status");
            }
            Err(err) => {
                if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                    || attempt >= backoff.max_retries
                {
                    return Err(err);
                }
                warn!(error = %err, attempt, "retryable request error");
            }
        }
        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
        attempt += 1;
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Minimum spacing between consecutive requests from one fetcher.
    pub request_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            request_interval: Duration::from_millis(1500),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Sequential page fetcher for rate-limited job boards.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    request_interval: Duration,
    backoff: BackoffPolicy,
    last_request: Mutex<Option<Instant>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        Ok(Self {
            client: builder.build()?,
            request_interval: config.request_interval,
            backoff: config.backoff,
            last_request: Mutex::new(None),
        })
    }

    async fn wait_turn(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.request_interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }

    pub async fn fetch_text(&self, source: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source, url);
        self.fetch_inner(url).instrument(span).await
    }

    async fn fetch_inner(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.wait_turn().await;
        let resp = send_with_retry(&self.backoff, || self.client.get(url)).await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.text().await?;
        debug!(bytes = body.len(), "fetched page");
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::NonRetryable);
    }

    #[tokio::test(start_paused = true)]
    async fn fetcher_spaces_out_requests() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            request_interval: Duration::from_secs(2),
            ..Default::default()
        })
        .unwrap();
        let start = Instant::now();
        fetcher.wait_turn().await;
        fetcher.wait_turn().await;
        fetcher.wait_turn().await;
        assert!(start.elapsed() >= Duration::from_secs(4));
    }
}
