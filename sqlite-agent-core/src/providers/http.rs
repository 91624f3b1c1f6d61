use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{RequestBuilder, Response, StatusCode};
use tokio::time::{sleep, Duration};

use crate::config::schema::ProviderConfig;
use crate::error::{Error, Result};

const DEFAULT_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 250,
            max_delay_ms: 3_000,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            ..Self::default()
        }
    }

    fn delay(&self, attempt: usize) -> Duration {
        let shift = (attempt as u32).min(10);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_delay_ms.max(self.base_delay_ms));
        Duration::from_millis(delay)
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Builds a JSON client for `label`, with an optional bearer token and the
/// configured extra headers.
pub fn build_client(
    config: &ProviderConfig,
    api_key: Option<&str>,
    label: &str,
) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    if let Some(api_key) = api_key {
        let auth = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|err| Error::Config(format!("invalid {label} authorization header: {err}")))?;
        headers.insert(AUTHORIZATION, auth);
    }

    for (name, value) in &config.extra_headers {
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|err| {
            Error::Config(format!("invalid {label} custom header name '{name}': {err}"))
        })?;
        let header_value = HeaderValue::from_str(value).map_err(|err| {
            Error::Config(format!(
                "invalid {label} custom header value for '{name}': {err}"
            ))
        })?;
        headers.insert(header_name, header_value);
    }

    let timeout_ms = if config.timeout_ms == 0 {
        DEFAULT_TIMEOUT_MS
    } else {
        config.timeout_ms
    };

    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(Duration::from_millis(timeout_ms))
        .build()
        .map_err(|err| Error::Provider(format!("failed to build {label} client: {err}")))
}

/// Sends the request, retrying 429/5xx responses and connect/timeout
/// failures with exponential backoff. Non-success final responses are
/// turned into `Error::Provider`, a final timeout into `Error::Timeout`.
pub async fn send_with_retry(
    builder: RequestBuilder,
    policy: &RetryPolicy,
    operation: &str,
) -> Result<Response> {
    let total_attempts = policy.max_retries.saturating_add(1);

    for attempt in 0..total_attempts {
        let Some(request) = builder.try_clone() else {
            return Err(Error::Provider(format!(
                "{operation} could not be retried because request body is not clonable"
            )));
        };
        let last_attempt = attempt + 1 >= total_attempts;

        match request.send().await {
            Ok(response) if response.status().is_success() => return Ok(response),
            Ok(response) => {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "<failed to read body>".to_owned());

                if is_retryable_status(status) && !last_attempt {
                    let delay = policy.delay(attempt);
                    tracing::warn!(
                        operation,
                        status = %status,
                        attempt,
                        total_attempts,
                        delay_ms = delay.as_millis(),
                        "retrying provider request after retryable HTTP status"
                    );
                    tracing::debug!(operation, %status, body, "retryable HTTP response body");
                    sleep(delay).await;
                    continue;
                }

                return Err(Error::Provider(format!(
                    "{operation} failed with status {status}: {body}"
                )));
            }
            Err(err) => {
                if is_retryable_transport_error(&err) && !last_attempt {
                    let delay = policy.delay(attempt);
                    tracing::warn!(
                        operation,
                        error = %err,
                        attempt,
                        total_attempts,
                        delay_ms = delay.as_millis(),
                        "retrying provider request after transport error"
                    );
                    sleep(delay).await;
                    continue;
                }

                if err.is_timeout() {
                    return Err(Error::Timeout(format!("{operation} timed out: {err}")));
                }
                return Err(Error::Provider(format!("{operation} failed: {err}")));
            }
        }
    }

    Err(Error::Provider(format!(
        "{operation} failed after retry budget was exhausted"
    )))
}
