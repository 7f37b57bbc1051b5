use std::time::Duration;

use reqwest::header::{RETRY_AFTER, USER_AGENT};
use reqwest::{Client, RequestBuilder, Response};

use crate::error::{ProviderError, Transient};

const AGENT: &str = "bedtime-pipeline/0.1";

pub fn client(timeout: Duration) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(timeout)
        .gzip(true)
        .build()
        .map_err(|e| ProviderError::Fatal(format!("cannot build HTTP client: {e}")))
}

pub fn bearer(request: RequestBuilder, api_key: Option<&str>) -> RequestBuilder {
    let request = request.header(USER_AGENT, AGENT);
    match api_key {
        Some(key) => request.bearer_auth(key),
        None => request,
    }
}

/// Send and classify the response status.
pub async fn send(request: RequestBuilder, timeout: Duration) -> Result<Response, ProviderError> {
    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            ProviderError::Retryable(Transient::Timeout(timeout))
        } else {
            ProviderError::from_reqwest(e)
        }
    })?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body: String = response
        .text()
        .await
        .unwrap_or_default()
        .chars()
        .take(300)
        .collect();
    Err(ProviderError::from_status(status.as_u16(), body, retry_after))
}

/// Read an environment variable holding an API key; empty counts as missing.
pub fn api_key(env_name: &str) -> Option<String> {
    std::env::var(env_name).ok().filter(|k| !k.trim().is_empty())
}
