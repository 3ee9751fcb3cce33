//! Shared HTTP fetch helper with error classification.

use std::time::Duration;

use jobwatch_core::{Error, FetchError, Result};
use serde::de::DeserializeOwned;
use tracing::debug;

const USER_AGENT: &str = concat!("jobwatch/", env!("CARGO_PKG_VERSION"));

/// Thin wrapper around a `reqwest::Client` that reports failures as
/// [`FetchError`] so the domain health tracker can classify them.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::Internal(format!("http client: {}", e)))?;
        Ok(Self { client })
    }

    /// GET `url` and decode the body as JSON.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> std::result::Result<T, FetchError> {
        debug!("GET {}", url);
        let response = self.client.get(url).send().await.map_err(classify)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::http(
                Some(status.as_u16()),
                format!("GET {} returned {}", url, status),
            ));
        }
        let body = response.text().await.map_err(classify)?;
        serde_json::from_str(&body)
            .map_err(|e| FetchError::parse(format!("GET {}: invalid JSON: {}", url, e)))
    }
}

/// Map a transport error onto the fetch error taxonomy.
pub fn classify(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::timeout(err.to_string())
    } else if err.is_decode() {
        FetchError::parse(err.to_string())
    } else if let Some(status) = err.status() {
        FetchError::http(Some(status.as_u16()), err.to_string())
    } else {
        FetchError::http(None, err.to_string())
    }
}
