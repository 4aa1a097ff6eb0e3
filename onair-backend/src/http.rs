//! Request/response client for the station status API.

use crate::error::{BackendError, Result};
use async_trait::async_trait;
use onair_core::config::parse_url;
use onair_core::{BackendConfig, CoreError, NowPlaying, StatusSource, StreamState};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

const LOG_TARGET: &str = "onair::backend::http";

pub const CURRENT_STREAM_STATE: &str = "current-stream-state";
pub const NOW_PLAYING: &str = "now-playing";

const CONNECT_TIMEOUT_SECS: u64 = 5;
const USER_AGENT: &str = concat!("onair/", env!("CARGO_PKG_VERSION"));

/// HTTP client for `current-stream-state` and `now-playing`.
pub struct StatusClient {
    client: ClientWithMiddleware,
    base: Url,
}

impl StatusClient {
    /// Create a client with retries and timeouts from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is invalid or the HTTP client cannot
    /// be created.
    pub fn new(config: &BackendConfig) -> std::result::Result<Self, CoreError> {
        let base = base_url(&config.base_url)?;

        let base_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .default_headers(auth_headers(&config.api_key)?)
            .build()
            .map_err(BackendError::from)?;

        // Wrap with retry middleware (exponential backoff)
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(config.max_retries);
        let client = ClientBuilder::new(base_client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self { client, base })
    }

    /// Absolute URL of an endpoint under the base URL
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint cannot be joined onto the base.
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(path)?)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.endpoint(path)?;
        debug!(target: LOG_TARGET, "GET {}", url);

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!(target: LOG_TARGET, "{} returned status: {}", path, status);
            return Err(BackendError::Status {
                endpoint: path.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl StatusSource for StatusClient {
    async fn current_stream_state(&self) -> onair_core::Result<StreamState> {
        Ok(self.get_json(CURRENT_STREAM_STATE).await?)
    }

    async fn now_playing(&self) -> onair_core::Result<NowPlaying> {
        Ok(self.get_json(NOW_PLAYING).await?)
    }
}

/// Parse the base URL so that endpoint paths join beneath it
fn base_url(raw: &str) -> std::result::Result<Url, CoreError> {
    let mut url = parse_url("backend.base_url", raw)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn auth_headers(api_key: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    if api_key.is_empty() {
        return Ok(headers);
    }
    headers.insert(HeaderName::from_static("apikey"), HeaderValue::from_str(api_key)?);
    let mut bearer = HeaderValue::from_str(&format!("Bearer {api_key}"))?;
    bearer.set_sensitive(true);
    headers.insert(AUTHORIZATION, bearer);
    Ok(headers)
}
