use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CACHE_CONTROL};
use reqwest::{Client, StatusCode};
use tracing::debug;

use super::fetcher::{parse_max_age, FetchResponse, TileFetcher};
use crate::error::{ConfigError, FetchError};

/// Default `User-Agent` sent with every tile request.
pub const DEFAULT_USER_AGENT: &str = concat!("tile-mosaic/", env!("CARGO_PKG_VERSION"));

/// `Accept` header sent with every tile request.
pub const IMAGE_ACCEPT: &str = "image/png, image/jpeg, image/*;q=0.8, */*;q=0.5";

/// Tile fetcher over HTTP(S).
///
/// Status handling:
/// - 2xx: body returned, `Cache-Control: max-age` becomes `expires_at`
/// - 404 and 410: [`FetchError::NotFound`]
/// - anything else: [`FetchError::Network`] carrying the status
///
/// The client-level timeout covers connect and body transfer; the loader wraps
/// every attempt in its own timeout as well.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    timeout: Duration,
}

impl HttpFetcher {
    /// Build a fetcher with the given timeout and `User-Agent`.
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, ConfigError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(IMAGE_ACCEPT));

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .default_headers(headers)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        Ok(Self { client, timeout })
    }

    fn map_error(&self, url: &str, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout {
                millis: self.timeout.as_millis() as u64,
            }
        } else {
            FetchError::Network {
                status: err.status().map(|s| s.as_u16()),
                message: format!("{url}: {err}"),
            }
        }
    }
}

#[async_trait]
impl TileFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.map_error(url, e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(FetchError::NotFound(format!("{url}: HTTP {status}")));
        }
        if !status.is_success() {
            return Err(FetchError::Network {
                status: Some(status.as_u16()),
                message: format!("{url}: HTTP {status}"),
            });
        }

        let expires_at = response
            .headers()
            .get(CACHE_CONTROL)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_max_age)
            .map(|max_age| SystemTime::now() + max_age);

        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        let body = response
            .bytes()
            .await
            .map_err(|e| self.map_error(url, e))?;

        debug!(url, bytes = body.len(), "fetched tile");

        Ok(FetchResponse {
            body,
            headers,
            expires_at,
        })
    }
}
