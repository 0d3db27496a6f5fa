//! Aggregator HTTP client
//!
//! `GET {base_url}/best-match?title=<title>&artist=<artist>`

use std::time::Duration;

use super::{adapter, dto};
use crate::enrichment::domain::{AggregatorError, BestMatch};

/// User agent string sent with every request
const USER_AGENT: &str = concat!("MusicMonitor/", env!("CARGO_PKG_VERSION"));

/// Aggregator service client
pub struct HttpAggregator {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpAggregator {
    /// Create a client for the service at `base_url`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, AggregatorError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| AggregatorError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn request_url(&self, title: &str, artist: &str) -> String {
        format!(
            "{}/best-match?title={}&artist={}",
            self.base_url,
            urlencoding::encode(title),
            urlencoding::encode(artist)
        )
    }

    /// Look up the best match for a title/artist query
    pub async fn best_match(&self, title: &str, artist: &str) -> Result<BestMatch, AggregatorError> {
        let url = self.request_url(title, artist);
        tracing::debug!(target: "healer", %url, "Querying aggregator");

        let response = self
            .http_client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| AggregatorError::Network(e.to_string()))?;

        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(BestMatch::none());
        }

        if !status.is_success() {
            return Err(AggregatorError::Status(status.as_u16()));
        }

        let body = response
            .json::<dto::BestMatchResponse>()
            .await
            .map_err(|e| AggregatorError::Parse(e.to_string()))?;

        Ok(adapter::to_best_match(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_url_encoding() {
        let client =
            HttpAggregator::new("http://localhost:8000/api/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            client.request_url("稻香", "AC/DC & Co"),
            "http://localhost:8000/api/best-match?title=%E7%A8%BB%E9%A6%99&artist=AC%2FDC%20%26%20Co"
        );
    }
}
