//! HTTP image fetching.

use std::time::Duration;

use async_trait::async_trait;

use super::CoverError;

/// Fetches raw image bytes for a URL.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// GET `url` and return the body. Non-200 responses are errors.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, CoverError>;
}

/// `reqwest`-backed fetcher with a per-request timeout.
pub struct ReqwestFetcher {
    http_client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new(timeout: Duration) -> Result<Self, CoverError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoverError::Network(e.to_string()))?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl ImageFetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, CoverError> {
        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| CoverError::Network(e.to_string()))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(CoverError::Status(status.as_u16()));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| CoverError::Network(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Test doubles for [`ImageFetcher`].
#[cfg(test)]
pub mod mocks {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;

    /// Serves canned bodies per URL and counts every request.
    #[derive(Default)]
    pub struct MockFetcher {
        responses: Mutex<HashMap<String, Result<Vec<u8>, u16>>>,
        calls: AtomicUsize,
        requested: Mutex<Vec<String>>,
    }

    impl MockFetcher {
        pub fn new() -> Self {
            Self::default()
        }

        /// Respond to `url` with `body`.
        pub fn with_body(self, url: &str, body: impl Into<Vec<u8>>) -> Self {
            self.responses
                .lock()
                .insert(url.to_string(), Ok(body.into()));
            self
        }

        /// Respond to `url` with an HTTP error status.
        pub fn with_status(self, url: &str, status: u16) -> Self {
            self.responses.lock().insert(url.to_string(), Err(status));
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn requested(&self) -> Vec<String> {
            self.requested.lock().clone()
        }
    }

    #[async_trait]
    impl ImageFetcher for MockFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>, CoverError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requested.lock().push(url.to_string());
            match self.responses.lock().get(url) {
                Some(Ok(body)) => Ok(body.clone()),
                Some(Err(status)) => Err(CoverError::Status(*status)),
                None => Err(CoverError::Network(format!("connection refused: {url}"))),
            }
        }
    }
}
