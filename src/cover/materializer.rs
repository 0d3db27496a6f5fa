//! Turns remote image URLs into cached local files.

use std::sync::Arc;

use super::cache::CacheSlot;
use super::{CacheFolder, CoverCache, CoverError, ImageFetcher, MaterializedImage};
use crate::model::COVER_PROXY_PREFIX;

/// Marker of a JSON indirection body (`{"url": "..."}`) in the first 100 bytes.
const INDIRECTION_MARKER: &[u8] = br#"{"url":"#;
const INDIRECTION_WINDOW: usize = 100;

/// Downloads images into the [`CoverCache`].
pub struct Materializer {
    cache: CoverCache,
    fetcher: Arc<dyn ImageFetcher>,
    picture_endpoint: String,
}

impl Materializer {
    /// `picture_endpoint` is the upstream API that proxy URLs are translated to.
    pub fn new(
        cache: CoverCache,
        fetcher: Arc<dyn ImageFetcher>,
        picture_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            fetcher,
            picture_endpoint: picture_endpoint.into(),
        }
    }

    /// Localize `url` into `folder`.
    ///
    /// Returns `None` on any failure; the reason is logged.
    pub async fn materialize(&self, url: &str, folder: CacheFolder) -> Option<MaterializedImage> {
        match self.try_materialize(url, folder).await {
            Ok(image) => Some(image),
            Err(e) => {
                tracing::warn!(target: "covers", url, error = %e, "Image download failed");
                None
            }
        }
    }

    async fn try_materialize(
        &self,
        url: &str,
        folder: CacheFolder,
    ) -> Result<MaterializedImage, CoverError> {
        let url = self.translate_proxy(url)?;
        if !url.starts_with("http") {
            return Err(CoverError::Network(format!("not a remote url: {url}")));
        }

        let slot = self.cache.slot(folder, &url);
        if let Some(data) = self.cache.read(&slot).await {
            tracing::debug!(target: "covers", url = %url, path = %slot.path.display(), "Cache hit");
            return Ok(image(slot, data));
        }

        let mut data = self.fetcher.fetch(&url).await?;
        if let Some(inner) = indirection_target(&data)? {
            tracing::debug!(target: "covers", from = %url, to = %inner, "Following url indirection");
            data = self.fetcher.fetch(&inner).await?;
            if indirection_target(&data)?.is_some() {
                return Err(CoverError::Indirection("nested indirection".into()));
            }
        }

        self.cache.store(&slot, &data).await?;
        tracing::info!(target: "covers", url = %url, path = %slot.path.display(), bytes = data.len(), "Image cached");
        Ok(image(slot, data))
    }

    /// Rewrite `/api/discovery/cover?source=..&id=..` to the upstream picture endpoint.
    /// Other URLs pass through unchanged.
    fn translate_proxy(&self, url: &str) -> Result<String, CoverError> {
        let Some(rest) = url.strip_prefix(COVER_PROXY_PREFIX) else {
            return Ok(url.to_string());
        };
        let query = rest.strip_prefix('?').unwrap_or(rest);

        let mut source = None;
        let mut id = None;
        for pair in query.split('&') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let value = urlencoding::decode(value)
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| value.to_string());
            match key {
                "source" if !value.is_empty() => source = Some(value),
                "id" if !value.is_empty() => id = Some(value),
                _ => {}
            }
        }

        match (source, id) {
            (Some(source), Some(id)) => Ok(format!(
                "{}?types=pic&source={}&id={}",
                self.picture_endpoint,
                urlencoding::encode(&source),
                urlencoding::encode(&id)
            )),
            _ => Err(CoverError::Indirection(format!(
                "proxy url without source/id: {url}"
            ))),
        }
    }
}

fn image(slot: CacheSlot, data: Vec<u8>) -> MaterializedImage {
    MaterializedImage {
        public_ref: slot.public_ref,
        path: slot.path,
        data,
    }
}

/// Extract the target of a `{"url": "..."}` body, if the body is one.
fn indirection_target(data: &[u8]) -> Result<Option<String>, CoverError> {
    let head = &data[..data.len().min(INDIRECTION_WINDOW)];
    if !head
        .windows(INDIRECTION_MARKER.len())
        .any(|w| w == INDIRECTION_MARKER)
    {
        return Ok(None);
    }

    let value: serde_json::Value =
        serde_json::from_slice(data).map_err(|e| CoverError::Indirection(e.to_string()))?;
    match value.get("url").and_then(|u| u.as_str()) {
        Some(url) if !url.trim().is_empty() => Ok(Some(url.to_string())),
        _ => Err(CoverError::Indirection("missing url field".into())),
    }
}
