//! Cover and avatar localization.
//!
//! Remote image URLs (and internal cover proxy URLs) are downloaded once
//! into a content-addressed cache under the upload root:
//!
//! ```text
//! <upload_root>/covers/<md5 hex>.<jpg|png>   ->  /uploads/covers/<md5 hex>.<ext>
//! <upload_root>/avatars/<md5 hex>.<jpg|png>  ->  /uploads/avatars/<md5 hex>.<ext>
//! ```
//!
//! The public reference (right column) is what gets stored in
//! `Song.cover` and `Artist.avatar`.
//!
//! # Design Principles
//!
//! - **Write-once**: an existing cache file is reused, never overwritten
//! - **Graceful degradation**: any failure yields `None`, the caller moves on
//! - **Testable**: network access sits behind [`ImageFetcher`]

mod cache;
mod fetcher;
mod materializer;

use std::path::PathBuf;

use thiserror::Error;

pub use cache::CoverCache;
pub use fetcher::{ImageFetcher, ReqwestFetcher};
pub use materializer::Materializer;

#[cfg(test)]
pub use fetcher::mocks;

/// Subfolder of the cover cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheFolder {
    Covers,
    Avatars,
}

impl CacheFolder {
    /// Directory name under the upload root.
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Covers => "covers",
            Self::Avatars => "avatars",
        }
    }

    /// Public reference prefix for files in this folder.
    pub fn public_prefix(self) -> &'static str {
        match self {
            Self::Covers => "/uploads/covers/",
            Self::Avatars => "/uploads/avatars/",
        }
    }

    /// Whether a stored reference points into this folder.
    pub fn owns(self, reference: &str) -> bool {
        reference.starts_with(self.public_prefix())
    }
}

/// A cached image: its public reference, on-disk location and bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterializedImage {
    /// `/uploads/<folder>/<file>`
    pub public_ref: String,
    pub path: PathBuf,
    pub data: Vec<u8>,
}

/// Errors raised while localizing an image.
///
/// These never leave [`Materializer::materialize`]; they are logged and
/// turned into `None`.
#[derive(Debug, Error)]
pub enum CoverError {
    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {0}")]
    Status(u16),

    #[error("empty response body")]
    Empty,

    #[error("malformed url indirection: {0}")]
    Indirection(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// MIME type sniffed from magic bytes. PNG signature means PNG, anything else JPEG.
pub fn mime_from_bytes(data: &[u8]) -> &'static str {
    if data.starts_with(b"\x89PNG") {
        "image/png"
    } else {
        "image/jpeg"
    }
}
