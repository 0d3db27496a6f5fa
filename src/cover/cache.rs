//! Content-addressed image cache on disk.
//!
//! Files are keyed by the md5 of the source URL. A file that already exists
//! with non-zero size is a cache hit and is never rewritten.

use std::path::PathBuf;

use super::{CacheFolder, CoverError};

/// A resolved cache slot for one URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSlot {
    pub public_ref: String,
    pub path: PathBuf,
}

/// Image cache rooted at the upload directory.
#[derive(Debug, Clone)]
pub struct CoverCache {
    root: PathBuf,
}

impl CoverCache {
    /// Create a cache rooted at `root`. Folders are created lazily on write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Cache slot for a URL: `<folder>/<md5(url)>.<ext>`.
    pub fn slot(&self, folder: CacheFolder, url: &str) -> CacheSlot {
        let ext = if url.to_lowercase().contains(".png") {
            "png"
        } else {
            "jpg"
        };
        let file_name = format!("{:x}.{}", md5::compute(url.as_bytes()), ext);

        CacheSlot {
            public_ref: format!("{}{}", folder.public_prefix(), file_name),
            path: self.root.join(folder.dir_name()).join(file_name),
        }
    }

    /// Read a cached file. Missing or empty files are a miss.
    pub async fn read(&self, slot: &CacheSlot) -> Option<Vec<u8>> {
        match tokio::fs::read(&slot.path).await {
            Ok(data) if !data.is_empty() => Some(data),
            _ => None,
        }
    }

    /// Write bytes into a slot unless a non-empty file is already there.
    ///
    /// The write goes through a temp file and a rename so readers never see
    /// a partial image.
    pub async fn store(&self, slot: &CacheSlot, data: &[u8]) -> Result<(), CoverError> {
        if data.is_empty() {
            return Err(CoverError::Empty);
        }
        if self.read(slot).await.is_some() {
            return Ok(());
        }
        if let Some(parent) = slot.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp_path = slot
            .path
            .with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&temp_path, data).await?;
        if let Err(e) = tokio::fs::rename(&temp_path, &slot.path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }
}
