//! Error types for the healing core.
//!
//! Each subsystem has its own `thiserror` enum. [`TagError`] and
//! [`TaskCancelled`] convert into [`Error`]; cover and aggregator failures
//! are logged where they happen and end up as "no change" instead. The CLI
//! converts everything into `anyhow`.
//!
//! A [`TaskCancelled`] raised at a cooperation point becomes
//! [`Error::Cancelled`] and stays recognizable through any added context,
//! see [`Error::is_cancelled`].
//!
//! # Example
//!
//! ```ignore
//! use music_monitor::error::{Error, Result};
//!
//! async fn heal(pool: &SqlitePool, id: i64) -> Result<Song> {
//!     let song = db::load_song(pool, id).await?; // Database errors auto-convert
//!     song.ok_or_else(|| Error::song_not_found(id))
//! }
//! ```

use std::path::PathBuf;

use crate::metadata::TagError;
use crate::tasks::TaskCancelled;

/// Result alias used across the healing core.
pub type Result<T> = std::result::Result<T, Error>;

/// Healer-level error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Tag reading/writing error
    #[error("Tag error for {path}: {message}")]
    Metadata { path: PathBuf, message: String },

    /// Configuration error
    #[error("Config error: {0}")]
    Config(String),

    /// Song or artist not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Task was cancelled at a cooperation point
    #[error("Task {0} cancelled")]
    Cancelled(String),

    /// Another error plus what was being done
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn metadata(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Metadata {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn song_not_found(id: i64) -> Self {
        Self::NotFound(format!("song {id}"))
    }

    pub fn artist_not_found(id: i64) -> Self {
        Self::NotFound(format!("artist {id}"))
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Wrap with a description of the failed step.
    pub fn context(self, ctx: impl Into<String>) -> Self {
        Self::WithContext {
            context: ctx.into(),
            source: Box::new(self),
        }
    }

    /// Whether this is (or wraps) a cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled(_) => true,
            Self::WithContext { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

impl From<TagError> for Error {
    fn from(e: TagError) -> Self {
        Self::metadata(e.path().map(PathBuf::from).unwrap_or_default(), e.to_string())
    }
}

impl From<TaskCancelled> for Error {
    fn from(e: TaskCancelled) -> Self {
        Self::Cancelled(e.task_id)
    }
}

/// `.with_context("loading song 3")` on healer, io and sqlx results.
pub trait ResultExt<T> {
    fn with_context(self, ctx: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn with_context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(ctx))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, std::io::Error> {
    fn with_context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Io(e).context(ctx))
    }
}

impl<T> ResultExt<T> for std::result::Result<T, sqlx::Error> {
    fn with_context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Database(e).context(ctx))
    }
}
