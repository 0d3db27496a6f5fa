//! Trait definitions for the provider aggregator.
//!
//! The healer only depends on [`MetadataAggregator`], so tests can swap in
//! the mocks below instead of talking HTTP.
//!
//! # Example
//!
//! ```ignore
//! use music_monitor::enrichment::traits::MetadataAggregator;
//!
//! async fn lookup(aggregator: &dyn MetadataAggregator) {
//!     let best = aggregator.best_match("稻香", "周杰伦").await?;
//! }
//! ```

use async_trait::async_trait;

use super::domain::{AggregatorError, BestMatch};

/// Best-match metadata lookup across providers.
///
/// Implement this trait to create mock implementations for testing.
#[async_trait]
pub trait MetadataAggregator: Send + Sync {
    /// Highest-confidence match for a title/artist query.
    async fn best_match(&self, title: &str, artist: &str) -> Result<BestMatch, AggregatorError>;
}

#[async_trait]
impl MetadataAggregator for super::aggregator::HttpAggregator {
    async fn best_match(&self, title: &str, artist: &str) -> Result<BestMatch, AggregatorError> {
        self.best_match(title, artist).await
    }
}
