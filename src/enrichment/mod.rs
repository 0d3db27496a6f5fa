//! Metadata enrichment - provider lookups and the merge policy.
//!
//! # Architecture
//!
//! This module follows a clean separation between:
//! - **Domain models** (`domain.rs`) - Internal types that represent our business logic
//! - **API DTOs** (`aggregator/dto.rs`) - Exact aggregator response shapes
//! - **Adapter** - Converts DTOs to domain models
//! - **Client** - HTTP client for the aggregator service
//! - **Merger** (`merger.rs`) - Pure decision of which fields to overwrite
//!
//! # Usage
//!
//! ```ignore
//! use enrichment::{merge, HttpAggregator, MetadataAggregator};
//!
//! let aggregator = HttpAggregator::new("http://localhost:8000/api/aggregator", timeout)?;
//! let best = aggregator.best_match("稻香", "周杰伦").await?;
//! let updates = merge(&current, &best.to_metadata());
//! ```

pub mod aggregator;
pub mod domain;
pub mod merger;
pub mod traits;

pub use aggregator::HttpAggregator;
pub use domain::{
    AggregatorError, BestMatch, PublishTime, SearchHit, SongMetadata, parse_publish_time,
};
pub use merger::{UpdateSet, merge};
pub use traits::MetadataAggregator;
