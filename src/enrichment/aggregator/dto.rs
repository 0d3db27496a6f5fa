//! Aggregator API Data Transfer Objects
//!
//! These types match what `GET /best-match` returns. Keys may arrive in
//! snake_case or camelCase depending on the service version.
//! DO NOT use these types outside the aggregator module - convert to domain types.

use serde::Deserialize;

/// `GET {base_url}/best-match?title=..&artist=..`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BestMatchResponse {
    pub success: bool,
    #[serde(alias = "searchResult")]
    pub search_result: Option<SearchResult>,
    pub album: Option<String>,
    #[serde(alias = "coverUrl")]
    pub cover_url: Option<String>,
    #[serde(alias = "coverSizeBytes")]
    pub cover_size_bytes: Option<u64>,
    pub lyrics: Option<String>,
    #[serde(alias = "publishTime")]
    pub publish_time: Option<PublishTimeValue>,
    pub source: Option<String>,
}

/// The provider record that matched
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SearchResult {
    pub title: Option<String>,
    pub artist: Option<String>,
}

/// `publish_time` is a string, an integer timestamp, or (rarely) a float.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PublishTimeValue {
    Int(i64),
    Float(f64),
    Text(String),
}
