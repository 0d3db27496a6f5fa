//! Internal domain models for metadata healing.
//!
//! These types are OUR types - they don't change when the aggregator's wire
//! format changes. Responses get converted into these types in
//! `aggregator::dto`.

use chrono::{DateTime, NaiveDate, NaiveDateTime};

/// Integers above this are milliseconds since the epoch, below it seconds.
pub const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

/// A metadata record on either side of a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SongMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub cover_url: Option<String>,
    /// Size of the cover image, when the side knows it
    pub cover_size_bytes: Option<u64>,
    pub publish_time: Option<NaiveDateTime>,
    pub lyrics: Option<String>,
}

/// `publish_time` as the aggregator reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishTime {
    /// ISO-like date or date-time string, a bare year, or a digit timestamp
    Text(String),
    /// Seconds or milliseconds since the epoch
    Epoch(i64),
}

/// Title/artist of the provider record that matched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchHit {
    pub title: Option<String>,
    pub artist: Option<String>,
}

/// The aggregator's best match for a `(title, artist)` query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BestMatch {
    pub success: bool,
    pub search_result: Option<SearchHit>,
    pub album: Option<String>,
    pub cover_url: Option<String>,
    pub cover_size_bytes: Option<u64>,
    pub lyrics: Option<String>,
    pub publish_time: Option<PublishTime>,
    /// Provider the match came from
    pub source: String,
}

impl BestMatch {
    /// An unsuccessful result.
    pub fn none() -> Self {
        Self::default()
    }

    /// Candidate metadata for the merger.
    pub fn to_metadata(&self) -> SongMetadata {
        let hit = self.search_result.as_ref();
        SongMetadata {
            title: hit.and_then(|h| h.title.clone()),
            artist: hit.and_then(|h| h.artist.clone()),
            album: self.album.clone(),
            cover_url: self.cover_url.clone(),
            cover_size_bytes: self.cover_size_bytes,
            publish_time: self.publish_time.as_ref().and_then(parse_publish_time),
            lyrics: self.lyrics.clone(),
        }
    }
}

/// Normalize an aggregator `publish_time` into a timestamp.
///
/// Accepts `YYYY-MM-DD...` (first 10 characters), a bare `YYYY`, digit
/// strings longer than 8 characters as epoch timestamps (longer than 10
/// means milliseconds), and integers (above [`MILLIS_THRESHOLD`] means
/// milliseconds). Anything else yields `None`.
pub fn parse_publish_time(value: &PublishTime) -> Option<NaiveDateTime> {
    match value {
        PublishTime::Epoch(n) => from_epoch(*n, *n > MILLIS_THRESHOLD),
        PublishTime::Text(text) => {
            let text = text.trim();
            if text.contains('-') && text.len() >= 10 {
                let date = NaiveDate::parse_from_str(text.get(..10)?, "%Y-%m-%d").ok()?;
                return date.and_hms_opt(0, 0, 0);
            }
            let all_digits = !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit());
            if all_digits && text.len() == 4 {
                let year = text.parse().ok()?;
                return NaiveDate::from_ymd_opt(year, 1, 1)?.and_hms_opt(0, 0, 0);
            }
            if all_digits && text.len() > 8 {
                return from_epoch(text.parse().ok()?, text.len() > 10);
            }
            None
        }
    }
}

fn from_epoch(value: i64, millis: bool) -> Option<NaiveDateTime> {
    let dt = if millis {
        DateTime::from_timestamp_millis(value)?
    } else {
        DateTime::from_timestamp(value, 0)?
    };
    Some(dt.naive_utc())
}

/// Errors talking to the provider aggregator.
#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {0}")]
    Status(u16),

    #[error("Failed to parse response: {0}")]
    Parse(String),
}
