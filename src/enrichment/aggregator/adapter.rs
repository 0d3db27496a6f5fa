//! Converts aggregator DTOs into domain types.

use super::dto::{BestMatchResponse, PublishTimeValue};
use crate::enrichment::domain::{BestMatch, PublishTime, SearchHit};

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

pub fn to_best_match(response: BestMatchResponse) -> BestMatch {
    BestMatch {
        success: response.success,
        search_result: response.search_result.map(|hit| SearchHit {
            title: non_blank(hit.title),
            artist: non_blank(hit.artist),
        }),
        album: non_blank(response.album),
        cover_url: non_blank(response.cover_url),
        cover_size_bytes: response.cover_size_bytes.filter(|&size| size > 0),
        lyrics: non_blank(response.lyrics),
        publish_time: response.publish_time.and_then(|value| match value {
            PublishTimeValue::Int(n) => Some(PublishTime::Epoch(n)),
            PublishTimeValue::Float(f) if f.is_finite() => Some(PublishTime::Epoch(f as i64)),
            PublishTimeValue::Float(_) => None,
            PublishTimeValue::Text(text) => non_blank(Some(text)).map(PublishTime::Text),
        }),
        source: response.source.unwrap_or_default(),
    }
}
