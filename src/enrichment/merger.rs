//! Field-level merge policy between stored and provider metadata.
//!
//! | Field          | Taken from the candidate when                                        |
//! |----------------|----------------------------------------------------------------------|
//! | `album`        | current is garbage and the candidate is not                          |
//! | `publish_time` | current is missing or the epoch, and the candidate is a real date    |
//! | `cover`        | current is empty, or remote, or both sizes known and candidate ≥ 1.2× |
//! | `lyrics`       | current is empty, or plain text while the candidate is timed        |
//! | `title/artist` | never                                                                |

use chrono::{NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;

use super::domain::SongMetadata;
use crate::cover::CacheFolder;

/// Values that count as "no real data" (compared case-insensitively, trimmed).
pub const GARBAGE_TOKENS: &[&str] = &[
    "unknown",
    "unknown album",
    "unknown artist",
    "未知",
    "无",
    "none",
    "test",
    "default",
    "1970",
    "1970-01-01",
];

/// Minimum size ratio for a cover to count as an upgrade.
const COVER_UPGRADE_RATIO: f64 = 1.2;

static TIMED_LYRICS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\d{1,3}:\d{2}").expect("valid regex"));

/// Fields the healer should apply. Empty fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateSet {
    pub album: Option<String>,
    pub publish_time: Option<NaiveDateTime>,
    pub cover: Option<String>,
    pub lyrics: Option<String>,
}

impl UpdateSet {
    pub fn is_empty(&self) -> bool {
        self.album.is_none()
            && self.publish_time.is_none()
            && self.cover.is_none()
            && self.lyrics.is_none()
    }

    /// Names of the fields present, for logging.
    pub fn fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.album.is_some() {
            fields.push("album");
        }
        if self.publish_time.is_some() {
            fields.push("publish_time");
        }
        if self.cover.is_some() {
            fields.push("cover");
        }
        if self.lyrics.is_some() {
            fields.push("lyrics");
        }
        fields
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.is_none_or(|v| v.trim().is_empty())
}

/// Empty, whitespace-only, or one of [`GARBAGE_TOKENS`].
pub fn is_garbage(value: Option<&str>) -> bool {
    match value.map(str::trim) {
        None | Some("") => true,
        Some(v) => {
            let lower = v.to_lowercase();
            GARBAGE_TOKENS.contains(&lower.as_str())
        }
    }
}

/// Missing, or on 1970-01-01.
pub fn is_invalid_date(value: Option<NaiveDateTime>) -> bool {
    match value {
        None => true,
        Some(dt) => NaiveDate::from_ymd_opt(1970, 1, 1) == Some(dt.date()),
    }
}

/// Whether lyrics carry `[mm:ss` timing anchors.
pub fn has_timed_lyrics(lyrics: &str) -> bool {
    TIMED_LYRICS.is_match(lyrics)
}

/// Whether a cover reference lives outside the cover cache.
pub fn is_remote_cover(cover: &str) -> bool {
    !cover.trim().is_empty() && !CacheFolder::Covers.owns(cover)
}

fn should_update_cover(current: &SongMetadata, candidate: &SongMetadata) -> bool {
    if is_blank(candidate.cover_url.as_deref()) {
        return false;
    }
    match current.cover_url.as_deref() {
        None => true,
        Some(c) if c.trim().is_empty() || is_remote_cover(c) => true,
        Some(_) => match (current.cover_size_bytes, candidate.cover_size_bytes) {
            (Some(cur), Some(cand)) => cand as f64 >= cur as f64 * COVER_UPGRADE_RATIO,
            _ => false,
        },
    }
}

fn should_update_lyrics(current: Option<&str>, candidate: Option<&str>) -> bool {
    let Some(candidate) = candidate.filter(|c| !c.trim().is_empty()) else {
        return false;
    };
    match current.filter(|c| !c.trim().is_empty()) {
        None => true,
        Some(current) => !has_timed_lyrics(current) && has_timed_lyrics(candidate),
    }
}

/// Decide which candidate fields overwrite the current ones.
pub fn merge(current: &SongMetadata, candidate: &SongMetadata) -> UpdateSet {
    let mut updates = UpdateSet::default();

    if is_garbage(current.album.as_deref()) && !is_garbage(candidate.album.as_deref()) {
        updates.album = candidate.album.clone();
    }

    if is_invalid_date(current.publish_time) && !is_invalid_date(candidate.publish_time) {
        updates.publish_time = candidate.publish_time;
    }

    if should_update_cover(current, candidate) {
        updates.cover = candidate.cover_url.clone();
    }

    if should_update_lyrics(current.lyrics.as_deref(), candidate.lyrics.as_deref()) {
        updates.lyrics = candidate.lyrics.clone();
    }

    updates
}
