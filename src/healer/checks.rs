//! Completeness checks and filename-derived search queries.

use std::fmt;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::Song;

bitflags::bitflags! {
    /// Fields a song still lacks. Empty means metadata-complete.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MissingFields: u8 {
        const TITLE = 1 << 0;
        const ARTIST = 1 << 1;
        const ALBUM = 1 << 2;
        /// Absent, or not yet in the cover cache
        const COVER = 1 << 3;
        const PUBLISH_TIME = 1 << 4;
        /// No source carries lyrics
        const LYRICS = 1 << 5;
    }
}

impl MissingFields {
    /// Evaluate the six completeness rules against a loaded song.
    pub fn of(song: &Song) -> Self {
        let mut missing = Self::empty();
        if song.title.trim().is_empty() {
            missing |= Self::TITLE;
        }
        if song.artist_name().trim().is_empty() {
            missing |= Self::ARTIST;
        }
        if song.album.as_deref().is_none_or(|a| a.trim().is_empty()) {
            missing |= Self::ALBUM;
        }
        if !song.has_local_cover() {
            missing |= Self::COVER;
        }
        if song.publish_time.is_none() {
            missing |= Self::PUBLISH_TIME;
        }
        if !song.has_lyrics() {
            missing |= Self::LYRICS;
        }
        missing
    }

    pub fn is_complete(self) -> bool {
        self.is_empty()
    }
}

impl fmt::Display for MissingFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .iter_names()
            .map(|(name, _)| name.to_ascii_lowercase())
            .collect();
        f.write_str(&names.join(", "))
    }
}

static TRACK_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+[.\s\-]+").expect("valid regex"));
static PARENTHESIZED: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*\(.*?\)").expect("valid regex"));
static DASH_SEPARATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+-\s+").expect("valid regex"));
static SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s{2,}").expect("valid regex"));

/// Search query derived from an audio file's basename.
///
/// `"01. Artist - Song_Name (HQ).mp3"` becomes `"Artist Song Name"`.
/// Returns `None` when nothing usable is left.
pub fn query_from_filename(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_string_lossy();
    let cleaned = TRACK_NUMBER.replace(&stem, "");
    let cleaned = cleaned.replace('_', " ");
    let cleaned = PARENTHESIZED.replace_all(&cleaned, "");
    let cleaned = DASH_SEPARATOR.replace_all(&cleaned, " ");
    let cleaned = SPACES.replace_all(cleaned.trim(), " ");
    (!cleaned.is_empty()).then(|| cleaned.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Artist, SongSource, data_keys};
    use chrono::NaiveDate;
    use proptest::prelude::*;

    fn complete_song() -> Song {
        let mut source = SongSource::local(1, Some("/music/a.mp3"));
        source.data_mut().set_str(data_keys::LYRICS, "[00:01.00]la");
        Song {
            id: 1,
            title: "稻香".into(),
            album: Some("魔杰座".into()),
            cover: Some("/uploads/covers/abc.jpg".into()),
            publish_time: NaiveDate::from_ymd_opt(2008, 10, 15).and_then(|d| d.and_hms_opt(0, 0, 0)),
            local_path: Some("/music/a.mp3".into()),
            artist: Some(Artist {
                id: 1,
                name: "周杰伦".into(),
                ..Default::default()
            }),
            sources: vec![source],
            ..Default::default()
        }
    }

    #[test]
    fn test_complete_song_has_nothing_missing() {
        assert!(MissingFields::of(&complete_song()).is_complete());
    }

    #[test]
    fn test_remote_cover_counts_as_missing() {
        let song = Song {
            cover: Some("https://cdn/example.jpg".into()),
            ..complete_song()
        };
        assert_eq!(MissingFields::of(&song), MissingFields::COVER);
    }

    #[test]
    fn test_missing_fields_display() {
        let song = Song {
            album: Some("  ".into()),
            artist: None,
            sources: Vec::new(),
            ..complete_song()
        };
        let missing = MissingFields::of(&song);
        assert_eq!(
            missing,
            MissingFields::ARTIST | MissingFields::ALBUM | MissingFields::LYRICS
        );
        assert_eq!(missing.to_string(), "artist, album, lyrics");
    }

    #[test]
    fn test_query_from_filename() {
        let q = |p: &str| query_from_filename(Path::new(p));
        assert_eq!(q("/music/周杰伦 - 稻香.mp3").as_deref(), Some("周杰伦 稻香"));
        assert_eq!(q("/music/01. Song_Name (HQ).flac").as_deref(), Some("Song Name"));
        assert_eq!(q("/music/03 - Intro.mp3").as_deref(), Some("Intro"));
        assert_eq!(q("/music/Hi-Fi Love.m4a").as_deref(), Some("Hi-Fi Love"));
        assert_eq!(q("/music/(Live).mp3"), None);
    }

    proptest! {
        /// Cleaned queries never carry underscores, parentheses groups or edge whitespace.
        #[test]
        fn prop_query_is_clean(stem in "[0-9]{0,2}[ ._a-zA-Z()-]{0,24}") {
            let path = format!("/music/{stem}.mp3");
            if let Some(query) = query_from_filename(Path::new(&path)) {
                prop_assert!(!query.contains('_'));
                prop_assert_eq!(query.trim(), query.as_str());
                prop_assert!(!query.is_empty());
                prop_assert!(!query.contains("  "));
            }
        }
    }
}
