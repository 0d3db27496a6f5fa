//! Core data models for the music library.
//!
//! Defines the aggregates the healer works on: [`Song`] (with its
//! [`SongSource`] children and a snapshot of its [`Artist`]) and [`Artist`]
//! (with its [`ArtistSource`] children).
//!
//! # Database Schema
//!
//! The models map to the following tables:
//! - `artists` / `artist_sources` - Artists and their per-provider records
//! - `songs` - Songs with display metadata and the local file path
//! - `song_sources` - Per-provider song records; lyrics live in `data_json`

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};

use crate::cover::CacheFolder;

/// Source tag for rows whose authority is the filesystem itself.
pub const LOCAL_SOURCE: &str = "local";

/// Prefix of the internal cover proxy (`/api/discovery/cover?source=..&id=..`).
pub const COVER_PROXY_PREFIX: &str = "/api/discovery/cover";

/// Recognized keys of the `data_json` bag.
pub mod data_keys {
    pub const LYRICS: &str = "lyrics";
    pub const ALBUM: &str = "album";
    pub const COVER: &str = "cover";
    pub const QUALITY: &str = "quality";
    pub const FORMAT: &str = "format";
}

/// Schemaless `data_json` bag attached to a [`SongSource`].
///
/// Recognized keys are listed in [`data_keys`]; anything else is carried
/// through untouched. Mutating the bag does not mark the owning row dirty,
/// see [`SongSource::mark_data_modified`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceData(Map<String, Value>);

impl SourceData {
    /// Parse a stored JSON document. Anything that is not an object becomes empty.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(serde_json::from_str::<Value>) {
            Some(Ok(Value::Object(map))) => Self(map),
            _ => Self::default(),
        }
    }

    /// Serialize for storage.
    pub fn to_json(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }

    /// Non-empty string value for `key`.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
    }

    pub fn set_str(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_string(), Value::String(value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn lyrics(&self) -> Option<&str> {
        self.get_str(data_keys::LYRICS)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// An artist with its per-provider source records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Artist {
    /// Database ID
    pub id: i64,
    /// Display name
    pub name: String,
    /// Local avatar reference (`/uploads/avatars/..`) or a remote URL awaiting localization
    pub avatar: Option<String>,
    /// Provider records. Empty when loaded as part of a song.
    pub sources: Vec<ArtistSource>,
}

impl Artist {
    /// Whether the avatar still points outside the avatar cache.
    pub fn has_remote_avatar(&self) -> bool {
        self.avatar
            .as_deref()
            .is_some_and(|a| a.starts_with("http"))
    }
}

/// A per-provider artist record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArtistSource {
    pub id: i64,
    pub artist_id: i64,
    pub source: String,
    pub source_id: String,
    pub avatar: Option<String>,
    pub url: Option<String>,
}

/// A per-provider song record.
///
/// `id` is `None` until the row has been inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct SongSource {
    pub id: Option<i64>,
    pub song_id: i64,
    /// Provider tag (`qqmusic`, `netease`, ...) or [`LOCAL_SOURCE`]
    pub source: String,
    /// Opaque provider key
    pub source_id: String,
    /// Provider URL, or the filesystem path for local sources
    pub url: Option<String>,
    /// Mirrors the parent song's cover once localized
    pub cover: Option<String>,
    data: SourceData,
    data_modified: bool,
}

impl SongSource {
    /// Build a source row from stored columns.
    pub fn new(
        id: Option<i64>,
        song_id: i64,
        source: impl Into<String>,
        source_id: impl Into<String>,
        data: SourceData,
    ) -> Self {
        Self {
            id,
            song_id,
            source: source.into(),
            source_id: source_id.into(),
            url: None,
            cover: None,
            data,
            data_modified: false,
        }
    }

    /// A not-yet-persisted `local` source for a song.
    ///
    /// The source key and URL are the file path when known, the song id otherwise.
    pub fn local(song_id: i64, local_path: Option<&str>) -> Self {
        let key = local_path
            .map(str::to_string)
            .unwrap_or_else(|| song_id.to_string());
        let mut source = Self::new(None, song_id, LOCAL_SOURCE, key, SourceData::default());
        source.url = local_path.map(str::to_string);
        source
    }

    pub fn data(&self) -> &SourceData {
        &self.data
    }

    /// Mutable access to the bag. Changes are only persisted after
    /// [`Self::mark_data_modified`].
    pub fn data_mut(&mut self) -> &mut SourceData {
        &mut self.data
    }

    /// Flag `data_json` as changed so the next save writes it.
    pub fn mark_data_modified(&mut self) {
        self.data_modified = true;
    }

    pub fn is_data_modified(&self) -> bool {
        self.data_modified
    }

    pub(crate) fn clear_modified(&mut self) {
        self.data_modified = false;
    }

    pub fn lyrics(&self) -> Option<&str> {
        self.data.lyrics()
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }
}

/// A song in the library, loaded together with its artist and sources.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Song {
    /// Database ID
    pub id: i64,
    pub title: String,
    pub album: Option<String>,
    /// Local cover reference (`/uploads/covers/..`), a remote URL, or none
    pub cover: Option<String>,
    pub publish_time: Option<NaiveDateTime>,
    /// Absolute path of the audio file
    pub local_path: Option<String>,
    /// Most recent heal attempt (advisory)
    pub last_enrich_at: Option<DateTime<Utc>>,
    pub artist: Option<Artist>,
    pub sources: Vec<SongSource>,
}

impl Song {
    /// Artist name, or an empty string when the song has no artist.
    pub fn artist_name(&self) -> &str {
        self.artist.as_ref().map(|a| a.name.as_str()).unwrap_or("")
    }

    /// Lyrics from the first source that carries any.
    pub fn first_lyrics(&self) -> Option<&str> {
        self.sources.iter().find_map(SongSource::lyrics)
    }

    pub fn has_lyrics(&self) -> bool {
        self.first_lyrics().is_some()
    }

    /// Whether the cover lives in the cover cache.
    pub fn has_local_cover(&self) -> bool {
        self.cover
            .as_deref()
            .is_some_and(|c| CacheFolder::Covers.owns(c))
    }

    /// Whether a non-empty cover still lives outside the cover cache.
    pub fn has_remote_cover(&self) -> bool {
        self.cover
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty() && !CacheFolder::Covers.owns(c))
    }

    pub fn stamp_enriched(&mut self) {
        self.last_enrich_at = Some(Utc::now());
    }
}
