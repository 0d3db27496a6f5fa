//! Test utilities and fixtures for music-monitor tests.
//!
//! This module provides a throwaway database, fixture inserters, and tiny
//! synthetic audio/image files so tag and heal tests run without real media.
//!
//! # Example
//!
//! ```ignore
//! use music_monitor::test_utils::{temp_db, insert_test_song, write_minimal_mp3};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let (pool, dir) = temp_db().await;
//!     let path = write_minimal_mp3(dir.path(), "song.mp3");
//!     let id = insert_test_song(&pool, Some("Artist"), NewSong { .. }).await;
//! }
//! ```

use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use sqlx::sqlite::SqlitePool;
use tempfile::TempDir;

use crate::db::{self, NewSong};

/// A 1x1 transparent PNG.
pub const TINY_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

/// JFIF header followed by end-of-image. Enough to be sniffed as JPEG.
pub const TINY_JPEG: &[u8] = &[
    0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46, 0x49, 0x46, 0x00, 0x01, 0x01, 0x00, 0x00,
    0x01, 0x00, 0x01, 0x00, 0x00, 0xFF, 0xD9,
];

/// Creates a temporary database for testing.
///
/// The database is created in a temporary directory that is automatically
/// cleaned up when the returned `TempDir` is dropped. Migrations are run
/// automatically. The directory doubles as scratch space for audio files.
///
/// # Returns
///
/// A tuple of (connection pool, temp directory handle).
/// Keep the TempDir alive for the duration of your test.
pub async fn temp_db() -> (SqlitePool, TempDir) {
    let dir = tempfile::tempdir().expect("Failed to create temp directory");
    let db_path = dir.path().join("test.db");
    let db_url = format!("sqlite:{}", db_path.display());

    let pool = db::init_db(&db_url)
        .await
        .expect("Failed to initialize test database");

    (pool, dir)
}

/// `YYYY-MM-DD` at midnight.
pub fn date(y: i32, m: u32, d: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .expect("valid test date")
}

/// A song row that passes every completeness rule except lyrics, which
/// live in sources (see [`insert_lyrics_source`]).
///
/// Customize with struct update syntax:
///
/// ```ignore
/// let song = NewSong { album: Some("Unknown".into()), ..complete_song("Title", path) };
/// ```
pub fn complete_song(title: &str, local_path: &Path) -> NewSong {
    NewSong {
        artist_id: None,
        title: title.to_string(),
        album: Some("Real Album".to_string()),
        cover: Some("/uploads/covers/existing.jpg".to_string()),
        publish_time: Some(date(2020, 1, 1)),
        local_path: Some(local_path.display().to_string()),
    }
}

/// Inserts a song, creating its artist first when a name is given.
pub async fn insert_test_song(pool: &SqlitePool, artist: Option<&str>, song: NewSong) -> i64 {
    let artist_id = match artist {
        Some(name) => Some(
            db::insert_artist(pool, name, None)
                .await
                .expect("Failed to insert artist"),
        ),
        None => song.artist_id,
    };
    db::insert_song(pool, &NewSong { artist_id, ..song })
        .await
        .expect("Failed to insert song")
}

/// Attaches a provider source carrying `lyrics`.
pub async fn insert_lyrics_source(
    pool: &SqlitePool,
    song_id: i64,
    source: &str,
    lyrics: &str,
) -> i64 {
    let data = serde_json::json!({ "lyrics": lyrics }).to_string();
    db::insert_song_source(pool, song_id, source, &format!("{source}-{song_id}"), Some(&data))
        .await
        .expect("Failed to insert song source")
}

/// Writes a FLAC file with a STREAMINFO block (44.1 kHz, stereo, 16 bit)
/// followed by a 16-byte PADDING block.
pub fn write_minimal_flac(dir: &Path, name: &str) -> PathBuf {
    let mut bytes = flac_stream_info(false);
    // Last metadata block, type 1 (PADDING), 16 bytes
    bytes.extend_from_slice(&[0x81, 0x00, 0x00, 0x10]);
    bytes.extend_from_slice(&[0; 16]);
    write_fixture(dir, name, &bytes)
}

/// Writes a FLAC file whose only metadata block is STREAMINFO.
pub fn write_unpadded_flac(dir: &Path, name: &str) -> PathBuf {
    write_fixture(dir, name, &flac_stream_info(true))
}

fn flac_stream_info(last: bool) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(62);
    bytes.extend_from_slice(b"fLaC");
    // Type 0 (STREAMINFO), 34 bytes
    bytes.extend_from_slice(&[if last { 0x80 } else { 0x00 }, 0x00, 0x00, 0x22]);
    // Min/max block size 4096
    bytes.extend_from_slice(&[0x10, 0x00, 0x10, 0x00]);
    // Min/max frame size unknown
    bytes.extend_from_slice(&[0; 6]);
    // 44100 Hz, 2 channels, 16 bits, 0 samples
    bytes.extend_from_slice(&[0x0A, 0xC4, 0x42, 0xF0, 0x00, 0x00, 0x00, 0x00]);
    // MD5 of the audio (none)
    bytes.extend_from_slice(&[0; 16]);
    bytes
}

/// Writes an untagged M4A: `ftyp`, a `moov` holding only `mvhd`, and an empty `mdat`.
pub fn write_minimal_m4a(dir: &Path, name: &str) -> PathBuf {
    fn atom(kind: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let len = u32::try_from(body.len() + 8).expect("atom fits in u32");
        let mut out = len.to_be_bytes().to_vec();
        out.extend_from_slice(kind);
        out.extend_from_slice(body);
        out
    }

    let mut ftyp = b"M4A ".to_vec();
    ftyp.extend_from_slice(&[0, 0, 0, 0]);
    ftyp.extend_from_slice(b"M4A isom");

    let mut mvhd = vec![0; 100];
    // Timescale 1000
    mvhd[12..16].copy_from_slice(&1000u32.to_be_bytes());
    // Rate 1.0, volume 1.0
    mvhd[20..24].copy_from_slice(&0x0001_0000u32.to_be_bytes());
    mvhd[24..26].copy_from_slice(&0x0100u16.to_be_bytes());
    // Identity matrix
    mvhd[36..40].copy_from_slice(&0x0001_0000u32.to_be_bytes());
    mvhd[52..56].copy_from_slice(&0x0001_0000u32.to_be_bytes());
    mvhd[68..72].copy_from_slice(&0x4000_0000u32.to_be_bytes());
    // Next track ID
    mvhd[96..100].copy_from_slice(&1u32.to_be_bytes());

    let mut bytes = atom(b"ftyp", &ftyp);
    bytes.extend(atom(b"moov", &atom(b"mvhd", &mvhd)));
    bytes.extend(atom(b"mdat", &[]));
    write_fixture(dir, name, &bytes)
}

fn write_fixture(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).expect("Failed to write audio fixture");
    path
}

/// Writes an untagged MP3 of three silent MPEG-1 Layer III frames (128 kbps, 44.1 kHz).
pub fn write_minimal_mp3(dir: &Path, name: &str) -> PathBuf {
    const FRAME_LEN: usize = 417;
    let mut bytes = Vec::with_capacity(FRAME_LEN * 3);
    for _ in 0..3 {
        bytes.extend_from_slice(&[0xFF, 0xFB, 0x90, 0x00]);
        bytes.extend_from_slice(&[0; FRAME_LEN - 4]);
    }

    write_fixture(dir, name, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_temp_db_creates_working_database() {
        let (pool, _dir) = temp_db().await;

        let songs = db::load_heal_candidates(&pool, 10).await.unwrap();
        assert!(songs.is_empty());
    }

    #[tokio::test]
    async fn test_insert_test_song_with_artist_and_lyrics() {
        let (pool, dir) = temp_db().await;
        let path = dir.path().join("a.mp3");

        let id = insert_test_song(&pool, Some("Test Artist"), complete_song("A", &path)).await;
        insert_lyrics_source(&pool, id, "netease", "[00:01.00]la").await;

        let song = db::load_song(&pool, id).await.unwrap().unwrap();
        assert_eq!(song.artist_name(), "Test Artist");
        assert_eq!(song.first_lyrics(), Some("[00:01.00]la"));
        assert_eq!(song.publish_time, Some(date(2020, 1, 1)));
    }

    #[test]
    fn test_fixture_files_have_expected_magic() {
        let dir = tempfile::tempdir().unwrap();
        let flac = std::fs::read(write_minimal_flac(dir.path(), "a.flac")).unwrap();
        assert_eq!(&flac[..4], b"fLaC");
        assert_eq!(flac.len(), 62);
        assert_eq!(flac[4] & 0x80, 0, "STREAMINFO is not the last block");

        let bare = std::fs::read(write_unpadded_flac(dir.path(), "b.flac")).unwrap();
        assert_eq!(bare.len(), 42);
        assert_eq!(bare[4] & 0x80, 0x80);

        let m4a = std::fs::read(write_minimal_m4a(dir.path(), "a.m4a")).unwrap();
        assert_eq!(&m4a[4..8], b"ftyp");
        assert_eq!(&m4a[28..32], b"moov");

        let mp3 = std::fs::read(write_minimal_mp3(dir.path(), "a.mp3")).unwrap();
        assert_eq!(&mp3[..2], &[0xFF, 0xFB]);
        assert_eq!(mp3.len(), 417 * 3);

        assert!(TINY_PNG.starts_with(b"\x89PNG"));
        assert!(TINY_JPEG.starts_with(&[0xFF, 0xD8]));
    }
}
