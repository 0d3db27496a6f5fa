//! Database module for song, artist, and source persistence.
//!
//! Uses SQLx with SQLite for lightweight, embedded database storage.
//! Songs and artists are loaded as whole aggregates (with their sources)
//! and saved back in a single transaction, which is the commit point of a
//! heal cycle.
//!
//! # Example
//!
//! ```ignore
//! use music_monitor::db::{init_db, load_song, save_song};
//!
//! let pool = init_db("sqlite:music_monitor.db").await?;
//! let mut song = load_song(&pool, 1).await?.unwrap();
//! song.album = Some("Piano Works".into());
//! save_song(&pool, &mut song).await?;
//! ```

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::model::{Artist, ArtistSource, Song, SongSource, SourceData};

/// Default database filename.
pub const DEFAULT_DB_NAME: &str = "music_monitor.db";

/// Storage format for `publish_time`.
const PUBLISH_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Build a SQLite database URL from an optional path.
///
/// If no path is provided, uses [`DEFAULT_DB_NAME`] in the current directory.
pub fn db_url(path: Option<&std::path::Path>) -> String {
    match path {
        Some(p) => format!("sqlite:{}", p.display()),
        None => format!("sqlite:{}", DEFAULT_DB_NAME),
    }
}

/// Initialize the database connection pool and run migrations.
///
/// Creates the database file if it doesn't exist, establishes a connection
/// pool with up to 5 connections, and runs all pending migrations.
pub async fn init_db(db_url: &str) -> Result<SqlitePool, sqlx::Error> {
    if !sqlx::Sqlite::database_exists(db_url).await.unwrap_or(false) {
        sqlx::Sqlite::create_database(db_url).await?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

// ============================================================================
// Timestamp encoding
// ============================================================================

pub(crate) fn encode_publish_time(value: Option<NaiveDateTime>) -> Option<String> {
    value.map(|v| v.format(PUBLISH_TIME_FORMAT).to_string())
}

pub(crate) fn decode_publish_time(value: Option<&str>) -> Option<NaiveDateTime> {
    let raw = value?.trim();
    NaiveDateTime::parse_from_str(raw, PUBLISH_TIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(raw.get(..10)?, "%Y-%m-%d")
                .ok()?
                .and_hms_opt(0, 0, 0)
        })
}

fn decode_rfc3339(value: Option<&str>) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value?)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ============================================================================
// Row types
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
struct SongRow {
    id: i64,
    artist_id: Option<i64>,
    title: String,
    album: Option<String>,
    cover: Option<String>,
    publish_time: Option<String>,
    local_path: Option<String>,
    last_enrich_at: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct SongSourceRow {
    id: i64,
    song_id: i64,
    source: String,
    source_id: String,
    url: Option<String>,
    cover: Option<String>,
    data_json: Option<String>,
}

impl From<SongSourceRow> for SongSource {
    fn from(row: SongSourceRow) -> Self {
        let mut source = SongSource::new(
            Some(row.id),
            row.song_id,
            row.source,
            row.source_id,
            SourceData::parse(row.data_json.as_deref()),
        );
        source.url = row.url;
        source.cover = row.cover;
        source
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ArtistRow {
    id: i64,
    name: String,
    avatar: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct ArtistSourceRow {
    id: i64,
    artist_id: i64,
    source: String,
    source_id: String,
    avatar: Option<String>,
    url: Option<String>,
}

impl From<ArtistSourceRow> for ArtistSource {
    fn from(row: ArtistSourceRow) -> Self {
        ArtistSource {
            id: row.id,
            artist_id: row.artist_id,
            source: row.source,
            source_id: row.source_id,
            avatar: row.avatar,
            url: row.url,
        }
    }
}

const SONG_COLUMNS: &str =
    "id, artist_id, title, album, cover, publish_time, local_path, last_enrich_at";

// ============================================================================
// Song aggregate
// ============================================================================

async fn hydrate_song(pool: &SqlitePool, row: SongRow) -> sqlx::Result<Song> {
    let artist = match row.artist_id {
        Some(artist_id) => sqlx::query_as::<_, ArtistRow>(
            "SELECT id, name, avatar FROM artists WHERE id = ?",
        )
        .bind(artist_id)
        .fetch_optional(pool)
        .await?
        .map(|a| Artist {
            id: a.id,
            name: a.name,
            avatar: a.avatar,
            sources: Vec::new(),
        }),
        None => None,
    };

    let sources = sqlx::query_as::<_, SongSourceRow>(
        "SELECT id, song_id, source, source_id, url, cover, data_json
         FROM song_sources WHERE song_id = ? ORDER BY id",
    )
    .bind(row.id)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(SongSource::from)
    .collect();

    Ok(Song {
        id: row.id,
        title: row.title,
        album: row.album,
        cover: row.cover,
        publish_time: decode_publish_time(row.publish_time.as_deref()),
        local_path: row.local_path,
        last_enrich_at: decode_rfc3339(row.last_enrich_at.as_deref()),
        artist,
        sources,
    })
}

/// Load a song with its artist and sources.
pub async fn load_song(pool: &SqlitePool, song_id: i64) -> sqlx::Result<Option<Song>> {
    let row: Option<SongRow> =
        sqlx::query_as(&format!("SELECT {SONG_COLUMNS} FROM songs WHERE id = ?"))
            .bind(song_id)
            .fetch_optional(pool)
            .await?;

    match row {
        Some(row) => Ok(Some(hydrate_song(pool, row).await?)),
        None => Ok(None),
    }
}

/// Load heal candidates: songs with a local file, in id order, capped at `cap`.
pub async fn load_heal_candidates(pool: &SqlitePool, cap: u32) -> sqlx::Result<Vec<Song>> {
    let rows: Vec<SongRow> = sqlx::query_as(&format!(
        "SELECT {SONG_COLUMNS} FROM songs WHERE local_path IS NOT NULL ORDER BY id LIMIT ?"
    ))
    .bind(cap as i64)
    .fetch_all(pool)
    .await?;

    let mut songs = Vec::with_capacity(rows.len());
    for row in rows {
        songs.push(hydrate_song(pool, row).await?);
    }
    Ok(songs)
}

/// IDs of songs whose cover is still a remote or proxy URL.
pub async fn songs_with_remote_covers(pool: &SqlitePool, limit: u32) -> sqlx::Result<Vec<i64>> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT id FROM songs
         WHERE cover LIKE 'http%' OR cover LIKE '/api/discovery/cover%'
         ORDER BY id LIMIT ?",
    )
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Persist a song aggregate in one transaction.
///
/// Writes the song columns, inserts sources that have no id yet, and
/// rewrites `data_json` only for sources flagged with
/// [`SongSource::mark_data_modified`]. Flags are cleared after commit.
pub async fn save_song(pool: &SqlitePool, song: &mut Song) -> sqlx::Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        "UPDATE songs SET title = ?, album = ?, cover = ?, publish_time = ?, last_enrich_at = ?
         WHERE id = ?",
    )
    .bind(&song.title)
    .bind(&song.album)
    .bind(&song.cover)
    .bind(encode_publish_time(song.publish_time))
    .bind(song.last_enrich_at.map(|t| t.to_rfc3339()))
    .bind(song.id)
    .execute(&mut *tx)
    .await?;

    for source in song.sources.iter_mut() {
        match source.id {
            None => {
                let (id,): (i64,) = sqlx::query_as(
                    r#"
                    INSERT INTO song_sources (song_id, source, source_id, url, cover, data_json)
                    VALUES (?, ?, ?, ?, ?, ?)
                    ON CONFLICT(song_id, source, source_id) DO UPDATE SET
                        url = excluded.url,
                        cover = excluded.cover,
                        data_json = excluded.data_json
                    RETURNING id
                    "#,
                )
                .bind(song.id)
                .bind(&source.source)
                .bind(&source.source_id)
                .bind(&source.url)
                .bind(&source.cover)
                .bind(source.data().to_json())
                .fetch_one(&mut *tx)
                .await?;
                source.id = Some(id);
                source.song_id = song.id;
            }
            Some(id) if source.is_data_modified() => {
                sqlx::query(
                    "UPDATE song_sources SET url = ?, cover = ?, data_json = ? WHERE id = ?",
                )
                .bind(&source.url)
                .bind(&source.cover)
                .bind(source.data().to_json())
                .bind(id)
                .execute(&mut *tx)
                .await?;
            }
            Some(id) => {
                sqlx::query("UPDATE song_sources SET url = ?, cover = ? WHERE id = ?")
                    .bind(&source.url)
                    .bind(&source.cover)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
        }
    }

    tx.commit().await?;

    for source in song.sources.iter_mut() {
        source.clear_modified();
    }
    Ok(())
}

// ============================================================================
// Artist aggregate
// ============================================================================

/// Load an artist with its sources.
pub async fn load_artist(pool: &SqlitePool, artist_id: i64) -> sqlx::Result<Option<Artist>> {
    let Some(row) = sqlx::query_as::<_, ArtistRow>(
        "SELECT id, name, avatar FROM artists WHERE id = ?",
    )
    .bind(artist_id)
    .fetch_optional(pool)
    .await?
    else {
        return Ok(None);
    };

    let sources = sqlx::query_as::<_, ArtistSourceRow>(
        "SELECT id, artist_id, source, source_id, avatar, url
         FROM artist_sources WHERE artist_id = ? ORDER BY id",
    )
    .bind(artist_id)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(ArtistSource::from)
    .collect();

    Ok(Some(Artist {
        id: row.id,
        name: row.name,
        avatar: row.avatar,
        sources,
    }))
}

/// IDs of artists whose avatar is still a remote URL.
pub async fn artists_with_remote_avatars(pool: &SqlitePool) -> sqlx::Result<Vec<i64>> {
    let rows: Vec<(i64,)> =
        sqlx::query_as("SELECT id FROM artists WHERE avatar LIKE 'http%' ORDER BY id")
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Persist an artist's avatar and its sources' avatars in one transaction.
pub async fn save_artist(pool: &SqlitePool, artist: &Artist) -> sqlx::Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("UPDATE artists SET name = ?, avatar = ? WHERE id = ?")
        .bind(&artist.name)
        .bind(&artist.avatar)
        .bind(artist.id)
        .execute(&mut *tx)
        .await?;

    for source in &artist.sources {
        sqlx::query("UPDATE artist_sources SET avatar = ? WHERE id = ?")
            .bind(&source.avatar)
            .bind(source.id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await
}

// ============================================================================
// Inserts used by the import path
// ============================================================================

/// Insert an artist and return its ID.
pub async fn insert_artist(
    pool: &SqlitePool,
    name: &str,
    avatar: Option<&str>,
) -> sqlx::Result<i64> {
    let result = sqlx::query("INSERT INTO artists (name, avatar) VALUES (?, ?)")
        .bind(name)
        .bind(avatar)
        .execute(pool)
        .await?;
    Ok(result.last_insert_rowid())
}

/// Insert an artist source and return its ID.
pub async fn insert_artist_source(
    pool: &SqlitePool,
    artist_id: i64,
    source: &str,
    source_id: &str,
    avatar: Option<&str>,
) -> sqlx::Result<i64> {
    let result = sqlx::query(
        "INSERT INTO artist_sources (artist_id, source, source_id, avatar) VALUES (?, ?, ?, ?)",
    )
    .bind(artist_id)
    .bind(source)
    .bind(source_id)
    .bind(avatar)
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Fields for a newly imported song.
#[derive(Debug, Clone, Default)]
pub struct NewSong {
    pub artist_id: Option<i64>,
    pub title: String,
    pub album: Option<String>,
    pub cover: Option<String>,
    pub publish_time: Option<NaiveDateTime>,
    pub local_path: Option<String>,
}

/// Insert a song and return its ID.
pub async fn insert_song(pool: &SqlitePool, song: &NewSong) -> sqlx::Result<i64> {
    let result = sqlx::query(
        "INSERT INTO songs (artist_id, title, album, cover, publish_time, local_path)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(song.artist_id)
    .bind(&song.title)
    .bind(&song.album)
    .bind(&song.cover)
    .bind(encode_publish_time(song.publish_time))
    .bind(&song.local_path)
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Insert a song source with a raw `data_json` document and return its ID.
pub async fn insert_song_source(
    pool: &SqlitePool,
    song_id: i64,
    source: &str,
    source_id: &str,
    data_json: Option<&str>,
) -> sqlx::Result<i64> {
    let result = sqlx::query(
        "INSERT INTO song_sources (song_id, source, source_id, data_json) VALUES (?, ?, ?, ?)",
    )
    .bind(song_id)
    .bind(source)
    .bind(source_id)
    .bind(data_json)
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::data_keys;
    use crate::test_utils::temp_db;

    #[test]
    fn test_publish_time_encoding() {
        let dt = NaiveDate::from_ymd_opt(2018, 5, 4)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let encoded = encode_publish_time(Some(dt)).unwrap();
        assert_eq!(encoded, "2018-05-04T00:00:00");
        assert_eq!(decode_publish_time(Some(&encoded)), Some(dt));
        assert_eq!(decode_publish_time(Some("2018-05-04")), Some(dt));
        assert_eq!(decode_publish_time(Some("garbage")), None);
    }

    #[tokio::test]
    async fn test_init_db_creates_database() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db_url = format!("sqlite:{}", db_path.display());

        let pool = init_db(&db_url).await.expect("Failed to init db");
        assert!(db_path.exists());

        let songs = load_heal_candidates(&pool, 10).await.unwrap();
        assert!(songs.is_empty());
    }

    #[tokio::test]
    async fn test_load_song_with_relations() {
        let (pool, _dir) = temp_db().await;
        let artist_id = insert_artist(&pool, "Jay Chou", None).await.unwrap();
        let song_id = insert_song(
            &pool,
            &NewSong {
                artist_id: Some(artist_id),
                title: "Rice Field".into(),
                local_path: Some("/music/rice.mp3".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        insert_song_source(&pool, song_id, "netease", "186", Some(r#"{"lyrics":"hi"}"#))
            .await
            .unwrap();

        let song = load_song(&pool, song_id).await.unwrap().unwrap();
        assert_eq!(song.artist_name(), "Jay Chou");
        assert_eq!(song.sources.len(), 1);
        assert_eq!(song.first_lyrics(), Some("hi"));
        assert!(load_song(&pool, 9999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unflagged_data_json_is_not_persisted() {
        let (pool, _dir) = temp_db().await;
        let song_id = insert_song(
            &pool,
            &NewSong {
                title: "Song".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        insert_song_source(&pool, song_id, "qqmusic", "q1", Some("{}"))
            .await
            .unwrap();

        let mut song = load_song(&pool, song_id).await.unwrap().unwrap();
        song.sources[0].data_mut().set_str(data_keys::LYRICS, "lost");
        save_song(&pool, &mut song).await.unwrap();
        let reloaded = load_song(&pool, song_id).await.unwrap().unwrap();
        assert_eq!(reloaded.first_lyrics(), None);

        let mut song = reloaded;
        song.sources[0].data_mut().set_str(data_keys::LYRICS, "kept");
        song.sources[0].mark_data_modified();
        save_song(&pool, &mut song).await.unwrap();
        assert!(!song.sources[0].is_data_modified());
        let reloaded = load_song(&pool, song_id).await.unwrap().unwrap();
        assert_eq!(reloaded.first_lyrics(), Some("kept"));
    }

    #[tokio::test]
    async fn test_save_song_inserts_new_sources() {
        let (pool, _dir) = temp_db().await;
        let song_id = insert_song(
            &pool,
            &NewSong {
                title: "Song".into(),
                local_path: Some("/music/song.flac".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let mut song = load_song(&pool, song_id).await.unwrap().unwrap();
        let mut local = SongSource::local(song.id, song.local_path.as_deref());
        local.data_mut().set_str(data_keys::LYRICS, "words");
        song.sources.push(local);
        song.album = Some("Album".into());
        song.stamp_enriched();
        save_song(&pool, &mut song).await.unwrap();
        assert!(song.sources[0].is_persisted());

        let reloaded = load_song(&pool, song_id).await.unwrap().unwrap();
        assert_eq!(reloaded.album.as_deref(), Some("Album"));
        assert!(reloaded.last_enrich_at.is_some());
        assert_eq!(reloaded.sources[0].source_id, "/music/song.flac");
        assert_eq!(reloaded.first_lyrics(), Some("words"));
    }

    #[tokio::test]
    async fn test_artist_avatar_roundtrip() {
        let (pool, _dir) = temp_db().await;
        let artist_id = insert_artist(&pool, "Artist", Some("https://img/a.jpg"))
            .await
            .unwrap();
        insert_artist_source(&pool, artist_id, "qqmusic", "mid", Some("https://img/a.jpg"))
            .await
            .unwrap();

        assert_eq!(artists_with_remote_avatars(&pool).await.unwrap(), vec![artist_id]);

        let mut artist = load_artist(&pool, artist_id).await.unwrap().unwrap();
        artist.avatar = Some("/uploads/avatars/x.jpg".into());
        artist.sources[0].avatar = artist.avatar.clone();
        save_artist(&pool, &artist).await.unwrap();

        let reloaded = load_artist(&pool, artist_id).await.unwrap().unwrap();
        assert_eq!(reloaded.sources[0].avatar.as_deref(), Some("/uploads/avatars/x.jpg"));
        assert!(artists_with_remote_avatars(&pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_candidates_require_local_path() {
        let (pool, _dir) = temp_db().await;
        insert_song(
            &pool,
            &NewSong {
                title: "Remote only".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let with_file = insert_song(
            &pool,
            &NewSong {
                title: "On disk".into(),
                local_path: Some("/music/x.mp3".into()),
                cover: Some("https://cdn/x.jpg".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let candidates = load_heal_candidates(&pool, 10).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, with_file);
        assert_eq!(songs_with_remote_covers(&pool, 10).await.unwrap(), vec![with_file]);
    }
}
