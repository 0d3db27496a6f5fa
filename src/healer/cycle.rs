//! The per-song heal cycle.

use std::path::Path;

use super::{HealOutcome, Healer, ensure_source, query_from_filename};
use crate::cover::CacheFolder;
use crate::db;
use crate::enrichment::merger::{is_garbage, is_invalid_date};
use crate::enrichment::{BestMatch, SongMetadata, UpdateSet, merge};
use crate::error::{Result, ResultExt};
use crate::metadata::{self, TagBundle, TagDate, TagWrite};
use crate::model::{Song, data_keys};

impl Healer {
    /// Heal one song.
    ///
    /// Queries the aggregator (falling back to a filename-derived query),
    /// merges, localizes the cover, writes tags and commits. Cover and tag
    /// failures are logged and do not stop the cycle; the database save at
    /// the end is the only commit point.
    pub async fn heal_song(&self, song_id: i64, force: bool) -> Result<HealOutcome> {
        let Some(mut song) = db::load_song(&self.pool, song_id)
            .await
            .with_context(format!("loading song {song_id}"))?
        else {
            tracing::error!(target: "healer", song_id, "Song not found");
            return Ok(HealOutcome::NotFound);
        };
        tracing::info!(target: "healer", song_id, title = %song.title, force, "Healing song");

        let file = self.audio_file(&song);
        let current = current_metadata(&song);

        let Some(best) = self.lookup(&song, file.as_deref()).await else {
            tracing::warn!(target: "healer", song_id, title = %song.title, "No metadata match");
            self.commit(&mut song).await?;
            return Ok(HealOutcome::NoMatch);
        };

        let candidate = best.to_metadata();
        let mut updates = merge(&current, &candidate);
        if updates.cover.is_none() && song.has_remote_cover() {
            updates.cover = candidate.cover_url.clone().or_else(|| song.cover.clone());
        }

        if updates.is_empty() {
            tracing::info!(target: "healer", song_id, "Metadata already up to date");
            self.commit(&mut song).await?;
            return Ok(HealOutcome::Unchanged);
        }

        let previous_cover = song.cover.clone();
        let cover_data = self.localize_cover(&mut song, updates.cover.as_deref()).await;
        let cover_applied = song.cover != previous_cover;

        if let Some(album) = &updates.album {
            song.album = Some(album.clone());
        }
        if let Some(publish_time) = updates.publish_time {
            song.publish_time = Some(publish_time);
        }

        let final_lyrics = updates
            .lyrics
            .clone()
            .or_else(|| candidate.lyrics.clone())
            .or_else(|| current.lyrics.clone());

        if let Some(path) = file {
            let on_disk = match metadata::read(path.clone()).await {
                Ok(tags) => tags,
                Err(e) => {
                    tracing::debug!(target: "healer", song_id, path = %path.display(), error = %e, "Current tags unreadable");
                    TagBundle::default()
                }
            };
            let tags = file_tags(&song, &updates, final_lyrics.as_deref(), cover_data, &on_disk);
            if !tags.is_empty() {
                match metadata::write(path.clone(), tags).await {
                    Ok(()) => {
                        tracing::info!(target: "healer", song_id, path = %path.display(), "Tags written")
                    }
                    Err(e) => {
                        tracing::error!(target: "healer", song_id, path = %path.display(), error = %e, "Tag write failed")
                    }
                }
            }
        }

        sync_sources(&mut song, final_lyrics.as_deref(), &updates);

        self.commit(&mut song).await?;

        let mut applied = updates.fields();
        if !cover_applied {
            applied.retain(|field| *field != "cover");
        }
        if applied.is_empty() {
            return Ok(HealOutcome::Unchanged);
        }
        tracing::info!(target: "healer", song_id, fields = ?applied, "Song healed");
        Ok(HealOutcome::Healed(applied))
    }

    /// Primary query, then the filename fallback. Errors count as no match.
    async fn lookup(&self, song: &Song, file: Option<&Path>) -> Option<BestMatch> {
        if let Some(best) = self.query(&song.title, song.artist_name()).await {
            return Some(best);
        }

        let path = file.or_else(|| song.local_path.as_deref().map(Path::new))?;
        let query = query_from_filename(path)?;
        if query == song.title.trim() {
            return None;
        }
        tracing::info!(target: "healer", song_id = song.id, query = %query, "Retrying with filename query");
        self.query(&query, "").await
    }

    async fn query(&self, title: &str, artist: &str) -> Option<BestMatch> {
        match self.aggregator.best_match(title, artist).await {
            Ok(best) if best.success => Some(best),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(target: "healer", title, artist, error = %e, "Aggregator lookup failed");
                None
            }
        }
    }

    /// Point `song.cover` at a cached file.
    ///
    /// Tries the wanted URL first, then the song's own remote cover. Returns
    /// the image bytes when something was downloaded or read from the cache.
    async fn localize_cover(&self, song: &mut Song, wanted: Option<&str>) -> Option<Vec<u8>> {
        let current = song.cover.clone().filter(|_| song.has_remote_cover());
        let mut urls: Vec<&str> = wanted.into_iter().collect();
        if let Some(current) = current.as_deref() {
            if !urls.contains(&current) {
                urls.push(current);
            }
        }

        for url in urls {
            if CacheFolder::Covers.owns(url) {
                song.cover = Some(url.to_string());
                return None;
            }
            if let Some(image) = self.materializer.materialize(url, CacheFolder::Covers).await {
                tracing::debug!(target: "healer", song_id = song.id, cover = %image.public_ref, "Cover localized");
                song.cover = Some(image.public_ref);
                return Some(image.data);
            }
        }
        None
    }

    async fn commit(&self, song: &mut Song) -> Result<()> {
        song.stamp_enriched();
        db::save_song(&self.pool, song)
            .await
            .with_context(format!("saving song {}", song.id))
    }
}

/// Stored side of the merge; lyrics come from the first source carrying any.
fn current_metadata(song: &Song) -> SongMetadata {
    SongMetadata {
        title: Some(song.title.clone()),
        artist: song.artist.as_ref().map(|a| a.name.clone()),
        album: song.album.clone(),
        cover_url: song.cover.clone(),
        cover_size_bytes: None,
        publish_time: song.publish_time,
        lyrics: song.first_lyrics().map(str::to_string),
    }
}

/// Tags to write back: the update set and the new cover, plus stored values
/// for fields the file lacks. An on-disk placeholder album counts as lacking.
fn file_tags(
    song: &Song,
    updates: &UpdateSet,
    lyrics: Option<&str>,
    cover: Option<Vec<u8>>,
    on_disk: &TagBundle,
) -> TagWrite {
    fn fill(missing: bool, stored: Option<String>) -> Option<String> {
        stored.filter(|_| missing)
    }

    let stored_album = song
        .album
        .clone()
        .filter(|album| !is_garbage(Some(album.as_str())));
    let stored_date = song
        .publish_time
        .filter(|date| !is_invalid_date(Some(*date)));

    TagWrite {
        title: fill(on_disk.title.is_none(), Some(song.title.clone())),
        artist: fill(
            on_disk.artist.is_none(),
            song.artist.as_ref().map(|a| a.name.clone()),
        ),
        album: updates
            .album
            .clone()
            .or_else(|| fill(is_garbage(on_disk.album.as_deref()), stored_album)),
        date: updates
            .publish_time
            .or_else(|| stored_date.filter(|_| on_disk.date.is_none()))
            .map(TagDate::Timestamp),
        lyrics: updates
            .lyrics
            .clone()
            .or_else(|| fill(on_disk.lyrics.is_none(), lyrics.map(str::to_string))),
        cover,
    }
}

/// Mirror lyrics, album and the local cover into every source.
///
/// A source takes the merger's lyrics when it picked an upgrade, otherwise
/// the final lyrics only if it has none. Changed bags are flagged for save.
fn sync_sources(song: &mut Song, final_lyrics: Option<&str>, updates: &UpdateSet) {
    ensure_source(song);
    let local_cover = song
        .cover
        .clone()
        .filter(|cover| CacheFolder::Covers.owns(cover));

    for source in &mut song.sources {
        if let Some(cover) = &local_cover {
            source.cover = Some(cover.clone());
        }

        let data = source.data_mut();
        let mut changed = false;
        match (updates.lyrics.as_deref(), final_lyrics) {
            (Some(upgrade), _) if data.lyrics() != Some(upgrade) => {
                data.set_str(data_keys::LYRICS, upgrade);
                changed = true;
            }
            (None, Some(lyrics)) if data.lyrics().is_none() => {
                data.set_str(data_keys::LYRICS, lyrics);
                changed = true;
            }
            _ => {}
        }
        if let Some(album) = &updates.album {
            if data.get_str(data_keys::ALBUM) != Some(album.as_str()) {
                data.set_str(data_keys::ALBUM, album.clone());
                changed = true;
            }
        }
        if let Some(cover) = &local_cover {
            if data.get_str(data_keys::COVER) != Some(cover.as_str()) {
                data.set_str(data_keys::COVER, cover.clone());
                changed = true;
            }
        }

        if changed {
            source.mark_data_modified();
        }
    }
}
