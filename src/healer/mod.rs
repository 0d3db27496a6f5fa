//! Heal coordinator - brings songs to metadata completeness.
//!
//! A batch walks the songs that have a local file, in id order:
//!
//! 1. Cooperation point ([`TaskMonitor::check`]): pause blocks, cancel stops.
//! 2. Tag fast-path: lyrics found in the file but in no source are adopted
//!    without asking any provider.
//! 3. Completeness check ([`MissingFields`]); complete songs are skipped.
//! 4. Per-song heal cycle ([`Healer::heal_song`]).
//!
//! Progress goes out through the monitor after every candidate. A cancelled
//! batch still finishes as `completed`, carrying the partial counts.
//!
//! # Usage
//!
//! ```ignore
//! let healer = Healer::new(pool, aggregator, materializer, monitor, config.library);
//! let report = healer.heal_all(50, false).await?;
//! println!("healed {} of {}", report.healed, report.total);
//! ```

mod artist;
mod checks;
mod cycle;

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};
use sqlx::SqlitePool;

use crate::config::LibraryConfig;
use crate::cover::Materializer;
use crate::db;
use crate::enrichment::MetadataAggregator;
use crate::error::{Result, ResultExt};
use crate::metadata;
use crate::model::{Song, SongSource, data_keys};
use crate::tasks::TaskMonitor;

pub use artist::{AVATARS_TASK, COVERS_TASK};
pub use checks::{MissingFields, query_from_filename};

/// Task type of a heal batch.
pub const HEAL_TASK: &str = "heal";

/// Result of one per-song heal cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealOutcome {
    /// Fields were applied (names in the order the merger lists them)
    Healed(Vec<&'static str>),
    /// A match was found but nothing needed changing
    Unchanged,
    /// The aggregator had nothing, even after the filename fallback
    NoMatch,
    /// No song with that id
    NotFound,
}

impl HealOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Healed(_) | Self::Unchanged)
    }
}

/// Counters of a finished (or cancelled) batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub healed: u32,
    pub processed: u32,
    pub total: u32,
    pub cancelled: bool,
}

impl BatchReport {
    fn details(&self) -> Value {
        json!({
            "healed": self.healed,
            "processed": self.processed,
            "total": self.total,
            "cancelled": self.cancelled,
        })
    }

    fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        (self.processed.min(self.total) * 100 / self.total) as u8
    }
}

/// The heal coordinator. One instance can serve many batches, but callers
/// run at most one batch at a time.
pub struct Healer {
    pool: SqlitePool,
    aggregator: Arc<dyn MetadataAggregator>,
    materializer: Materializer,
    monitor: Arc<TaskMonitor>,
    library: LibraryConfig,
}

impl Healer {
    pub fn new(
        pool: SqlitePool,
        aggregator: Arc<dyn MetadataAggregator>,
        materializer: Materializer,
        monitor: Arc<TaskMonitor>,
        library: LibraryConfig,
    ) -> Self {
        Self {
            pool,
            aggregator,
            materializer,
            monitor,
            library,
        }
    }

    pub fn monitor(&self) -> &Arc<TaskMonitor> {
        &self.monitor
    }

    /// Heal up to `limit` songs.
    ///
    /// `force` is accepted for API symmetry; the coordinator does not
    /// rate-limit songs, so it changes nothing today.
    pub async fn heal_all(&self, limit: u32, force: bool) -> Result<BatchReport> {
        let limit = limit.max(1);
        let candidates = db::load_heal_candidates(&self.pool, limit.saturating_mul(2))
            .await
            .with_context("loading heal candidates")?;

        let task_id = self.monitor.start(HEAL_TASK, "Preparing metadata heal");
        let mut report = BatchReport {
            total: candidates.len() as u32,
            ..Default::default()
        };
        tracing::info!(
            target: "healer",
            task_id,
            candidates = report.total,
            limit,
            force,
            "Heal batch started"
        );

        match self
            .run_batch(&task_id, candidates, limit, force, &mut report)
            .await
        {
            Ok(()) => {
                let message = format!("Heal finished, {} songs healed", report.healed);
                tracing::info!(
                    target: "healer",
                    healed = report.healed,
                    processed = report.processed,
                    "Heal batch finished"
                );
                self.monitor.finish(&task_id, &message, Some(report.details()));
                Ok(report)
            }
            Err(e) if e.is_cancelled() => {
                report.cancelled = true;
                let message = format!("Heal cancelled, {} songs healed", report.healed);
                tracing::warn!(
                    target: "healer",
                    healed = report.healed,
                    processed = report.processed,
                    "Heal batch cancelled"
                );
                self.monitor.finish(&task_id, &message, Some(report.details()));
                Ok(report)
            }
            Err(e) => {
                self.monitor.error(&task_id, &e.to_string());
                Err(e)
            }
        }
    }

    async fn run_batch(
        &self,
        task_id: &str,
        candidates: Vec<Song>,
        limit: u32,
        force: bool,
        report: &mut BatchReport,
    ) -> Result<()> {
        for song in candidates {
            self.monitor.check(task_id).await?;

            let song_id = song.id;
            let title = song.title.clone();
            match self.process_candidate(song, force).await {
                Ok(true) => report.healed += 1,
                Ok(false) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::error!(target: "healer", song_id, title = %title, error = %e, "Heal failed");
                }
            }

            report.processed += 1;
            self.monitor.update(
                task_id,
                report.percent(),
                Some(&format!("Processed: {title}")),
                Some(report.details()),
            );

            if report.healed >= limit {
                break;
            }
        }
        Ok(())
    }

    /// Fast-path, completeness check, then the full cycle. `true` means healed.
    async fn process_candidate(&self, mut song: Song, force: bool) -> Result<bool> {
        let file = if song.has_lyrics() {
            None
        } else {
            self.audio_file(&song)
        };
        if let Some(path) = file {
            match metadata::read(path.clone()).await {
                Ok(tags) => {
                    if let Some(lyrics) = tags.lyrics {
                        self.adopt_file_lyrics(&mut song, &lyrics).await?;
                        return Ok(true);
                    }
                }
                Err(e) => {
                    tracing::warn!(target: "healer", path = %path.display(), error = %e, "Could not read tags");
                }
            }
        }

        let missing = MissingFields::of(&song);
        if missing.is_complete() {
            tracing::debug!(target: "healer", song_id = song.id, "Song complete, skipping");
            return Ok(false);
        }
        tracing::info!(target: "healer", song_id = song.id, title = %song.title, %missing, "Song incomplete");

        Ok(self.heal_song(song.id, force).await?.is_success())
    }

    /// Copy lyrics found in the file into every source and commit.
    async fn adopt_file_lyrics(&self, song: &mut Song, lyrics: &str) -> Result<()> {
        ensure_source(song);
        for source in &mut song.sources {
            source.data_mut().set_str(data_keys::LYRICS, lyrics);
            source.mark_data_modified();
        }
        song.stamp_enriched();
        db::save_song(&self.pool, song)
            .await
            .with_context(format!("saving lyrics for song {}", song.id))?;

        tracing::info!(target: "healer", song_id = song.id, title = %song.title, "Lyrics adopted from file tags");
        Ok(())
    }

    /// The song's audio file, if it exists inside a library root.
    fn audio_file(&self, song: &Song) -> Option<PathBuf> {
        let raw = song.local_path.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }
        let path = PathBuf::from(raw);
        if !path.is_file() {
            tracing::warn!(target: "healer", song_id = song.id, path = %path.display(), "Audio file missing");
            return None;
        }
        if !self.library.contains(&path) {
            tracing::warn!(target: "healer", song_id = song.id, path = %path.display(), "Audio file outside library roots");
            return None;
        }
        Some(path)
    }
}

/// Give a song its `local` source when it has none.
fn ensure_source(song: &mut Song) {
    if song.sources.is_empty() {
        tracing::debug!(target: "healer", song_id = song.id, "Creating local source");
        song.sources
            .push(SongSource::local(song.id, song.local_path.as_deref()));
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::harness::Harness;
    use super::*;
    use crate::cover::CacheFolder;
    use crate::cover::mocks::MockFetcher;
    use crate::db::NewSong;
    use crate::enrichment::traits::mocks::{MockAggregator, found};
    use crate::enrichment::{AggregatorError, BestMatch};
    use crate::metadata::{TagWrite, read_front_cover};
    use crate::model::LOCAL_SOURCE;
    use crate::tasks::{TaskEvent, TaskEvents, TaskState};
    use crate::test_utils::{
        TINY_JPEG, complete_song, insert_lyrics_source, insert_test_song, write_minimal_mp3,
    };

    fn drain(events: &mut TaskEvents) -> Vec<TaskEvent> {
        std::iter::from_fn(|| events.try_recv()).collect()
    }

    #[tokio::test]
    async fn test_batch_localizes_remote_cover() {
        let new_cover = "https://cdn/new.jpg";
        let h = Harness::new(
            Arc::new(MockAggregator::always(found("Real Album", Some(new_cover)))),
            MockFetcher::new().with_body(new_cover, TINY_JPEG),
        )
        .await;
        let mut events = h.monitor.subscribe();

        let path = write_minimal_mp3(h.dir.path(), "song.mp3");
        let id = insert_test_song(
            &h.pool,
            Some("Artist"),
            NewSong {
                cover: Some("https://cdn/example.jpg".into()),
                ..complete_song("Song", &path)
            },
        )
        .await;
        insert_lyrics_source(&h.pool, id, "qqmusic", "[00:01.00]la").await;

        let report = h.healer.heal_all(10, false).await.unwrap();
        assert_eq!(report.healed, 1);
        assert!(!report.cancelled);

        let expected = Harness::cached_ref(CacheFolder::Covers, new_cover);
        let song = db::load_song(&h.pool, id).await.unwrap().unwrap();
        assert_eq!(song.cover.as_deref(), Some(expected.as_str()));
        assert_eq!(song.sources[0].cover.as_deref(), Some(expected.as_str()));
        assert_eq!(song.sources[0].data().get_str(data_keys::COVER), Some(expected.as_str()));
        assert_eq!(read_front_cover(&path).unwrap(), Some(TINY_JPEG.to_vec()));

        let seen = drain(&mut events);
        let last = seen.last().unwrap();
        assert_eq!(last.data.state, TaskState::Completed);
        assert_eq!(last.data.task_type, HEAL_TASK);
        assert_eq!(last.data.progress, 100);
        assert_eq!(last.data.details["healed"], 1);
    }

    #[tokio::test]
    async fn test_fast_path_adopts_file_lyrics() {
        let aggregator = Arc::new(MockAggregator::no_matches());
        let h = Harness::new(aggregator.clone(), MockFetcher::new()).await;

        let path = write_minimal_mp3(h.dir.path(), "lyrics.mp3");
        metadata::write_blocking(
            &path,
            &TagWrite {
                lyrics: Some("hello\nworld".into()),
                ..Default::default()
            },
        )
        .unwrap();
        let id = insert_test_song(&h.pool, Some("Artist"), complete_song("Song", &path)).await;

        let report = h.healer.heal_all(10, false).await.unwrap();
        assert_eq!(report.healed, 1);
        assert_eq!(aggregator.call_count(), 0);

        let song = db::load_song(&h.pool, id).await.unwrap().unwrap();
        assert_eq!(song.sources.len(), 1);
        assert_eq!(song.sources[0].source, LOCAL_SOURCE);
        assert_eq!(song.sources[0].lyrics(), Some("hello\nworld"));
        assert!(song.last_enrich_at.is_some());
    }

    #[tokio::test]
    async fn test_fast_path_updates_existing_source() {
        let aggregator = Arc::new(MockAggregator::no_matches());
        let h = Harness::new(aggregator.clone(), MockFetcher::new()).await;

        let path = write_minimal_mp3(h.dir.path(), "lyrics.mp3");
        metadata::write_blocking(
            &path,
            &TagWrite {
                lyrics: Some("[00:02.00]words".into()),
                ..Default::default()
            },
        )
        .unwrap();
        let id = insert_test_song(&h.pool, Some("Artist"), complete_song("Song", &path)).await;
        db::insert_song_source(&h.pool, id, "netease", "n1", Some(r#"{"quality":"SQ"}"#))
            .await
            .unwrap();

        h.healer.heal_all(10, false).await.unwrap();

        let song = db::load_song(&h.pool, id).await.unwrap().unwrap();
        assert_eq!(song.sources.len(), 1);
        assert_eq!(song.sources[0].source, "netease");
        assert_eq!(song.sources[0].lyrics(), Some("[00:02.00]words"));
        assert_eq!(song.sources[0].data().get_str(data_keys::QUALITY), Some("SQ"));
        assert_eq!(aggregator.call_count(), 0);
    }

    #[tokio::test]
    async fn test_complete_songs_are_skipped() {
        let aggregator = Arc::new(MockAggregator::always(found("Other", None)));
        let h = Harness::new(aggregator.clone(), MockFetcher::new()).await;
        let mut events = h.monitor.subscribe();

        for n in 0..3 {
            let path = h.dir.path().join(format!("{n}.mp3"));
            let id = insert_test_song(&h.pool, Some("Artist"), complete_song("Song", &path)).await;
            insert_lyrics_source(&h.pool, id, "qqmusic", "[00:01.00]la").await;
        }

        let report = h.healer.heal_all(10, false).await.unwrap();
        assert_eq!(report.processed, 3);
        assert_eq!(report.healed, 0);
        assert_eq!(aggregator.call_count(), 0);

        let progress: Vec<u8> = drain(&mut events).iter().map(|e| e.data.progress).collect();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
        assert_eq!(progress.last(), Some(&100));
    }

    #[tokio::test]
    async fn test_batch_stops_at_limit() {
        let aggregator = Arc::new(MockAggregator::always(found("Real Album", None)));
        let h = Harness::new(aggregator.clone(), MockFetcher::new()).await;

        for n in 0..6 {
            let path = h.dir.path().join(format!("{n}.mp3"));
            insert_test_song(
                &h.pool,
                None,
                NewSong {
                    album: Some("Unknown".into()),
                    ..complete_song("Song", &path)
                },
            )
            .await;
        }

        let report = h.healer.heal_all(2, false).await.unwrap();
        assert_eq!(report.healed, 2);
        assert_eq!(report.processed, 2);
        // Candidates are capped at twice the limit.
        assert_eq!(report.total, 4);
    }

    #[tokio::test]
    async fn test_aggregator_errors_do_not_fail_batch() {
        let h = Harness::new(Arc::new(MockAggregator::failing()), MockFetcher::new()).await;
        let path = h.dir.path().join("a.mp3");
        let id = insert_test_song(&h.pool, None, NewSong {
            album: None,
            ..complete_song("Song", &path)
        })
        .await;

        let report = h.healer.heal_all(5, false).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.healed, 0);

        let song = db::load_song(&h.pool, id).await.unwrap().unwrap();
        assert!(song.last_enrich_at.is_some());
    }

    /// Cancels the running task from inside the n-th lookup.
    struct CancelOnCall {
        monitor: Arc<TaskMonitor>,
        events: Mutex<TaskEvents>,
        cancel_on: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MetadataAggregator for CancelOnCall {
        async fn best_match(&self, _: &str, _: &str) -> std::result::Result<BestMatch, AggregatorError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == self.cancel_on {
                let task_id = self.events.lock().try_recv().unwrap().data.task_id;
                assert!(self.monitor.cancel(&task_id));
            }
            Ok(found("Real Album", None))
        }
    }

    #[tokio::test]
    async fn test_cancel_finishes_with_partial_counts() {
        let monitor = Arc::new(TaskMonitor::new());
        let aggregator = Arc::new(CancelOnCall {
            monitor: monitor.clone(),
            events: Mutex::new(monitor.subscribe()),
            cancel_on: 7,
            calls: AtomicUsize::new(0),
        });
        let h = Harness::with_monitor(aggregator.clone(), MockFetcher::new(), monitor.clone()).await;
        let mut events = monitor.subscribe();

        for n in 0..50 {
            let path = h.dir.path().join(format!("{n}.mp3"));
            insert_test_song(
                &h.pool,
                None,
                NewSong {
                    album: Some("Unknown".into()),
                    ..complete_song(&format!("Song {n}"), &path)
                },
            )
            .await;
        }

        let report = h.healer.heal_all(50, false).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.processed, 7);
        assert!(report.healed <= 7);
        assert_eq!(aggregator.calls.load(Ordering::SeqCst), 7);

        let seen = drain(&mut events);
        let last = seen.last().unwrap();
        assert_eq!(last.data.state, TaskState::Completed);
        assert!(last.data.message.contains("cancelled"));
        assert_eq!(last.data.details["healed"], report.healed);
        assert!(!seen.iter().any(|e| e.data.state == TaskState::Error));
    }

    #[test]
    fn test_report_percent() {
        let report = BatchReport {
            processed: 1,
            total: 3,
            ..Default::default()
        };
        assert_eq!(report.percent(), 33);
        assert_eq!(BatchReport::default().percent(), 100);
    }
}
