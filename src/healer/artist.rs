//! Avatar and cover localization passes.
//!
//! These reuse the batch shape of [`Healer::heal_all`] (cooperation point,
//! progress per item, cancel finishes as completed) over a list of ids.

use std::future::Future;

use super::{BatchReport, HealOutcome, Healer};
use crate::cover::CacheFolder;
use crate::db;
use crate::error::{Error, Result, ResultExt};
use crate::model::Artist;

/// Task type of the artist-avatar pass.
pub const AVATARS_TASK: &str = "heal_avatars";

/// Task type of the cover-localization pass.
pub const COVERS_TASK: &str = "heal_covers";

impl Healer {
    /// Localize one artist's avatar. `Ok(true)` when it was moved into the cache.
    pub async fn heal_artist(&self, artist_id: i64) -> Result<bool> {
        let mut artist = db::load_artist(&self.pool, artist_id)
            .await
            .with_context(format!("loading artist {artist_id}"))?
            .ok_or_else(|| Error::artist_not_found(artist_id))?;
        self.localize_avatar(&mut artist).await
    }

    async fn localize_avatar(&self, artist: &mut Artist) -> Result<bool> {
        if !artist.has_remote_avatar() {
            return Ok(false);
        }
        let Some(url) = artist.avatar.clone() else {
            return Ok(false);
        };

        tracing::info!(target: "healer", artist_id = artist.id, name = %artist.name, "Localizing avatar");
        let Some(image) = self.materializer.materialize(&url, CacheFolder::Avatars).await else {
            return Ok(false);
        };

        artist.avatar = Some(image.public_ref.clone());
        for source in &mut artist.sources {
            source.avatar = Some(image.public_ref.clone());
        }
        db::save_artist(&self.pool, artist)
            .await
            .with_context(format!("saving artist {}", artist.id))?;

        tracing::info!(target: "healer", artist_id = artist.id, avatar = %image.public_ref, "Avatar localized");
        Ok(true)
    }

    /// Localize the avatar of every artist that still has a remote one.
    pub async fn heal_artist_avatars(&self) -> Result<BatchReport> {
        let ids = db::artists_with_remote_avatars(&self.pool)
            .await
            .with_context("listing remote avatars")?;
        self.run_tracked(AVATARS_TASK, "avatars", ids, |id| self.heal_artist(id))
            .await
    }

    /// Run the heal cycle over songs whose cover is still remote, counting
    /// the ones whose cover ended up in the cache.
    pub async fn heal_remote_covers(&self, limit: u32) -> Result<BatchReport> {
        let ids = db::songs_with_remote_covers(&self.pool, limit.max(1))
            .await
            .with_context("listing remote covers")?;
        self.run_tracked(COVERS_TASK, "covers", ids, |id| async move {
            let outcome = self.heal_song(id, false).await?;
            Ok(matches!(outcome, HealOutcome::Healed(fields) if fields.contains(&"cover")))
        })
        .await
    }

    /// Drive `step` over `ids` under a monitored task.
    async fn run_tracked<F, Fut>(
        &self,
        task_type: &str,
        noun: &str,
        ids: Vec<i64>,
        mut step: F,
    ) -> Result<BatchReport>
    where
        F: FnMut(i64) -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let task_id = self
            .monitor
            .start(task_type, &format!("Localizing {} {noun}", ids.len()));
        let mut report = BatchReport {
            total: ids.len() as u32,
            ..Default::default()
        };

        for id in ids {
            if self.monitor.check(&task_id).await.is_err() {
                report.cancelled = true;
                break;
            }

            match step(id).await {
                Ok(true) => report.healed += 1,
                Ok(false) => {}
                Err(e) => tracing::error!(target: "healer", task_type, id, error = %e, "Localization failed"),
            }

            report.processed += 1;
            self.monitor.update(
                &task_id,
                report.percent(),
                Some(&format!("{}/{} {noun}", report.processed, report.total)),
                Some(report.details()),
            );
        }

        let verb = if report.cancelled { "cancelled" } else { "finished" };
        let message = format!("Localization {verb}, {} {noun} localized", report.healed);
        tracing::info!(target: "healer", task_type, healed = report.healed, processed = report.processed, "{message}");
        self.monitor.finish(&task_id, &message, Some(report.details()));
        Ok(report)
    }
}
