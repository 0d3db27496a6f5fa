//! CLI command definitions and handlers.
//!
//! Each subcommand is implemented as a function that takes the parsed arguments
//! and returns an `anyhow::Result<()>`. Batch commands print task progress
//! events to stdout as JSON lines; logs go to stderr.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{self, Config};
use crate::cover::{self, CoverCache, Materializer, ReqwestFetcher};
use crate::enrichment::HttpAggregator;
use crate::error::Error;
use crate::healer::{BatchReport, HealOutcome, Healer};
use crate::tasks::TaskMonitor;
use crate::{db, metadata};

/// Music Monitor metadata healer
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Database path (overrides the config file)
    #[arg(long, global = true, env = "MUSIC_MONITOR_DB")]
    pub db: Option<PathBuf>,
    /// Cover cache root (overrides the config file)
    #[arg(long, global = true)]
    pub upload_root: Option<PathBuf>,
    /// Aggregator base URL (overrides the config file)
    #[arg(long, global = true, env = "MUSIC_MONITOR_AGGREGATOR")]
    pub aggregator: Option<String>,
    /// Config file (default: config.toml in the OS config directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand)]
pub enum Commands {
    /// Heal songs with missing or placeholder metadata
    Heal {
        /// Stop after this many songs were healed (default: heal.default_limit)
        #[arg(short, long)]
        limit: Option<u32>,
        /// Accepted for API parity; logged only
        #[arg(long)]
        force: bool,
    },
    /// Run the heal cycle for one song
    HealSong {
        /// Song ID
        id: i64,
        /// Accepted for API parity; logged only
        #[arg(long)]
        force: bool,
    },
    /// Move remote song covers into the local cover cache
    HealCovers {
        /// Maximum number of songs to visit
        #[arg(short, long, default_value = "1000")]
        limit: u32,
    },
    /// Move remote artist avatars into the local cache
    HealAvatars,
    /// Print the tags of an audio file
    Tags {
        /// Path to the audio file
        path: PathBuf,
    },
    /// Write the effective configuration to the config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Run the specified CLI command.
pub fn run_command(cli: &Cli) -> anyhow::Result<()> {
    let config = effective_config(cli);

    match &cli.command {
        Commands::Tags { path } => cmd_tags(path),
        Commands::InitConfig { force } => cmd_init_config(cli, &config, *force),
        Commands::HealSong { id, force } => {
            Runtime::new()?.block_on(cmd_heal_song(&config, *id, *force))
        }
        Commands::Heal { limit, force } => {
            let limit = limit.unwrap_or(config.heal.default_limit);
            Runtime::new()?.block_on(async {
                let session = Session::open(&config).await?;
                let result = session.healer.heal_all(limit, *force).await;
                session.close().await;
                print_report("Heal", &result?);
                Ok(())
            })
        }
        Commands::HealCovers { limit } => Runtime::new()?.block_on(async {
            let session = Session::open(&config).await?;
            let result = session.healer.heal_remote_covers(*limit).await;
            session.close().await;
            print_report("Cover localization", &result?);
            Ok(())
        }),
        Commands::HealAvatars => Runtime::new()?.block_on(async {
            let session = Session::open(&config).await?;
            let result = session.healer.heal_artist_avatars().await;
            session.close().await;
            print_report("Avatar localization", &result?);
            Ok(())
        }),
    }
}

/// Config file values with command-line overrides applied.
fn effective_config(cli: &Cli) -> Config {
    let mut config = match &cli.config {
        Some(path) => config::load_from(path),
        None => config::load(),
    };
    if let Some(db) = &cli.db {
        config.storage.database = db.clone();
    }
    if let Some(root) = &cli.upload_root {
        config.storage.upload_root = root.clone();
    }
    if let Some(url) = &cli.aggregator {
        config.aggregator.base_url = Some(url.clone());
    }
    config
}

// ============================================================================
// Wiring
// ============================================================================

async fn build_healer(config: &Config) -> anyhow::Result<Healer> {
    let db_path = &config.storage.database;
    let pool = db::init_db(&db::db_url(Some(db_path)))
        .await
        .with_context(|| format!("opening database {}", db_path.display()))?;

    let base_url = config
        .aggregator
        .base_url
        .as_deref()
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| {
            Error::config("no aggregator configured (set aggregator.base_url or --aggregator)")
        })?;
    let aggregator =
        HttpAggregator::new(base_url, Duration::from_secs(config.aggregator.timeout_secs))?;

    let fetcher = ReqwestFetcher::new(Duration::from_secs(config.heal.cover_timeout_secs))?;
    let materializer = Materializer::new(
        CoverCache::new(config.storage.upload_root.clone()),
        Arc::new(fetcher),
        config.heal.picture_endpoint.clone(),
    );

    info!(
        db = %db_path.display(),
        upload_root = %config.storage.upload_root.display(),
        aggregator = base_url,
        "Healer ready"
    );
    Ok(Healer::new(
        pool,
        Arc::new(aggregator),
        materializer,
        Arc::new(TaskMonitor::new()),
        config.library.clone(),
    ))
}

/// A healer plus the progress printer and interrupt handler around one batch.
struct Session {
    healer: Healer,
    printer: JoinHandle<()>,
    interrupt: JoinHandle<()>,
}

impl Session {
    async fn open(config: &Config) -> anyhow::Result<Self> {
        let healer = build_healer(config).await?;
        let printer = spawn_progress_printer(healer.monitor());
        let interrupt = spawn_interrupt_handler(healer.monitor().clone());
        Ok(Self {
            healer,
            printer,
            interrupt,
        })
    }

    /// Drop the monitor so the printer drains the remaining events and exits.
    async fn close(self) {
        let Self {
            healer,
            printer,
            interrupt,
        } = self;
        interrupt.abort();
        let _ = interrupt.await;
        drop(healer);
        if let Err(e) = printer.await {
            warn!("Progress printer failed: {e}");
        }
    }
}

fn spawn_progress_printer(monitor: &TaskMonitor) -> JoinHandle<()> {
    let events = monitor.subscribe().into_stream();
    tokio::spawn(async move {
        let mut events = std::pin::pin!(events);
        while let Some(event) = events.next().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!("Could not encode progress event: {e}"),
            }
        }
    })
}

/// Ctrl-C requests cancellation; the batch then finishes with partial counts.
fn spawn_interrupt_handler(monitor: Arc<TaskMonitor>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            for task_id in monitor.active() {
                warn!(task_id = %task_id, "Interrupt received, cancelling");
                monitor.cancel(&task_id);
            }
        }
    })
}

// ============================================================================
// Individual command implementations
// ============================================================================

async fn cmd_heal_song(config: &Config, song_id: i64, force: bool) -> anyhow::Result<()> {
    let healer = build_healer(config).await?;
    match healer.heal_song(song_id, force).await? {
        HealOutcome::Healed(fields) => println!("Healed song {song_id}: {}", fields.join(", ")),
        HealOutcome::Unchanged => println!("Song {song_id} is already up to date"),
        HealOutcome::NoMatch => println!("No metadata match for song {song_id}"),
        HealOutcome::NotFound => return Err(Error::song_not_found(song_id).into()),
    }
    Ok(())
}

fn print_report(label: &str, report: &BatchReport) {
    let verb = if report.cancelled { "cancelled" } else { "finished" };
    eprintln!(
        "{label} {verb}: {} healed, {} of {} processed",
        report.healed, report.processed, report.total
    );
}

fn cmd_tags(path: &Path) -> anyhow::Result<()> {
    let tags = metadata::read_blocking(path)
        .with_context(|| format!("reading tags from {}", path.display()))?;

    println!("File: {}", path.display());
    println!("  Title:  {}", tags.title.as_deref().unwrap_or("(empty)"));
    println!("  Artist: {}", tags.artist.as_deref().unwrap_or("(empty)"));
    println!("  Album:  {}", tags.album.as_deref().unwrap_or("(empty)"));
    println!("  Date:   {}", tags.date.as_deref().unwrap_or("(empty)"));
    match &tags.lyrics {
        Some(lyrics) => println!("  Lyrics: {} lines", lyrics.lines().count()),
        None => println!("  Lyrics: (empty)"),
    }
    match metadata::read_front_cover(path)? {
        Some(data) => println!(
            "  Cover:  {} bytes ({})",
            data.len(),
            cover::mime_from_bytes(&data)
        ),
        None => println!("  Cover:  (none)"),
    }
    Ok(())
}

fn cmd_init_config(cli: &Cli, config: &Config, force: bool) -> anyhow::Result<()> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => config::config_path().context("could not determine the config directory")?,
    };
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    config::save_to(config, &path)?;
    println!("Wrote {}", path.display());
    Ok(())
}
