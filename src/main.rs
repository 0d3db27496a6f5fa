//! Music Monitor - metadata healing for a self-hosted music library.
//!
//! Finds songs with missing or placeholder metadata, asks the provider
//! aggregator for a better match, merges the result without destroying good
//! data, localizes covers into the upload cache and writes tags back into
//! the audio files. Everything runs from the command line.

pub mod cli;
pub mod config;
pub mod cover;
pub mod db;
pub mod enrichment;
pub mod error;
pub mod healer;
pub mod metadata;
pub mod model;
pub mod tasks;
#[cfg(test)]
pub mod test_utils;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const LOG_DIRECTIVES: [&str; 5] = [
    "music_monitor=info",
    "healer=info",
    "tasks=info",
    "covers=info",
    "tags=info",
];

fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    // Component targets (healer, tasks, covers, tags) sit outside the crate path
    let mut filter = EnvFilter::from_default_env();
    for directive in LOG_DIRECTIVES {
        filter = filter.add_directive(directive.parse()?);
    }

    // Logs go to stderr; stdout carries command output and progress events
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .init();

    cli::run_command(&args)
}
