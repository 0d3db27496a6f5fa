//! Command-line interface for music-monitor.
//!
//! This module provides CLI commands for running heal batches, healing a
//! single song, localizing covers and avatars, and inspecting file tags.

mod commands;

pub use commands::{Cli, Commands, run_command};
