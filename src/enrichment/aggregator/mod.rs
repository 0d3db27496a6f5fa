//! Provider aggregator integration
//!
//! Talks to the aggregator service that searches several music providers
//! and returns the single best match for a title/artist query.

pub mod dto;
mod adapter;
mod client;

pub use client::HttpAggregator;
