//! Resumable subreddit harvester: discovers threads, fetches each one with its full
//! comment forest, and appends them to NDJSON while checkpointing progress in DuckDB.

pub mod cli;
pub mod config;
pub mod db;
pub mod discovery;
pub mod error;
pub mod forest;
pub mod harvester;
pub mod models;
pub mod ndjson;
pub mod reddit;
pub mod retry;
pub mod throttle;
