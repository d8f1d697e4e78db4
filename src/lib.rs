//! tracklink - keep local work items in sync with a remote issue tracker.
//!
//! This crate provides the sync engine and the `tl` CLI.
//!
//! # Architecture
//!
//! - [`remote`] - Paginated HTTP client for the remote tracker
//! - [`sync`] - Normalization, caching, links, conflict detection, orchestration
//! - [`model`] - Local entities and normalized snapshots
//! - [`storage`] - SQLite persistence behind key-value and entity traits
//! - [`config`] - Configuration file and path resolution
//! - [`cli`] - Command-line interface using clap
//! - [`error`] - Error types and handling

#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod error;
pub mod model;
pub mod remote;
pub mod storage;
pub mod sync;
pub mod validate;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
