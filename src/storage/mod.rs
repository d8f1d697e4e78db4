//! Storage layer for tracklink.
//!
//! This module provides the persistence layer using SQLite with:
//! - WAL mode for concurrent reads
//! - Transaction discipline for atomic writes
//! - Audit events for history
//!
//! The sync core only sees the [`KeyValueStore`] and [`LocalStore`] traits;
//! in-memory implementations back tests and dry runs.
//!
//! # Submodules
//!
//! - [`events`] - Audit event storage
//! - [`kv`] - Key-value interface for sync state
//! - [`local`] - Local entity interface
//! - [`schema`] - Database schema definitions
//! - [`sqlite`] - Main SQLite storage implementation

pub mod events;
pub mod kv;
pub mod local;
pub mod schema;
pub mod sqlite;

pub use kv::{ns, KeyValueStore, KvWrite, MemoryStore};
pub use local::{LocalStore, MemoryLocalStore};
pub use sqlite::{MutationContext, SqliteStorage};
