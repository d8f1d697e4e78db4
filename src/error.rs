//! Error types for tracklink.
//!
//! Provides structured error handling with:
//! - Machine-readable error codes (`ErrorCode`)
//! - Category-based exit codes (2=db, 3=not_found, 4=validation, etc.)
//! - Retryability flags for scripted callers
//! - Context-aware recovery hints
//! - Structured JSON output for piped / non-TTY consumers

use std::path::PathBuf;
use thiserror::Error;

use crate::remote::RemoteError;
use crate::sync::{LinkError, SyncError};

/// Result type alias for tracklink operations.
pub type Result<T> = std::result::Result<T, Error>;

// ── Error Code ────────────────────────────────────────────────

/// Machine-readable error codes grouped by category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Database (exit 2)
    NotInitialized,
    AlreadyInitialized,
    DatabaseError,

    // Not Found (exit 3)
    EntityNotFound,
    LinkNotFound,

    // Validation (exit 4)
    InvalidArgument,
    LinkConflict,

    // Remote (exit 5)
    RemoteError,
    AuthenticationFailed,

    // Sync (exit 6)
    SyncError,

    // Config (exit 7)
    ConfigError,

    // I/O (exit 8)
    IoError,
    JsonError,

    // Internal (exit 1)
    InternalError,
}

impl ErrorCode {
    /// Machine-readable SCREAMING_SNAKE code string.
    #[must_use]
    pub const fn as_str(&self) -> &str {
        match self {
            Self::NotInitialized => "NOT_INITIALIZED",
            Self::AlreadyInitialized => "ALREADY_INITIALIZED",
            Self::DatabaseError => "DATABASE_ERROR",
            Self::EntityNotFound => "ENTITY_NOT_FOUND",
            Self::LinkNotFound => "LINK_NOT_FOUND",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::LinkConflict => "LINK_CONFLICT",
            Self::RemoteError => "REMOTE_ERROR",
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::SyncError => "SYNC_ERROR",
            Self::ConfigError => "CONFIG_ERROR",
            Self::IoError => "IO_ERROR",
            Self::JsonError => "JSON_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Category-based exit code (1-8).
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::InternalError => 1,
            Self::NotInitialized | Self::AlreadyInitialized | Self::DatabaseError => 2,
            Self::EntityNotFound | Self::LinkNotFound => 3,
            Self::InvalidArgument | Self::LinkConflict => 4,
            Self::RemoteError | Self::AuthenticationFailed => 5,
            Self::SyncError => 6,
            Self::ConfigError => 7,
            Self::IoError | Self::JsonError => 8,
        }
    }

    /// Whether a caller should retry (possibly with corrected input).
    ///
    /// Remote transport errors are retryable; authentication failures are
    /// not until credentials change.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument | Self::LinkConflict | Self::RemoteError | Self::DatabaseError
        )
    }
}

// ── Error Enum ────────────────────────────────────────────────

/// Errors that can occur in tracklink operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Not initialized: run `tl init` first")]
    NotInitialized,

    #[error("Already initialized at {path}")]
    AlreadyInitialized { path: PathBuf },

    #[error("Entity not found: {id}")]
    EntityNotFound { id: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Write conflict: {namespace}/{key} changed concurrently")]
    WriteConflict { namespace: String, key: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Map this error to its structured `ErrorCode`.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::NotInitialized => ErrorCode::NotInitialized,
            Self::AlreadyInitialized { .. } => ErrorCode::AlreadyInitialized,
            Self::Database(_) | Self::WriteConflict { .. } => ErrorCode::DatabaseError,
            Self::EntityNotFound { .. } => ErrorCode::EntityNotFound,
            Self::Link(LinkError::NotLinked { .. }) => ErrorCode::LinkNotFound,
            Self::Link(LinkError::Store(_)) => ErrorCode::DatabaseError,
            Self::Link(_) => ErrorCode::LinkConflict,
            Self::Remote(RemoteError::Authentication(_))
            | Self::Sync(SyncError::Authentication(_)) => ErrorCode::AuthenticationFailed,
            Self::Remote(_) => ErrorCode::RemoteError,
            Self::Sync(_) => ErrorCode::SyncError,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::Config(_) => ErrorCode::ConfigError,
            Self::Io(_) => ErrorCode::IoError,
            Self::Json(_) => ErrorCode::JsonError,
            Self::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Category-based exit code, delegating to the `ErrorCode`.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        self.error_code().exit_code()
    }

    /// Context-aware recovery hint.
    ///
    /// Returns `None` if no actionable suggestion exists.
    #[must_use]
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::NotInitialized => Some("Run `tl init` to initialize the database".to_string()),

            Self::AlreadyInitialized { path } => Some(format!(
                "Database already exists at {}. Use `--force` to reinitialize.",
                path.display()
            )),

            Self::EntityNotFound { id } => Some(format!(
                "No local entity with ID '{id}'. Use `tl link list` to see linked entities."
            )),

            Self::Link(LinkError::LocalAlreadyLinked { local_id, remote_id }) => Some(format!(
                "'{local_id}' is already linked to '{remote_id}'. Run `tl link remove {local_id}` first."
            )),
            Self::Link(LinkError::RemoteAlreadyLinked { remote_id, local_id }) => Some(format!(
                "Remote '{remote_id}' is already linked to '{local_id}'. Run `tl link remove {local_id}` first."
            )),
            Self::Link(LinkError::NotLinked { .. }) => {
                Some("Use `tl link list` to see existing links.".to_string())
            }

            Self::Remote(RemoteError::Authentication(_))
            | Self::Sync(SyncError::Authentication(_)) => Some(
                "The remote tracker rejected the credentials.\n  \
                 Set TRACKLINK_TOKEN or `token` in ~/.tracklink/config.json"
                    .to_string(),
            ),

            Self::Config(msg) if msg.contains("remote_url") => Some(
                "Set TRACKLINK_REMOTE_URL or `remote_url` in ~/.tracklink/config.json".to_string(),
            ),

            Self::InvalidArgument(msg) if msg.contains("kind") => {
                Some("Valid kinds: issue, milestone, project".to_string())
            }

            _ => None,
        }
    }

    /// Structured JSON representation for machine consumption.
    ///
    /// Includes error code, message, retryability, exit code, and
    /// optional recovery hint.
    #[must_use]
    pub fn to_structured_json(&self) -> serde_json::Value {
        let code = self.error_code();
        let mut obj = serde_json::json!({
            "error": {
                "code": code.as_str(),
                "message": self.to_string(),
                "retryable": code.is_retryable(),
                "exit_code": code.exit_code(),
            }
        });

        if let Some(hint) = self.hint() {
            obj["error"]["hint"] = serde_json::Value::String(hint);
        }

        obj
    }
}
