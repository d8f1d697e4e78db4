//! Remote tracker client interface.
//!
//! The literal wire transport sits behind [`RemoteClient`]; the fetcher and
//! orchestrator only ever see decoded JSON bodies and a "has next page" flag.

use serde_json::Value;
use thiserror::Error;

/// Query parameters (GET) or JSON body (PATCH/POST).
pub type Params = serde_json::Map<String, Value>;

/// HTTP-style request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Patch,
    Post,
}

impl Method {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Patch => "PATCH",
            Self::Post => "POST",
        }
    }
}

/// Decoded response from the remote tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
    pub body: Value,
    /// Whether the response advertised a `next` page relation.
    pub has_next: bool,
}

impl RemoteResponse {
    /// Response with no further pages.
    #[must_use]
    pub fn last(body: Value) -> Self {
        Self {
            body,
            has_next: false,
        }
    }

    #[must_use]
    pub fn with_next(body: Value) -> Self {
        Self {
            body,
            has_next: true,
        }
    }
}

/// Errors raised while talking to the remote tracker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("authentication rejected: {0}")]
    Authentication(String),

    #[error("remote returned {code}: {body}")]
    Status { code: u16, body: String },

    #[error("undecodable response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Whether the run as a whole must abort.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { code: 404, .. })
    }
}

/// Trait for remote tracker clients.
///
/// Implemented by [`super::HttpRemoteClient`] and by the scripted client
/// used in tests.
pub trait RemoteClient: Send + Sync {
    /// Issue one request against an endpoint relative to the tracker base.
    fn request(
        &self,
        method: Method,
        endpoint: &str,
        params: &Params,
    ) -> impl std::future::Future<Output = Result<RemoteResponse, RemoteError>> + Send;
}
