//! HTTP remote client over reqwest.
//!
//! Speaks JSON to a REST-style tracker: bearer-token auth, query-string
//! pagination, and `Link: <...>; rel="next"` for continuation.

use reqwest::header::{HeaderMap, LINK};
use serde_json::Value;

use super::client::{Method, Params, RemoteClient, RemoteError, RemoteResponse};

/// Remote client backed by `reqwest`.
pub struct HttpRemoteClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpRemoteClient {
    /// Create a client for the tracker at `base_url`.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    /// Reuse an existing reqwest client (custom timeouts, proxies).
    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }
}

impl RemoteClient for HttpRemoteClient {
    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        params: &Params,
    ) -> Result<RemoteResponse, RemoteError> {
        let url = self.url(endpoint);

        let mut builder = match method {
            Method::Get => self.client.get(&url).query(&query_pairs(params)),
            Method::Patch => self.client.patch(&url).json(params),
            Method::Post => self.client.post(&url).json(params),
        };
        builder = builder.header(reqwest::header::ACCEPT, "application/json");
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        tracing::trace!(method = method.as_str(), %url, "remote request");

        let response = builder
            .send()
            .await
            .map_err(|e| RemoteError::Transport(format!("{} {url} failed: {e}", method.as_str())))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(RemoteError::Authentication(format!("{status} from {url}")));
        }

        let has_next = has_next_link(response.headers());

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Status {
                code: status.as_u16(),
                body,
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| RemoteError::Transport(format!("reading body from {url}: {e}")))?;

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text)
                .map_err(|e| RemoteError::Decode(format!("{url}: {e}")))?
        };

        Ok(RemoteResponse { body, has_next })
    }
}

/// Flatten params into query pairs; strings are sent unquoted.
fn query_pairs(params: &Params) -> Vec<(String, String)> {
    params
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let value = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), value)
        })
        .collect()
}

fn has_next_link(headers: &HeaderMap) -> bool {
    headers
        .get_all(LINK)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(link_has_next)
}

/// Whether a `Link` header value contains a `rel="next"` entry.
fn link_has_next(header: &str) -> bool {
    header.split(',').any(|entry| {
        entry.split(';').skip(1).any(|param| {
            let param = param.trim();
            param
                .strip_prefix("rel=")
                .map(|rel| rel.trim_matches('"'))
                .is_some_and(|rel| rel.split_whitespace().any(|r| r.eq_ignore_ascii_case("next")))
        })
    })
}
