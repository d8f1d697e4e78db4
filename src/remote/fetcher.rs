//! Paginated retrieval from a remote collection.
//!
//! Pages are requested strictly in order, starting at 1. The loop ends on
//! an empty page, on a response without a `next` relation, or at the
//! `max_pages` ceiling. Transport errors propagate unchanged; retry policy
//! belongs to the caller.

use std::sync::Arc;

use serde_json::Value;

use super::client::{Method, Params, RemoteClient, RemoteError};
use super::record::RawRemoteRecord;
use crate::sync::events::{SharedSink, SyncEvent};

/// Default page size requested from the tracker.
pub const DEFAULT_PER_PAGE: u32 = 100;

/// Default upper bound on pages fetched per collection.
pub const DEFAULT_MAX_PAGES: u32 = 1000;

/// Drives paginated listing and single-item lookups.
pub struct RemoteFetcher<C> {
    client: Arc<C>,
    per_page: u32,
    max_pages: u32,
    sink: SharedSink,
}

impl<C: RemoteClient> RemoteFetcher<C> {
    pub fn new(client: Arc<C>, sink: SharedSink) -> Self {
        Self {
            client,
            per_page: DEFAULT_PER_PAGE,
            max_pages: DEFAULT_MAX_PAGES,
            sink,
        }
    }

    #[must_use]
    pub fn with_per_page(mut self, per_page: u32) -> Self {
        self.per_page = per_page.max(1);
        self
    }

    #[must_use]
    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    /// Shared handle to the underlying client (used for pushes).
    #[must_use]
    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    /// Fetch every item of a collection, in response order.
    ///
    /// `page` and `per_page` are merged over the caller's params.
    ///
    /// # Errors
    ///
    /// Returns the first transport, status, or decode error.
    pub async fn fetch_all(
        &self,
        endpoint: &str,
        params: &Params,
    ) -> Result<Vec<RawRemoteRecord>, RemoteError> {
        let mut records = Vec::new();
        let mut page: u32 = 1;

        loop {
            let mut query = params.clone();
            query.insert("page".into(), Value::from(page));
            query.insert("per_page".into(), Value::from(self.per_page));

            let response = self.client.request(Method::Get, endpoint, &query).await?;
            let items = page_items(response.body);

            self.sink.emit(SyncEvent::PageFetched {
                endpoint: endpoint.to_string(),
                page,
                items: items.len(),
            });

            if items.is_empty() {
                break;
            }
            records.extend(items.into_iter().map(RawRemoteRecord::Payload));

            if !response.has_next {
                break;
            }
            if page >= self.max_pages {
                self.sink.emit(SyncEvent::PageLimitReached {
                    endpoint: endpoint.to_string(),
                    max_pages: self.max_pages,
                });
                break;
            }
            page += 1;
        }

        Ok(records)
    }

    /// Fetch one item by remote id. A 404 yields `None`.
    ///
    /// # Errors
    ///
    /// Returns transport, status (other than 404), or decode errors.
    pub async fn fetch_one(
        &self,
        endpoint: &str,
        remote_id: &str,
    ) -> Result<Option<RawRemoteRecord>, RemoteError> {
        let path = format!("{}/{remote_id}", endpoint.trim_end_matches('/'));
        match self.client.request(Method::Get, &path, &Params::new()).await {
            Ok(response) => Ok(page_items(response.body)
                .into_iter()
                .next()
                .map(RawRemoteRecord::Payload)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Items carried by a response body.
///
/// Accepts a bare array, an `{"items": [...]}` envelope, or a single object.
fn page_items(body: Value) -> Vec<Value> {
    match body {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("items") {
            Some(Value::Array(items)) => items,
            Some(other) => {
                map.insert("items".into(), other);
                vec![Value::Object(map)]
            }
            None if map.is_empty() => Vec::new(),
            None => vec![Value::Object(map)],
        },
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::client::RemoteResponse;
    use crate::sync::events::RecordingSink;
    use crate::testing::ScriptedClient;
    use serde_json::json;

    fn fetcher(client: ScriptedClient) -> (RemoteFetcher<ScriptedClient>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        (RemoteFetcher::new(Arc::new(client), sink.clone()), sink)
    }

    #[tokio::test]
    async fn test_pagination_concatenates_in_order() {
        let client = ScriptedClient::new()
            .page("issues", 1, RemoteResponse::with_next(json!([{"id": "a"}, {"id": "b"}])))
            .page("issues", 2, RemoteResponse::with_next(json!([{"id": "c"}])))
            .page("issues", 3, RemoteResponse::last(json!([])));
        let (fetcher, _) = fetcher(client);

        let records = fetcher.fetch_all("issues", &Params::new()).await.unwrap();
        let ids: Vec<_> = records.iter().filter_map(RawRemoteRecord::remote_id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(fetcher.client().requests_to("issues"), 3);
    }

    #[tokio::test]
    async fn test_missing_next_relation_stops() {
        let client = ScriptedClient::new()
            .page("issues", 1, RemoteResponse::last(json!([{"id": "a"}])))
            .page("issues", 2, RemoteResponse::last(json!([{"id": "never"}])));
        let (fetcher, _) = fetcher(client);

        let records = fetcher.fetch_all("issues", &Params::new()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(fetcher.client().requests_to("issues"), 1);
    }

    #[tokio::test]
    async fn test_page_ceiling_bounds_endless_server() {
        let mut client = ScriptedClient::new();
        for page in 1..=10 {
            client = client.page("issues", page, RemoteResponse::with_next(json!([{"id": page}])));
        }
        let (fetcher, sink) = fetcher(client);
        let fetcher = fetcher.with_max_pages(3);

        let records = fetcher.fetch_all("issues", &Params::new()).await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(
            sink.count(|e| matches!(e, SyncEvent::PageLimitReached { max_pages: 3, .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_transport_error_propagates() {
        let client = ScriptedClient::new()
            .page("issues", 1, RemoteResponse::with_next(json!([{"id": "a"}])))
            .fail_page("issues", 2, RemoteError::Transport("connection reset".into()));
        let (fetcher, _) = fetcher(client);

        let err = fetcher.fetch_all("issues", &Params::new()).await.unwrap_err();
        assert_eq!(err, RemoteError::Transport("connection reset".into()));
    }

    #[tokio::test]
    async fn test_fetch_one_not_found_is_none() {
        let client = ScriptedClient::new().item("issues", json!({"id": "7", "title": "x"}));
        let (fetcher, _) = fetcher(client);

        assert!(fetcher.fetch_one("issues", "7").await.unwrap().is_some());
        assert!(fetcher.fetch_one("issues", "8").await.unwrap().is_none());
    }

    #[test]
    fn test_page_items_shapes() {
        assert_eq!(page_items(json!({"items": [1, 2]})).len(), 2);
        assert_eq!(page_items(json!({"id": 1})).len(), 1);
        assert!(page_items(json!({})).is_empty());
        assert!(page_items(Value::Null).is_empty());
    }
}
