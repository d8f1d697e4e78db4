//! Shared fakes for unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::remote::{Method, Params, RemoteClient, RemoteError, RemoteResponse};
use crate::storage::{KeyValueStore, KvWrite, MemoryStore};

/// In-process stand-in for a remote tracker.
///
/// Serves two kinds of content:
/// - scripted pages: a fixed response (or error) per `(endpoint, page)`
/// - collections: items that are paginated on request and patched in place,
///   so repeated runs observe earlier pushes
#[derive(Default)]
pub struct ScriptedClient {
    pages: Mutex<HashMap<(String, u32), std::result::Result<RemoteResponse, RemoteError>>>,
    collections: Mutex<BTreeMap<String, Vec<Value>>>,
    failures: Mutex<HashMap<(Method, String), RemoteError>>,
    /// Requests that succeed a set number of times, then fail.
    budgets: Mutex<HashMap<(Method, String), (usize, RemoteError)>>,
    log: Mutex<Vec<(Method, String, Params)>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(self, endpoint: &str, page: u32, response: RemoteResponse) -> Self {
        self.pages
            .lock()
            .insert((endpoint.to_string(), page), Ok(response));
        self
    }

    pub fn fail_page(self, endpoint: &str, page: u32, error: RemoteError) -> Self {
        self.pages
            .lock()
            .insert((endpoint.to_string(), page), Err(error));
        self
    }

    /// Add one item to a paginated collection.
    pub fn item(self, endpoint: &str, item: Value) -> Self {
        self.collections
            .lock()
            .entry(endpoint.to_string())
            .or_default()
            .push(item);
        self
    }

    /// Make every `method` request to `path` fail until cleared.
    pub fn fail(&self, method: Method, path: &str, error: RemoteError) {
        self.failures
            .lock()
            .insert((method, path.to_string()), error);
    }

    /// Let `allowed` more `method` requests to `path` through, then fail.
    pub fn fail_after(&self, method: Method, path: &str, allowed: usize, error: RemoteError) {
        self.budgets
            .lock()
            .insert((method, path.to_string()), (allowed, error));
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
        self.budgets.lock().clear();
    }

    /// Simulate an edit made directly on the tracker.
    pub fn edit(&self, endpoint: &str, id: &str, patch: &Value) {
        let mut collections = self.collections.lock();
        if let Some(item) = collections
            .get_mut(endpoint)
            .and_then(|items| items.iter_mut().find(|item| item_id(item) == Some(id.to_string())))
        {
            merge(item, patch);
        }
    }

    /// Current state of a collection item.
    pub fn remote_item(&self, endpoint: &str, id: &str) -> Option<Value> {
        self.collections
            .lock()
            .get(endpoint)?
            .iter()
            .find(|item| item_id(item) == Some(id.to_string()))
            .cloned()
    }

    /// Number of GET requests made to exactly `endpoint`.
    pub fn requests_to(&self, endpoint: &str) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|(method, path, _)| *method == Method::Get && path == endpoint)
            .count()
    }

    /// All PATCH requests as `(path, body)`.
    pub fn patches(&self) -> Vec<(String, Params)> {
        self.log
            .lock()
            .iter()
            .filter(|(method, _, _)| *method == Method::Patch)
            .map(|(_, path, params)| (path.clone(), params.clone()))
            .collect()
    }

    fn respond(
        &self,
        method: Method,
        endpoint: &str,
        params: &Params,
    ) -> std::result::Result<RemoteResponse, RemoteError> {
        if let Some(error) = self.failures.lock().get(&(method, endpoint.to_string())) {
            return Err(error.clone());
        }
        if let Some((allowed, error)) = self.budgets.lock().get_mut(&(method, endpoint.to_string())) {
            if *allowed == 0 {
                return Err(error.clone());
            }
            *allowed -= 1;
        }

        if method == Method::Get {
            if let Some(page) = params.get("page").and_then(Value::as_u64) {
                let page = u32::try_from(page).unwrap_or(u32::MAX);
                if let Some(scripted) = self.pages.lock().get(&(endpoint.to_string(), page)) {
                    return scripted.clone();
                }
                let per_page = params
                    .get("per_page")
                    .and_then(Value::as_u64)
                    .and_then(|n| usize::try_from(n).ok())
                    .unwrap_or(100);
                return Ok(self.collection_page(endpoint, page as usize, per_page));
            }
        }

        let Some((collection, id)) = endpoint.rsplit_once('/') else {
            return Err(not_found(endpoint));
        };
        let mut collections = self.collections.lock();
        let item = collections
            .get_mut(collection)
            .and_then(|items| items.iter_mut().find(|item| item_id(item) == Some(id.to_string())))
            .ok_or_else(|| not_found(endpoint))?;

        match method {
            Method::Get => Ok(RemoteResponse::last(item.clone())),
            Method::Patch => {
                merge(item, &Value::Object(params.clone()));
                Ok(RemoteResponse::last(item.clone()))
            }
            Method::Post => Err(RemoteError::Status {
                code: 405,
                body: "method not allowed".into(),
            }),
        }
    }

    fn collection_page(&self, endpoint: &str, page: usize, per_page: usize) -> RemoteResponse {
        let collections = self.collections.lock();
        let items = collections.get(endpoint).map_or(&[][..], Vec::as_slice);
        let start = page.saturating_sub(1) * per_page;
        let end = (start + per_page).min(items.len());
        let slice = items.get(start..end).unwrap_or(&[]).to_vec();
        RemoteResponse {
            body: Value::Array(slice),
            has_next: end < items.len(),
        }
    }
}

impl RemoteClient for ScriptedClient {
    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        params: &Params,
    ) -> std::result::Result<RemoteResponse, RemoteError> {
        self.log
            .lock()
            .push((method, endpoint.to_string(), params.clone()));
        self.respond(method, endpoint, params)
    }
}

fn item_id(item: &Value) -> Option<String> {
    match item.get("id").or_else(|| item.get("number"))? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn merge(item: &mut Value, patch: &Value) {
    if let (Value::Object(target), Value::Object(fields)) = (item, patch) {
        for (key, value) in fields {
            target.insert(key.clone(), value.clone());
        }
    }
}

fn not_found(endpoint: &str) -> RemoteError {
    RemoteError::Status {
        code: 404,
        body: format!("{endpoint} not found"),
    }
}

/// Key-value store whose batch writes can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_batches: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_batches(&self, fail: bool) {
        self.fail_batches.store(fail, Ordering::SeqCst);
    }
}

impl KeyValueStore for FlakyStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        self.inner.get(namespace, key)
    }

    fn put(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        self.inner.put(namespace, key, value)
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        self.inner.delete(namespace, key)
    }

    fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        self.inner.keys(namespace)
    }

    fn clear(&self, namespace: &str) -> Result<usize> {
        self.inner.clear(namespace)
    }

    fn write_batch(&self, writes: &[KvWrite]) -> Result<()> {
        if self.fail_batches.load(Ordering::SeqCst) {
            return Err(Error::Other("disk full".into()));
        }
        self.inner.write_batch(writes)
    }
}
