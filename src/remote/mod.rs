//! Remote tracker access.
//!
//! - [`client`] - Transport interface and errors
//! - [`http`] - reqwest implementation
//! - [`fetcher`] - Pagination driver
//! - [`record`] - Raw records at the adapter boundary

pub mod client;
pub mod fetcher;
pub mod http;
pub mod record;

pub use client::{Method, Params, RemoteClient, RemoteError, RemoteResponse};
pub use fetcher::{RemoteFetcher, DEFAULT_MAX_PAGES, DEFAULT_PER_PAGE};
pub use http::HttpRemoteClient;
pub use record::RawRemoteRecord;
