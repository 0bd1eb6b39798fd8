//! Upstream forge API access.
//!
//! Provides the [`ResourceFetcher`] trait through which the refresh workers
//! pull resources from the upstream REST API.  Pagination, authentication and
//! rate limiting are handled behind the trait so callers only see a complete
//! collection or a raw payload.

pub mod github;
pub mod rate_limit;

use async_trait::async_trait;
use bytes::Bytes;

use crate::cache::CacheError;

pub use github::GitHubClient;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    /// Fetch every page of a collection endpoint and return the items in
    /// upstream order.
    async fn list_resources(&self, path: &str) -> Result<Vec<serde_json::Value>, CacheError>;

    /// Fetch a single (non-paginated) endpoint and return its body verbatim.
    async fn get_resource(&self, path: &str) -> Result<Bytes, CacheError>;
}

/// Value of the `Authorization` header sent upstream for `token`.
pub fn authorization_value(token: &str) -> String {
    format!("token {token}")
}
