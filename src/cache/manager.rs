//! Pulls upstream resources into the store and reads them back.
//!
//! A [`CacheManager`] pairs a [`ResourceFetcher`] with a [`KeyValueStore`].
//! Every refresh is a full replacement of one key; the previous value stays in
//! place whenever a refresh fails.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, instrument};

use super::model::{CachedResource, Repository};
use super::CacheError;
use crate::forge::ResourceFetcher;
use crate::storage::{KeyValueStore, StoreError};

// ---------------------------------------------------------------------------
// CacheManager
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct CacheManager {
    fetcher: Arc<dyn ResourceFetcher>,
    store: Arc<dyn KeyValueStore>,
}

impl CacheManager {
    pub fn new(fetcher: Arc<dyn ResourceFetcher>, store: Arc<dyn KeyValueStore>) -> Self {
        Self { fetcher, store }
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Fetch `resource` from upstream and replace its stored value.
    ///
    /// Paginated collections are merged into a single JSON array; other
    /// resources are stored byte-for-byte as the upstream sent them.
    /// Returns the number of bytes written.
    #[instrument(skip(self), fields(path = %resource.path))]
    pub async fn refresh_resource(&self, resource: &CachedResource) -> Result<usize, CacheError> {
        let payload = if resource.paginate {
            let items = self.fetcher.list_resources(&resource.path).await?;
            let encoded = serde_json::to_vec(&items)
                .map_err(|e| CacheError::serialization(&resource.path, e))?;
            Bytes::from(encoded)
        } else {
            self.fetcher.get_resource(&resource.path).await?
        };

        let len = payload.len();
        self.store.set(&resource.path, payload).await?;
        debug!(bytes = len, "resource refreshed");
        Ok(len)
    }

    /// Raw stored payload for a cached path.
    pub async fn cached(&self, path: &str) -> Result<Option<Bytes>, StoreError> {
        self.store.get(path).await
    }

    /// Decode the stored repository collection. An absent key is an empty
    /// collection; a record missing a view metric is a decode error.
    pub async fn repositories(&self, repos_path: &str) -> Result<Vec<Repository>, CacheError> {
        match self.store.get(repos_path).await? {
            Some(payload) => serde_json::from_slice(&payload)
                .map_err(|e| CacheError::serialization(repos_path, e)),
            None => Ok(Vec::new()),
        }
    }
}
