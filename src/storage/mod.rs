//! Key/value persistence for cached upstream payloads and derived views.
//!
//! Every key holds one opaque byte value that is replaced wholesale on each
//! write. Nothing expires and nothing is deleted. A read distinguishes an
//! absent key (`Ok(None)`) from a failed read (`Err(StoreError::Read)`).

pub mod keydb;
pub mod memory;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

use crate::config::{StoreBackend, StoreConfig};

pub use keydb::KeyDbStore;
pub use memory::InMemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store read of {key} failed: {message}")]
    Read { key: String, message: String },
    #[error("store write of {key} failed: {message}")]
    Write { key: String, message: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Byte-oriented key/value store shared by refresh workers and request
/// handlers.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Replace the value at `key`.
    async fn set(&self, key: &str, value: Bytes) -> Result<(), StoreError>;

    /// Read the current value at `key`, `None` if it was never written.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Round-trip to the backend to confirm it is reachable.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Build the configured store backend.
pub async fn build_store(config: &StoreConfig) -> Result<Arc<dyn KeyValueStore>> {
    match config.backend {
        StoreBackend::Keydb => Ok(Arc::new(KeyDbStore::connect(config).await?)),
        StoreBackend::Memory => {
            tracing::warn!("using in-memory store; cached data will not survive restarts");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}
