use crate::storage::StoreError;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failures raised while refreshing, building, or reading cached data.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Transport-level failure talking to the upstream API.
    #[error("upstream request for {path} failed: {source}")]
    UpstreamFetch {
        path: String,
        #[source]
        source: BoxError,
    },
    /// The upstream API answered with a non-success status.
    #[error("upstream returned {status} for {path}")]
    UpstreamStatus { path: String, status: u16 },
    /// Encoding or decoding a stored payload failed.
    #[error("serialization failed for {key}: {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    /// A view limit that is not a positive integer.
    #[error("invalid limit {0:?}: expected a positive integer")]
    InvalidLimit(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The repository refresh worker went away; no further signals will come.
    #[error("refresh gate closed")]
    GateClosed,
    /// A refresh worker task panicked or was aborted.
    #[error("refresh worker aborted: {0}")]
    WorkerAborted(String),
}

impl CacheError {
    pub fn upstream_fetch(path: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::UpstreamFetch {
            path: path.into(),
            source: source.into(),
        }
    }

    pub fn serialization(key: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            key: key.into(),
            source,
        }
    }
}
