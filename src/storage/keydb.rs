//! KeyDB / Redis backed [`KeyValueStore`].
//!
//! Builds a [`fred::clients::Pool`] for the endpoint described in
//! [`crate::config::StoreConfig`], optionally enabling TLS via `rustls` and
//! reading the password from an environment variable.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use fred::clients::Pool;
use fred::interfaces::{ClientLike, KeysInterface};
use fred::types::config::{ReconnectPolicy, ServerConfig, TlsConnector};
use fred::types::Builder;
use tracing::trace;

use super::{KeyValueStore, StoreError};
use crate::config::StoreConfig;

const POOL_SIZE: usize = 4;

#[derive(Clone)]
pub struct KeyDbStore {
    pool: Pool,
}

impl KeyDbStore {
    /// Connect a pool and verify it with a PING before returning.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let auth_token = std::env::var(&config.auth_token_env).ok();

        // The endpoint may carry a `redis://` or `rediss://` scheme prefix.
        let endpoint = config
            .endpoint
            .trim_start_matches("rediss://")
            .trim_start_matches("redis://");

        let (host, port) = parse_host_port(endpoint)?;

        let mut fred_config = fred::types::config::Config {
            server: ServerConfig::new_centralized(host, port),
            ..fred::types::config::Config::default()
        };

        if config.tls {
            fred_config.tls = Some(TlsConnector::default_rustls()?.into());
        }

        if let Some(token) = auth_token {
            fred_config.password = Some(token);
        }

        let mut builder = Builder::from_config(fred_config);

        // Exponential reconnect: initial 0ms, base 100ms, max 30s, factor 2.
        builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));

        let pool = builder
            .build_pool(POOL_SIZE)
            .context("failed to build KeyDB connection pool")?;

        pool.init().await.context("failed to connect to KeyDB")?;

        let _: String = pool
            .ping(None)
            .await
            .context("KeyDB PING failed after connect")?;

        tracing::info!(
            host = host,
            port = port,
            tls = config.tls,
            pool_size = POOL_SIZE,
            "KeyDB pool created and verified"
        );

        Ok(Self { pool })
    }
}

#[async_trait]
impl KeyValueStore for KeyDbStore {
    async fn set(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
        let len = value.len();
        let _: () = self
            .pool
            .set(key, value, None, None, false)
            .await
            .map_err(|e| StoreError::Write {
                key: key.to_string(),
                message: e.to_string(),
            })?;
        trace!(key, bytes = len, "KeyDB SET");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let value: Option<Vec<u8>> = self.pool.get(key).await.map_err(|e| StoreError::Read {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        trace!(key, hit = value.is_some(), "KeyDB GET");
        Ok(value.map(Bytes::from))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let _: String = self
            .pool
            .ping(None)
            .await
            .map_err(|e| StoreError::Unavailable(format!("PING failed: {e}")))?;
        Ok(())
    }
}

/// Parse a `host:port` string.  If the port is omitted, defaults to `6379`.
pub fn parse_host_port(endpoint: &str) -> Result<(&str, u16)> {
    // Strip any trailing path segments (e.g. a `/0` database suffix).
    let endpoint = endpoint.split('/').next().unwrap_or(endpoint);

    if let Some((host, port_str)) = endpoint.rsplit_once(':') {
        let port: u16 = port_str
            .parse()
            .with_context(|| format!("invalid port in endpoint: {endpoint}"))?;
        Ok((host, port))
    } else {
        Ok((endpoint, 6379))
    }
}
