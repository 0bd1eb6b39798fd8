use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub store: StoreConfig,
    pub cache: CacheConfig,
}

// ---------------------------------------------------------------------------
// Upstream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// URL scheme used for both refreshes and pass-through (`https` in production).
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Host (and optional port) of the upstream REST API, e.g. `api.github.com`.
    #[serde(default = "default_hostname")]
    pub hostname: String,
    /// Name of the environment variable that holds the upstream API token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Connection-establishment timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Page size requested from paginated collection endpoints.
    #[serde(default = "default_per_page")]
    pub per_page: u32,
    /// Minimum number of API calls to keep in reserve before self-throttling.
    #[serde(default = "default_rate_limit_buffer")]
    pub rate_limit_buffer: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            hostname: default_hostname(),
            token_env: default_token_env(),
            timeout: default_timeout(),
            per_page: default_per_page(),
            rate_limit_buffer: default_rate_limit_buffer(),
        }
    }
}

impl UpstreamConfig {
    /// `{scheme}://{hostname}` with no trailing slash.
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.hostname.trim_end_matches('/'))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Read the API token from the configured environment variable.
    /// An unset or empty variable yields `None`.
    pub fn token(&self) -> Option<String> {
        std::env::var(&self.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty())
    }
}

fn default_scheme() -> String {
    "https".to_string()
}

fn default_hostname() -> String {
    "api.github.com".to_string()
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}

fn default_timeout() -> u64 {
    10
}

fn default_per_page() -> u32 {
    100
}

fn default_rate_limit_buffer() -> u32 {
    100
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8080`).
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http_listen: default_http_listen(),
        }
    }
}

fn default_http_listen() -> String {
    "0.0.0.0:8080".to_string()
}

// ---------------------------------------------------------------------------
// Store (KeyDB / Redis)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Keydb,
    /// Process-local map. Nothing survives a restart.
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Connection string (e.g. `redis://localhost:6379`).
    #[serde(default = "default_store_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub tls: bool,
    /// Name of the environment variable that holds the store password.
    #[serde(default = "default_store_auth_env")]
    pub auth_token_env: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            endpoint: default_store_endpoint(),
            tls: false,
            auth_token_env: default_store_auth_env(),
        }
    }
}

fn default_store_endpoint() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_store_auth_env() -> String {
    "KEYDB_AUTH_TOKEN".to_string()
}

// ---------------------------------------------------------------------------
// Cache / refresh
// ---------------------------------------------------------------------------

/// What the repository refresh worker does when a cycle fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop the whole process (fail fast).
    #[default]
    Shutdown,
    /// Log, keep the previous value, and wait for the next tick.
    Skip,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceConfig {
    /// Upstream path; `{org}` is replaced with [`CacheConfig::org`].
    pub path: String,
    /// Follow `Link: rel="next"` pages and merge them into one JSON array.
    #[serde(default)]
    pub paginate: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Organization whose resources are cached.
    pub org: String,
    /// Seconds between refreshes. Shared by every cached resource and by the
    /// view rebuild; there is no per-resource cadence.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
    #[serde(default)]
    pub repos_failure_policy: FailurePolicy,
    #[serde(default = "default_resources")]
    pub resources: Vec<ResourceConfig>,
}

impl CacheConfig {
    pub fn refresh_period(&self) -> Duration {
        Duration::from_secs(self.refresh_interval)
    }

    /// Store key (and route) of the organization's repository collection.
    pub fn repos_path(&self) -> String {
        format!("/orgs/{}/repos", self.org)
    }

    /// Resolve `{org}` in a configured path.
    pub fn resolve_path(&self, path: &str) -> String {
        path.replace("{org}", &self.org)
    }
}

fn default_refresh_interval() -> u64 {
    60
}

fn default_resources() -> Vec<ResourceConfig> {
    vec![
        ResourceConfig {
            path: "/".to_string(),
            paginate: false,
        },
        ResourceConfig {
            path: "/orgs/{org}".to_string(),
            paginate: false,
        },
        ResourceConfig {
            path: "/orgs/{org}/members".to_string(),
            paginate: true,
        },
        ResourceConfig {
            path: "/orgs/{org}/repos".to_string(),
            paginate: true,
        },
    ]
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents).with_context(|| format!("invalid config file: {}", path.display()))
}

/// Parse YAML, apply environment overrides, and validate.
pub fn parse_config(contents: &str) -> Result<Config> {
    let mut config: Config =
        serde_yaml::from_str(contents).context("failed to parse config YAML")?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    validate_config(&config)?;
    Ok(config)
}

/// Overlay selected settings from the environment. `lookup` is injected so
/// tests do not have to mutate the process environment.
fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(listen) = lookup("ORGCACHE_HTTP_LISTEN") {
        config.proxy.http_listen = listen;
    }
    if let Some(endpoint) = lookup("ORGCACHE_STORE_ENDPOINT") {
        config.store.endpoint = endpoint;
    }
    if let Some(org) = lookup("ORGCACHE_ORG") {
        config.cache.org = org;
    }
    if let Some(interval) = lookup("ORGCACHE_REFRESH_INTERVAL") {
        config.cache.refresh_interval = interval
            .trim()
            .parse()
            .with_context(|| format!("ORGCACHE_REFRESH_INTERVAL is not a number: {interval}"))?;
    }
    Ok(())
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.cache.org.trim().is_empty(),
        "cache.org must not be empty"
    );
    anyhow::ensure!(
        config.cache.refresh_interval > 0,
        "cache.refresh_interval must be greater than zero"
    );
    anyhow::ensure!(
        (1..=100).contains(&config.upstream.per_page),
        "upstream.per_page must be 1-100"
    );

    let mut seen = std::collections::HashSet::new();
    for resource in &config.cache.resources {
        anyhow::ensure!(
            resource.path.starts_with('/'),
            "resource path must start with '/': {}",
            resource.path
        );
        let resolved = config.cache.resolve_path(&resource.path);
        anyhow::ensure!(
            seen.insert(resolved.clone()),
            "duplicate resource path: {resolved}"
        );
    }
    anyhow::ensure!(
        seen.contains(&config.cache.repos_path()),
        "cache.resources must include the repository path {}",
        config.cache.repos_path()
    );
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_config(org: &str) -> Config {
    let mut config: Config =
        serde_yaml::from_str(&format!("cache:\n  org: {org}\n")).expect("minimal config parses");
    config.store.backend = StoreBackend::Memory;
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: Config = serde_yaml::from_str("cache:\n  org: Netflix\n").unwrap();
        validate_config(&config).unwrap();

        assert_eq!(config.upstream.base_url(), "https://api.github.com");
        assert_eq!(config.cache.refresh_interval, 60);
        assert_eq!(config.cache.repos_failure_policy, FailurePolicy::Shutdown);
        assert_eq!(config.proxy.http_listen, "0.0.0.0:8080");
        assert_eq!(config.store.backend, StoreBackend::Keydb);

        let paths: Vec<String> = config
            .cache
            .resources
            .iter()
            .map(|r| config.cache.resolve_path(&r.path))
            .collect();
        assert_eq!(
            paths,
            vec![
                "/",
                "/orgs/Netflix",
                "/orgs/Netflix/members",
                "/orgs/Netflix/repos"
            ]
        );
    }

    #[test]
    fn full_config_parses() {
        let yaml = r#"
upstream:
  scheme: http
  hostname: ghe.example.com
  timeout: 3
proxy:
  http_listen: "127.0.0.1:9000"
store:
  backend: memory
cache:
  org: acme
  refresh_interval: 15
  repos_failure_policy: skip
  resources:
    - path: /orgs/{org}/repos
      paginate: true
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        validate_config(&config).unwrap();
        assert_eq!(config.upstream.base_url(), "http://ghe.example.com");
        assert_eq!(config.upstream.connect_timeout(), Duration::from_secs(3));
        assert_eq!(config.cache.repos_failure_policy, FailurePolicy::Skip);
        assert_eq!(config.cache.refresh_period(), Duration::from_secs(15));
        assert_eq!(config.cache.resources.len(), 1);
    }

    #[test]
    fn rejects_zero_refresh_interval() {
        let config: Config =
            serde_yaml::from_str("cache:\n  org: acme\n  refresh_interval: 0\n").unwrap();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_missing_repos_resource() {
        let yaml = "cache:\n  org: acme\n  resources:\n    - path: /\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("/orgs/acme/repos"));
    }

    #[test]
    fn rejects_duplicate_resource_paths() {
        let yaml = r#"
cache:
  org: acme
  resources:
    - path: /orgs/{org}/repos
    - path: /orgs/acme/repos
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn env_overrides_take_precedence() {
        let mut config: Config = serde_yaml::from_str("cache:\n  org: acme\n").unwrap();
        apply_env_overrides(&mut config, |name| match name {
            "ORGCACHE_ORG" => Some("other".to_string()),
            "ORGCACHE_REFRESH_INTERVAL" => Some("5".to_string()),
            "ORGCACHE_HTTP_LISTEN" => Some("127.0.0.1:1".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.cache.org, "other");
        assert_eq!(config.cache.refresh_interval, 5);
        assert_eq!(config.proxy.http_listen, "127.0.0.1:1");
        assert_eq!(config.cache.repos_path(), "/orgs/other/repos");
    }

    #[test]
    fn env_override_rejects_bad_interval() {
        let mut config: Config = serde_yaml::from_str("cache:\n  org: acme\n").unwrap();
        let result = apply_env_overrides(&mut config, |name| {
            (name == "ORGCACHE_REFRESH_INTERVAL").then(|| "soon".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn shipped_example_config_is_valid() {
        let config: Config =
            serde_yaml::from_str(include_str!("../config.example.yaml")).unwrap();
        validate_config(&config).unwrap();
        assert_eq!(config.cache.repos_path(), "/orgs/Netflix/repos");
        assert_eq!(config.upstream.connect_timeout(), Duration::from_secs(5));
    }
}
