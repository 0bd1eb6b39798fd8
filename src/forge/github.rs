//! GitHub REST API client used by the refresh workers.
//!
//! Collection endpoints are paginated with `per_page` and followed through
//! the `Link: <...>; rel="next"` response header until the last page.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, LINK};
use tracing::{debug, error, instrument};

use super::rate_limit::RateLimitState;
use super::{authorization_value, ResourceFetcher};
use crate::cache::CacheError;
use crate::config::UpstreamConfig;
use crate::metrics::{MetricsRegistry, ResourceLabels};

const GITHUB_ACCEPT: &str = "application/vnd.github.v3+json";

// ---------------------------------------------------------------------------
// Client struct
// ---------------------------------------------------------------------------

pub struct GitHubClient {
    http_client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    per_page: u32,
    rate_limit_buffer: u32,
    rate_limit: RateLimitState,
    metrics: MetricsRegistry,
}

impl GitHubClient {
    pub fn new(
        config: &UpstreamConfig,
        http_client: reqwest::Client,
        metrics: MetricsRegistry,
    ) -> Self {
        let token = config.token();
        if token.is_none() {
            // Unauthenticated calls still work, at a far lower rate limit.
            error!(
                token_env = %config.token_env,
                "upstream API token is not set; requests will be unauthenticated"
            );
        }
        Self {
            http_client,
            base_url: config.base_url(),
            token,
            per_page: config.per_page,
            rate_limit_buffer: config.rate_limit_buffer,
            rate_limit: RateLimitState::new(),
            metrics,
        }
    }

    /// Issue one authenticated GET and return the successful response.
    async fn send(&self, path: &str, url: &str) -> Result<reqwest::Response, CacheError> {
        self.rate_limit.throttle(self.rate_limit_buffer).await;

        let mut request = self.http_client.get(url).header(ACCEPT, GITHUB_ACCEPT);
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, authorization_value(token));
        }

        let resp = request
            .send()
            .await
            .map_err(|e| CacheError::upstream_fetch(path, e))?;

        self.metrics
            .metrics
            .upstream_api_calls
            .get_or_create(&ResourceLabels {
                resource: path.to_string(),
            })
            .inc();
        self.rate_limit.observe(resp.headers());
        if self.rate_limit.remaining() != u64::MAX {
            self.metrics
                .metrics
                .upstream_api_rate_limit_remaining
                .set(self.rate_limit.remaining().min(i64::MAX as u64) as i64);
        }

        let status = resp.status();
        if !status.is_success() {
            return Err(CacheError::UpstreamStatus {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(resp)
    }
}

// ---------------------------------------------------------------------------
// Trait implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl ResourceFetcher for GitHubClient {
    #[instrument(skip(self))]
    async fn list_resources(&self, path: &str) -> Result<Vec<serde_json::Value>, CacheError> {
        let mut items = Vec::new();
        let mut next = Some(first_page_url(&self.base_url, path, self.per_page));
        let mut pages = 0usize;

        while let Some(url) = next.take() {
            let resp = self.send(path, &url).await?;
            next = next_page_url(resp.headers());

            let body = resp
                .bytes()
                .await
                .map_err(|e| CacheError::upstream_fetch(path, e))?;
            let page: Vec<serde_json::Value> =
                serde_json::from_slice(&body).map_err(|e| CacheError::serialization(path, e))?;
            items.extend(page);
            pages += 1;
        }

        debug!(path, pages, items = items.len(), "fetched collection");
        Ok(items)
    }

    #[instrument(skip(self))]
    async fn get_resource(&self, path: &str) -> Result<Bytes, CacheError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.send(path, &url).await?;
        resp.bytes()
            .await
            .map_err(|e| CacheError::upstream_fetch(path, e))
    }
}

// ---------------------------------------------------------------------------
// Pagination helpers
// ---------------------------------------------------------------------------

fn first_page_url(base_url: &str, path: &str, per_page: u32) -> String {
    let sep = if path.contains('?') { '&' } else { '?' };
    format!("{base_url}{path}{sep}per_page={per_page}")
}

/// Extract the `rel="next"` target from an RFC 5988 `Link` header.
pub fn next_page_url(headers: &HeaderMap) -> Option<String> {
    let link = headers.get(LINK)?.to_str().ok()?;
    link.split(',').find_map(|part| {
        let mut segments = part.split(';');
        let target = segments.next()?.trim();
        let is_next = segments.any(|param| {
            let param = param.trim();
            param == "rel=\"next\"" || param == "rel=next"
        });
        if !is_next {
            return None;
        }
        target
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .map(str::to_string)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(LINK, value.parse().unwrap());
        headers
    }

    #[test]
    fn next_link_is_found_among_others() {
        let headers = link(
            "<https://api.github.com/organizations/913567/repos?per_page=100&page=2>; rel=\"next\", \
             <https://api.github.com/organizations/913567/repos?per_page=100&page=5>; rel=\"last\"",
        );
        assert_eq!(
            next_page_url(&headers).as_deref(),
            Some("https://api.github.com/organizations/913567/repos?per_page=100&page=2")
        );
    }

    #[test]
    fn last_page_has_no_next_link() {
        let headers = link(
            "<https://api.github.com/organizations/913567/repos?page=1>; rel=\"first\", \
             <https://api.github.com/organizations/913567/repos?page=4>; rel=\"prev\"",
        );
        assert_eq!(next_page_url(&headers), None);
        assert_eq!(next_page_url(&HeaderMap::new()), None);
    }

    #[test]
    fn first_page_url_appends_per_page() {
        assert_eq!(
            first_page_url("https://api.github.com", "/orgs/acme/repos", 100),
            "https://api.github.com/orgs/acme/repos?per_page=100"
        );
        assert_eq!(
            first_page_url("https://api.github.com", "/orgs/acme/repos?type=public", 10),
            "https://api.github.com/orgs/acme/repos?type=public&per_page=10"
        );
    }

    async fn serve_paginated_repos() -> std::net::SocketAddr {
        use axum::extract::{Query, State};
        use axum::response::IntoResponse;
        use std::collections::HashMap;

        async fn repos(
            State(addr): State<std::net::SocketAddr>,
            Query(query): Query<HashMap<String, String>>,
        ) -> axum::response::Response {
            match query.get("page").map(String::as_str) {
                None => (
                    [(
                        LINK.as_str(),
                        format!("<http://{addr}/orgs/acme/repos?per_page=2&page=2>; rel=\"next\""),
                    )],
                    r#"[{"full_name":"acme/a"},{"full_name":"acme/b"}]"#,
                )
                    .into_response(),
                Some(_) => r#"[{"full_name":"acme/c"}]"#.into_response(),
            }
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = axum::Router::new()
            .route("/orgs/acme/repos", axum::routing::get(repos))
            .route(
                "/orgs/acme/missing",
                axum::routing::get(|| async { axum::http::StatusCode::NOT_FOUND }),
            )
            .with_state(addr);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn client_for(addr: std::net::SocketAddr) -> GitHubClient {
        let config = UpstreamConfig {
            scheme: "http".to_string(),
            hostname: addr.to_string(),
            per_page: 2,
            ..UpstreamConfig::default()
        };
        GitHubClient::new(&config, reqwest::Client::new(), MetricsRegistry::new())
    }

    #[tokio::test]
    async fn list_resources_follows_every_page() {
        let addr = serve_paginated_repos().await;
        let client = client_for(addr);

        let items = client.list_resources("/orgs/acme/repos").await.unwrap();
        let names: Vec<&str> = items
            .iter()
            .map(|v| v["full_name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["acme/a", "acme/b", "acme/c"]);
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let addr = serve_paginated_repos().await;
        let client = client_for(addr);

        let err = client.get_resource("/orgs/acme/missing").await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::UpstreamStatus { status: 404, .. }
        ));
    }
}
