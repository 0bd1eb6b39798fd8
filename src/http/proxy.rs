//! Reverse-proxy fallback for everything outside the cached set.
//!
//! Requests are forwarded with their method, path, query, headers and body.
//! The upstream credential replaces any client `Authorization` header and the
//! response is streamed back without buffering.

use axum::{
    body::{Body, HttpBody},
    extract::Request,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{debug, instrument, warn};

use crate::config::UpstreamConfig;
use crate::forge::authorization_value;

const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_ORIGIN_HOST: HeaderName = HeaderName::from_static("x-origin-host");

/// Connection-scoped headers that must not be forwarded (RFC 9110 §7.6.1).
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

pub struct ReverseProxy {
    client: reqwest::Client,
    base_url: String,
    origin_host: String,
    authorization: Option<HeaderValue>,
}

impl ReverseProxy {
    /// Build a proxy for the configured upstream. Redirects are handed back to
    /// the client rather than followed.
    pub fn new(config: &UpstreamConfig) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        let authorization = config.token().and_then(|token| {
            match HeaderValue::from_str(&authorization_value(&token)) {
                Ok(mut value) => {
                    value.set_sensitive(true);
                    Some(value)
                }
                Err(e) => {
                    warn!(error = %e, "upstream token is not a valid header value");
                    None
                }
            }
        });

        Ok(Self {
            client,
            base_url: config.base_url(),
            origin_host: config.hostname.clone(),
            authorization,
        })
    }

    /// Forward `req` to the upstream and relay its response.
    #[instrument(skip_all, fields(method = %req.method(), path = %req.uri().path()))]
    pub async fn forward(&self, req: Request) -> Response {
        let (parts, body) = req.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", self.base_url, path_and_query);

        let mut headers = forwarded_headers(&parts.headers);
        if let Some(host) = parts.headers.get(header::HOST) {
            headers.insert(X_FORWARDED_HOST, host.clone());
        }
        if let Ok(origin) = HeaderValue::from_str(&self.origin_host) {
            headers.insert(X_ORIGIN_HOST, origin);
        }
        if let Some(auth) = &self.authorization {
            headers.insert(header::AUTHORIZATION, auth.clone());
        }

        let mut request = self.client.request(parts.method, &url).headers(headers);
        if !body.is_end_stream() {
            request = request.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }
        let upstream = request.send().await;

        let upstream = match upstream {
            Ok(resp) => resp,
            Err(e) => {
                warn!(error = %e, %url, "upstream request failed");
                let status = if e.is_timeout() {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::BAD_GATEWAY
                };
                return (status, "upstream unavailable").into_response();
            }
        };

        let status = upstream.status();
        debug!(%status, "upstream responded");

        let response_headers = forwarded_headers(upstream.headers());
        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        response
    }
}

/// Copy `headers` minus hop-by-hop fields and `Host`.
fn forwarded_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    out.remove(header::HOST);
    for name in &HOP_BY_HOP {
        out.remove(name);
    }
    out
}
