use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RefreshLabels {
    pub resource: String,
    pub outcome: RefreshOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum RefreshOutcome {
    Success,
    Failure,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ResourceLabels {
    pub resource: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ViewLabels {
    pub view: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RouteLabels {
    pub route: RouteKind,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum RouteKind {
    Cached,
    View,
    PassThrough,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the cache.
pub struct Metrics {
    // -- refresh workers --
    pub refresh_cycles_total: Family<RefreshLabels, Counter>,
    pub refresh_duration_seconds: Family<ResourceLabels, Histogram>,

    // -- views --
    pub view_builds_total: Counter,
    pub view_persist_failures_total: Family<ViewLabels, Counter>,

    // -- requests --
    pub requests_total: Family<RouteLabels, Counter>,

    // -- upstream API --
    pub upstream_api_calls: Family<ResourceLabels, Counter>,
    pub upstream_api_rate_limit_remaining: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let refresh_cycles_total = Family::<RefreshLabels, Counter>::default();
        registry.register(
            "orgcache_refresh_cycles",
            "Completed refresh cycles by resource and outcome",
            refresh_cycles_total.clone(),
        );

        let refresh_duration_seconds =
            Family::<ResourceLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.05, 2.0, 12))
            });
        registry.register(
            "orgcache_refresh_duration_seconds",
            "Refresh cycle latency in seconds",
            refresh_duration_seconds.clone(),
        );

        let view_builds_total = Counter::default();
        registry.register(
            "orgcache_view_builds",
            "View rebuilds triggered by a fresh repository snapshot",
            view_builds_total.clone(),
        );

        let view_persist_failures_total = Family::<ViewLabels, Counter>::default();
        registry.register(
            "orgcache_view_persist_failures",
            "Views that could not be serialized or stored",
            view_persist_failures_total.clone(),
        );

        let requests_total = Family::<RouteLabels, Counter>::default();
        registry.register(
            "orgcache_requests",
            "Inbound requests by routing decision",
            requests_total.clone(),
        );

        let upstream_api_calls = Family::<ResourceLabels, Counter>::default();
        registry.register(
            "orgcache_upstream_api_calls",
            "Upstream API calls made by refresh workers",
            upstream_api_calls.clone(),
        );

        let upstream_api_rate_limit_remaining: Gauge = Gauge::default();
        registry.register(
            "orgcache_upstream_api_rate_limit_remaining",
            "Remaining upstream API calls before rate limit",
            upstream_api_rate_limit_remaining.clone(),
        );

        Self {
            refresh_cycles_total,
            refresh_duration_seconds,
            view_builds_total,
            view_persist_failures_total,
            requests_total,
            upstream_api_calls,
            upstream_api_rate_limit_remaining,
        }
    }

    pub fn record_refresh(&self, resource: &str, outcome: RefreshOutcome, seconds: f64) {
        self.refresh_cycles_total
            .get_or_create(&RefreshLabels {
                resource: resource.to_string(),
                outcome,
            })
            .inc();
        self.refresh_duration_seconds
            .get_or_create(&ResourceLabels {
                resource: resource.to_string(),
            })
            .observe(seconds);
    }

    pub fn record_route(&self, route: RouteKind) {
        self.requests_total
            .get_or_create(&RouteLabels { route })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, shared by workers and handlers.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}
