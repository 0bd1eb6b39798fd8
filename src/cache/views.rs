//! Sorted "top N" projections over the repository collection.
//!
//! Each view is a copy of the collection stable-sorted by one metric in
//! descending order and stored under its own key.  Ties keep the order the
//! repositories had in the upstream collection, so rebuilding from the same
//! input always produces the same bytes.

use std::cmp::Reverse;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

use super::model::{format_timestamp, Repository};
use super::CacheError;
use crate::metrics::{MetricsRegistry, ViewLabels};
use crate::storage::KeyValueStore;

// ---------------------------------------------------------------------------
// View keys
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKey {
    ByForks,
    ByLastUpdated,
    ByOpenIssues,
    ByStars,
}

impl ViewKey {
    pub const ALL: [ViewKey; 4] = [
        ViewKey::ByForks,
        ViewKey::ByLastUpdated,
        ViewKey::ByOpenIssues,
        ViewKey::ByStars,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ViewKey::ByForks => "by-forks",
            ViewKey::ByLastUpdated => "by-last-updated",
            ViewKey::ByOpenIssues => "by-open-issues",
            ViewKey::ByStars => "by-stars",
        }
    }

    /// Key the sorted sequence is persisted under.
    pub fn store_key(&self) -> String {
        format!("top-repo-{}", self.as_str())
    }

    /// Map the last segment of `/view/top/{n}/{metric}`.
    pub fn from_route_segment(segment: &str) -> Option<Self> {
        match segment {
            "forks" => Some(ViewKey::ByForks),
            "last_updated" => Some(ViewKey::ByLastUpdated),
            "open_issues" => Some(ViewKey::ByOpenIssues),
            "stars" => Some(ViewKey::ByStars),
            _ => None,
        }
    }

    /// Stable sort, largest metric first.
    fn sort(&self, repos: &mut [Repository]) {
        match self {
            ViewKey::ByForks => repos.sort_by_key(|r| Reverse(r.forks_count)),
            ViewKey::ByLastUpdated => repos.sort_by_key(|r| Reverse(r.updated_at)),
            ViewKey::ByOpenIssues => repos.sort_by_key(|r| Reverse(r.open_issues_count)),
            ViewKey::ByStars => repos.sort_by_key(|r| Reverse(r.stargazers_count)),
        }
    }

    fn metric(&self, repo: &Repository) -> String {
        match self {
            ViewKey::ByForks => repo.forks_count.to_string(),
            ViewKey::ByLastUpdated => format_timestamp(&repo.updated_at),
            ViewKey::ByOpenIssues => repo.open_issues_count.to_string(),
            ViewKey::ByStars => repo.stargazers_count.to_string(),
        }
    }
}

impl fmt::Display for ViewKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `(repoFullName, metricValue)` row of a view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewEntry {
    pub repo: String,
    pub value: String,
}

/// Render rows as `[[name, value],[name, value]]`. Fields are not quoted;
/// this is a fixed text format, not JSON.
pub fn render_entries(entries: &[ViewEntry]) -> String {
    let rows: Vec<String> = entries
        .iter()
        .map(|e| format!("[{}, {}]", e.repo, e.value))
        .collect();
    format!("[{}]", rows.join(","))
}

/// Parse the `{n}` route parameter. Anything but an integer `>= 1` is
/// rejected.
pub fn parse_limit(raw: &str) -> Result<i64, CacheError> {
    let limit: i64 = raw
        .parse()
        .map_err(|_| CacheError::InvalidLimit(raw.to_string()))?;
    validate_limit(limit)?;
    Ok(limit)
}

fn validate_limit(limit: i64) -> Result<usize, CacheError> {
    if limit < 1 {
        return Err(CacheError::InvalidLimit(limit.to_string()));
    }
    usize::try_from(limit).map_err(|_| CacheError::InvalidLimit(limit.to_string()))
}

/// Which views made it into the store during one build.
#[derive(Debug, Default)]
pub struct BuildReport {
    pub persisted: Vec<ViewKey>,
    pub failed: Vec<(ViewKey, CacheError)>,
}

// ---------------------------------------------------------------------------
// ViewBuilder
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ViewBuilder {
    store: Arc<dyn KeyValueStore>,
    metrics: MetricsRegistry,
}

impl ViewBuilder {
    pub fn new(store: Arc<dyn KeyValueStore>, metrics: MetricsRegistry) -> Self {
        Self { store, metrics }
    }

    /// Sort and persist all four views. A failure on one view is logged and
    /// recorded in the report; the remaining views are still attempted.
    #[instrument(skip(self, repos), fields(repos = repos.len()))]
    pub async fn build_views(&self, repos: &[Repository]) -> BuildReport {
        let mut report = BuildReport::default();
        for key in ViewKey::ALL {
            match self.build_view(key, repos).await {
                Ok(()) => report.persisted.push(key),
                Err(e) => {
                    warn!(view = %key, error = %e, "failed to persist view");
                    self.metrics
                        .metrics
                        .view_persist_failures_total
                        .get_or_create(&ViewLabels {
                            view: key.to_string(),
                        })
                        .inc();
                    report.failed.push((key, e));
                }
            }
        }
        self.metrics.metrics.view_builds_total.inc();
        info!(
            persisted = report.persisted.len(),
            failed = report.failed.len(),
            "views rebuilt"
        );
        report
    }

    async fn build_view(&self, key: ViewKey, repos: &[Repository]) -> Result<(), CacheError> {
        let mut sorted = repos.to_vec();
        key.sort(&mut sorted);
        let store_key = key.store_key();
        let payload =
            serde_json::to_vec(&sorted).map_err(|e| CacheError::serialization(&store_key, e))?;
        self.store.set(&store_key, Bytes::from(payload)).await?;
        debug!(view = %key, "view persisted");
        Ok(())
    }

    /// Return at most `limit` leading rows of a persisted view.
    ///
    /// A view that was never built reads as empty, the same as a view over
    /// zero repositories.
    pub async fn get_view(&self, key: ViewKey, limit: i64) -> Result<Vec<ViewEntry>, CacheError> {
        let limit = validate_limit(limit)?;
        let store_key = key.store_key();

        let Some(payload) = self.store.get(&store_key).await? else {
            debug!(view = %key, "view not built yet");
            return Ok(Vec::new());
        };

        let repos: Vec<Repository> =
            serde_json::from_slice(&payload).map_err(|e| CacheError::serialization(&store_key, e))?;

        Ok(repos
            .iter()
            .take(limit)
            .map(|repo| ViewEntry {
                repo: repo.full_name.clone(),
                value: key.metric(repo),
            })
            .collect())
    }
}
