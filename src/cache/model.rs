use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CacheConfig;

/// One upstream resource kept in the store under its canonical path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResource {
    /// Resolved upstream path, also the store key and the served route.
    pub path: String,
    /// Collection endpoint: every page is fetched and merged.
    pub paginate: bool,
}

impl CachedResource {
    /// Resolve the configured resources for the configured organization.
    pub fn from_config(config: &CacheConfig) -> Vec<Self> {
        config
            .resources
            .iter()
            .map(|r| Self {
                path: config.resolve_path(&r.path),
                paginate: r.paginate,
            })
            .collect()
    }
}

/// The repository fields the views are built from.
///
/// Every field is required: a record without one of them fails to decode
/// rather than sorting with a made-up value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub full_name: String,
    pub forks_count: u64,
    pub open_issues_count: u64,
    pub stargazers_count: u64,
    pub updated_at: DateTime<Utc>,
}

/// Timestamp rendering used in view output (`2006-01-02T15:04:05Z`).
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_upstream_record_ignoring_extra_fields() {
        let json = r#"{
            "id": 1,
            "full_name": "acme/widgets",
            "forks_count": 3,
            "open_issues_count": 7,
            "stargazers_count": 42,
            "updated_at": "2019-03-04T05:06:07Z",
            "owner": {"login": "acme"}
        }"#;
        let repo: Repository = serde_json::from_str(json).unwrap();
        assert_eq!(repo.full_name, "acme/widgets");
        assert_eq!(repo.stargazers_count, 42);
        assert_eq!(format_timestamp(&repo.updated_at), "2019-03-04T05:06:07Z");
    }

    #[test]
    fn missing_metric_is_a_decode_error() {
        let json = r#"{
            "full_name": "acme/widgets",
            "forks_count": 3,
            "open_issues_count": 7,
            "updated_at": "2019-03-04T05:06:07Z"
        }"#;
        assert!(serde_json::from_str::<Repository>(json).is_err());
    }

    #[test]
    fn resources_resolve_org_placeholder() {
        let config = crate::config::test_config("acme");
        let resources = CachedResource::from_config(&config.cache);
        assert!(resources.contains(&CachedResource {
            path: "/orgs/acme/members".to_string(),
            paginate: true,
        }));
        assert!(resources.contains(&CachedResource {
            path: "/".to_string(),
            paginate: false,
        }));
    }
}
