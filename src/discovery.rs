//! Discovery cache: plural resource name → kind, resolved against the
//! live cluster and cached with a long TTL (`spec.md` §4.10).
//!
//! Shares the `TtlCache` discipline from [`crate::cache`] (one cache
//! discipline for the whole process per `spec.md` §5), under its own key
//! namespace so a discovery hit never collides with an authn/authz entry
//! even though both live in the same process.

use std::time::Duration;

use kube::Client;
use thiserror::Error;

use crate::cache::TtlCache;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("upstream discovery call failed with status {0}")]
    UpstreamStatus(u16),
    #[error("upstream discovery call failed: {0}")]
    Upstream(String),
    #[error("no resource named '{0}' found in {1}")]
    NotFound(String, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKind {
    pub kind: String,
    pub namespaced: bool,
}

/// One instance of the shared TTL cache, scoped to discovery lookups.
#[derive(Clone)]
pub struct DiscoveryCache {
    cache: TtlCache<ResolvedKind>,
}

impl DiscoveryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            // Discovery results never go stale in a way worth a negative
            // cache entry distinct from "miss" — a failed lookup is always
            // retried on the next request (spec.md §4.10 only prescribes
            // a positive-result cache).
            cache: TtlCache::new(ttl, Duration::from_secs(0)),
        }
    }

    fn cache_key(api_version: &str, plural: &str) -> String {
        format!("discovery:{api_version}:{plural}")
    }

    /// Resolve `plural` under `api_version` (`"v1"` or `"group/v1"`).
    ///
    /// On cache miss, issues `GET /api/<v>` (core) or `/apis/<group>/<v>`
    /// (named group) and linearly scans the result for a matching
    /// `name`, exactly as `spec.md` §4.10 specifies. On upstream failure
    /// the status is surfaced verbatim (`spec.md` §7: discovery failures
    /// are 404/400 "per legacy behavior", decided by the caller).
    pub async fn resolve(
        &self,
        client: &Client,
        api_version: &str,
        plural: &str,
    ) -> Result<ResolvedKind, DiscoveryError> {
        let key = Self::cache_key(api_version, plural);
        if let Some(hit) = self.cache.get(&key).await {
            if let Some(resolved) = hit.as_positive() {
                return Ok(resolved.clone());
            }
        }

        let path = discovery_path(api_version);
        let request = http::Request::builder()
            .uri(path)
            .body(Vec::new())
            .map_err(|e| DiscoveryError::Upstream(e.to_string()))?;

        let body: serde_json::Value = client
            .request(request)
            .await
            .map_err(|e| DiscoveryError::Upstream(e.to_string()))?;

        let resolved = scan_api_resource_list(&body.to_string(), plural)
            .ok_or_else(|| DiscoveryError::NotFound(plural.to_string(), api_version.to_string()))?;

        self.cache.put_positive(key, resolved.clone()).await;
        Ok(resolved)
    }
}

fn discovery_path(api_version: &str) -> String {
    match api_version.split_once('/') {
        Some((group, version)) => format!("/apis/{group}/{version}"),
        None => format!("/api/{api_version}"),
    }
}

/// Linearly scan a serialized `APIResourceList` for a resource whose
/// `name` matches `plural`, returning its `kind` and namespaced-ness.
fn scan_api_resource_list(body: &str, plural: &str) -> Option<ResolvedKind> {
    let parsed: serde_json::Value = serde_json::from_str(body).ok()?;
    let resources = parsed.get("resources")?.as_array()?;
    for resource in resources {
        if resource.get("name")?.as_str()? == plural {
            let kind = resource.get("kind")?.as_str()?.to_string();
            let namespaced = resource.get("namespaced").and_then(|v| v.as_bool()).unwrap_or(true);
            return Some(ResolvedKind { kind, namespaced });
        }
    }
    None
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_path_core_group() {
        assert_eq!(discovery_path("v1"), "/api/v1");
    }

    #[test]
    fn discovery_path_named_group() {
        assert_eq!(discovery_path("batch/v1"), "/apis/batch/v1");
    }

    #[test]
    fn scan_finds_matching_plural() {
        let body = serde_json::json!({
            "resources": [
                {"name": "pods", "kind": "Pod", "namespaced": true},
                {"name": "nodes", "kind": "Node", "namespaced": false},
            ]
        })
        .to_string();
        let resolved = scan_api_resource_list(&body, "pods").unwrap();
        assert_eq!(resolved.kind, "Pod");
        assert!(resolved.namespaced);

        let node = scan_api_resource_list(&body, "nodes").unwrap();
        assert!(!node.namespaced);
    }

    #[test]
    fn scan_returns_none_for_unknown_plural() {
        let body = serde_json::json!({"resources": []}).to_string();
        assert!(scan_api_resource_list(&body, "widgets").is_none());
    }
}
