//! Stage 2: subject-access-review authorization, cached by the textual
//! canonical form of the full SAR spec (`spec.md` §4.6 "Authz", §9 open
//! question 3: per-SAR caching is a strict superset of per-user caching).

use k8s_openapi::api::authorization::v1::{
    ResourceAttributes as K8sResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec,
};
use kube::api::{Api, PostParams};
use thiserror::Error;
use tracing::{info, warn};

use super::authn::AuthPrincipal;
use super::AuthPipeline;
use crate::cache::CachedValue;

/// One `(verb, group, resource, subresource, namespace, name)` tuple to
/// authorize (`spec.md` §4.6 "Build a list of `ResourceAttributes` from
/// path parameters").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAttributes {
    pub verb: String,
    pub group: String,
    pub resource: String,
    pub subresource: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceAttributes {
    /// Canonical textual form used as the cache key — stable field order,
    /// every field present even when empty, so two logically-identical
    /// attribute sets always hash the same way.
    pub fn canonical_text(&self, principal: &AuthPrincipal) -> String {
        format!(
            "sar:user={}:verb={}:group={}:resource={}:subresource={}:namespace={}:name={}",
            principal.name, self.verb, self.group, self.resource, self.subresource, self.namespace, self.name
        )
    }

    fn to_k8s(&self) -> K8sResourceAttributes {
        K8sResourceAttributes {
            verb: Some(self.verb.clone()),
            group: non_empty(&self.group),
            resource: non_empty(&self.resource),
            subresource: non_empty(&self.subresource),
            namespace: non_empty(&self.namespace),
            name: non_empty(&self.name),
            ..Default::default()
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Build the attribute list for a request, per `spec.md` §4.6 and the
/// two literal scenarios in §8 (named GET, `/log` subpath).
///
/// `verb` is `get` when `name` is present, `list` otherwise. A `/log`
/// suffix appends a second attribute granting `pods/log get`.
pub fn build_resource_attributes(
    group: &str,
    resource: &str,
    namespace: &str,
    name: Option<&str>,
    is_log_request: bool,
) -> Vec<ResourceAttributes> {
    let verb = if name.is_some() { "get" } else { "list" };
    let mut attrs = vec![ResourceAttributes {
        verb: verb.to_string(),
        group: group.to_string(),
        resource: resource.to_string(),
        subresource: String::new(),
        namespace: namespace.to_string(),
        name: name.unwrap_or_default().to_string(),
    }];

    if is_log_request {
        attrs.push(ResourceAttributes {
            verb: "get".to_string(),
            group: String::new(),
            resource: "pods".to_string(),
            subresource: "log".to_string(),
            namespace: namespace.to_string(),
            name: name.unwrap_or_default().to_string(),
        });
    }

    attrs
}

#[derive(Debug, Error)]
pub enum AuthzError {
    #[error("access denied")]
    Denied,
    #[error("upstream subject access review failed: {0}")]
    UpstreamFailure(String),
}

impl AuthPipeline {
    /// Evaluate one `ResourceAttributes` entry for `principal`, through
    /// the shared cache.
    async fn check_one(
        &self,
        principal: &AuthPrincipal,
        attrs: &ResourceAttributes,
    ) -> Result<(), AuthzError> {
        let key = attrs.canonical_text(principal);

        if let Some(cached) = self.authz_cache.get(&key).await {
            return match cached {
                CachedValue::Positive(true) => Ok(()),
                _ => Err(AuthzError::Denied),
            };
        }

        let sars: Api<SubjectAccessReview> = Api::all(self.client.clone());
        let review = SubjectAccessReview {
            spec: SubjectAccessReviewSpec {
                user: Some(principal.name.clone()),
                uid: non_empty(&principal.uid),
                groups: Some(principal.groups.iter().cloned().collect()),
                resource_attributes: Some(attrs.to_k8s()),
                ..Default::default()
            },
            ..Default::default()
        };

        let result = sars.create(&PostParams::default(), &review).await;
        let reviewed = match result {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "subject_access_review_upstream_failure");
                return Err(AuthzError::UpstreamFailure(e.to_string()));
            }
        };

        let allowed = reviewed.status.map(|s| s.allowed).unwrap_or(false);
        if allowed {
            self.authz_cache.put_positive(key, true).await;
            Ok(())
        } else {
            self.authz_cache.put_negative(key).await;
            info!(user = %principal.name, verb = %attrs.verb, resource = %attrs.resource, "subject_access_review_denied");
            Err(AuthzError::Denied)
        }
    }

    /// Evaluate every attribute; stop at the first denial
    /// (`spec.md` §4.6: "on any denial, stop and 401").
    pub async fn authorize(
        &self,
        principal: &AuthPrincipal,
        attrs: &[ResourceAttributes],
    ) -> Result<(), AuthzError> {
        for a in attrs {
            self.check_one(principal, a).await?;
        }
        Ok(())
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_get_produces_single_get_attribute() {
        let attrs = build_resource_attributes("", "pods", "ns", Some("my-pod"), false);
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs[0].verb, "get");
        assert_eq!(attrs[0].namespace, "ns");
        assert_eq!(attrs[0].name, "my-pod");
        assert_eq!(attrs[0].resource, "pods");
    }

    #[test]
    fn list_without_name_uses_list_verb() {
        let attrs = build_resource_attributes("", "pods", "ns", None, false);
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs[0].verb, "list");
    }

    #[test]
    fn log_subpath_appends_pods_log_attribute() {
        // Scenario 5 (spec.md §8): /apis/batch/v1/namespaces/ns/cronjobs/my-cronjob/log
        let attrs = build_resource_attributes("batch", "cronjobs", "ns", Some("my-cronjob"), true);
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[1].resource, "pods");
        assert_eq!(attrs[1].subresource, "log");
        assert_eq!(attrs[1].verb, "get");
        assert_eq!(attrs[1].namespace, "ns");
    }

    #[test]
    fn canonical_text_is_stable_for_identical_attrs() {
        let principal = AuthPrincipal {
            name: "alice".to_string(),
            uid: "u1".to_string(),
            groups: Default::default(),
            extra: Default::default(),
        };
        let a = ResourceAttributes {
            verb: "get".to_string(),
            group: "".to_string(),
            resource: "pods".to_string(),
            subresource: "".to_string(),
            namespace: "ns".to_string(),
            name: "my-pod".to_string(),
        };
        assert_eq!(a.canonical_text(&principal), a.canonical_text(&principal));
    }

    #[test]
    fn canonical_text_differs_on_any_field() {
        let principal = AuthPrincipal {
            name: "alice".to_string(),
            uid: "u1".to_string(),
            groups: Default::default(),
            extra: Default::default(),
        };
        let a = ResourceAttributes {
            verb: "get".to_string(),
            group: String::new(),
            resource: "pods".to_string(),
            subresource: String::new(),
            namespace: "ns".to_string(),
            name: "a".to_string(),
        };
        let b = ResourceAttributes { name: "b".to_string(), ..a.clone() };
        assert_ne!(a.canonical_text(&principal), b.canonical_text(&principal));
    }
}
