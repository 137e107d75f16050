//! Stage 3: impersonation, gated by [`crate::config::Config::impersonation_enabled`]
//! (`spec.md` §4.6 "Impersonation").
//!
//! Recognizes the fixed Kubernetes impersonation header family —
//! `Impersonate-User`, repeatable `Impersonate-Group`, `Impersonate-Uid`,
//! and `Impersonate-Extra-<key>` — and authorizes the *requester's*
//! principal to impersonate each attribute via its own SAR before
//! swapping in the impersonated principal.

use std::collections::{BTreeMap, HashSet};

use http::HeaderMap;

use super::authn::AuthPrincipal;
use super::authz::ResourceAttributes;
use super::{AuthPipeline, PipelineError};

pub const USER_HEADER: &str = "impersonate-user";
pub const GROUP_HEADER: &str = "impersonate-group";
pub const UID_HEADER: &str = "impersonate-uid";
pub const EXTRA_HEADER_PREFIX: &str = "impersonate-extra-";

const IMPERSONATION_GROUP: &str = "authentication.k8s.io";

/// The impersonation request parsed out of a header map, or `None` when
/// no impersonation headers are present at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImpersonationRequest {
    pub user: String,
    pub groups: Vec<String>,
    pub uid: Option<String>,
    pub extra: BTreeMap<String, Vec<String>>,
}

/// Parse impersonation headers out of `headers`.
///
/// `spec.md` §4.6: "If any impersonation header is present but the
/// 'user' header is absent, reject with 400." Returns `Ok(None)` when no
/// impersonation header of any kind is present.
pub fn parse_impersonation_headers(
    headers: &HeaderMap,
) -> Result<Option<ImpersonationRequest>, PipelineError> {
    let has_any = headers.keys().any(|k| {
        let name = k.as_str().to_ascii_lowercase();
        name == USER_HEADER
            || name == GROUP_HEADER
            || name == UID_HEADER
            || name.starts_with(EXTRA_HEADER_PREFIX)
    });
    if !has_any {
        return Ok(None);
    }

    let user = headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or(PipelineError::ImpersonationMissingUser)?;

    let groups: Vec<String> = headers
        .get_all(GROUP_HEADER)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .collect();

    let uid = headers
        .get(UID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let mut extra: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if let Some(key) = lower.strip_prefix(EXTRA_HEADER_PREFIX) {
            if let Ok(v) = value.to_str() {
                extra.entry(key.to_string()).or_default().push(v.to_string());
            }
        }
    }

    Ok(Some(ImpersonationRequest { user, groups, uid, extra }))
}

/// Split `"system:serviceaccount:<namespace>:<name>"` into its
/// namespace and name, or `None` for any other username shape.
fn parse_service_account(username: &str) -> Option<(&str, &str)> {
    let rest = username.strip_prefix("system:serviceaccount:")?;
    rest.split_once(':')
}

/// `"system:serviceaccount:<namespace>:<name>"` implies the well-known
/// service-account groups.
fn service_account_groups(username: &str) -> Option<Vec<String>> {
    let (namespace, _name) = parse_service_account(username)?;
    Some(vec![
        "system:serviceaccounts".to_string(),
        format!("system:serviceaccounts:{namespace}"),
        "system:authenticated".to_string(),
    ])
}

/// Build the principal that results from a successful impersonation,
/// with implied service-account groups folded in.
fn build_impersonated_principal(req: &ImpersonationRequest) -> AuthPrincipal {
    let mut groups: HashSet<String> = req.groups.iter().cloned().collect();
    if let Some(implied) = service_account_groups(&req.user) {
        groups.extend(implied);
    }
    AuthPrincipal {
        name: req.user.clone(),
        uid: req.uid.clone().unwrap_or_default(),
        groups,
        extra: req.extra.clone(),
    }
}

/// One SAR-shaped attribute per impersonated field
/// (`users`, `groups`, `serviceaccounts`, `uids`, `userextras/<sub>`),
/// each a `verb: impersonate` check against the requester's own
/// principal (`spec.md` §4.6).
fn build_impersonation_attributes(req: &ImpersonationRequest) -> Vec<ResourceAttributes> {
    let mut attrs = match parse_service_account(&req.user) {
        Some((namespace, name)) => vec![ResourceAttributes {
            verb: "impersonate".to_string(),
            group: IMPERSONATION_GROUP.to_string(),
            resource: "serviceaccounts".to_string(),
            subresource: String::new(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }],
        None => vec![ResourceAttributes {
            verb: "impersonate".to_string(),
            group: IMPERSONATION_GROUP.to_string(),
            resource: "users".to_string(),
            subresource: String::new(),
            namespace: String::new(),
            name: req.user.clone(),
        }],
    };

    for group in &req.groups {
        attrs.push(ResourceAttributes {
            verb: "impersonate".to_string(),
            group: IMPERSONATION_GROUP.to_string(),
            resource: "groups".to_string(),
            subresource: String::new(),
            namespace: String::new(),
            name: group.clone(),
        });
    }

    if let Some(uid) = &req.uid {
        attrs.push(ResourceAttributes {
            verb: "impersonate".to_string(),
            group: IMPERSONATION_GROUP.to_string(),
            resource: "uids".to_string(),
            subresource: String::new(),
            namespace: String::new(),
            name: uid.clone(),
        });
    }

    for (key, values) in &req.extra {
        for value in values {
            attrs.push(ResourceAttributes {
                verb: "impersonate".to_string(),
                group: IMPERSONATION_GROUP.to_string(),
                resource: "userextras".to_string(),
                subresource: key.clone(),
                namespace: String::new(),
                name: value.clone(),
            });
        }
    }

    attrs
}

impl AuthPipeline {
    /// Run stage 3. `requester` is the principal authn already
    /// resolved. On success, returns the impersonated principal that
    /// replaces `requester` for the rest of the request
    /// (`spec.md` §4.6: "replace the request principal with the
    /// impersonated one before handing off to authz").
    pub async fn impersonate(
        &self,
        requester: &AuthPrincipal,
        req: &ImpersonationRequest,
    ) -> Result<AuthPrincipal, PipelineError> {
        let attrs = build_impersonation_attributes(req);
        self.authorize(requester, &attrs)
            .await
            .map_err(|e| PipelineError::ImpersonationDenied(e.to_string()))?;
        Ok(build_impersonated_principal(req))
    }
}

/* ============================= TESTS ============================= */
