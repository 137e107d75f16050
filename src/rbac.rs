//! RBAC reconciler (`spec.md` §4.7): derives `Role`/`RoleBinding`/
//! `ClusterRole`/`ClusterRoleBinding` objects purely from a
//! [`crate::filterstore::FilterStore`] snapshot. Pure functions — the
//! caller (the `rbac` CLI command or a future controller) applies them
//! via `kube::Api::patch`, the same pattern the teacher uses for its
//! `Lease` object in `commands/watch.rs::acquire_leader`.

use std::collections::BTreeSet;

use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule as K8sPolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::filterstore::FilterStore;

pub const CLUSTER_READ_ROLE_NAME: &str = "kubearchive-read";
pub const CLUSTER_ROLE_BINDING_NAME: &str = "kubearchive-vacuum-read";

fn namespace_delete_role_name(namespace: &str) -> String {
    format!("kubearchive-delete-{namespace}")
}

fn namespace_delete_role_binding_name(namespace: &str) -> String {
    format!("kubearchive-delete-{namespace}-binding")
}

/// Every distinct `(group, resource)` referenced anywhere in the store.
fn distinct_group_resources(store: &FilterStore) -> BTreeSet<(String, String)> {
    let mut out = BTreeSet::new();
    let all_rules = store.cluster.iter().chain(store.namespaces.values().flatten());
    for rule in all_rules {
        let (group, resource) = split_group_resource(&rule.selector.api_version, &rule.selector.kind);
        out.insert((group, resource));
    }
    out
}

/// Best-effort group/resource split used only to build RBAC rules, not
/// to address the API — mirrors [`crate::supervisor::plural_guess`]'s
/// role as a seed rather than an authority.
fn split_group_resource(api_version: &str, kind: &str) -> (String, String) {
    let group = api_version.split_once('/').map(|(g, _)| g.to_string()).unwrap_or_default();
    let resource = plural(&kind.to_lowercase());
    (group, resource)
}

fn plural(lower: &str) -> String {
    if lower.ends_with('s') {
        format!("{lower}es")
    } else if lower.ends_with('y') {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{lower}s")
    }
}

/// Cluster-scoped read role covering every distinct API group × resource
/// in the union of cluster and namespace rules, verbs `{get, list, watch}`
/// (`spec.md` §4.7).
pub fn cluster_read_role(store: &FilterStore) -> ClusterRole {
    let rules = distinct_group_resources(store)
        .into_iter()
        .map(|(group, resource)| K8sPolicyRule {
            api_groups: Some(vec![group]),
            resources: Some(vec![resource]),
            verbs: vec!["get".to_string(), "list".to_string(), "watch".to_string()],
            ..Default::default()
        })
        .collect();

    ClusterRole {
        metadata: ObjectMeta { name: Some(CLUSTER_READ_ROLE_NAME.to_string()), ..Default::default() },
        rules: Some(rules),
        ..Default::default()
    }
}

/// Per-namespace delete role, verbs `{delete}`, restricted to the
/// selectors named in that namespace's policy plus any cluster policy
/// inherited into it (`spec.md` §4.7).
pub fn namespace_delete_role(store: &FilterStore, namespace: &str) -> Option<Role> {
    let namespace_rules = store.namespaces.get(namespace)?;

    let mut group_resources: BTreeSet<(String, String)> = namespace_rules
        .iter()
        .map(|r| split_group_resource(&r.selector.api_version, &r.selector.kind))
        .collect();
    group_resources.extend(
        store
            .cluster
            .iter()
            .map(|r| split_group_resource(&r.selector.api_version, &r.selector.kind)),
    );

    let rules = group_resources
        .into_iter()
        .map(|(group, resource)| K8sPolicyRule {
            api_groups: Some(vec![group]),
            resources: Some(vec![resource]),
            verbs: vec!["delete".to_string()],
            ..Default::default()
        })
        .collect();

    Some(Role {
        metadata: ObjectMeta {
            name: Some(namespace_delete_role_name(namespace)),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        rules: Some(rules),
        ..Default::default()
    })
}

/// Role bindings attaching the sink and vacuum service identities
/// (`spec.md` §4.7).
pub fn namespace_delete_role_binding(namespace: &str, vacuum_service_account: &str) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(namespace_delete_role_binding_name(namespace)),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: namespace_delete_role_name(namespace),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: vacuum_service_account.to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    }
}

/// Cluster role binding granting vacuum identities read access to the
/// cluster policy (`spec.md` §4.7).
pub fn cluster_role_binding(vacuum_service_accounts: &[(String, String)]) -> ClusterRoleBinding {
    let subjects = vacuum_service_accounts
        .iter()
        .map(|(name, namespace)| Subject {
            kind: "ServiceAccount".to_string(),
            name: name.clone(),
            namespace: Some(namespace.clone()),
            ..Default::default()
        })
        .collect();

    ClusterRoleBinding {
        metadata: ObjectMeta { name: Some(CLUSTER_ROLE_BINDING_NAME.to_string()), ..Default::default() },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: CLUSTER_READ_ROLE_NAME.to_string(),
        },
        subjects: Some(subjects),
    }
}

/* ============================= TESTS ============================= */
