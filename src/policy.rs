//! Policy model: the `ClusterPolicy` and `NamespacePolicy` custom
//! resources, and the validation rules every create/update must pass
//! before the [`crate::filterstore`] reducer accepts the change.
//!
//! Mirrors the teacher's `src/crd.rs` shape (`kube::CustomResource` derive,
//! `camelCase` rename, `Default` status) generalized from pod-governance
//! fields to archive-policy fields per `spec.md` §3-4.2.

use std::collections::HashSet;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::expr::{CompileError, CompiledExpr};

/// The only name a `ClusterPolicy` or `NamespacePolicy` may be created
/// under (`spec.md` §3, §4.2 rule 1).
pub const RESERVED_POLICY_NAME: &str = "kubearchive";

/* ============================= SELECTOR ============================= */

/// `(apiVersion, kind)` pair — the primary key for everything the watch
/// supervisor watches.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ApiVersionKind {
    pub api_version: String,
    pub kind: String,
}

impl ApiVersionKind {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }

    /// Canonical watch-map key: `"<kind>-<apiVersion>"` (`spec.md` §4.4).
    pub fn watch_key(&self) -> String {
        format!("{}-{}", self.kind, self.api_version)
    }
}

/* ============================= KEEP SPEC ============================= */

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeepRule {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub when: String,
    pub count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct KeepSpec {
    #[serde(default)]
    pub rules: Vec<KeepRule>,
}

/* ============================= POLICY RULE ============================= */

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    pub selector: ApiVersionKind,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub archive_when: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub delete_when: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub archive_on_delete: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_last: Option<KeepSpec>,
}

/* ============================= CLUSTER POLICY ============================= */

/// `ClusterPolicy` — singleton archive policy covering the whole cluster.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "kubearchive.org",
    version = "v1",
    kind = "ClusterPolicy",
    plural = "clusterpolicies",
    status = "ClusterPolicyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPolicySpec {
    #[serde(default)]
    pub resources: Vec<PolicyRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPolicyStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/* ============================= NAMESPACE POLICY ============================= */

/// `NamespacePolicy` — per-namespace archive policy override.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "kubearchive.org",
    version = "v1",
    kind = "NamespacePolicy",
    plural = "namespacepolicies",
    status = "NamespacePolicyStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct NamespacePolicySpec {
    #[serde(default)]
    pub resources: Vec<PolicyRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct NamespacePolicyStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/* ============================= VALIDATION ============================= */

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("resource name must be '{RESERVED_POLICY_NAME}', got '{0}'")]
    WrongName(String),
    #[error("NamespacePolicy must not be created in the operator's own namespace '{0}'")]
    OwnNamespaceForbidden(String),
    #[error("rule for {0:?}: archiveWhen does not compile: {1}")]
    BadArchiveWhen(ApiVersionKind, CompileError),
    #[error("rule for {0:?}: deleteWhen does not compile: {1}")]
    BadDeleteWhen(ApiVersionKind, CompileError),
    #[error("rule for {0:?}: archiveOnDelete does not compile: {1}")]
    BadArchiveOnDelete(ApiVersionKind, CompileError),
    #[error("rule for {0:?}: keepLast rule name '{1}' is empty")]
    EmptyKeepRuleName(ApiVersionKind),
    #[error("rule for {0:?}: keepLast rule name '{1}' is duplicated")]
    DuplicateKeepRuleName(ApiVersionKind, String),
    #[error("rule for {0:?}: keepLast rule expression (normalized) is duplicated")]
    DuplicateKeepRuleExpr(ApiVersionKind),
    #[error("rule for {0:?}: keepLast rule '{1}' has an empty `when` expression")]
    EmptyKeepRuleExpr(ApiVersionKind, String),
    #[error("namespace override for {0:?} references unknown cluster rule name '{1}'")]
    UnknownNamespaceOverrideName(ApiVersionKind, String),
    #[error(
        "namespace override for {0:?} rule '{1}' has count {2} exceeding cluster rule count {3}"
    )]
    NamespaceOverrideCountTooHigh(ApiVersionKind, String, u32, u32),
}

/// Normalize whitespace for the keepLast expression-uniqueness check
/// (`spec.md` §4.2 rule 3: "unique (after whitespace normalization)").
fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn validate_rule(rule: &PolicyRule) -> Result<(), ValidationError> {
    if !rule.archive_when.trim().is_empty() {
        CompiledExpr::compile(&rule.archive_when)
            .map_err(|e| ValidationError::BadArchiveWhen(rule.selector.clone(), e))?;
    }
    if !rule.delete_when.trim().is_empty() {
        CompiledExpr::compile(&rule.delete_when)
            .map_err(|e| ValidationError::BadDeleteWhen(rule.selector.clone(), e))?;
    }
    if !rule.archive_on_delete.trim().is_empty() {
        CompiledExpr::compile(&rule.archive_on_delete)
            .map_err(|e| ValidationError::BadArchiveOnDelete(rule.selector.clone(), e))?;
    }

    if let Some(keep) = &rule.keep_last {
        let mut seen_names: HashSet<&str> = HashSet::new();
        let mut seen_exprs: HashSet<String> = HashSet::new();
        for kr in &keep.rules {
            if kr.name.trim().is_empty() {
                return Err(ValidationError::EmptyKeepRuleName(rule.selector.clone()));
            }
            if !seen_names.insert(kr.name.as_str()) {
                return Err(ValidationError::DuplicateKeepRuleName(
                    rule.selector.clone(),
                    kr.name.clone(),
                ));
            }
            if kr.when.trim().is_empty() {
                return Err(ValidationError::EmptyKeepRuleExpr(
                    rule.selector.clone(),
                    kr.name.clone(),
                ));
            }
            CompiledExpr::compile(&kr.when).map_err(|e| {
                ValidationError::BadArchiveWhen(rule.selector.clone(), e)
            })?;
            let normalized = normalize_whitespace(&kr.when);
            if !seen_exprs.insert(normalized) {
                return Err(ValidationError::DuplicateKeepRuleExpr(rule.selector.clone()));
            }
        }
    }

    Ok(())
}

/// Validate a `ClusterPolicy` in isolation (rules 1-3 of `spec.md` §4.2).
pub fn validate_cluster_policy(name: &str, spec: &ClusterPolicySpec) -> Result<(), ValidationError> {
    if name != RESERVED_POLICY_NAME {
        return Err(ValidationError::WrongName(name.to_string()));
    }
    for rule in &spec.resources {
        validate_rule(rule)?;
    }
    Ok(())
}

/// Validate a `NamespacePolicy` against its own rules (1-3) plus the
/// cross-document rules 4-5: its overrides must reference an existing
/// cluster rule name with a count no higher than the cluster's, and it
/// must not live in the operator's own namespace.
pub fn validate_namespace_policy(
    name: &str,
    namespace: &str,
    spec: &NamespacePolicySpec,
    operator_namespace: &str,
    cluster_spec: &ClusterPolicySpec,
) -> Result<(), ValidationError> {
    if name != RESERVED_POLICY_NAME {
        return Err(ValidationError::WrongName(name.to_string()));
    }
    if namespace == operator_namespace {
        return Err(ValidationError::OwnNamespaceForbidden(namespace.to_string()));
    }
    for rule in &spec.resources {
        validate_rule(rule)?;

        let Some(keep) = &rule.keep_last else {
            continue;
        };

        let cluster_rule = cluster_spec
            .resources
            .iter()
            .find(|r| r.selector == rule.selector);

        for kr in &keep.rules {
            let cluster_keep = cluster_rule.and_then(|cr| cr.keep_last.as_ref());
            let cluster_entry = cluster_keep.and_then(|ck| ck.rules.iter().find(|c| c.name == kr.name));

            match cluster_entry {
                None => {
                    return Err(ValidationError::UnknownNamespaceOverrideName(
                        rule.selector.clone(),
                        kr.name.clone(),
                    ));
                }
                Some(cluster_kr) if kr.count > cluster_kr.count => {
                    return Err(ValidationError::NamespaceOverrideCountTooHigh(
                        rule.selector.clone(),
                        kr.name.clone(),
                        kr.count,
                        cluster_kr.count,
                    ));
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    fn pod_selector() -> ApiVersionKind {
        ApiVersionKind::new("v1", "Pod")
    }

    #[test]
    fn watch_key_format() {
        assert_eq!(pod_selector().watch_key(), "Pod-v1");
    }

    #[test]
    fn reserved_name_enforced() {
        let spec = ClusterPolicySpec::default();
        assert_eq!(
            validate_cluster_policy("not-kubearchive", &spec),
            Err(ValidationError::WrongName("not-kubearchive".to_string()))
        );
        assert!(validate_cluster_policy(RESERVED_POLICY_NAME, &spec).is_ok());
    }

    #[test]
    fn rejects_bad_expression() {
        let spec = ClusterPolicySpec {
            resources: vec![PolicyRule {
                selector: pod_selector(),
                archive_when: ".status.phase ==".to_string(),
                delete_when: String::new(),
                archive_on_delete: String::new(),
                keep_last: None,
            }],
        };
        assert!(validate_cluster_policy(RESERVED_POLICY_NAME, &spec).is_err());
    }

    #[test]
    fn rejects_bad_duration_literal() {
        let spec = ClusterPolicySpec {
            resources: vec![PolicyRule {
                selector: pod_selector(),
                archive_when: "age() > duration('nope')".to_string(),
                delete_when: String::new(),
                archive_on_delete: String::new(),
                keep_last: None,
            }],
        };
        assert!(validate_cluster_policy(RESERVED_POLICY_NAME, &spec).is_err());
    }

    #[test]
    fn empty_expressions_are_valid() {
        let spec = ClusterPolicySpec {
            resources: vec![PolicyRule {
                selector: pod_selector(),
                archive_when: String::new(),
                delete_when: String::new(),
                archive_on_delete: String::new(),
                keep_last: None,
            }],
        };
        assert!(validate_cluster_policy(RESERVED_POLICY_NAME, &spec).is_ok());
    }

    #[test]
    fn keep_rule_names_must_be_unique() {
        let spec = ClusterPolicySpec {
            resources: vec![PolicyRule {
                selector: pod_selector(),
                archive_when: String::new(),
                delete_when: String::new(),
                archive_on_delete: String::new(),
                keep_last: Some(KeepSpec {
                    rules: vec![
                        KeepRule {
                            name: "recent".to_string(),
                            when: "true".to_string(),
                            count: 3,
                            sort_by: None,
                        },
                        KeepRule {
                            name: "recent".to_string(),
                            when: "false".to_string(),
                            count: 1,
                            sort_by: None,
                        },
                    ],
                }),
            }],
        };
        assert_eq!(
            validate_cluster_policy(RESERVED_POLICY_NAME, &spec),
            Err(ValidationError::DuplicateKeepRuleName(
                pod_selector(),
                "recent".to_string()
            ))
        );
    }

    #[test]
    fn keep_rule_expressions_must_be_unique_after_whitespace_normalization() {
        let spec = ClusterPolicySpec {
            resources: vec![PolicyRule {
                selector: pod_selector(),
                archive_when: String::new(),
                delete_when: String::new(),
                archive_on_delete: String::new(),
                keep_last: Some(KeepSpec {
                    rules: vec![
                        KeepRule {
                            name: "a".to_string(),
                            when: "true   ==   true".to_string(),
                            count: 3,
                            sort_by: None,
                        },
                        KeepRule {
                            name: "b".to_string(),
                            when: "true == true".to_string(),
                            count: 1,
                            sort_by: None,
                        },
                    ],
                }),
            }],
        };
        assert_eq!(
            validate_cluster_policy(RESERVED_POLICY_NAME, &spec),
            Err(ValidationError::DuplicateKeepRuleExpr(pod_selector()))
        );
    }

    #[test]
    fn namespace_policy_forbidden_in_operator_namespace() {
        let cluster = ClusterPolicySpec::default();
        let ns_spec = NamespacePolicySpec::default();
        let err = validate_namespace_policy(
            RESERVED_POLICY_NAME,
            "kubearchive-system",
            &ns_spec,
            "kubearchive-system",
            &cluster,
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::OwnNamespaceForbidden("kubearchive-system".to_string()));
    }

    #[test]
    fn namespace_override_must_reference_existing_cluster_rule() {
        let cluster = ClusterPolicySpec {
            resources: vec![PolicyRule {
                selector: pod_selector(),
                archive_when: String::new(),
                delete_when: String::new(),
                archive_on_delete: String::new(),
                keep_last: Some(KeepSpec {
                    rules: vec![KeepRule {
                        name: "recent".to_string(),
                        when: "true".to_string(),
                        count: 10,
                        sort_by: None,
                    }],
                }),
            }],
        };
        let ns_spec = NamespacePolicySpec {
            resources: vec![PolicyRule {
                selector: pod_selector(),
                archive_when: String::new(),
                delete_when: String::new(),
                archive_on_delete: String::new(),
                keep_last: Some(KeepSpec {
                    rules: vec![KeepRule {
                        name: "unknown".to_string(),
                        when: "true".to_string(),
                        count: 1,
                        sort_by: None,
                    }],
                }),
            }],
        };
        let err = validate_namespace_policy(
            RESERVED_POLICY_NAME,
            "team-a",
            &ns_spec,
            "kubearchive-system",
            &cluster,
        )
        .unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownNamespaceOverrideName(pod_selector(), "unknown".to_string())
        );
    }

    #[test]
    fn namespace_override_count_cannot_exceed_cluster_count() {
        let cluster = ClusterPolicySpec {
            resources: vec![PolicyRule {
                selector: pod_selector(),
                archive_when: String::new(),
                delete_when: String::new(),
                archive_on_delete: String::new(),
                keep_last: Some(KeepSpec {
                    rules: vec![KeepRule {
                        name: "recent".to_string(),
                        when: "true".to_string(),
                        count: 5,
                        sort_by: None,
                    }],
                }),
            }],
        };
        let ns_spec = NamespacePolicySpec {
            resources: vec![PolicyRule {
                selector: pod_selector(),
                archive_when: String::new(),
                delete_when: String::new(),
                archive_on_delete: String::new(),
                keep_last: Some(KeepSpec {
                    rules: vec![KeepRule {
                        name: "recent".to_string(),
                        when: "true".to_string(),
                        count: 99,
                        sort_by: None,
                    }],
                }),
            }],
        };
        let err = validate_namespace_policy(
            RESERVED_POLICY_NAME,
            "team-a",
            &ns_spec,
            "kubearchive-system",
            &cluster,
        )
        .unwrap_err();
        assert_eq!(
            err,
            ValidationError::NamespaceOverrideCountTooHigh(pod_selector(), "recent".to_string(), 99, 5)
        );
    }

    #[test]
    fn namespace_override_at_or_below_cluster_count_is_valid() {
        let cluster = ClusterPolicySpec {
            resources: vec![PolicyRule {
                selector: pod_selector(),
                archive_when: String::new(),
                delete_when: String::new(),
                archive_on_delete: String::new(),
                keep_last: Some(KeepSpec {
                    rules: vec![KeepRule {
                        name: "recent".to_string(),
                        when: "true".to_string(),
                        count: 5,
                        sort_by: None,
                    }],
                }),
            }],
        };
        let ns_spec = NamespacePolicySpec {
            resources: vec![PolicyRule {
                selector: pod_selector(),
                archive_when: String::new(),
                delete_when: String::new(),
                archive_on_delete: String::new(),
                keep_last: Some(KeepSpec {
                    rules: vec![KeepRule {
                        name: "recent".to_string(),
                        when: "true".to_string(),
                        count: 5,
                        sort_by: None,
                    }],
                }),
            }],
        };
        assert!(validate_namespace_policy(
            RESERVED_POLICY_NAME,
            "team-a",
            &ns_spec,
            "kubearchive-system",
            &cluster,
        )
        .is_ok());
    }
}
