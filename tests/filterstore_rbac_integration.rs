//! Cross-module round-trip property (`spec.md` §8): applying the same
//! policy twice produces the same FilterStore and the same generated
//! RBAC set.

use kubearchive::filterstore::{reduce, FilterStore, PolicyChange};
use kubearchive::policy::{ApiVersionKind, ClusterPolicySpec, KeepRule, KeepSpec, NamespacePolicySpec, PolicyRule};
use kubearchive::rbac::{cluster_read_role, namespace_delete_role};

fn pod_rule() -> PolicyRule {
    PolicyRule {
        selector: ApiVersionKind::new("v1", "Pod"),
        archive_when: "status.phase == 'Failed'".to_string(),
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
    }
}

fn job_rule() -> PolicyRule {
    PolicyRule {
        selector: ApiVersionKind::new("batch/v1", "Job"),
        archive_when: String::new(),
        delete_when: String::new(),
        archive_on_delete: "true".to_string(),
        keep_last: None,
    }
}

#[test]
fn applying_same_cluster_and_namespace_policy_twice_is_idempotent() {
    let cluster_change = PolicyChange::ClusterUpserted(ClusterPolicySpec { resources: vec![pod_rule()] });
    let namespace_change = PolicyChange::NamespaceUpserted {
        namespace: "team-a".to_string(),
        spec: NamespacePolicySpec { resources: vec![job_rule()] },
    };

    let once = reduce(&reduce(&FilterStore::default(), &cluster_change), &namespace_change);
    let twice = reduce(&reduce(&once, &cluster_change), &namespace_change);

    assert_eq!(once, twice);

    let role_once = cluster_read_role(&once);
    let role_twice = cluster_read_role(&twice);
    assert_eq!(role_once.rules, role_twice.rules);

    let ns_role_once = namespace_delete_role(&once, "team-a").unwrap();
    let ns_role_twice = namespace_delete_role(&twice, "team-a").unwrap();
    assert_eq!(ns_role_once.rules, ns_role_twice.rules);
}

#[test]
fn cluster_rule_is_inherited_into_every_namespace_delete_role() {
    let store = reduce(
        &reduce(
            &FilterStore::default(),
            &PolicyChange::ClusterUpserted(ClusterPolicySpec { resources: vec![pod_rule()] }),
        ),
        &PolicyChange::NamespaceUpserted {
            namespace: "team-b".to_string(),
            spec: NamespacePolicySpec { resources: vec![job_rule()] },
        },
    );

    let role = namespace_delete_role(&store, "team-b").unwrap();
    // Both the namespace's own Job rule and the inherited cluster Pod
    // rule must be present (spec.md §4.7).
    assert_eq!(role.rules.unwrap().len(), 2);
}
