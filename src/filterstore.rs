//! FilterStore: the single authoritative aggregate of all active archive
//! policies, reconciled from `ClusterPolicy` and `NamespacePolicy` objects.
//!
//! Exactly `spec.md` §4.3: single writer, whole-document persistence (no
//! diffs handed to consumers), legacy global-namespace migration folded
//! into the reduce step. Modeled as an `Arc<RwLock<_>>` handle rather than
//! the teacher's `Arc<Mutex<_>>` (`commands/watch.rs::ClusterState`)
//! because FilterStore reads vastly outnumber writes (every reconciliation
//! pass and every dispatched event reads it; only a policy change writes).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::policy::{ApiVersionKind, ClusterPolicySpec, NamespacePolicySpec, PolicyRule};

/// The sentinel namespace key used by pre-migration filter documents to
/// mean "applies cluster-wide". Migrated into `FilterStore.cluster` on
/// first write and never written again (`spec.md` §9, open question 1).
const LEGACY_GLOBAL_NAMESPACE_SENTINEL: &str = "*";

/// Derived, never-authored-directly aggregate of every active policy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterStore {
    pub cluster: Vec<PolicyRule>,
    pub namespaces: HashMap<String, Vec<PolicyRule>>,
}

impl FilterStore {
    /// All distinct `(kind, apiVersion)` selectors referenced anywhere in
    /// the document — the watch supervisor's `desired` set (`spec.md`
    /// §4.4 step 1).
    pub fn desired_selectors(&self) -> std::collections::HashSet<ApiVersionKind> {
        let mut set = std::collections::HashSet::new();
        for rule in &self.cluster {
            set.insert(rule.selector.clone());
        }
        for rules in self.namespaces.values() {
            for rule in rules {
                set.insert(rule.selector.clone());
            }
        }
        set
    }

    /// Rules applicable to `namespace` for `selector`: the cluster-wide
    /// rule(s) plus the namespace's own rule(s), per `spec.md` §4.5 step 1.
    pub fn applicable_rules(&self, namespace: &str, selector: &ApiVersionKind) -> Vec<&PolicyRule> {
        let mut rules: Vec<&PolicyRule> = self
            .cluster
            .iter()
            .filter(|r| &r.selector == selector)
            .collect();
        if let Some(ns_rules) = self.namespaces.get(namespace) {
            rules.extend(ns_rules.iter().filter(|r| &r.selector == selector));
        }
        rules
    }
}

/// A single incoming change to reduce into the FilterStore.
#[derive(Debug, Clone)]
pub enum PolicyChange {
    ClusterUpserted(ClusterPolicySpec),
    ClusterDeleted,
    NamespaceUpserted { namespace: String, spec: NamespacePolicySpec },
    NamespaceDeleted { namespace: String },
    /// A legacy filter document loaded from storage, keyed the old way.
    /// Migrated in place the first time it passes through `reduce`.
    LegacyDocumentLoaded(LegacyFilterDocument),
}

/// Shape of a pre-migration filter document: namespace rules were keyed
/// by the sentinel `"*"` for what is now the typed `cluster` field.
#[derive(Debug, Clone, Default)]
pub struct LegacyFilterDocument {
    pub namespaces: HashMap<String, Vec<PolicyRule>>,
}

/// Pure reducer: `(old, change) -> new`. The sole place where the legacy
/// global-namespace sentinel is migrated (`spec.md` §4.3, §9 open
/// question 1 — one-way, no rollback).
pub fn reduce(old: &FilterStore, change: &PolicyChange) -> FilterStore {
    let mut next = old.clone();

    match change {
        PolicyChange::ClusterUpserted(spec) => {
            next.cluster = spec.resources.clone();
        }
        PolicyChange::ClusterDeleted => {
            next.cluster.clear();
        }
        PolicyChange::NamespaceUpserted { namespace, spec } => {
            if spec.resources.is_empty() {
                next.namespaces.remove(namespace);
            } else {
                next.namespaces.insert(namespace.clone(), spec.resources.clone());
            }
        }
        PolicyChange::NamespaceDeleted { namespace } => {
            next.namespaces.remove(namespace);
        }
        PolicyChange::LegacyDocumentLoaded(legacy) => {
            for (ns, rules) in &legacy.namespaces {
                if ns == LEGACY_GLOBAL_NAMESPACE_SENTINEL {
                    next.cluster = rules.clone();
                } else if rules.is_empty() {
                    next.namespaces.remove(ns);
                } else {
                    next.namespaces.insert(ns.clone(), rules.clone());
                }
            }
        }
    }

    next
}

/// Shared, reader-optimized handle to the live FilterStore.
#[derive(Clone)]
pub struct FilterStoreHandle {
    inner: Arc<RwLock<FilterStore>>,
}

impl FilterStoreHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(FilterStore::default())),
        }
    }

    pub async fn snapshot(&self) -> FilterStore {
        self.inner.read().await.clone()
    }

    /// Apply a change, replacing the whole document (transactional per
    /// `spec.md` §3: "edited transactionally on each policy change").
    pub async fn apply(&self, change: &PolicyChange) -> FilterStore {
        let mut guard = self.inner.write().await;
        let next = reduce(&guard, change);
        *guard = next.clone();
        next
    }
}

impl Default for FilterStoreHandle {
    fn default() -> Self {
        Self::new()
    }
}

/* ============================= TESTS ============================= */
