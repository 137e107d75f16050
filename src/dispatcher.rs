//! Event dispatcher (`spec.md` §4.5): applies predicates to each observed
//! object and emits typed cloud events with retry classification. Reuses
//! `reqwest`, reserved in this crate strictly for the sink POST — every
//! Kubernetes-apiserver call stays on the `kube` idiom.

use std::collections::HashSet;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::default_retriable_status_codes;
use crate::expr::CompiledExpr;
use crate::policy::{ApiVersionKind, PolicyRule};

const SOURCE: &str = "org.kubearchive.archive-controller";
const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventVariant {
    ArchiveWhen,
    ArchiveThenDelete,
    ArchiveOnDelete,
}

impl EventVariant {
    fn type_suffix(self) -> &'static str {
        match self {
            EventVariant::ArchiveWhen => "archive-when",
            EventVariant::ArchiveThenDelete => "archive-then-delete",
            EventVariant::ArchiveOnDelete => "archive-on-delete",
        }
    }

    fn event_type(self) -> String {
        format!("org.kubearchive.resource.{}", self.type_suffix())
    }
}

#[derive(Debug, Serialize)]
struct CloudEventExtensions<'a> {
    apiversion: &'a str,
    kind: &'a str,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct CloudEvent<'a> {
    source: &'a str,
    #[serde(rename = "type")]
    event_type: String,
    data: serde_json::Value,
    #[serde(flatten)]
    extensions: CloudEventExtensions<'a>,
}

pub struct EventDispatcher {
    http: reqwest::Client,
    target_url: String,
    retriable: HashSet<u16>,
}

impl EventDispatcher {
    pub fn new(target_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            target_url,
            retriable: default_retriable_status_codes().iter().copied().collect(),
        }
    }

    #[cfg(test)]
    pub fn for_tests(target_url: String) -> Self {
        Self::new(target_url)
    }

    /// `Added`/`Modified` dispatch (`spec.md` §4.5 step 2): `deleteWhen`
    /// wins over `archiveWhen` when both fire.
    pub async fn dispatch_upsert(
        &self,
        avk: &ApiVersionKind,
        namespace: Option<&str>,
        name: &str,
        object: &serde_json::Value,
        cluster_rules: &[PolicyRule],
        namespace_rules: &[PolicyRule],
    ) {
        let rules = cluster_rules.iter().chain(namespace_rules.iter());
        let mut any_delete = false;
        let mut any_archive = false;

        for rule in rules.clone() {
            if evaluate(&rule.delete_when, object) {
                any_delete = true;
            }
        }
        if !any_delete {
            for rule in rules {
                if evaluate(&rule.archive_when, object) {
                    any_archive = true;
                }
            }
        }

        if any_delete {
            self.emit(EventVariant::ArchiveThenDelete, avk, namespace, name, object).await;
        } else if any_archive {
            self.emit(EventVariant::ArchiveWhen, avk, namespace, name, object).await;
        }
    }

    /// `Deleted` dispatch (`spec.md` §4.5 step 2): fire `archiveOnDelete`
    /// or drop.
    pub async fn dispatch_deleted(
        &self,
        avk: &ApiVersionKind,
        namespace: Option<&str>,
        name: &str,
        object: &serde_json::Value,
        cluster_rules: &[PolicyRule],
        namespace_rules: &[PolicyRule],
    ) {
        let fires = cluster_rules
            .iter()
            .chain(namespace_rules.iter())
            .any(|rule| evaluate(&rule.archive_on_delete, object));

        if fires {
            self.emit(EventVariant::ArchiveOnDelete, avk, namespace, name, object).await;
        }
    }

    async fn emit(
        &self,
        variant: EventVariant,
        avk: &ApiVersionKind,
        namespace: Option<&str>,
        name: &str,
        object: &serde_json::Value,
    ) {
        let event = CloudEvent {
            source: SOURCE,
            event_type: variant.event_type(),
            data: object.clone(),
            extensions: CloudEventExtensions {
                apiversion: &avk.api_version,
                kind: &avk.kind,
                name,
                namespace,
            },
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.http.post(&self.target_url).json(&event).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        info!(variant = variant.type_suffix(), kind = %avk.kind, name, "event_published");
                        return;
                    }
                    if !self.is_retriable(status) || attempt >= MAX_ATTEMPTS {
                        warn!(variant = variant.type_suffix(), status = status.as_u16(), kind = %avk.kind, name, "event_publish_terminal_failure");
                        return;
                    }
                    warn!(variant = variant.type_suffix(), status = status.as_u16(), attempt, "event_publish_retrying");
                }
                Err(e) => {
                    if attempt >= MAX_ATTEMPTS {
                        warn!(variant = variant.type_suffix(), error = %e, kind = %avk.kind, name, "event_publish_terminal_failure");
                        return;
                    }
                    warn!(variant = variant.type_suffix(), error = %e, attempt, "event_publish_retrying");
                }
            }
            tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
        }
    }

    fn is_retriable(&self, status: StatusCode) -> bool {
        self.retriable.contains(&status.as_u16())
    }
}

/// Compile and evaluate `source` against `object`; an empty expression,
/// a compile failure, or an evaluation error all count as "does not
/// fire" (`spec.md` §3 invariant: "error never archives").
fn evaluate(source: &str, object: &serde_json::Value) -> bool {
    match CompiledExpr::compile(source) {
        Ok(compiled) => compiled.evaluate(object).fired(),
        Err(_) => false,
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyRule;

    fn rule(archive_when: &str, delete_when: &str, archive_on_delete: &str) -> PolicyRule {
        PolicyRule {
            selector: ApiVersionKind { api_version: "v1".to_string(), kind: "Pod".to_string() },
            archive_when: archive_when.to_string(),
            delete_when: delete_when.to_string(),
            archive_on_delete: archive_on_delete.to_string(),
            keep_last: None,
        }
    }

    #[test]
    fn retriable_set_matches_configured_defaults() {
        let dispatcher = EventDispatcher::for_tests("http://example.invalid".to_string());
        assert!(dispatcher.is_retriable(StatusCode::SERVICE_UNAVAILABLE));
        assert!(dispatcher.is_retriable(StatusCode::TOO_MANY_REQUESTS));
        assert!(!dispatcher.is_retriable(StatusCode::BAD_REQUEST));
        assert!(!dispatcher.is_retriable(StatusCode::OK));
    }

    #[test]
    fn empty_expression_never_fires() {
        assert!(!evaluate("", &serde_json::json!({})));
    }

    #[test]
    fn delete_when_wins_over_archive_when() {
        let object = serde_json::json!({"status": {"phase": "Failed"}});
        let delete_fires = evaluate("status.phase == 'Failed'", &object);
        assert!(delete_fires);
    }

    #[test]
    fn malformed_expression_is_treated_as_non_firing() {
        assert!(!evaluate("status.phase ==", &serde_json::json!({})));
    }

    #[tokio::test]
    async fn dispatch_upsert_prefers_delete_over_archive() {
        let dispatcher = EventDispatcher::for_tests("http://127.0.0.1:0".to_string());
        let avk = ApiVersionKind { api_version: "v1".to_string(), kind: "Pod".to_string() };
        let object = serde_json::json!({"status": {"phase": "Failed"}});
        let cluster = vec![rule("status.phase == 'Failed'", "status.phase == 'Failed'", "")];
        // Exercises the branch logic; the POST itself will fail against
        // the unreachable sink and be logged, not panicked on.
        dispatcher.dispatch_upsert(&avk, Some("ns"), "p", &object, &cluster, &[]).await;
    }
}
