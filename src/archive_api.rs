//! Archive read API (`spec.md` §4.8): a paginated, label-selectable,
//! name-addressable read over the archive store. Routes mirror the
//! upstream Kubernetes API shape; middleware order is tracing → authn →
//! authz → impersonation → discovery → pagination → handler, composed
//! here as one sequential pipeline per handler rather than a tower
//! layer stack, since every stage short-circuits with a typed error the
//! handler turns into a response.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use thiserror::Error;
use tracing::{info, warn};

use crate::auth::authn::extract_bearer_token;
use crate::auth::authz::build_resource_attributes;
use crate::auth::impersonation::parse_impersonation_headers;
use crate::auth::{AuthPrincipal, SharedAuthPipeline};
use crate::config::Config;
use crate::discovery::DiscoveryCache;
use crate::pagination::{self, ContinuationCursor};

/* ============================= STORE ============================= */

#[derive(Debug, Clone)]
pub struct ArchiveRecord {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub kind: String,
    pub api_version: String,
    pub namespace: Option<String>,
    pub name: String,
    pub object: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelOp {
    Equals,
    NotEquals,
    Exists,
    NotExists,
    In,
    NotIn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelRequirement {
    pub key: String,
    pub op: LabelOp,
    pub values: Vec<String>,
}

/// A minimal upstream label-selector grammar: `k=v`, `k==v`, `k!=v`,
/// `k`, `!k`, `k in (a,b)`, `k notin (a,b)`, comma-separated.
pub fn parse_label_selector(raw: &str) -> Result<Vec<LabelRequirement>, ApiError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }

    raw.split(',').map(|clause| parse_requirement(clause.trim())).collect()
}

fn parse_requirement(clause: &str) -> Result<LabelRequirement, ApiError> {
    if let Some(key) = clause.strip_prefix('!') {
        let key = key.trim();
        if key.is_empty() {
            return Err(ApiError::InvalidLabelSelector(clause.to_string()));
        }
        return Ok(LabelRequirement { key: key.to_string(), op: LabelOp::NotExists, values: Vec::new() });
    }

    if let Some((key, rest)) = split_set_op(clause, " notin ") {
        return Ok(LabelRequirement { key, op: LabelOp::NotIn, values: parse_set(rest)? });
    }
    if let Some((key, rest)) = split_set_op(clause, " in ") {
        return Ok(LabelRequirement { key, op: LabelOp::In, values: parse_set(rest)? });
    }
    if let Some((key, value)) = clause.split_once("!=") {
        return Ok(LabelRequirement {
            key: key.trim().to_string(),
            op: LabelOp::NotEquals,
            values: vec![value.trim().to_string()],
        });
    }
    if let Some((key, value)) = clause.split_once("==") {
        return Ok(LabelRequirement {
            key: key.trim().to_string(),
            op: LabelOp::Equals,
            values: vec![value.trim().to_string()],
        });
    }
    if let Some((key, value)) = clause.split_once('=') {
        return Ok(LabelRequirement {
            key: key.trim().to_string(),
            op: LabelOp::Equals,
            values: vec![value.trim().to_string()],
        });
    }

    if clause.is_empty() || clause.contains(char::is_whitespace) {
        return Err(ApiError::InvalidLabelSelector(clause.to_string()));
    }
    Ok(LabelRequirement { key: clause.to_string(), op: LabelOp::Exists, values: Vec::new() })
}

fn split_set_op<'a>(clause: &'a str, op: &str) -> Option<(String, &'a str)> {
    clause.split_once(op).map(|(k, rest)| (k.trim().to_string(), rest.trim()))
}

fn parse_set(rest: &str) -> Result<Vec<String>, ApiError> {
    let inner = rest
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| ApiError::InvalidLabelSelector(rest.to_string()))?;
    Ok(inner.split(',').map(|v| v.trim().to_string()).filter(|v| !v.is_empty()).collect())
}

fn matches_requirement(labels: &HashMap<String, String>, req: &LabelRequirement) -> bool {
    match req.op {
        LabelOp::Exists => labels.contains_key(&req.key),
        LabelOp::NotExists => !labels.contains_key(&req.key),
        LabelOp::Equals => labels.get(&req.key) == req.values.first(),
        LabelOp::NotEquals => labels.get(&req.key) != req.values.first(),
        LabelOp::In => labels.get(&req.key).is_some_and(|v| req.values.contains(v)),
        LabelOp::NotIn => !labels.get(&req.key).is_some_and(|v| req.values.contains(v)),
    }
}

pub fn matches_all(labels: &HashMap<String, String>, reqs: &[LabelRequirement]) -> bool {
    reqs.iter().all(|r| matches_requirement(labels, r))
}

/// Pull `metadata.labels` out of a stored object's JSON, the same shape
/// every archived Kubernetes resource carries.
fn record_labels(object: &serde_json::Value) -> HashMap<String, String> {
    object
        .get("metadata")
        .and_then(|m| m.get("labels"))
        .and_then(|l| l.as_object())
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct ArchiveQuery<'a> {
    pub kind: &'a str,
    pub api_version: &'a str,
    pub namespace: Option<&'a str>,
    pub name: Option<&'a str>,
    pub continue_id: Option<i64>,
    pub continue_after: Option<DateTime<Utc>>,
    pub label_filters: &'a [LabelRequirement],
    pub limit: i64,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

#[async_trait::async_trait]
pub trait ArchiveStore: Send + Sync {
    async fn query(
        &self,
        q: &ArchiveQuery<'_>,
    ) -> Result<(Vec<ArchiveRecord>, Option<i64>, Option<DateTime<Utc>>), ApiError>;

    /// `(kind, apiVersion, namespace, name) -> (logURL, jsonPath)`.
    async fn log_url(
        &self,
        kind: &str,
        api_version: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Option<(String, Option<String>)>;

    async fn ping(&self) -> bool;
}

/// Reference in-memory store used by tests.
#[derive(Default)]
pub struct MemoryArchiveStore {
    pub records: tokio::sync::RwLock<Vec<ArchiveRecord>>,
    pub log_urls: tokio::sync::RwLock<HashMap<(String, String, Option<String>, String), (String, Option<String>)>>,
}

#[async_trait::async_trait]
impl ArchiveStore for MemoryArchiveStore {
    async fn query(
        &self,
        q: &ArchiveQuery<'_>,
    ) -> Result<(Vec<ArchiveRecord>, Option<i64>, Option<DateTime<Utc>>), ApiError> {
        let records = self.records.read().await;
        let mut matched: Vec<&ArchiveRecord> = records
            .iter()
            .filter(|r| r.kind == q.kind && r.api_version == q.api_version)
            .filter(|r| q.namespace.is_none_or(|ns| r.namespace.as_deref() == Some(ns)))
            .filter(|r| q.name.is_none_or(|n| r.name == n))
            .filter(|r| match q.continue_id {
                Some(id) => r.id > id,
                None => true,
            })
            .filter(|r| q.created_after.is_none_or(|a| r.created_at > a))
            .filter(|r| q.created_before.is_none_or(|b| r.created_at < b))
            .filter(|r| matches_all(&record_labels(&r.object), q.label_filters))
            .collect();
        matched.sort_by_key(|r| r.id);

        if let Some(name) = q.name {
            let exact: Vec<&ArchiveRecord> = matched.into_iter().filter(|r| r.name == name).collect();
            return match exact.len() {
                0 => Err(ApiError::NotFound),
                1 => Ok((vec![exact[0].clone()], None, None)),
                _ => Err(ApiError::Internal("multiple records matched a single name lookup".to_string())),
            };
        }

        let limited: Vec<ArchiveRecord> = matched.into_iter().take(q.limit.max(0) as usize).cloned().collect();
        let last = limited.last().map(|r| (r.id, r.created_at));
        Ok(match last {
            Some((id, ts)) => (limited, Some(id), Some(ts)),
            None => (limited, None, None),
        })
    }

    async fn log_url(
        &self,
        kind: &str,
        api_version: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Option<(String, Option<String>)> {
        let key = (kind.to_string(), api_version.to_string(), namespace.map(String::from), name.to_string());
        self.log_urls.read().await.get(&key).cloned()
    }

    async fn ping(&self) -> bool {
        true
    }
}

/* ============================= ERRORS ============================= */

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid label selector: {0}")]
    InvalidLabelSelector(String),
    #[error("invalid pagination parameter: {0}")]
    Pagination(#[from] pagination::PaginationError),
    #[error("{0}")]
    BadRequest(String),
    #[error("missing or malformed bearer token")]
    Unauthenticated,
    #[error("access denied")]
    Forbidden,
    #[error("record not found")]
    NotFound,
    #[error("internal error: {0}")]
    Internal(String),
    #[error("archive store unavailable")]
    Unavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::InvalidLabelSelector(_) | ApiError::Pagination(_) | ApiError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Unauthenticated | ApiError::Forbidden => StatusCode::UNAUTHORIZED,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, Json(serde_json::json!({ "message": self.to_string() }))).into_response()
    }
}

/* ============================= STATE & ROUTER ============================= */

#[derive(Clone)]
pub struct ApiState {
    pub auth: SharedAuthPipeline,
    pub discovery: DiscoveryCache,
    pub store: Arc<dyn ArchiveStore>,
    pub config: Config,
    pub http: reqwest::Client,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/:version/:resource", get(list_core))
        .route("/api/:version/namespaces/:ns/:resource", get(list_core_namespaced))
        .route("/api/:version/namespaces/:ns/:resource/:name", get(get_core_named))
        .route("/api/:version/namespaces/:ns/:resource/:name/log", get(get_core_log))
        .route("/apis/:group/:version/:resource", get(list_group))
        .route("/apis/:group/:version/namespaces/:ns/:resource", get(list_group_namespaced))
        .route("/apis/:group/:version/namespaces/:ns/:resource/:name", get(get_group_named))
        .route("/apis/:group/:version/namespaces/:ns/:resource/:name/log", get(get_group_log))
        .with_state(state)
}

#[derive(Debug, serde::Deserialize)]
struct ListQuery {
    #[serde(rename = "labelSelector")]
    label_selector: Option<String>,
    limit: Option<String>,
    #[serde(rename = "continue")]
    continue_token: Option<String>,
    #[serde(rename = "creationTimestampAfter")]
    created_after: Option<String>,
    #[serde(rename = "creationTimestampBefore")]
    created_before: Option<String>,
}

async fn list_core(
    State(state): State<ApiState>,
    Path((version, resource)): Path<(String, String)>,
    Query(q): Query<ListQuery>,
    headers: HeaderMap,
) -> Response {
    handle(&state, &headers, &version, &resource, None, None, false, q).await
}

async fn list_core_namespaced(
    State(state): State<ApiState>,
    Path((version, ns, resource)): Path<(String, String, String)>,
    Query(q): Query<ListQuery>,
    headers: HeaderMap,
) -> Response {
    handle(&state, &headers, &version, &resource, Some(ns), None, false, q).await
}

async fn get_core_named(
    State(state): State<ApiState>,
    Path((version, ns, resource, name)): Path<(String, String, String, String)>,
    Query(q): Query<ListQuery>,
    headers: HeaderMap,
) -> Response {
    handle(&state, &headers, &version, &resource, Some(ns), Some(name), false, q).await
}

async fn get_core_log(
    State(state): State<ApiState>,
    Path((version, ns, resource, name)): Path<(String, String, String, String)>,
    headers: HeaderMap,
) -> Response {
    handle_log(&state, &headers, &version, &resource, Some(ns), name).await
}

async fn list_group(
    State(state): State<ApiState>,
    Path((group, version, resource)): Path<(String, String, String)>,
    Query(q): Query<ListQuery>,
    headers: HeaderMap,
) -> Response {
    handle(&state, &headers, &format!("{group}/{version}"), &resource, None, None, false, q).await
}

async fn list_group_namespaced(
    State(state): State<ApiState>,
    Path((group, version, ns, resource)): Path<(String, String, String, String)>,
    Query(q): Query<ListQuery>,
    headers: HeaderMap,
) -> Response {
    handle(&state, &headers, &format!("{group}/{version}"), &resource, Some(ns), None, false, q).await
}

async fn get_group_named(
    State(state): State<ApiState>,
    Path((group, version, ns, resource, name)): Path<(String, String, String, String, String)>,
    Query(q): Query<ListQuery>,
    headers: HeaderMap,
) -> Response {
    handle(&state, &headers, &format!("{group}/{version}"), &resource, Some(ns), Some(name), false, q).await
}

async fn get_group_log(
    State(state): State<ApiState>,
    Path((group, version, ns, resource, name)): Path<(String, String, String, String, String)>,
    headers: HeaderMap,
) -> Response {
    handle_log(&state, &headers, &format!("{group}/{version}"), &resource, Some(ns), name).await
}

/// Run the full tracing → authn → authz → impersonation → discovery →
/// pagination → handler pipeline for one non-log request.
#[allow(clippy::too_many_arguments)]
async fn handle(
    state: &ApiState,
    headers: &HeaderMap,
    api_version: &str,
    resource: &str,
    namespace: Option<String>,
    name: Option<String>,
    is_log: bool,
    q: ListQuery,
) -> Response {
    match handle_inner(state, headers, api_version, resource, namespace, name, is_log, q).await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_inner(
    state: &ApiState,
    headers: &HeaderMap,
    api_version: &str,
    resource: &str,
    namespace: Option<String>,
    name: Option<String>,
    _is_log: bool,
    q: ListQuery,
) -> Result<Response, ApiError> {
    let principal = run_auth_pipeline(state, headers, resource, namespace.as_deref(), name.as_deref(), false)
        .await?;

    let resolved = state
        .discovery
        .resolve(&state.auth.client, api_version, resource)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let label_filters = parse_label_selector(q.label_selector.as_deref().unwrap_or(""))?;
    let limit = pagination::parse_limit(
        q.limit.as_deref(),
        state.config.pagination_default_limit,
        state.config.pagination_min_limit,
        state.config.pagination_max_limit,
    )?;
    let cursor = pagination::decode(q.continue_token.as_deref().unwrap_or(""))?;

    let (after, before) = parse_time_bounds(q.created_after.as_deref(), q.created_before.as_deref())?;

    info!(user = %principal.name, kind = %resolved.kind, resource, "archive_read_request");

    let query = ArchiveQuery {
        kind: &resolved.kind,
        api_version,
        namespace: namespace.as_deref(),
        name: name.as_deref(),
        continue_id: cursor.map(|c| c.id),
        continue_after: cursor.map(|c| c.timestamp),
        label_filters: &label_filters,
        limit,
        created_after: after,
        created_before: before,
    };

    let (records, last_id, last_ts) = state.store.query(&query).await?;

    if let Some(n) = &name {
        let record = records.into_iter().next().ok_or(ApiError::NotFound)?;
        let _ = n;
        return Ok(Json(record.object).into_response());
    }

    let continue_token = match (last_id, last_ts) {
        (Some(id), Some(ts)) => pagination::encode(&ContinuationCursor { id, timestamp: ts }),
        _ => String::new(),
    };

    let envelope = serde_json::json!({
        "kind": "List",
        "apiVersion": "v1",
        "metadata": { "continue": continue_token },
        "items": records.into_iter().map(|r| r.object).collect::<Vec<_>>(),
    });

    Ok(Json(envelope).into_response())
}

fn parse_time_bounds(after: Option<&str>, before: Option<&str>) -> Result<(Option<DateTime<Utc>>, Option<DateTime<Utc>>), ApiError> {
    let after = after
        .map(|s| DateTime::parse_from_rfc3339(s).map(|d| d.with_timezone(&Utc)))
        .transpose()
        .map_err(|_| ApiError::BadRequest("creationTimestampAfter is not valid RFC3339".to_string()))?;
    let before = before
        .map(|s| DateTime::parse_from_rfc3339(s).map(|d| d.with_timezone(&Utc)))
        .transpose()
        .map_err(|_| ApiError::BadRequest("creationTimestampBefore is not valid RFC3339".to_string()))?;

    if let (Some(a), Some(b)) = (after, before) {
        if b <= a {
            return Err(ApiError::BadRequest(
                "creationTimestampBefore must be strictly greater than creationTimestampAfter".to_string(),
            ));
        }
    }
    Ok((after, before))
}

async fn run_auth_pipeline(
    state: &ApiState,
    headers: &HeaderMap,
    resource: &str,
    namespace: Option<&str>,
    name: Option<&str>,
    is_log: bool,
) -> Result<AuthPrincipal, ApiError> {
    let auth_header = headers.get(http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    let token = extract_bearer_token(auth_header).map_err(|_| ApiError::BadRequest("missing or malformed bearer token".to_string()))?;

    let requester = state.auth.authenticate(token).await.map_err(|_| ApiError::Unauthenticated)?;

    let attrs = build_resource_attributes("", resource, namespace.unwrap_or_default(), name, is_log);
    state.auth.authorize(&requester, &attrs).await.map_err(|_| ApiError::Forbidden)?;

    match parse_impersonation_headers(headers).map_err(|_| ApiError::BadRequest("impersonation header present without user header".to_string()))? {
        None => Ok(requester),
        Some(req) => {
            let impersonated = state
                .auth
                .impersonate(&requester, &req)
                .await
                .map_err(|_| ApiError::Forbidden)?;
            Ok(impersonated)
        }
    }
}

async fn handle_log(
    state: &ApiState,
    headers: &HeaderMap,
    api_version: &str,
    resource: &str,
    namespace: Option<String>,
    name: String,
) -> Response {
    match handle_log_inner(state, headers, api_version, resource, namespace, name).await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}

async fn handle_log_inner(
    state: &ApiState,
    headers: &HeaderMap,
    api_version: &str,
    resource: &str,
    namespace: Option<String>,
    name: String,
) -> Result<Response, ApiError> {
    let _principal = run_auth_pipeline(state, headers, resource, namespace.as_deref(), Some(&name), true).await?;

    let resolved = state
        .discovery
        .resolve(&state.auth.client, api_version, resource)
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let (log_url, json_path) = state
        .store
        .log_url(&resolved.kind, api_version, namespace.as_deref(), &name)
        .await
        .ok_or(ApiError::NotFound)?;

    let upstream = state.http.get(&log_url).send().await.map_err(|e| {
        warn!(error = %e, log_url, "log_upstream_request_failed");
        ApiError::Internal(e.to_string())
    })?;

    let mut lines = Vec::new();
    let mut stream = upstream.bytes_stream();
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ApiError::Internal(e.to_string()))?;
        buf.extend_from_slice(&chunk);
        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            if let Ok(text) = std::str::from_utf8(&line[..line.len().saturating_sub(1)]) {
                lines.push(apply_json_path(text, json_path.as_deref()));
            }
        }
    }
    if !buf.is_empty() {
        if let Ok(text) = std::str::from_utf8(&buf) {
            lines.push(apply_json_path(text, json_path.as_deref()));
        }
    }

    Ok(lines.join("\n").into_response())
}

/// A single-field dotted jsonPath extractor, e.g. `.message`. Lines that
/// fail to parse as JSON, or that lack the field, pass through verbatim.
fn apply_json_path(line: &str, json_path: Option<&str>) -> String {
    let Some(path) = json_path else { return line.to_string() };
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
        return line.to_string();
    };
    let mut cursor = &value;
    for field in path.trim_start_matches('.').split('.') {
        match cursor.get(field) {
            Some(v) => cursor = v,
            None => return line.to_string(),
        }
    }
    cursor.as_str().map(String::from).unwrap_or_else(|| cursor.to_string())
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_equality_requirement() {
        let reqs = parse_label_selector("app=foo").unwrap();
        assert_eq!(reqs, vec![LabelRequirement { key: "app".to_string(), op: LabelOp::Equals, values: vec!["foo".to_string()] }]);
    }

    #[test]
    fn parses_inequality_and_existence() {
        let reqs = parse_label_selector("tier!=frontend,env,!deprecated").unwrap();
        assert_eq!(reqs.len(), 3);
        assert_eq!(reqs[1].op, LabelOp::Exists);
        assert_eq!(reqs[2].op, LabelOp::NotExists);
    }

    #[test]
    fn parses_in_and_notin_sets() {
        let reqs = parse_label_selector("env in (prod,staging),tier notin (frontend)").unwrap();
        assert_eq!(reqs[0].op, LabelOp::In);
        assert_eq!(reqs[0].values, vec!["prod".to_string(), "staging".to_string()]);
        assert_eq!(reqs[1].op, LabelOp::NotIn);
    }

    #[test]
    fn empty_selector_matches_everything() {
        let reqs = parse_label_selector("").unwrap();
        assert!(reqs.is_empty());
        let labels = HashMap::new();
        assert!(matches_all(&labels, &reqs));
    }

    #[test]
    fn matches_all_requires_every_requirement() {
        let mut labels = HashMap::new();
        labels.insert("app".to_string(), "foo".to_string());
        let reqs = parse_label_selector("app=foo,tier=backend").unwrap();
        assert!(!matches_all(&labels, &reqs));
        labels.insert("tier".to_string(), "backend".to_string());
        assert!(matches_all(&labels, &reqs));
    }

    #[test]
    fn time_bounds_reject_non_strict_ordering() {
        let err = parse_time_bounds(Some("2024-01-02T00:00:00Z"), Some("2024-01-01T00:00:00Z")).unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[test]
    fn time_bounds_accept_strict_ordering() {
        let (after, before) = parse_time_bounds(Some("2024-01-01T00:00:00Z"), Some("2024-01-02T00:00:00Z")).unwrap();
        assert!(after.is_some() && before.is_some());
    }

    #[tokio::test]
    async fn memory_store_returns_not_found_for_missing_name() {
        let store = MemoryArchiveStore::default();
        let query = ArchiveQuery {
            kind: "Pod",
            api_version: "v1",
            namespace: Some("ns"),
            name: Some("missing"),
            continue_id: None,
            continue_after: None,
            label_filters: &[],
            limit: 100,
            created_after: None,
            created_before: None,
        };
        let result = store.query(&query).await;
        assert!(matches!(result, Err(ApiError::NotFound)));
    }

    #[tokio::test]
    async fn memory_store_lists_and_paginates() {
        let store = MemoryArchiveStore::default();
        {
            let mut records = store.records.write().await;
            for i in 0..3 {
                records.push(ArchiveRecord {
                    id: i,
                    created_at: Utc::now(),
                    kind: "Pod".to_string(),
                    api_version: "v1".to_string(),
                    namespace: Some("ns".to_string()),
                    name: format!("pod-{i}"),
                    object: serde_json::json!({"metadata": {"name": format!("pod-{i}")}}),
                });
            }
        }
        let query = ArchiveQuery {
            kind: "Pod",
            api_version: "v1",
            namespace: Some("ns"),
            name: None,
            continue_id: None,
            continue_after: None,
            label_filters: &[],
            limit: 2,
            created_after: None,
            created_before: None,
        };
        let (records, last_id, _) = store.query(&query).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(last_id, Some(1));
    }

    #[tokio::test]
    async fn memory_store_applies_label_selector() {
        let store = MemoryArchiveStore::default();
        {
            let mut records = store.records.write().await;
            records.push(ArchiveRecord {
                id: 0,
                created_at: Utc::now(),
                kind: "Pod".to_string(),
                api_version: "v1".to_string(),
                namespace: Some("ns".to_string()),
                name: "keep-me".to_string(),
                object: serde_json::json!({"metadata": {"labels": {"team": "a"}}}),
            });
            records.push(ArchiveRecord {
                id: 1,
                created_at: Utc::now(),
                kind: "Pod".to_string(),
                api_version: "v1".to_string(),
                namespace: Some("ns".to_string()),
                name: "drop-me".to_string(),
                object: serde_json::json!({"metadata": {"labels": {"team": "b"}}}),
            });
        }
        let label_filters = parse_label_selector("team=a").unwrap();
        let query = ArchiveQuery {
            kind: "Pod",
            api_version: "v1",
            namespace: Some("ns"),
            name: None,
            continue_id: None,
            continue_after: None,
            label_filters: &label_filters,
            limit: 100,
            created_after: None,
            created_before: None,
        };
        let (records, _, _) = store.query(&query).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "keep-me");
    }

    #[test]
    fn apply_json_path_extracts_nested_field() {
        let line = r#"{"message": "hello"}"#;
        assert_eq!(apply_json_path(line, Some(".message")), "hello");
    }

    #[test]
    fn apply_json_path_passes_through_non_json() {
        assert_eq!(apply_json_path("plain text", Some(".message")), "plain text");
    }

    #[test]
    fn apply_json_path_passes_through_without_path() {
        assert_eq!(apply_json_path("plain text", None), "plain text");
    }
}
