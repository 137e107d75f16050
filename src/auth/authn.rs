//! Stage 1: bearer-token authentication, cached with independent
//! positive/negative TTLs (`spec.md` §4.6 "Authn").

use std::collections::{BTreeMap, HashSet};

use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec};
use kube::api::{Api, PostParams};
use kube::Client;
use thiserror::Error;
use tracing::{info, warn};

use super::AuthPipeline;
use crate::cache::CachedValue;

/// The principal a validated bearer token (or impersonation headers)
/// resolves to (`spec.md` §3 `AuthPrincipal`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPrincipal {
    pub name: String,
    pub uid: String,
    pub groups: HashSet<String>,
    pub extra: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Error)]
pub enum AuthnError {
    #[error("missing or malformed Authorization header")]
    MalformedHeader,
    #[error("token rejected")]
    Unauthenticated,
    #[error("upstream token review failed: {0}")]
    UpstreamFailure(String),
}

/// Extract the bearer token from an `Authorization` header value.
///
/// `spec.md` §4.6: "reject malformed or missing headers with 400."
pub fn extract_bearer_token(header_value: Option<&str>) -> Result<&str, AuthnError> {
    let value = header_value.ok_or(AuthnError::MalformedHeader)?;
    value
        .strip_prefix("Bearer ")
        .filter(|t| !t.is_empty())
        .ok_or(AuthnError::MalformedHeader)
}

impl AuthPipeline {
    /// Run stage 1. On a cache miss, performs an upstream `TokenReview`
    /// and caches the outcome under the positive or negative TTL.
    pub async fn authenticate(&self, token: &str) -> Result<AuthPrincipal, AuthnError> {
        if let Some(cached) = self.authn_cache.get(token).await {
            return match cached {
                CachedValue::Positive(principal) => Ok(principal),
                CachedValue::Negative => Err(AuthnError::Unauthenticated),
            };
        }

        let reviews: Api<TokenReview> = Api::all(self.client.clone());
        let review = TokenReview {
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let result = reviews.create(&PostParams::default(), &review).await;

        let reviewed = match result {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "token_review_upstream_failure");
                return Err(AuthnError::UpstreamFailure(e.to_string()));
            }
        };

        let status = reviewed.status.unwrap_or_default();

        if !status.authenticated.unwrap_or(false) {
            self.authn_cache.put_negative(token).await;
            info!("token_review_denied");
            return Err(AuthnError::Unauthenticated);
        }

        let Some(user_info) = status.user else {
            self.authn_cache.put_negative(token).await;
            return Err(AuthnError::Unauthenticated);
        };

        let principal = AuthPrincipal {
            name: user_info.username.unwrap_or_default(),
            uid: user_info.uid.unwrap_or_default(),
            groups: user_info.groups.unwrap_or_default().into_iter().collect(),
            extra: user_info
                .extra
                .unwrap_or_default()
                .into_iter()
                .collect(),
        };

        self.authn_cache.put_positive(token, principal.clone()).await;
        info!(user = %principal.name, "token_review_accepted");
        Ok(principal)
    }
}

/* ============================= TESTS ============================= */
