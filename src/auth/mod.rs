//! Request-path authorization pipeline: authn → authz → impersonation,
//! all three sharing one TTL cache (`spec.md` §4.6).
//!
//! Token review and subject-access-review calls use the Kubernetes API
//! server's own pseudo-resources (`TokenReview`, `SubjectAccessReview`)
//! through `kube::Api<T>::create`, the same idiom the teacher uses for
//! every other cluster interaction — no hand-rolled HTTP client for
//! talking to the apiserver.

pub mod authn;
pub mod authz;
pub mod impersonation;

use std::sync::Arc;
use std::time::Duration;

use kube::Client;

use crate::cache::TtlCache;
use crate::config::Config;

pub use authn::{AuthPrincipal, AuthnError};
pub use authz::{AuthzError, ResourceAttributes};
pub use impersonation::ImpersonationRequest;

/// Everything the three pipeline stages need, built once at startup and
/// cloned into each request's handler context (`spec.md` §9: no implicit
/// lookups inside handlers).
#[derive(Clone)]
pub struct AuthPipeline {
    pub client: Client,
    pub authn_cache: TtlCache<AuthPrincipal>,
    pub authz_cache: TtlCache<bool>,
    pub impersonation_enabled: bool,
}

impl AuthPipeline {
    pub fn new(client: Client, config: &Config) -> Self {
        Self {
            client,
            authn_cache: TtlCache::new(config.authn_cache_positive_ttl, config.authn_cache_negative_ttl),
            authz_cache: TtlCache::new(config.authz_cache_positive_ttl, config.authz_cache_negative_ttl),
            impersonation_enabled: config.impersonation_enabled,
        }
    }

    #[cfg(test)]
    pub fn for_tests(client: Client) -> Self {
        Self {
            client,
            authn_cache: TtlCache::new(Duration::from_secs(300), Duration::from_secs(30)),
            authz_cache: TtlCache::new(Duration::from_secs(300), Duration::from_secs(30)),
            impersonation_enabled: true,
        }
    }
}

/// Outcome of running the full three-stage pipeline for one request.
#[derive(Debug, Clone)]
pub struct AuthorizedRequest {
    pub principal: AuthPrincipal,
}

/// Errors surfaced by the pipeline, mapped to HTTP status by the caller
/// per `spec.md` §7.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Authn(#[from] AuthnError),
    #[error(transparent)]
    Authz(#[from] AuthzError),
    #[error("impersonation header present without user header")]
    ImpersonationMissingUser,
    #[error("impersonation denied: {0}")]
    ImpersonationDenied(String),
}

pub type SharedAuthPipeline = Arc<AuthPipeline>;
