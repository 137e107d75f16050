//! Process-wide configuration, read once at startup and threaded through
//! explicitly (`spec.md` §9: "Model them as explicit configuration values
//! passed at startup; avoid implicit lookups inside handlers so they
//! remain testable"). Mirrors the teacher's `cli.rs` + per-command
//! `const` pattern, generalized into one struct.

use std::time::Duration;

use clap::Parser;

/// The environment variable naming the operator's own namespace
/// (`spec.md` §6 "Environment"). Absent only in tests.
pub const OPERATOR_NAMESPACE_ENV: &str = "KUBEARCHIVE_NAMESPACE";

/// Default used only when `OPERATOR_NAMESPACE_ENV` is unset — tests only,
/// per `spec.md` §6.
pub const DEFAULT_OPERATOR_NAMESPACE_FOR_TESTS: &str = "kubearchive-system";

/// Env flag gating impersonation support (`spec.md` §4.6, §6).
pub const IMPERSONATION_ENABLE_ENV: &str = "KUBEARCHIVE_ENABLE_IMPERSONATION";

/// Recognized runtime configuration (`spec.md` §9 "Configuration objects").
#[derive(Debug, Clone)]
pub struct Config {
    pub operator_namespace: String,
    pub impersonation_enabled: bool,
    pub authn_cache_positive_ttl: Duration,
    pub authn_cache_negative_ttl: Duration,
    pub authz_cache_positive_ttl: Duration,
    pub authz_cache_negative_ttl: Duration,
    pub pagination_default_limit: i64,
    pub pagination_min_limit: i64,
    pub pagination_max_limit: i64,
    pub watch_timeout_lower: Duration,
    pub watch_timeout_upper: Duration,
    pub event_target_url: String,
    pub discovery_cache_ttl: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            operator_namespace: std::env::var(OPERATOR_NAMESPACE_ENV)
                .unwrap_or_else(|_| DEFAULT_OPERATOR_NAMESPACE_FOR_TESTS.to_string()),
            impersonation_enabled: std::env::var(IMPERSONATION_ENABLE_ENV)
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            authn_cache_positive_ttl: Duration::from_secs(300),
            authn_cache_negative_ttl: Duration::from_secs(30),
            authz_cache_positive_ttl: Duration::from_secs(300),
            authz_cache_negative_ttl: Duration::from_secs(30),
            pagination_default_limit: 100,
            pagination_min_limit: 1,
            pagination_max_limit: 1000,
            watch_timeout_lower: Duration::from_secs(300),
            watch_timeout_upper: Duration::from_secs(600),
            event_target_url: "http://kubearchive-sink.kubearchive-system.svc:8080".to_string(),
            discovery_cache_ttl: Duration::from_secs(3600),
        }
    }
}

/// The sink's default retriable HTTP status set (`spec.md` §4.5).
pub fn default_retriable_status_codes() -> &'static [u16] {
    &[404, 413, 425, 429, 500, 502, 503, 504]
}

/// CLI flags, following the teacher's `clap::Parser` + `Subcommand` shape
/// (`src/cli.rs`).
#[derive(Parser, Debug)]
#[command(name = "kubearchive")]
#[command(about = "Kubernetes resource archive control plane")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Display application version
    Version,

    /// Check cluster connectivity and permissions
    Check,

    /// Run the watch supervisor + event dispatcher control loop
    Watch,

    /// Serve the archive read API
    Serve {
        #[arg(long, default_value = "0.0.0.0:8081", env = "KUBEARCHIVE_API_ADDR")]
        addr: String,
    },

    /// Manage the ClusterPolicy / NamespacePolicy CRDs
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },

    /// Print the reconciled RBAC manifests for the current FilterStore
    Rbac,
}

#[derive(clap::Subcommand, Debug)]
pub enum CrdAction {
    /// Print the ClusterPolicy and NamespacePolicy CRD YAML to stdout
    Generate,
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_test_namespace_when_env_unset() {
        // SAFETY: test-local env mutation, no other test reads this var concurrently
        // within the same process in a way that would race observably here.
        unsafe {
            std::env::remove_var(OPERATOR_NAMESPACE_ENV);
        }
        let cfg = Config::default();
        assert_eq!(cfg.operator_namespace, DEFAULT_OPERATOR_NAMESPACE_FOR_TESTS);
    }

    #[test]
    fn retriable_status_set_matches_spec() {
        let set = default_retriable_status_codes();
        for code in [404, 413, 425, 429, 500, 502, 503, 504] {
            assert!(set.contains(&code));
        }
        assert!(!set.contains(&400));
        assert!(!set.contains(&401));
    }
}
