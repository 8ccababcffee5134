//! Krill core types: the pool data model, annotation surface, error
//! taxonomy and the control-plane manager contract.

#![forbid(unsafe_code)]

pub mod annotations;
mod error;

pub use error::{KrillError, KrillResult};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Role used for pools that must be reachable from outside the cluster.
pub const ROLE_PUBLIC: &str = "public";
/// Role used for pools that are only reachable from inside the cluster.
pub const ROLE_PRIVATE: &str = "private";

/// Sentinel for "run the pool on the host network" (no virtual network).
pub const HOST_NETWORK: &str = "";
/// Virtual network joined by private pools when none is named explicitly.
pub const DEFAULT_VIRTUAL_NETWORK: &str = "krill-overlay";

/// Frontend bind port sentinel meaning "let the control plane assign one".
pub const DYNAMIC_PORT: i32 = 0;

/// Policy governing whether a missing pool may be created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolCreationStrategy {
    /// Create the pool whenever one with the target name doesn't exist.
    #[default]
    IfNotPresent,
    /// Never create the pool; it is expected to exist out-of-band.
    Never,
    /// Create the pool only if one was never created for this workload.
    Once,
}

impl FromStr for PoolCreationStrategy {
    type Err = KrillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IfNotPresent" => Ok(Self::IfNotPresent),
            "Never" => Ok(Self::Never),
            "Once" => Ok(Self::Once),
            other => Err(KrillError::Validation(format!(
                "{:?} is not a valid pool creation strategy",
                other
            ))),
        }
    }
}

impl fmt::Display for PoolCreationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::IfNotPresent => "IfNotPresent",
            Self::Never => "Never",
            Self::Once => "Once",
        };
        f.write_str(s)
    }
}

/// Desired configuration of a load-balancer pool.
///
/// Built deterministically from a workload snapshot plus its resolved
/// options; two builds from identical input compare equal, which is what
/// the reconcile no-op check relies on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSpec {
    pub name: String,
    pub role: String,
    pub cpus: f64,
    pub mem_mb: i64,
    pub size: i64,
    /// Virtual network the pool joins; empty means the host network.
    pub network: String,
    pub frontends: Vec<PoolFrontend>,
    pub backends: Vec<PoolBackend>,
}

/// Externally reachable binding of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolFrontend {
    pub name: String,
    /// Port the pool binds on; [`DYNAMIC_PORT`] defers to the control plane.
    pub bind_port: i32,
    pub protocol: String,
    /// Backend used when no route matches. Flat-port frontends always
    /// forward here.
    pub default_backend: Option<String>,
    /// Host/path routes, kept sorted by (host, path).
    pub routes: Vec<FrontendRoute>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontendRoute {
    /// Host to match; empty matches any host.
    pub host: String,
    pub path: String,
    pub backend: String,
}

/// Internal target a frontend forwards to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolBackend {
    pub name: String,
    pub target: BackendTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendTarget {
    pub namespace: String,
    pub service: String,
    pub port: i32,
}

/// Address assigned to a pool by the control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolAddress {
    pub hostname: Option<String>,
    pub ip: Option<String>,
}

/// The control plane's current view of a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub spec: PoolSpec,
    /// Addresses at which the pool is reachable, when known.
    #[serde(default)]
    pub addresses: Vec<PoolAddress>,
}

/// Result of a single reconcile pass. Transient failures are `Err` values,
/// not outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Created,
    Updated,
    /// The remote pool already matches the desired spec; no mutating call
    /// was made.
    Skipped,
    /// The pool is absent and the creation strategy forbids creating it.
    /// Non-retryable; requires an operator or a strategy change.
    Rejected(String),
}

/// Identity of the workload a reconcile pass is acting for, used in
/// messages, events and status writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadRef {
    pub kind: &'static str,
    pub api_version: &'static str,
    pub namespace: String,
    pub name: String,
}

impl WorkloadRef {
    pub fn service(namespace: &str, name: &str) -> Self {
        Self {
            kind: "Service",
            api_version: "v1",
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn ingress(namespace: &str, name: &str) -> Self {
        Self {
            kind: "Ingress",
            api_version: "networking.k8s.io/v1",
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Contract the reconcile core consumes for talking to the pool control
/// plane. `get_pool_by_name` fails with a distinguished not-found error
/// when the pool is absent; callers treat that as an expected branch.
#[async_trait::async_trait]
pub trait PoolManager: Send + Sync {
    async fn create_pool(&self, spec: &PoolSpec) -> Result<Pool, KrillError>;
    async fn get_pool_by_name(&self, name: &str) -> Result<Pool, KrillError>;
    async fn update_pool(&self, name: &str, spec: &PoolSpec) -> Result<Pool, KrillError>;
    async fn get_version(&self) -> Result<String, KrillError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creation_strategy_parses_closed_set() {
        assert_eq!(
            "IfNotPresent".parse::<PoolCreationStrategy>().unwrap(),
            PoolCreationStrategy::IfNotPresent
        );
        assert_eq!(
            "Never".parse::<PoolCreationStrategy>().unwrap(),
            PoolCreationStrategy::Never
        );
        assert_eq!(
            "Once".parse::<PoolCreationStrategy>().unwrap(),
            PoolCreationStrategy::Once
        );
        let err = "sometimes".parse::<PoolCreationStrategy>().unwrap_err();
        assert!(err.to_string().contains("sometimes"), "err={}", err);
    }

    #[test]
    fn creation_strategy_display_round_trips() {
        for s in [
            PoolCreationStrategy::IfNotPresent,
            PoolCreationStrategy::Never,
            PoolCreationStrategy::Once,
        ] {
            assert_eq!(s.to_string().parse::<PoolCreationStrategy>().unwrap(), s);
        }
    }

    #[test]
    fn pool_deserializes_without_addresses() {
        let raw = serde_json::json!({
            "spec": {
                "name": "p", "role": "private", "cpus": 0.1, "mem_mb": 128,
                "size": 1, "network": "", "frontends": [], "backends": []
            }
        });
        let pool: Pool = serde_json::from_value(raw).unwrap();
        assert!(pool.addresses.is_empty());
    }
}
