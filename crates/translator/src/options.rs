//! Resolution of workload annotations into validated translation options.
//!
//! Resolution is fail-fast: the first invalid annotation wins and surfaces
//! as a validation error naming the offending key and value. Options are
//! recomputed on every reconcile pass and never persisted.

use std::collections::{BTreeMap, HashMap};

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use once_cell::sync::Lazy;
use regex::Regex;

use krill_core::annotations::{
    CLOUD_LB_CONFIGMAP_KEY, POOL_CPUS_KEY, POOL_CREATION_STRATEGY_KEY, POOL_FRONTEND_PORT_KEY,
    POOL_MEM_KEY, POOL_NAME_KEY, POOL_NETWORK_KEY, POOL_PORTMAP_PREFIX, POOL_ROLE_KEY,
    POOL_SIZE_KEY,
};
use krill_core::{
    KrillError, KrillResult, PoolCreationStrategy, DEFAULT_VIRTUAL_NETWORK, DYNAMIC_PORT,
    HOST_NETWORK, ROLE_PRIVATE, ROLE_PUBLIC,
};

use crate::quantity;

/// Default CPU request for a pool, in cores.
pub const DEFAULT_POOL_CPUS: f64 = 0.1;
/// Default memory request for a pool, in mebibytes.
pub const DEFAULT_POOL_MEM_MB: i64 = 128;
/// Default instance count for a pool.
pub const DEFAULT_POOL_SIZE: i64 = 1;

/// Default frontend bind port for Ingress-backed pools.
pub const DEFAULT_FRONTEND_PORT: i32 = 80;

/// Prefix prepended to generated pool names when a cloud load-balancer
/// configmap is referenced.
const CLOUD_POOL_NAME_PREFIX: &str = "ext";

static POOL_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$").expect("static pool-name regex"));

/// Options shared by every workload kind.
#[derive(Debug, Clone, PartialEq)]
pub struct BaseOptions {
    pub pool_name: String,
    pub role: String,
    /// Virtual network the pool joins; empty means the host network.
    pub network: String,
    pub cpus: f64,
    pub mem_mb: i64,
    pub size: i64,
    pub strategy: PoolCreationStrategy,
    /// Companion cloud load-balancer configmap, when referenced.
    pub cloud_lb_configmap: Option<String>,
}

/// Options for flat-port (Service) workloads.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceOptions {
    pub base: BaseOptions,
    /// Source port to frontend bind port; [`DYNAMIC_PORT`] defers the
    /// assignment to the control plane.
    pub port_map: BTreeMap<i32, i32>,
}

/// Options for host/path-routed (Ingress) workloads.
#[derive(Debug, Clone, PartialEq)]
pub struct IngressOptions {
    pub base: BaseOptions,
    pub frontend_port: i32,
}

fn validation(msg: String) -> KrillError {
    KrillError::Validation(msg)
}

/// Builds the deterministic pool name used when none is set explicitly.
/// `dev/kubernetes01` + `foo` + `bar` yields `dev--kubernetes01--foo--bar`.
pub fn compute_pool_name(prefix: Option<&str>, cluster_name: &str, namespace: &str, name: &str) -> String {
    let cluster = cluster_name.replace('/', "--");
    match prefix {
        Some(p) => format!("{}--{}--{}--{}", p, cluster, namespace, name),
        None => format!("{}--{}--{}", cluster, namespace, name),
    }
}

fn compute_base_options(
    cluster_name: &str,
    namespace: &str,
    name: &str,
    annotations: &BTreeMap<String, String>,
) -> KrillResult<BaseOptions> {
    let cloud_lb_configmap = annotations.get(CLOUD_LB_CONFIGMAP_KEY).cloned();

    // 1. Pool name: explicit annotation wins, else the deterministic slug.
    let pool_name = match annotations.get(POOL_NAME_KEY) {
        Some(v) => {
            if !POOL_NAME_RE.is_match(v) || v.len() > 63 {
                return Err(validation(format!("{:?} is not a valid pool name", v)));
            }
            v.clone()
        }
        None => {
            let prefix = cloud_lb_configmap.as_ref().map(|_| CLOUD_POOL_NAME_PREFIX);
            compute_pool_name(prefix, cluster_name, namespace, name)
        }
    };

    // 2. Role, defaulting to private.
    let role = annotations
        .get(POOL_ROLE_KEY)
        .cloned()
        .unwrap_or_else(|| ROLE_PRIVATE.to_string());

    // 3. Network. Public pools must stay on the host network; private pools
    // join the named virtual network, defaulting when none is given.
    let network = match annotations.get(POOL_NETWORK_KEY) {
        Some(v) if role == ROLE_PUBLIC && v != HOST_NETWORK => {
            return Err(validation(format!(
                "cannot join a virtual network when the pool's role is {:?}",
                ROLE_PUBLIC
            )));
        }
        Some(v) => v.clone(),
        None if role == ROLE_PUBLIC => HOST_NETWORK.to_string(),
        None => DEFAULT_VIRTUAL_NETWORK.to_string(),
    };

    // 4. CPU and memory requests.
    let cpus = match annotations.get(POOL_CPUS_KEY) {
        Some(v) => quantity::parse_cpus(v).map_err(|e| {
            validation(format!(
                "failed to parse {:?} ({}) as the amount of cpus to request: {}",
                v, POOL_CPUS_KEY, e
            ))
        })?,
        None => DEFAULT_POOL_CPUS,
    };
    let mem_mb = match annotations.get(POOL_MEM_KEY) {
        Some(v) => quantity::parse_mem_mb(v).map_err(|e| {
            validation(format!(
                "failed to parse {:?} ({}) as the amount of memory to request: {}",
                v, POOL_MEM_KEY, e
            ))
        })?,
        None => DEFAULT_POOL_MEM_MB,
    };

    // 5. Size.
    let size = match annotations.get(POOL_SIZE_KEY) {
        Some(v) => {
            let n: i64 = v.parse().map_err(|e| {
                validation(format!(
                    "failed to parse {:?} ({}) as the size to request for the target pool: {}",
                    v, POOL_SIZE_KEY, e
                ))
            })?;
            if n < 0 {
                return Err(validation(format!("{} is not a valid size", n)));
            }
            n
        }
        None => DEFAULT_POOL_SIZE,
    };

    // 6. Creation strategy.
    let strategy = match annotations.get(POOL_CREATION_STRATEGY_KEY) {
        Some(v) => v.parse::<PoolCreationStrategy>()?,
        None => PoolCreationStrategy::default(),
    };

    Ok(BaseOptions {
        pool_name,
        role,
        network,
        cpus,
        mem_mb,
        size,
        strategy,
        cloud_lb_configmap,
    })
}

fn empty_annotations() -> BTreeMap<String, String> {
    BTreeMap::new()
}

/// Resolves a Service resource's annotations and ports into validated
/// translation options.
pub fn compute_service_options(cluster_name: &str, svc: &Service) -> KrillResult<ServiceOptions> {
    let namespace = svc.metadata.namespace.as_deref().unwrap_or_default();
    let name = svc.metadata.name.as_deref().unwrap_or_default();
    let annotations = svc.metadata.annotations.clone().unwrap_or_else(empty_annotations);
    let base = compute_base_options(cluster_name, namespace, name, &annotations)?;

    let ports = svc
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .cloned()
        .unwrap_or_default();

    // 7a. Only TCP ports can be fronted by a pool.
    for port in &ports {
        if let Some(protocol) = port.protocol.as_deref() {
            if protocol != "TCP" {
                return Err(validation(format!(
                    "protocol {:?} is not supported",
                    protocol
                )));
            }
        }
    }

    // 7b. Per-port destinations: explicit mapping when annotated, identity
    // otherwise, dynamic when a cloud load-balancer fronts the pool. No two
    // source ports may target the same destination.
    let mut port_map = BTreeMap::new();
    let mut claimed: HashMap<i32, String> = HashMap::new();
    for port in &ports {
        let ident = port
            .name
            .clone()
            .unwrap_or_else(|| port.port.to_string());
        let key = format!("{}{}", POOL_PORTMAP_PREFIX, port.port);
        let dest = match annotations.get(&key) {
            Some(v) => {
                let dest: i32 = v.parse().map_err(|e| {
                    validation(format!(
                        "failed to parse {:?} as a frontend bind port: {}",
                        v, e
                    ))
                })?;
                if !(1..=65535).contains(&dest) {
                    return Err(validation(format!("{} is not a valid port number", dest)));
                }
                dest
            }
            None if base.cloud_lb_configmap.is_some() => DYNAMIC_PORT,
            None => port.port,
        };
        if dest != DYNAMIC_PORT {
            if let Some(other) = claimed.insert(dest, ident.clone()) {
                return Err(validation(format!(
                    "port {} is mapped to both {:?} and {:?} service ports",
                    dest, other, ident
                )));
            }
        }
        port_map.insert(port.port, dest);
    }

    Ok(ServiceOptions { base, port_map })
}

/// Resolves an Ingress resource's annotations and routing rules into
/// validated translation options.
pub fn compute_ingress_options(cluster_name: &str, ing: &Ingress) -> KrillResult<IngressOptions> {
    let namespace = ing.metadata.namespace.as_deref().unwrap_or_default();
    let name = ing.metadata.name.as_deref().unwrap_or_default();
    let annotations = ing.metadata.annotations.clone().unwrap_or_else(empty_annotations);
    let base = compute_base_options(cluster_name, namespace, name, &annotations)?;

    let frontend_port = match annotations.get(POOL_FRONTEND_PORT_KEY) {
        Some(v) => {
            let port: i32 = v.parse().map_err(|e| {
                validation(format!(
                    "failed to parse {:?} as a frontend bind port: {}",
                    v, e
                ))
            })?;
            if !(1..=65535).contains(&port) {
                return Err(validation(format!("{} is not a valid port number", port)));
            }
            port
        }
        None => DEFAULT_FRONTEND_PORT,
    };

    // Every referenced backend must be a service with a numeric port; the
    // builder cannot resolve named ports without reading the Service.
    let spec = ing.spec.as_ref();
    let mut backends = Vec::new();
    if let Some(b) = spec.and_then(|s| s.default_backend.as_ref()) {
        backends.push(b);
    }
    for rule in spec.and_then(|s| s.rules.as_ref()).into_iter().flatten() {
        for path in rule.http.as_ref().map(|h| h.paths.iter()).into_iter().flatten() {
            backends.push(&path.backend);
        }
    }
    for backend in backends {
        let svc = backend.service.as_ref().ok_or_else(|| {
            validation("ingress backends must reference a service".to_string())
        })?;
        let numeric = svc.port.as_ref().and_then(|p| p.number).is_some();
        if !numeric {
            return Err(validation(format!(
                "ingress backend for service {:?} must reference a numeric port",
                svc.name
            )));
        }
    }

    Ok(IngressOptions {
        base,
        frontend_port,
    })
}
