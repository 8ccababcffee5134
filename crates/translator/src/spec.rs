//! Deterministic construction of desired pool specs.
//!
//! Builders are pure: the same (workload, options) input always yields a
//! structurally identical [`PoolSpec`], with frontends, backends and routes
//! in a stable sort order. The reconcile no-op check depends on this.

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::{Ingress, IngressBackend};

use krill_core::{
    BackendTarget, FrontendRoute, PoolBackend, PoolFrontend, PoolSpec,
};

use crate::options::{IngressOptions, ServiceOptions};

const PROTOCOL_TCP: &str = "TCP";

fn base_pool(opts: &crate::options::BaseOptions) -> PoolSpec {
    PoolSpec {
        name: opts.pool_name.clone(),
        role: opts.role.clone(),
        cpus: opts.cpus,
        mem_mb: opts.mem_mb,
        size: opts.size,
        network: opts.network.clone(),
        frontends: Vec::new(),
        backends: Vec::new(),
    }
}

/// Builds the desired pool for a flat-port (Service) workload: one frontend
/// per declared port, each forwarding to the service's own port.
pub fn build_service_pool(svc: &Service, opts: &ServiceOptions) -> PoolSpec {
    let namespace = svc.metadata.namespace.as_deref().unwrap_or_default();
    let name = svc.metadata.name.as_deref().unwrap_or_default();

    let mut ports: Vec<i32> = svc
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(|ps| ps.iter().map(|p| p.port).collect())
        .unwrap_or_default();
    ports.sort_unstable();
    ports.dedup();

    let mut pool = base_pool(&opts.base);
    for port in ports {
        let slug = format!("{}--{}--{}", namespace, name, port);
        let bind_port = opts.port_map.get(&port).copied().unwrap_or(port);
        pool.backends.push(PoolBackend {
            name: slug.clone(),
            target: BackendTarget {
                namespace: namespace.to_string(),
                service: name.to_string(),
                port,
            },
        });
        pool.frontends.push(PoolFrontend {
            name: slug.clone(),
            bind_port,
            protocol: PROTOCOL_TCP.to_string(),
            default_backend: Some(slug),
            routes: Vec::new(),
        });
    }
    pool
}

fn push_unique(backends: &mut Vec<PoolBackend>, b: PoolBackend) {
    if !backends.iter().any(|x| x.name == b.name) {
        backends.push(b);
    }
}

fn backend_slug(namespace: &str, ingress: &str, backend: &IngressBackend) -> Option<(String, PoolBackend)> {
    let svc = backend.service.as_ref()?;
    let port = svc.port.as_ref().and_then(|p| p.number)?;
    let slug = format!("{}--{}--{}--{}", namespace, ingress, svc.name, port);
    let backend = PoolBackend {
        name: slug.clone(),
        target: BackendTarget {
            namespace: namespace.to_string(),
            service: svc.name.clone(),
            port,
        },
    };
    Some((slug, backend))
}

/// Builds the desired pool for a host/path-routed (Ingress) workload: one
/// frontend carrying a route per rule, plus a catch-all default backend
/// when the resource declares one.
pub fn build_ingress_pool(ing: &Ingress, opts: &IngressOptions) -> PoolSpec {
    let namespace = ing.metadata.namespace.as_deref().unwrap_or_default();
    let name = ing.metadata.name.as_deref().unwrap_or_default();
    let spec = ing.spec.as_ref();

    let mut backends: Vec<PoolBackend> = Vec::new();
    let mut routes: Vec<FrontendRoute> = Vec::new();

    let default_backend = spec
        .and_then(|s| s.default_backend.as_ref())
        .and_then(|b| backend_slug(namespace, name, b))
        .map(|(slug, backend)| {
            push_unique(&mut backends, backend);
            slug
        });

    for rule in spec.and_then(|s| s.rules.as_ref()).into_iter().flatten() {
        let host = rule.host.clone().unwrap_or_default();
        for path in rule.http.as_ref().map(|h| h.paths.iter()).into_iter().flatten() {
            if let Some((slug, backend)) = backend_slug(namespace, name, &path.backend) {
                push_unique(&mut backends, backend);
                routes.push(FrontendRoute {
                    host: host.clone(),
                    path: path.path.clone().unwrap_or_else(|| "/".to_string()),
                    backend: slug,
                });
            }
        }
    }

    backends.sort_by(|a, b| a.name.cmp(&b.name));
    routes.sort_by(|a, b| (&a.host, &a.path, &a.backend).cmp(&(&b.host, &b.path, &b.backend)));
    routes.dedup();

    let mut pool = base_pool(&opts.base);
    pool.frontends.push(PoolFrontend {
        name: format!("{}--{}", namespace, name),
        bind_port: opts.frontend_port,
        protocol: PROTOCOL_TCP.to_string(),
        default_backend,
        routes,
    });
    pool.backends = backends;
    pool
}
