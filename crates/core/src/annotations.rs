//! Annotation keys consumed from workload objects.
//!
//! All krill-owned keys live under a single prefix so operators can spot
//! them at a glance; the ingress-class pair reuses the upstream key that
//! other ingress controllers honor.

/// Prefix shared by every krill-owned annotation.
pub const PREFIX: &str = "lb.krill.io/";

/// Key of the annotation that selects the controller satisfying an Ingress.
pub const INGRESS_CLASS_KEY: &str = "kubernetes.io/ingress.class";
/// Value the ingress-class annotation must carry for krill to act.
pub const INGRESS_CLASS_VALUE: &str = "krill";

/// Key of the annotation that opts a Service into pool provisioning.
pub const SERVICE_CLASS_KEY: &str = "lb.krill.io/class";
/// Value the service-class annotation must carry for krill to act.
pub const SERVICE_CLASS_VALUE: &str = "krill";

/// Name of the pool to provision for the workload.
pub const POOL_NAME_KEY: &str = "lb.krill.io/pool-name";
/// Role (public vs. private) of the target pool.
pub const POOL_ROLE_KEY: &str = "lb.krill.io/pool-role";
/// Virtual network the target pool joins; empty selects the host network.
pub const POOL_NETWORK_KEY: &str = "lb.krill.io/pool-network";
/// CPU request for the target pool, as a resource quantity.
pub const POOL_CPUS_KEY: &str = "lb.krill.io/pool-cpus";
/// Memory request for the target pool, as a resource quantity.
pub const POOL_MEM_KEY: &str = "lb.krill.io/pool-mem";
/// Instance count to request for the target pool.
pub const POOL_SIZE_KEY: &str = "lb.krill.io/pool-size";
/// Strategy used when the target pool does not exist.
pub const POOL_CREATION_STRATEGY_KEY: &str = "lb.krill.io/pool-creation-strategy";

/// Frontend bind port for Ingress-backed pools.
pub const POOL_FRONTEND_PORT_KEY: &str = "lb.krill.io/pool-frontend-port";

/// Prefix of the per-port annotations mapping a Service port to a frontend
/// bind port; the full key is this prefix followed by the source port.
pub const POOL_PORTMAP_PREFIX: &str = "lb.krill.io/pool-portmap.";

/// Name of a companion configmap describing a cloud load-balancer placed in
/// front of the pool. When present, unmapped frontend ports are left for
/// the control plane to assign.
pub const CLOUD_LB_CONFIGMAP_KEY: &str = "lb.krill.io/cloud-loadbalancer-configmap";
