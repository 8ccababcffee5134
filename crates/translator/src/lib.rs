//! Krill translator: resolves workload annotations into typed options,
//! builds desired pool specs and reconciles them against the control plane.

#![forbid(unsafe_code)]

pub mod options;
mod quantity;
pub mod reconcile;
pub mod spec;

pub use options::{
    compute_ingress_options, compute_service_options, BaseOptions, IngressOptions,
    ServiceOptions, DEFAULT_POOL_CPUS, DEFAULT_POOL_MEM_MB, DEFAULT_POOL_SIZE,
};
pub use reconcile::{PoolReconciler, ReconcileReport};
pub use spec::{build_ingress_pool, build_service_pool};
