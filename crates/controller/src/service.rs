//! Reconcile driver for annotated Service workloads.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use tracing::{debug, info, warn};

use krill_core::annotations::{SERVICE_CLASS_KEY, SERVICE_CLASS_VALUE};
use krill_core::{KrillError, PoolAddress, PoolManager, ReconcileOutcome, WorkloadRef};
use krill_translator::{build_service_pool, compute_service_options, PoolReconciler};

use crate::queue::WorkItem;
use crate::traits::{EventSeverity, EventSink, StatusSink, WorkloadCache};
use crate::{
    split_key, Handler, REASON_INVALID_ANNOTATIONS, REASON_POOL_CREATION_FORBIDDEN,
    REASON_POOL_PROVISIONED,
};

/// A Service opts into pool provisioning via the class annotation; every
/// other Service is ignored.
pub fn is_managed_service(svc: &Service) -> bool {
    svc.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(SERVICE_CLASS_KEY))
        .map(String::as_str)
        == Some(SERVICE_CLASS_VALUE)
}

fn prior_status_present(svc: &Service) -> bool {
    !status_addresses(svc).is_empty()
}

/// Load-balancer addresses currently recorded on the Service's status.
fn status_addresses(svc: &Service) -> Vec<PoolAddress> {
    svc.status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|entries| {
            entries
                .iter()
                .map(|e| PoolAddress {
                    hostname: e.hostname.clone(),
                    ip: e.ip.clone(),
                })
                .collect()
        })
        .unwrap_or_default()
}

pub struct ServiceController {
    cluster_name: String,
    cache: Arc<dyn WorkloadCache<Service>>,
    manager: Arc<dyn PoolManager>,
    status: Arc<dyn StatusSink>,
    events: Arc<dyn EventSink>,
}

impl ServiceController {
    pub fn new(
        cluster_name: impl Into<String>,
        cache: Arc<dyn WorkloadCache<Service>>,
        manager: Arc<dyn PoolManager>,
        status: Arc<dyn StatusSink>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            cache,
            manager,
            status,
            events,
        }
    }

    async fn sync(&self, svc: &Service) -> Result<(), KrillError> {
        let workload = WorkloadRef::service(
            svc.metadata.namespace.as_deref().unwrap_or_default(),
            svc.metadata.name.as_deref().unwrap_or_default(),
        );

        let opts = match compute_service_options(&self.cluster_name, svc) {
            Ok(opts) => opts,
            Err(e) => {
                self.events
                    .publish(
                        &workload,
                        EventSeverity::Warning,
                        REASON_INVALID_ANNOTATIONS,
                        &e.to_string(),
                    )
                    .await;
                return Err(e);
            }
        };
        let desired = build_service_pool(svc, &opts);

        let reconciler = PoolReconciler::new(self.manager.as_ref());
        let report = reconciler
            .reconcile(
                &workload,
                opts.base.strategy,
                prior_status_present(svc),
                &desired,
            )
            .await?;

        match report.outcome {
            ReconcileOutcome::Rejected(reason) => {
                warn!(workload = %workload, pool = %desired.name, "pool creation forbidden: {}", reason);
                self.events
                    .publish(
                        &workload,
                        EventSeverity::Warning,
                        REASON_POOL_CREATION_FORBIDDEN,
                        &reason,
                    )
                    .await;
                return Ok(());
            }
            ReconcileOutcome::Skipped => {}
            outcome @ (ReconcileOutcome::Created | ReconcileOutcome::Updated) => {
                let verb = match outcome {
                    ReconcileOutcome::Created => "created",
                    _ => "updated",
                };
                self.events
                    .publish(
                        &workload,
                        EventSeverity::Normal,
                        REASON_POOL_PROVISIONED,
                        &format!("pool {:?} {}", desired.name, verb),
                    )
                    .await;
            }
        }

        // An in-sync pool can still have a lagging status, e.g. when the
        // write-back of an earlier pass failed after the mutation
        // succeeded; repair it here without another pool call.
        if let Some(addresses) = report.addresses.filter(|a| !a.is_empty()) {
            if status_addresses(svc) != addresses {
                self.status.write_addresses(&workload, &addresses).await?;
            }
        }
        Ok(())
    }

    /// Deletion path, driven from the last observed snapshot.
    async fn finalize(&self, svc: &Service) -> Result<(), KrillError> {
        let workload = WorkloadRef::service(
            svc.metadata.namespace.as_deref().unwrap_or_default(),
            svc.metadata.name.as_deref().unwrap_or_default(),
        );
        match compute_service_options(&self.cluster_name, svc) {
            Ok(opts) => {
                let reconciler = PoolReconciler::new(self.manager.as_ref());
                reconciler.release(&workload, &opts.base.pool_name).await
            }
            Err(e) => {
                // The snapshot never resolved to a pool, so there is
                // nothing to release.
                debug!(workload = %workload, error = %e, "skipping release of unresolvable service");
                Ok(())
            }
        }
    }
}

#[async_trait::async_trait]
impl Handler<Service> for ServiceController {
    fn kind(&self) -> &'static str {
        "Service"
    }

    async fn handle(&self, item: &WorkItem<Service>) -> Result<(), KrillError> {
        let (namespace, name) = split_key(&item.key);
        match self.cache.get(namespace, name) {
            Some(svc) => {
                if !is_managed_service(&svc) {
                    // The class annotation was removed after enqueueing.
                    return Ok(());
                }
                self.sync(&svc).await
            }
            None => match &item.tombstone {
                Some(svc) => {
                    info!(key = %item.key, "service deleted; releasing its pool");
                    self.finalize(svc).await
                }
                None => {
                    debug!(key = %item.key, "service no longer exists; nothing to do");
                    Ok(())
                }
            },
        }
    }
}
