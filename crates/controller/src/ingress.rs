//! Reconcile driver for annotated Ingress workloads.

use std::sync::Arc;

use k8s_openapi::api::networking::v1::Ingress;
use tracing::{debug, info, warn};

use krill_core::annotations::{INGRESS_CLASS_KEY, INGRESS_CLASS_VALUE};
use krill_core::{KrillError, PoolAddress, PoolManager, ReconcileOutcome, WorkloadRef};
use krill_translator::{build_ingress_pool, compute_ingress_options, PoolReconciler};

use crate::queue::WorkItem;
use crate::traits::{EventSeverity, EventSink, StatusSink, WorkloadCache};
use crate::{
    split_key, Handler, REASON_INVALID_ANNOTATIONS, REASON_POOL_CREATION_FORBIDDEN,
    REASON_POOL_PROVISIONED,
};

/// An Ingress is krill's to satisfy when its class annotation names this
/// controller; all others belong to some other ingress controller.
pub fn is_managed_ingress(ing: &Ingress) -> bool {
    ing.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(INGRESS_CLASS_KEY))
        .map(String::as_str)
        == Some(INGRESS_CLASS_VALUE)
}

fn prior_status_present(ing: &Ingress) -> bool {
    !status_addresses(ing).is_empty()
}

/// Load-balancer addresses currently recorded on the Ingress's status.
fn status_addresses(ing: &Ingress) -> Vec<PoolAddress> {
    ing.status
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

pub struct IngressController {
    cluster_name: String,
    cache: Arc<dyn WorkloadCache<Ingress>>,
    manager: Arc<dyn PoolManager>,
    status: Arc<dyn StatusSink>,
    events: Arc<dyn EventSink>,
}

impl IngressController {
    pub fn new(
        cluster_name: impl Into<String>,
        cache: Arc<dyn WorkloadCache<Ingress>>,
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

    async fn sync(&self, ing: &Ingress) -> Result<(), KrillError> {
        let workload = WorkloadRef::ingress(
            ing.metadata.namespace.as_deref().unwrap_or_default(),
            ing.metadata.name.as_deref().unwrap_or_default(),
        );

        let opts = match compute_ingress_options(&self.cluster_name, ing) {
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
        let desired = build_ingress_pool(ing, &opts);

        let reconciler = PoolReconciler::new(self.manager.as_ref());
        let report = reconciler
            .reconcile(
                &workload,
                opts.base.strategy,
                prior_status_present(ing),
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
            if status_addresses(ing) != addresses {
                self.status.write_addresses(&workload, &addresses).await?;
            }
        }
        Ok(())
    }

    async fn finalize(&self, ing: &Ingress) -> Result<(), KrillError> {
        let workload = WorkloadRef::ingress(
            ing.metadata.namespace.as_deref().unwrap_or_default(),
            ing.metadata.name.as_deref().unwrap_or_default(),
        );
        match compute_ingress_options(&self.cluster_name, ing) {
            Ok(opts) => {
                let reconciler = PoolReconciler::new(self.manager.as_ref());
                reconciler.release(&workload, &opts.base.pool_name).await
            }
            Err(e) => {
                debug!(workload = %workload, error = %e, "skipping release of unresolvable ingress");
                Ok(())
            }
        }
    }
}

#[async_trait::async_trait]
impl Handler<Ingress> for IngressController {
    fn kind(&self) -> &'static str {
        "Ingress"
    }

    async fn handle(&self, item: &WorkItem<Ingress>) -> Result<(), KrillError> {
        let (namespace, name) = split_key(&item.key);
        match self.cache.get(namespace, name) {
            Some(ing) => {
                if !is_managed_ingress(&ing) {
                    return Ok(());
                }
                self.sync(&ing).await
            }
            None => match &item.tombstone {
                Some(ing) => {
                    info!(key = %item.key, "ingress deleted; releasing its pool");
                    self.finalize(ing).await
                }
                None => {
                    debug!(key = %item.key, "ingress no longer exists; nothing to do");
                    Ok(())
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use k8s_openapi::api::networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, IngressBackend, IngressRule,
        IngressServiceBackend, IngressSpec, ServiceBackendPort,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use rustc_hash::FxHashMap;

    use krill_core::annotations::POOL_FRONTEND_PORT_KEY;
    use krill_core::{Pool, PoolSpec};

    #[derive(Default)]
    struct FakeCache {
        objects: FxHashMap<String, Arc<Ingress>>,
    }

    impl FakeCache {
        fn with(ing: Ingress) -> Self {
            let key = format!(
                "{}/{}",
                ing.metadata.namespace.as_deref().unwrap(),
                ing.metadata.name.as_deref().unwrap()
            );
            let mut objects = FxHashMap::default();
            objects.insert(key, Arc::new(ing));
            Self { objects }
        }
    }

    impl WorkloadCache<Ingress> for FakeCache {
        fn get(&self, namespace: &str, name: &str) -> Option<Arc<Ingress>> {
            self.objects.get(&format!("{}/{}", namespace, name)).cloned()
        }
    }

    #[derive(Default)]
    struct FakeManager {
        pool: Mutex<Option<Pool>>,
        created: Mutex<Vec<PoolSpec>>,
    }

    #[async_trait::async_trait]
    impl PoolManager for FakeManager {
        async fn create_pool(&self, spec: &PoolSpec) -> Result<Pool, KrillError> {
            self.created.lock().unwrap().push(spec.clone());
            let pool = Pool {
                spec: spec.clone(),
                addresses: vec![PoolAddress {
                    hostname: None,
                    ip: Some("1.2.3.4".into()),
                }],
            };
            *self.pool.lock().unwrap() = Some(pool.clone());
            Ok(pool)
        }

        async fn get_pool_by_name(&self, name: &str) -> Result<Pool, KrillError> {
            self.pool
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| KrillError::NotFound(format!("pool {:?} does not exist", name)))
        }

        async fn update_pool(&self, _name: &str, spec: &PoolSpec) -> Result<Pool, KrillError> {
            let pool = Pool {
                spec: spec.clone(),
                addresses: vec![],
            };
            *self.pool.lock().unwrap() = Some(pool.clone());
            Ok(pool)
        }

        async fn get_version(&self) -> Result<String, KrillError> {
            Ok("fake".into())
        }
    }

    #[derive(Default)]
    struct FakeStatus {
        writes: Mutex<Vec<(WorkloadRef, Vec<PoolAddress>)>>,
    }

    #[async_trait::async_trait]
    impl StatusSink for FakeStatus {
        async fn write_addresses(
            &self,
            workload: &WorkloadRef,
            addresses: &[PoolAddress],
        ) -> Result<(), KrillError> {
            self.writes
                .lock()
                .unwrap()
                .push((workload.clone(), addresses.to_vec()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeEvents {
        published: Mutex<Vec<(EventSeverity, String)>>,
    }

    #[async_trait::async_trait]
    impl EventSink for FakeEvents {
        async fn publish(
            &self,
            _workload: &WorkloadRef,
            severity: EventSeverity,
            reason: &str,
            _message: &str,
        ) {
            self.published
                .lock()
                .unwrap()
                .push((severity, reason.to_string()));
        }
    }

    fn backend(service: &str, port: i32) -> IngressBackend {
        IngressBackend {
            service: Some(IngressServiceBackend {
                name: service.to_string(),
                port: Some(ServiceBackendPort {
                    number: Some(port),
                    name: None,
                }),
            }),
            resource: None,
        }
    }

    fn managed_ingress(extra: &[(&str, &str)]) -> Ingress {
        let mut annotations = BTreeMap::new();
        annotations.insert(INGRESS_CLASS_KEY.to_string(), INGRESS_CLASS_VALUE.to_string());
        for (k, v) in extra {
            annotations.insert(k.to_string(), v.to_string());
        }
        Ingress {
            metadata: ObjectMeta {
                namespace: Some("foo".into()),
                name: Some("bar".into()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                rules: Some(vec![IngressRule {
                    host: Some("example.com".into()),
                    http: Some(HTTPIngressRuleValue {
                        paths: vec![HTTPIngressPath {
                            path: Some("/".into()),
                            path_type: "Prefix".into(),
                            backend: backend("web", 8080),
                        }],
                    }),
                }]),
                ..Default::default()
            }),
            status: None,
        }
    }

    struct Harness {
        controller: IngressController,
        manager: Arc<FakeManager>,
        status: Arc<FakeStatus>,
        events: Arc<FakeEvents>,
    }

    fn harness(cache: FakeCache) -> Harness {
        let manager = Arc::new(FakeManager::default());
        let status = Arc::new(FakeStatus::default());
        let events = Arc::new(FakeEvents::default());
        let controller = IngressController::new(
            "dev/kubernetes01",
            Arc::new(cache),
            Arc::clone(&manager) as Arc<dyn PoolManager>,
            Arc::clone(&status) as Arc<dyn StatusSink>,
            Arc::clone(&events) as Arc<dyn EventSink>,
        );
        Harness {
            controller,
            manager,
            status,
            events,
        }
    }

    #[tokio::test]
    async fn managed_ingress_provisions_a_pool_and_writes_status() {
        let h = harness(FakeCache::with(managed_ingress(&[])));
        h.controller
            .handle(&WorkItem::new("foo/bar"))
            .await
            .unwrap();

        let created = h.manager.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].name, "dev--kubernetes01--foo--bar");
        assert_eq!(created[0].frontends.len(), 1);
        assert_eq!(created[0].frontends[0].routes.len(), 1);

        let writes = h.status.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(
            writes[0].1,
            vec![PoolAddress {
                hostname: None,
                ip: Some("1.2.3.4".into())
            }]
        );
    }

    #[tokio::test]
    async fn skipped_pass_repairs_a_lagging_status() {
        // The cached ingress never had a status, so a second pass over an
        // in-sync pool must still write the addresses back.
        let h = harness(FakeCache::with(managed_ingress(&[])));
        h.controller
            .handle(&WorkItem::new("foo/bar"))
            .await
            .unwrap();
        h.controller
            .handle(&WorkItem::new("foo/bar"))
            .await
            .unwrap();
        assert_eq!(h.manager.created.lock().unwrap().len(), 1);
        let writes = h.status.writes.lock().unwrap();
        assert_eq!(writes.len(), 2);
        assert_eq!(
            writes[1].1,
            vec![PoolAddress {
                hostname: None,
                ip: Some("1.2.3.4".into())
            }]
        );
    }

    #[tokio::test]
    async fn unmanaged_ingress_is_ignored() {
        let mut ing = managed_ingress(&[]);
        ing.metadata.annotations = None;
        let h = harness(FakeCache::with(ing));
        h.controller
            .handle(&WorkItem::new("foo/bar"))
            .await
            .unwrap();
        assert!(h.manager.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_frontend_port_publishes_a_warning() {
        let h = harness(FakeCache::with(managed_ingress(&[(
            POOL_FRONTEND_PORT_KEY,
            "70000",
        )])));
        let err = h
            .controller
            .handle(&WorkItem::new("foo/bar"))
            .await
            .unwrap_err();
        assert!(matches!(err, KrillError::Validation(_)), "err={}", err);

        let events = h.events.published.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0],
            (
                EventSeverity::Warning,
                REASON_INVALID_ANNOTATIONS.to_string()
            )
        );
    }

    #[tokio::test]
    async fn deleted_ingress_releases_via_the_tombstone() {
        let h = harness(FakeCache::default());
        let snapshot = Arc::new(managed_ingress(&[]));
        h.controller
            .handle(&WorkItem::tombstone("foo/bar", snapshot))
            .await
            .unwrap();
        assert!(h.manager.created.lock().unwrap().is_empty());
        assert!(h.status.writes.lock().unwrap().is_empty());
    }
}
