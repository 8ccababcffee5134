//! Capability seams between the reconcile drivers and the cluster.
//!
//! The drivers only ever see these traits; the kube-backed implementations
//! live here and the tests substitute in-memory fakes.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::{Patch, PatchParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::reflector::{Lookup, ObjectRef, Store};
use kube::{Api, Client};
use tracing::warn;

use krill_core::{KrillError, PoolAddress, WorkloadRef};

/// Read access to the watch cache for one workload kind.
pub trait WorkloadCache<K>: Send + Sync {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>>;
}

impl<K> WorkloadCache<K> for Store<K>
where
    K: Lookup<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        Store::get(self, &ObjectRef::new(name).within(namespace))
    }
}

/// Folds pool addresses into a workload's load-balancer status.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn write_addresses(
        &self,
        workload: &WorkloadRef,
        addresses: &[PoolAddress],
    ) -> Result<(), KrillError>;
}

/// Status sink that merge-patches `status.loadBalancer.ingress` on the
/// workload object.
#[derive(Clone)]
pub struct KubeStatusSink {
    client: Client,
}

impl KubeStatusSink {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn status_patch(addresses: &[PoolAddress]) -> serde_json::Value {
    let entries: Vec<serde_json::Value> = addresses
        .iter()
        .map(|a| {
            let mut entry = serde_json::Map::new();
            if let Some(hostname) = &a.hostname {
                entry.insert("hostname".into(), hostname.clone().into());
            }
            if let Some(ip) = &a.ip {
                entry.insert("ip".into(), ip.clone().into());
            }
            serde_json::Value::Object(entry)
        })
        .collect();
    serde_json::json!({ "status": { "loadBalancer": { "ingress": entries } } })
}

#[async_trait]
impl StatusSink for KubeStatusSink {
    async fn write_addresses(
        &self,
        workload: &WorkloadRef,
        addresses: &[PoolAddress],
    ) -> Result<(), KrillError> {
        let patch = Patch::Merge(status_patch(addresses));
        let params = PatchParams::default();
        // Service and Ingress share the load-balancer status shape, so the
        // patch body is kind-independent; only the API group differs.
        let result = match workload.kind {
            "Service" => {
                let api: Api<k8s_openapi::api::core::v1::Service> =
                    Api::namespaced(self.client.clone(), &workload.namespace);
                api.patch_status(&workload.name, &params, &patch)
                    .await
                    .map(|_| ())
            }
            "Ingress" => {
                let api: Api<k8s_openapi::api::networking::v1::Ingress> =
                    Api::namespaced(self.client.clone(), &workload.namespace);
                api.patch_status(&workload.name, &params, &patch)
                    .await
                    .map(|_| ())
            }
            other => {
                return Err(KrillError::StatusWrite(format!(
                    "unsupported workload kind {:?}",
                    other
                )))
            }
        };
        result.map_err(|e| {
            KrillError::StatusWrite(format!(
                "failed to update the status of {} {}: {}",
                workload.kind.to_lowercase(),
                workload,
                e
            ))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

/// Publishes operator-visible events against a workload. Event delivery is
/// best-effort; failures never fail a reconcile pass.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(
        &self,
        workload: &WorkloadRef,
        severity: EventSeverity,
        reason: &str,
        message: &str,
    );
}

/// Event sink backed by the Kubernetes events API.
#[derive(Clone)]
pub struct KubeEventSink {
    client: Client,
    reporter: Reporter,
}

impl KubeEventSink {
    pub fn new(client: Client, controller_name: &str) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: controller_name.to_string(),
                instance: None,
            },
        }
    }
}

fn object_reference(workload: &WorkloadRef) -> ObjectReference {
    ObjectReference {
        api_version: Some(workload.api_version.to_string()),
        kind: Some(workload.kind.to_string()),
        namespace: Some(workload.namespace.clone()),
        name: Some(workload.name.clone()),
        ..Default::default()
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(
        &self,
        workload: &WorkloadRef,
        severity: EventSeverity,
        reason: &str,
        message: &str,
    ) {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            object_reference(workload),
        );
        let type_ = match severity {
            EventSeverity::Normal => EventType::Normal,
            EventSeverity::Warning => EventType::Warning,
        };
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!(workload = %workload, reason, error = %e, "failed to publish event");
        }
    }
}
