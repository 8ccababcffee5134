//! Watch dispatch: turns a list+watch stream into work-queue keys.
//!
//! The reflector keeps the cache that handlers read; the dispatcher only
//! ever enqueues keys (plus a snapshot for deletions). Filtering happens
//! here so unmanaged objects never cost a queue slot.

use std::fmt::Debug;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::TryStreamExt;
use kube::api::Api;
use kube::runtime::reflector::{self, store, Lookup};
use kube::runtime::watcher::{self, Event};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::{WorkItem, WorkQueue};

fn object_key<K: ResourceExt>(obj: &K) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

/// Runs the list+watch loop for one workload kind until cancellation.
///
/// Applied objects enqueue their key; deleted objects enqueue a tombstone
/// carrying the last observed snapshot, since the cache entry is gone by
/// the time a worker picks the key up. A watch restart re-enqueues every
/// managed object so state converges after a relist.
pub async fn run_watch<K>(
    api: Api<K>,
    writer: store::Writer<K>,
    queue: Arc<WorkQueue<K>>,
    is_managed: fn(&K) -> bool,
    shutdown: CancellationToken,
) -> Result<()>
where
    K: Resource<DynamicType = ()>
        + Lookup<DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static,
{
    let dyntype = ();
    let kind = <K as Resource>::kind(&dyntype);
    let stream = reflector::reflector(writer, watcher::watcher(api, watcher::Config::default()));
    futures::pin_mut!(stream);
    info!(kind = %kind, "watch started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(kind = %kind, "watch stopping");
                return Ok(());
            }
            ev = stream.try_next() => match ev.with_context(|| format!("{} watch failed", kind))? {
                Some(Event::Applied(obj)) => {
                    if is_managed(&obj) {
                        queue.add(WorkItem::new(object_key(&obj)));
                    }
                }
                Some(Event::Deleted(obj)) => {
                    if is_managed(&obj) {
                        let key = object_key(&obj);
                        queue.add(WorkItem::tombstone(key, Arc::new(obj)));
                    }
                }
                Some(Event::Restarted(list)) => {
                    debug!(kind = %kind, count = list.len(), "watch restarted");
                    for obj in list {
                        if is_managed(&obj) {
                            queue.add(WorkItem::new(object_key(&obj)));
                        }
                    }
                }
                None => {
                    warn!(kind = %kind, "watch stream ended");
                    return Ok(());
                }
            }
        }
    }
}
