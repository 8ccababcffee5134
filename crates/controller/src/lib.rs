//! Krill controllers: the deduplicating work queue, watch dispatch and the
//! per-kind reconcile drivers for Service and Ingress workloads.
//!
//! One controller per workload kind, each with its own queue and worker
//! pool. Workers map the error taxonomy onto queue behavior: retryable
//! failures re-enter with backoff, validation failures are dropped until
//! the workload is edited again.

#![forbid(unsafe_code)]

pub mod ingress;
pub mod queue;
pub mod service;
pub mod traits;
pub mod watch;

pub use ingress::IngressController;
pub use queue::{RetryPolicy, WorkItem, WorkQueue};
pub use service::ServiceController;
pub use traits::{
    EventSeverity, EventSink, KubeEventSink, KubeStatusSink, StatusSink, WorkloadCache,
};
pub use watch::run_watch;

use std::sync::Arc;
use std::time::Instant;

use krill_core::KrillError;
use metrics::histogram;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Event reason attached when annotations fail validation.
pub const REASON_INVALID_ANNOTATIONS: &str = "InvalidAnnotations";
/// Event reason attached when the creation strategy forbids provisioning.
pub const REASON_POOL_CREATION_FORBIDDEN: &str = "PoolCreationForbidden";
/// Event reason attached after a successful pool mutation.
pub const REASON_POOL_PROVISIONED: &str = "PoolProvisioned";

/// Splits a `namespace/name` queue key. Keys are built by the watch
/// dispatcher, so a missing separator only happens for cluster-scoped
/// objects, which krill does not watch.
pub fn split_key(key: &str) -> (&str, &str) {
    match key.split_once('/') {
        Some((namespace, name)) => (namespace, name),
        None => ("", key),
    }
}

/// One reconcile pass over a popped work item.
#[async_trait::async_trait]
pub trait Handler<T>: Send + Sync {
    /// Workload kind handled, used in logs.
    fn kind(&self) -> &'static str;

    async fn handle(&self, item: &WorkItem<T>) -> Result<(), KrillError>;
}

/// Drives a worker pool over a work queue until shutdown.
pub struct Controller<T> {
    queue: Arc<WorkQueue<T>>,
    handler: Arc<dyn Handler<T>>,
}

impl<T: Send + Sync + 'static> Controller<T> {
    pub fn new(queue: Arc<WorkQueue<T>>, handler: Arc<dyn Handler<T>>) -> Self {
        Self { queue, handler }
    }

    pub fn queue(&self) -> Arc<WorkQueue<T>> {
        Arc::clone(&self.queue)
    }

    /// Runs `workers` concurrent workers. Returns once the shutdown token
    /// fires and every worker has drained: pending items are still handed
    /// out after cancellation so no accepted change is silently lost.
    pub async fn run(&self, workers: usize, shutdown: CancellationToken) {
        let kind = self.handler.kind();
        info!(kind, workers, "controller started");

        {
            let queue = Arc::clone(&self.queue);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                queue.shut_down();
            });
        }

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let queue = Arc::clone(&self.queue);
            let handler = Arc::clone(&self.handler);
            handles.push(tokio::spawn(async move {
                worker_loop(id, queue, handler).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        info!(kind, "controller stopped");
    }
}

async fn worker_loop<T: Send + Sync + 'static>(
    id: usize,
    queue: Arc<WorkQueue<T>>,
    handler: Arc<dyn Handler<T>>,
) {
    let kind = handler.kind();
    while let Some(item) = queue.pop().await {
        let key = item.key.clone();
        let start = Instant::now();
        match handler.handle(&item).await {
            Ok(()) => {
                queue.forget(&key);
            }
            Err(e) if e.is_retryable() => {
                warn!(kind, worker = id, key = %key, error = %e, "reconcile failed; requeueing");
                if !queue.retry(item.clone()) {
                    error!(kind, key = %key, error = %e, "retry budget exhausted; dropping item");
                    queue.forget(&key);
                }
            }
            Err(e) => {
                // Retrying the same input cannot succeed; the next edit of
                // the workload re-enqueues the key.
                warn!(kind, worker = id, key = %key, error = %e, "dropping item after non-retryable failure");
                queue.forget(&key);
            }
        }
        histogram!("reconcile_latency_ms", start.elapsed().as_millis() as f64);
        queue.done(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn split_key_handles_both_shapes() {
        assert_eq!(split_key("foo/bar"), ("foo", "bar"));
        assert_eq!(split_key("bar"), ("", "bar"));
    }

    struct ScriptedHandler {
        calls: AtomicUsize,
        // One error per call, in order; Ok once exhausted.
        script: Mutex<Vec<KrillError>>,
    }

    impl ScriptedHandler {
        fn new(script: Vec<KrillError>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                script: Mutex::new(script),
            }
        }
    }

    #[async_trait::async_trait]
    impl Handler<()> for ScriptedHandler {
        fn kind(&self) -> &'static str {
            "Test"
        }

        async fn handle(&self, _item: &WorkItem<()>) -> Result<(), KrillError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Ok(())
            } else {
                Err(script.remove(0))
            }
        }
    }

    fn queue() -> Arc<WorkQueue<()>> {
        Arc::new(WorkQueue::new(RetryPolicy {
            base: Duration::from_millis(1),
            max: Duration::from_millis(5),
            max_retries: 5,
        }))
    }

    #[tokio::test]
    async fn retryable_failures_are_retried_until_success() {
        let q = queue();
        let handler = Arc::new(ScriptedHandler::new(vec![
            KrillError::Remote("boom".into()),
            KrillError::Remote("boom".into()),
        ]));
        let controller = Controller::new(Arc::clone(&q), handler.clone() as Arc<dyn Handler<()>>);
        q.add(WorkItem::new("foo/bar"));

        let token = CancellationToken::new();
        let run = {
            let token = token.clone();
            tokio::spawn(async move { controller.run(2, token).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        run.await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn validation_failures_are_not_retried() {
        let q = queue();
        let handler = Arc::new(ScriptedHandler::new(vec![KrillError::Validation(
            "bad".into(),
        )]));
        let controller = Controller::new(Arc::clone(&q), handler.clone() as Arc<dyn Handler<()>>);
        q.add(WorkItem::new("foo/bar"));

        let token = CancellationToken::new();
        let run = {
            let token = token.clone();
            tokio::spawn(async move { controller.run(1, token).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        run.await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pending_items_are_drained_on_shutdown() {
        let q = queue();
        let handler = Arc::new(ScriptedHandler::new(vec![]));
        let controller = Controller::new(Arc::clone(&q), handler.clone() as Arc<dyn Handler<()>>);
        q.add(WorkItem::new("foo/a"));
        q.add(WorkItem::new("foo/b"));
        q.add(WorkItem::new("foo/c"));

        let token = CancellationToken::new();
        token.cancel();
        controller.run(1, token).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(q.is_empty());
    }
}
