//! Pool reconciliation: fetch the current remote state, decide, act.
//!
//! A pass is keyed on (remote pool exists, creation strategy, prior status
//! present). "Not found" from the control plane is an expected branch, not
//! a failure. There is no cross-call transaction: a crash between a
//! successful mutation and the status write-back is repaired by the
//! structural diff on the next pass.

use krill_core::{
    KrillError, Pool, PoolAddress, PoolCreationStrategy, PoolManager, PoolSpec, ReconcileOutcome,
    WorkloadRef,
};
use metrics::counter;
use tracing::{debug, info, warn};

/// What a reconcile pass decided and what to write back.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileReport {
    pub outcome: ReconcileOutcome,
    /// The remote pool's addresses after the pass, to be folded into the
    /// workload status. Carried on the Skipped branch too, so a status
    /// write-back that failed on an earlier pass is repaired by the next
    /// one. `None` only when no pool exists.
    pub addresses: Option<Vec<PoolAddress>>,
}

impl ReconcileReport {
    fn without_pool(outcome: ReconcileOutcome) -> Self {
        Self {
            outcome,
            addresses: None,
        }
    }

    fn with_pool(outcome: ReconcileOutcome, pool: Pool) -> Self {
        Self {
            outcome,
            addresses: Some(pool.addresses),
        }
    }
}

/// Drives a pool towards its desired spec through a [`PoolManager`].
pub struct PoolReconciler<'a, M: PoolManager + ?Sized> {
    manager: &'a M,
}

impl<'a, M: PoolManager + ?Sized> PoolReconciler<'a, M> {
    pub fn new(manager: &'a M) -> Self {
        Self { manager }
    }

    /// Runs one reconcile pass for `workload`. `prior_status_present` is the
    /// "was a pool previously provisioned" signal consulted by the Once
    /// strategy.
    pub async fn reconcile(
        &self,
        workload: &WorkloadRef,
        strategy: PoolCreationStrategy,
        prior_status_present: bool,
        desired: &PoolSpec,
    ) -> Result<ReconcileReport, KrillError> {
        counter!("reconcile_attempts", 1u64);
        match self.manager.get_pool_by_name(&desired.name).await {
            Ok(current) => {
                if current.spec == *desired {
                    debug!(pool = %desired.name, workload = %workload, "pool is in sync; nothing to do");
                    return Ok(ReconcileReport::with_pool(ReconcileOutcome::Skipped, current));
                }
                let pool = self.manager.update_pool(&desired.name, desired).await?;
                info!(pool = %desired.name, workload = %workload, "pool updated");
                Ok(ReconcileReport::with_pool(ReconcileOutcome::Updated, pool))
            }
            Err(e) if e.is_not_found() => {
                self.create_missing(workload, strategy, prior_status_present, desired)
                    .await
            }
            Err(e) => {
                counter!("reconcile_err", 1u64);
                Err(e)
            }
        }
    }

    async fn create_missing(
        &self,
        workload: &WorkloadRef,
        strategy: PoolCreationStrategy,
        prior_status_present: bool,
        desired: &PoolSpec,
    ) -> Result<ReconcileReport, KrillError> {
        let kind = workload.kind.to_lowercase();
        match strategy {
            PoolCreationStrategy::Never => {
                Ok(ReconcileReport::without_pool(ReconcileOutcome::Rejected(format!(
                    "pool {:?} targeted by {} {} does not exist, but the pool creation strategy is {}",
                    desired.name, kind, workload, strategy
                ))))
            }
            PoolCreationStrategy::Once if prior_status_present => {
                Ok(ReconcileReport::without_pool(ReconcileOutcome::Rejected(format!(
                    "pool {:?} targeted by {} {} has probably been manually deleted, and the pool creation strategy is {}",
                    desired.name, kind, workload, strategy
                ))))
            }
            PoolCreationStrategy::IfNotPresent | PoolCreationStrategy::Once => {
                let pool = self.manager.create_pool(desired).await.map_err(|e| {
                    counter!("reconcile_err", 1u64);
                    e
                })?;
                info!(pool = %desired.name, workload = %workload, "pool created");
                Ok(ReconcileReport::with_pool(ReconcileOutcome::Created, pool))
            }
        }
    }

    /// Deletion path. The manager contract carries no delete operation, so
    /// cleanup is limited to reporting any pool left behind; dangling pools
    /// are an operator concern.
    pub async fn release(&self, workload: &WorkloadRef, pool_name: &str) -> Result<(), KrillError> {
        match self.manager.get_pool_by_name(pool_name).await {
            Ok(_) => {
                warn!(
                    pool = %pool_name,
                    workload = %workload,
                    "workload deleted; pool is left in place (the control plane contract has no delete operation)"
                );
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
