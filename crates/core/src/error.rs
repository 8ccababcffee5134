use thiserror::Error;

/// Error taxonomy for the reconcile paths. Retryability drives work-queue
/// behavior: validation failures are dropped without retry, remote and
/// status-write failures re-enter the queue with backoff.
#[derive(Debug, Error)]
pub enum KrillError {
    /// Malformed or contradictory annotation/port data. Retrying an
    /// unchanged input cannot succeed; the next edit re-enqueues the key.
    #[error("validation: {0}")]
    Validation(String),

    /// The remote pool does not exist. An expected branch of the reconcile
    /// state machine, never a failure in itself.
    #[error("not found: {0}")]
    NotFound(String),

    /// Network error, timeout or 5xx from the control plane.
    #[error("remote: {0}")]
    Remote(String),

    /// The pool mutation succeeded but the workload status write-back
    /// failed; only the write-back needs repeating.
    #[error("status write: {0}")]
    StatusWrite(String),
}

impl KrillError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Remote(_) | Self::StatusWrite(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type KrillResult<T> = Result<T, KrillError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_the_taxonomy() {
        assert!(!KrillError::Validation("x".into()).is_retryable());
        assert!(!KrillError::NotFound("x".into()).is_retryable());
        assert!(KrillError::Remote("x".into()).is_retryable());
        assert!(KrillError::StatusWrite("x".into()).is_retryable());
    }
}
