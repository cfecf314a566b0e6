use crate::depot::{Generation, Status, TabletId};

/// Client-visible failure of a put or read query.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DepotError {
    /// Rejected before any work was done.
    #[error("malformed request: {0}")]
    Malformed(String),
    /// A dependency (block state, concurrent writer) lost a race.
    #[error("race: {0}")]
    Race(String),
    #[error("block state of tablet {tablet_id} generation {generation} still unknown")]
    BlockCheckUnknown {
        tablet_id: TabletId,
        generation: Generation,
    },
    #[error("coordinator disconnected")]
    CoordinatorDisconnected,
    #[error("key is behind the garbage-collection barrier")]
    BarrierViolation,
    #[error("coordinator generation changed from {expected} to {actual}")]
    GenerationMismatch {
        expected: Generation,
        actual: Generation,
    },
    #[error("no data: {0}")]
    NoData(String),
    #[error("store returned {status}: {error}")]
    Store { status: Status, error: String },
    #[error("commit failed with {0}: {1}")]
    Commit(Status, String),
    #[error("resolve failed with {status}: {error}")]
    Resolve { status: Status, error: String },
    #[error("request expired before it could be processed")]
    Expired,
    #[error("pending queue is full")]
    QueueFull,
    #[error("cancelled")]
    Cancelled,
}

impl DepotError {
    /// Only a lost coordinator session is worth retrying as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DepotError::CoordinatorDisconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_disconnect_is_retryable() {
        assert!(DepotError::CoordinatorDisconnected.is_retryable());
        assert!(!DepotError::Race("blocked".into()).is_retryable());
        assert!(!DepotError::Expired.is_retryable());
        assert_eq!(
            DepotError::Store {
                status: Status::NoData,
                error: "gone".into()
            }
            .to_string(),
            "store returned NODATA: gone"
        );
    }
}
