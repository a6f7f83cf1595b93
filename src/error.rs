use thiserror::Error;

use crate::{
    admin::{AdminError, RegionId},
    compactor::CompactorState,
};

/// Table or region metadata was unavailable while resolving topology.
///
/// Unassigned regions and retryable admin errors are retried by the resolver
/// before they surface; a missing table is reported at once.
#[derive(Debug, Clone, Error)]
pub enum TopologyError {
    /// The table does not exist.
    #[error("table {0} not found")]
    TableNotFound(String),
    /// A region has no host (it is in transition).
    #[error("region {0} is unassigned")]
    RegionUnassigned(RegionId),
    /// The admin client failed.
    #[error("topology lookup failed: {0}")]
    Admin(#[from] AdminError),
}

/// Errors raised synchronously by [`MajorCompactor`](crate::MajorCompactor).
///
/// Per-pair failures never surface here; they are collected in the
/// [`CompactionReport`](crate::CompactionReport).
#[derive(Debug, Error)]
pub enum CompactorError {
    /// `initialize_work_queues` was called twice without a `shutdown` in between.
    #[error("work queues already initialized")]
    AlreadyInitialized,
    /// `compact_all_regions` was called before `initialize_work_queues`.
    #[error("work queues not initialized")]
    NotInitialized,
    /// The operation is not valid in the current lifecycle state.
    #[error("cannot {operation} while {state:?}")]
    InvalidState {
        /// Attempted operation.
        operation: &'static str,
        /// State the driver was in.
        state: CompactorState,
    },
    /// Topology resolution failed after its retries.
    #[error(transparent)]
    Topology(#[from] TopologyError),
}
