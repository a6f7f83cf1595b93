#![deny(missing_docs)]
//! Client-side driver for major compaction of region-partitioned tables.
//!
//! [`MajorCompactor`] asks every server hosting a table's regions to
//! major-compact each (region, family) pair, caps the number of simultaneous
//! requests per server, and then polls fragment counts until every pair is
//! down to its threshold or the run times out. The merge itself always runs on
//! the storage servers; the driver is purely a control-plane coordinator.
//!
//! The cluster is reached through the [`AdminClient`] trait. [`mem`] ships an
//! in-memory implementation that hosts tables, accumulates fragments on flush
//! and merges them on a discharger interval.

mod observability;

/// Admin contract consumed by the driver.
pub mod admin;
/// Run configuration.
pub mod config;
/// Error types raised by the driver.
pub mod error;
/// Driver counters.
pub mod metrics;
/// In-memory cluster implementing the admin contract.
pub mod mem;
/// Run outcome types.
pub mod report;
/// Compaction tasks and exclusion policy.
pub mod task;
/// Topology resolution.
pub mod topology;

mod compactor;
mod handle;
mod monitor;
mod queue;
mod requester;

pub use crate::{
    admin::{AdminClient, AdminError, RegionId, RegionLocation, ServerName},
    compactor::{CompactorState, MajorCompactor},
    config::CompactorConfig,
    error::{CompactorError, TopologyError},
    report::{CompactionReport, PairReport, PairStatus, RunStatus},
    requester::CompactionRequestFailed,
    task::{ExclusionPolicy, PairKey},
};
