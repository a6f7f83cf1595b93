//! Outcome of a compaction run.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::{
    admin::{RegionId, ServerName},
    metrics::DriverMetricsSnapshot,
    task::ExclusionReason,
};

/// Final status of one (region, family) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PairStatus {
    /// Observed at or below the fragment threshold.
    Converged,
    /// The compaction request failed permanently or ran out of retries.
    Failed,
    /// Still above the threshold when the run timed out.
    TimedOut,
    /// Planned but not dispatched (dry run).
    Skipped,
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    /// Every planned pair converged (or the run had nothing to do).
    Completed,
    /// Some pairs converged, others failed or timed out.
    Partial,
    /// No planned pair converged.
    Failed,
}

impl RunStatus {
    /// Derive the run status from per-pair outcomes.
    pub fn from_pairs(pairs: &[PairReport]) -> Self {
        let settled_ok = |p: &&PairReport| {
            matches!(p.status, PairStatus::Converged | PairStatus::Skipped)
        };
        let ok = pairs.iter().filter(settled_ok).count();
        if ok == pairs.len() {
            RunStatus::Completed
        } else if ok == 0 {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        }
    }
}

/// Outcome of one planned pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairReport {
    /// Region compacted.
    pub region: RegionId,
    /// Family compacted.
    pub family: String,
    /// Server that handled the last request.
    pub server: ServerName,
    /// Final status.
    pub status: PairStatus,
    /// Request attempts made.
    pub attempts: u32,
    /// Fragments when the run was planned.
    pub fragments_before: usize,
    /// Last observed fragment count, if any poll succeeded.
    pub fragments_after: Option<usize>,
    /// Last request error for failed pairs.
    pub error: Option<String>,
}

/// A pair left out by the exclusion policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExcludedPair {
    /// Region skipped.
    pub region: RegionId,
    /// Family skipped.
    pub family: String,
    /// Fragments at planning time.
    pub fragments: usize,
    /// Why it was skipped.
    pub reason: ExclusionReason,
}

/// Everything a caller needs to judge a run.
#[derive(Debug, Clone, Serialize)]
pub struct CompactionReport {
    /// Table compacted.
    pub table: String,
    /// Overall status.
    pub status: RunStatus,
    /// Whether the run hit its wall-clock budget.
    pub timed_out: bool,
    /// Whether the run only planned.
    pub dry_run: bool,
    /// Planned pairs, in key order.
    pub pairs: Vec<PairReport>,
    /// Pairs excluded before planning.
    pub excluded: Vec<ExcludedPair>,
    /// Highest simultaneous requests seen per server.
    pub peak_in_flight: BTreeMap<ServerName, usize>,
    /// Driver counters for the run.
    pub metrics: DriverMetricsSnapshot,
    /// Wall-clock duration of `compact_all_regions`.
    pub elapsed_ms: u64,
}

impl CompactionReport {
    /// Number of planned pairs with `status`.
    pub fn count(&self, status: PairStatus) -> usize {
        self.pairs.iter().filter(|p| p.status == status).count()
    }

    /// Pairs that did not converge.
    pub fn unconverged(&self) -> impl Iterator<Item = &PairReport> {
        self.pairs
            .iter()
            .filter(|p| matches!(p.status, PairStatus::Failed | PairStatus::TimedOut))
    }

    /// Process exit code: 0 when completed, 2 when partial, 1 when failed.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Completed => 0,
            RunStatus::Failed => 1,
            RunStatus::Partial => 2,
        }
    }
}
