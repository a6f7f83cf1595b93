//! Compaction tasks and the exclusion policy that decides which pairs need one.

use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use ulid::Ulid;

use crate::admin::{RegionId, ServerName};

/// Milliseconds since the Unix epoch according to the local clock.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// A (region, family) pair: the unit of compaction work.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PairKey {
    /// Region being compacted.
    pub region: RegionId,
    /// Column family within the region.
    pub family: String,
}

impl PairKey {
    /// Build a pair key.
    pub fn new(region: impl Into<RegionId>, family: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            family: family.into(),
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.region, self.family)
    }
}

/// One queued major-compaction request.
#[derive(Debug, Clone)]
pub struct CompactionTask {
    /// Unique id, stable across retries.
    pub id: Ulid,
    /// Pair to compact.
    pub pair: PairKey,
    /// Server whose queue currently owns the task.
    pub server: ServerName,
    /// Wall-clock submission time in milliseconds.
    pub submitted_ms: u64,
    /// Number of failed attempts so far.
    pub attempts: u32,
    /// Fragment count observed when the run was planned.
    pub fragments_before: usize,
}

impl CompactionTask {
    pub(crate) fn new(pair: PairKey, server: ServerName, fragments_before: usize) -> Self {
        Self {
            id: Ulid::new(),
            pair,
            server,
            submitted_ms: unix_millis(),
            attempts: 0,
            fragments_before,
        }
    }

    /// Task to re-enqueue after a transient failure, possibly on another server.
    pub(crate) fn retry_on(mut self, server: ServerName) -> Self {
        self.attempts += 1;
        self.server = server;
        self.submitted_ms = unix_millis();
        self
    }
}

/// Why a pair was left out of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExclusionReason {
    /// Fragment count already at or below the threshold.
    AtThreshold,
    /// The server reports a major compaction at or after the cutoff.
    CompactedSinceCutoff,
}

/// Prunes pairs that do not need a major compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExclusionPolicy {
    /// Pairs compacted at or after this instant (ms since epoch) are skipped.
    pub cutoff_ms: Option<u64>,
    /// Pairs with at most this many fragments are skipped.
    pub max_fragments: usize,
}

impl ExclusionPolicy {
    /// Decide whether a pair is excluded, given what the server reports for it.
    pub fn exclusion(
        &self,
        fragments: usize,
        last_major_ms: Option<u64>,
    ) -> Option<ExclusionReason> {
        if fragments <= self.max_fragments {
            return Some(ExclusionReason::AtThreshold);
        }
        match (self.cutoff_ms, last_major_ms) {
            (Some(cutoff), Some(last)) if last >= cutoff => {
                Some(ExclusionReason::CompactedSinceCutoff)
            }
            _ => None,
        }
    }

    /// Whether an observed fragment count satisfies the target.
    pub fn is_converged(&self, fragments: usize) -> bool {
        fragments <= self.max_fragments
    }
}
