//! Run configuration for [`MajorCompactor`](crate::MajorCompactor).

use std::{collections::BTreeSet, time::Duration};

use serde::{Deserialize, Serialize};

/// Default interval between fragment-count polls; matches a typical
/// discharger interval on the storage servers.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Options for a single compaction run. Immutable once handed to the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactorConfig {
    pub(crate) table: String,
    pub(crate) families: BTreeSet<String>,
    pub(crate) concurrency: usize,
    pub(crate) cutoff_ms: Option<u64>,
    pub(crate) fragment_threshold: usize,
    #[serde(with = "duration_ms")]
    pub(crate) poll_interval: Duration,
    #[serde(with = "duration_ms")]
    pub(crate) run_timeout: Duration,
    pub(crate) max_request_retries: u32,
    #[serde(with = "duration_ms")]
    pub(crate) retry_backoff: Duration,
    pub(crate) topology_retries: u32,
    #[serde(with = "duration_ms")]
    pub(crate) topology_retry_delay: Duration,
    #[serde(with = "duration_ms")]
    pub(crate) shutdown_grace: Duration,
    pub(crate) dry_run: bool,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        CompactorConfig {
            table: String::new(),
            families: BTreeSet::new(),
            concurrency: 1,
            cutoff_ms: None,
            fragment_threshold: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            run_timeout: Duration::from_secs(600),
            max_request_retries: 3,
            retry_backoff: Duration::from_millis(100),
            topology_retries: 3,
            topology_retry_delay: Duration::from_millis(200),
            shutdown_grace: Duration::from_secs(30),
            dry_run: false,
        }
    }
}

impl CompactorConfig {
    /// Compact `families` of `table` with default tuning.
    pub fn new<I, S>(table: impl Into<String>, families: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CompactorConfig::default().with_target(table, families)
    }

    /// Point the run at `families` of `table`, keeping every other option.
    pub fn with_target<I, S>(self, table: impl Into<String>, families: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CompactorConfig {
            table: table.into(),
            families: families.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    /// Maximum in-flight compaction requests per server. Clamped to at least one.
    pub fn concurrency(self, concurrency: usize) -> Self {
        CompactorConfig {
            concurrency: concurrency.max(1),
            ..self
        }
    }

    /// Skip pairs the server reports as major-compacted at or after `cutoff_ms`.
    pub fn cutoff_ms(self, cutoff_ms: u64) -> Self {
        CompactorConfig {
            cutoff_ms: Some(cutoff_ms),
            ..self
        }
    }

    /// A pair is done once its fragment count is at or below `threshold`.
    pub fn fragment_threshold(self, fragment_threshold: usize) -> Self {
        CompactorConfig {
            fragment_threshold,
            ..self
        }
    }

    /// Interval between fragment-count polls.
    pub fn poll_interval(self, poll_interval: Duration) -> Self {
        CompactorConfig {
            poll_interval,
            ..self
        }
    }

    /// Wall-clock budget for `compact_all_regions`.
    pub fn run_timeout(self, run_timeout: Duration) -> Self {
        CompactorConfig {
            run_timeout,
            ..self
        }
    }

    /// Number of times a failed request is re-enqueued before the pair fails.
    pub fn max_request_retries(self, max_request_retries: u32) -> Self {
        CompactorConfig {
            max_request_retries,
            ..self
        }
    }

    /// Delay before a failed request is re-enqueued.
    pub fn retry_backoff(self, retry_backoff: Duration) -> Self {
        CompactorConfig {
            retry_backoff,
            ..self
        }
    }

    /// Retries and delay used while the table's topology is unavailable.
    pub fn topology_retries(self, topology_retries: u32, delay: Duration) -> Self {
        CompactorConfig {
            topology_retries,
            topology_retry_delay: delay,
            ..self
        }
    }

    /// How long `shutdown` waits for in-flight requests before aborting workers.
    pub fn shutdown_grace(self, shutdown_grace: Duration) -> Self {
        CompactorConfig {
            shutdown_grace,
            ..self
        }
    }

    /// Plan the run without dispatching any request.
    pub fn dry_run(self, dry_run: bool) -> Self {
        CompactorConfig { dry_run, ..self }
    }

    /// Table being compacted.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Families being compacted.
    pub fn families(&self) -> &BTreeSet<String> {
        &self.families
    }

    /// Per-server concurrency limit.
    pub fn concurrency_limit(&self) -> usize {
        self.concurrency.max(1)
    }

    /// Fragment threshold below which a pair counts as compacted.
    pub fn threshold(&self) -> usize {
        self.fragment_threshold
    }

    /// Whether the run only plans.
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
