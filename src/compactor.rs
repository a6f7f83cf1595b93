//! Major-compaction driver: lifecycle and orchestration.
//!
//! ```text
//! Created ──initialize_work_queues──▶ Initialized ──compact_all_regions──▶ Running
//!    ▲                                                                       │
//!    │                                                          ┌────────────┴───────────┐
//!    │                                                          ▼                        ▼
//! Shutdown ◀────────────────────── shutdown (from any state) ─ Completed             Failed
//! ```
//!
//! The driver resolves the table's topology, prunes pairs the exclusion policy
//! rules out, and builds one queue per server. Running the driver spawns the
//! per-server worker pools and blocks on the completion monitor; the report
//! collects every per-pair outcome. Only misuse is raised as an error.

use std::sync::Arc;

use serde::Serialize;
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    admin::AdminClient,
    config::CompactorConfig,
    error::CompactorError,
    handle::WorkerHandle,
    metrics::{DriverMetrics, DriverMetricsSnapshot},
    monitor::CompletionMonitor,
    observability::{log_debug, log_error, log_info, run_span},
    queue::{DispatchGuard, WorkQueues, WorkerContext},
    requester::CompactionRequester,
    report::{CompactionReport, ExcludedPair, PairReport, PairStatus, RunStatus},
    task::{CompactionTask, ExclusionPolicy, PairKey},
    topology::{TopologyResolver, TopologySnapshot},
};

/// Lifecycle state of a [`MajorCompactor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompactorState {
    /// Constructed; no resources held.
    Created,
    /// Topology resolved and queues built.
    Initialized,
    /// Workers dispatching, monitor polling.
    Running,
    /// The run finished with at least one converged pair (or nothing to do).
    Completed,
    /// The run finished without any converged pair.
    Failed,
    /// Resources released.
    Shutdown,
}

/// Resources held between `initialize_work_queues` and `shutdown`.
struct Run {
    queues: Arc<WorkQueues>,
    tasks: Vec<CompactionTask>,
    excluded: Vec<ExcludedPair>,
    workers: Option<WorkerHandle>,
    cancel: CancellationToken,
    metrics: Arc<DriverMetrics>,
}

/// Triggers and verifies major compaction of every region of one table.
///
/// # Example
/// ```no_run
/// # use std::sync::Arc;
/// # use major_compactor::{CompactorConfig, MajorCompactor, mem::{ClusterOptions, InMemoryCluster}};
/// # async fn run() -> Result<(), major_compactor::CompactorError> {
/// let cluster = Arc::new(InMemoryCluster::new(ClusterOptions::with_servers(3)));
/// let mut compactor = MajorCompactor::new(cluster, CompactorConfig::new("t", ["a"]));
/// compactor.initialize_work_queues().await?;
/// let report = compactor.compact_all_regions().await?;
/// compactor.shutdown().await;
/// std::process::exit(report.exit_code());
/// # }
/// ```
pub struct MajorCompactor {
    admin: Arc<dyn AdminClient>,
    config: CompactorConfig,
    topology: TopologyResolver,
    state: CompactorState,
    run: Option<Run>,
}

impl MajorCompactor {
    /// Build a driver; no cluster call is made until `initialize_work_queues`.
    pub fn new(admin: Arc<dyn AdminClient>, config: CompactorConfig) -> Self {
        let topology = TopologyResolver::new(
            Arc::clone(&admin),
            config.topology_retries,
            config.topology_retry_delay,
        );
        Self {
            admin,
            config,
            topology,
            state: CompactorState::Created,
            run: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CompactorState {
        self.state
    }

    /// Options this driver runs with.
    pub fn config(&self) -> &CompactorConfig {
        &self.config
    }

    /// Exclusion policy derived from the configuration.
    pub fn exclusion_policy(&self) -> ExclusionPolicy {
        ExclusionPolicy {
            cutoff_ms: self.config.cutoff_ms,
            max_fragments: self.config.fragment_threshold,
        }
    }

    /// Tasks planned by the last `initialize_work_queues`, in key order.
    pub fn planned_tasks(&self) -> &[CompactionTask] {
        self.run.as_ref().map(|r| r.tasks.as_slice()).unwrap_or(&[])
    }

    /// Pairs excluded by the last `initialize_work_queues`.
    pub fn excluded(&self) -> &[ExcludedPair] {
        self.run.as_ref().map(|r| r.excluded.as_slice()).unwrap_or(&[])
    }

    /// Counters of the current run.
    pub fn metrics(&self) -> DriverMetricsSnapshot {
        self.run
            .as_ref()
            .map(|r| r.metrics.snapshot())
            .unwrap_or_default()
    }

    /// Resolve topology, apply the exclusion policy and build per-server queues.
    pub async fn initialize_work_queues(&mut self) -> Result<(), CompactorError> {
        match self.state {
            CompactorState::Created | CompactorState::Shutdown => {}
            _ => return Err(CompactorError::AlreadyInitialized),
        }
        let snapshot = self
            .topology
            .resolve(&self.config.table, &self.config.families)
            .instrument(run_span(&self.config.table, "plan"))
            .await?;
        let (tasks, excluded) = plan(&snapshot, &self.exclusion_policy());
        let queues = WorkQueues::build(
            snapshot.servers(),
            tasks.clone(),
            self.config.concurrency_limit(),
        );
        log_info!(
            component = "compactor",
            event = "queues_initialized",
            table = %self.config.table,
            regions = snapshot.len(),
            servers = queues.servers().count(),
            planned = tasks.len(),
            queued = queues.queued(),
            excluded = excluded.len(),
            concurrency = self.config.concurrency_limit(),
        );
        self.run = Some(Run {
            queues: Arc::new(queues),
            tasks,
            excluded,
            workers: None,
            cancel: CancellationToken::new(),
            metrics: Arc::new(DriverMetrics::new()),
        });
        self.state = CompactorState::Initialized;
        Ok(())
    }

    /// Dispatch every planned pair and block until all converge, fail, or the
    /// run times out.
    pub async fn compact_all_regions(&mut self) -> Result<CompactionReport, CompactorError> {
        match self.state {
            CompactorState::Initialized => {}
            CompactorState::Created | CompactorState::Shutdown => {
                return Err(CompactorError::NotInitialized)
            }
            state => {
                return Err(CompactorError::InvalidState {
                    operation: "compact all regions",
                    state,
                })
            }
        }
        let policy = self.exclusion_policy();
        let run = self.run.as_mut().ok_or(CompactorError::NotInitialized)?;
        self.state = CompactorState::Running;
        let started = Instant::now();

        let plan_only = self.config.dry_run || run.tasks.is_empty();
        let (pairs, timed_out): (Vec<PairReport>, bool) = if plan_only {
            (run.tasks.iter().map(skipped).collect(), false)
        } else {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let ctx = Arc::new(WorkerContext {
                requester: CompactionRequester::new(
                    Arc::clone(&self.admin),
                    self.topology.clone(),
                    self.config.max_request_retries,
                    Arc::clone(&run.metrics),
                ),
                guard: DispatchGuard::default(),
                events: events_tx,
                retry_backoff: self.config.retry_backoff,
            });
            let workers = run.queues.spawn_workers(ctx, run.cancel.clone());
            log_debug!(
                component = "compactor",
                event = "workers_spawned",
                table = %self.config.table,
                workers = workers.len(),
            );
            run.workers = Some(workers);

            let monitor = CompletionMonitor::new(
                Arc::clone(&self.admin),
                policy,
                self.config.poll_interval,
                self.config.run_timeout,
                Arc::clone(&run.metrics),
            );
            let outcome = monitor
                .watch(&run.tasks, events_rx)
                .instrument(run_span(&self.config.table, "run"))
                .await;

            if let Some(workers) = run.workers.take() {
                workers.shutdown(self.config.shutdown_grace).await;
            }
            run.queues.drain();
            (outcome.pairs, outcome.timed_out)
        };

        let status = RunStatus::from_pairs(&pairs);
        let report = CompactionReport {
            table: self.config.table.clone(),
            status,
            timed_out,
            dry_run: self.config.dry_run,
            pairs,
            excluded: run.excluded.clone(),
            peak_in_flight: run.queues.peak_in_flight(),
            metrics: run.metrics.snapshot(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        self.state = match status {
            RunStatus::Failed => CompactorState::Failed,
            RunStatus::Completed | RunStatus::Partial => CompactorState::Completed,
        };
        if status == RunStatus::Failed {
            log_error!(
                component = "compactor",
                event = "run_failed",
                table = %report.table,
                failed = report.count(PairStatus::Failed),
                timed_out = report.count(PairStatus::TimedOut),
            );
        } else {
            log_info!(
                component = "compactor",
                event = "run_finished",
                table = %report.table,
                status = ?status,
                converged = report.count(PairStatus::Converged),
                failed = report.count(PairStatus::Failed),
                timed_out = report.count(PairStatus::TimedOut),
                excluded = report.excluded.len(),
                elapsed_ms = report.elapsed_ms,
            );
        }
        Ok(report)
    }

    /// Stop workers, discard undispatched tasks and release queues.
    ///
    /// Safe to call in any state, any number of times.
    pub async fn shutdown(&mut self) {
        if let Some(run) = self.run.take() {
            run.cancel.cancel();
            if let Some(workers) = run.workers {
                workers.shutdown(self.config.shutdown_grace).await;
            }
            let discarded = run.queues.drain();
            log_info!(
                component = "compactor",
                event = "shutdown",
                table = %self.config.table,
                discarded = discarded,
            );
        }
        self.state = CompactorState::Shutdown;
    }
}

/// Split every (region, family) pair into planned tasks and exclusions.
fn plan(
    snapshot: &TopologySnapshot,
    policy: &ExclusionPolicy,
) -> (Vec<CompactionTask>, Vec<ExcludedPair>) {
    let mut tasks = Vec::new();
    let mut excluded = Vec::new();
    for (region, info) in snapshot.regions() {
        for (family, store) in &info.stores {
            match policy.exclusion(store.fragments, store.last_major_ms) {
                Some(reason) => excluded.push(ExcludedPair {
                    region: region.clone(),
                    family: family.clone(),
                    fragments: store.fragments,
                    reason,
                }),
                None => tasks.push(CompactionTask::new(
                    PairKey::new(region.clone(), family.clone()),
                    info.server.clone(),
                    store.fragments,
                )),
            }
        }
    }
    (tasks, excluded)
}

fn skipped(task: &CompactionTask) -> PairReport {
    PairReport {
        region: task.pair.region.clone(),
        family: task.pair.family.clone(),
        server: task.server.clone(),
        status: PairStatus::Skipped,
        attempts: 0,
        fragments_before: task.fragments_before,
        fragments_after: None,
        error: None,
    }
}
