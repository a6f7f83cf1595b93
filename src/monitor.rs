//! Completion monitor: observes convergence independently of dispatch.
//!
//! Workers only report that a server acknowledged (or refused) a request. The
//! monitor keeps the set of pending pairs and, every poll interval, reads the
//! fragment count of each acknowledged pair until it reaches the threshold.
//! Pairs that fail are settled immediately and never block the others.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use futures_util::future::join_all;
use tokio::{
    sync::mpsc,
    time::{Instant, MissedTickBehavior},
};

use crate::{
    admin::{AdminClient, ServerName},
    metrics::DriverMetrics,
    observability::{log_debug, log_warn},
    queue::WorkerEvent,
    report::{PairReport, PairStatus},
    task::{CompactionTask, ExclusionPolicy, PairKey},
};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct Pending {
    server: ServerName,
    attempts: u32,
    acknowledged: bool,
    fragments_before: usize,
    last_observed: Option<usize>,
}

/// Result of watching a run to its end.
#[derive(Debug)]
pub(crate) struct MonitorOutcome {
    pub(crate) pairs: Vec<PairReport>,
    pub(crate) timed_out: bool,
}

pub(crate) struct CompletionMonitor {
    admin: Arc<dyn AdminClient>,
    policy: ExclusionPolicy,
    poll_interval: Duration,
    timeout: Duration,
    metrics: Arc<DriverMetrics>,
}

impl CompletionMonitor {
    pub(crate) fn new(
        admin: Arc<dyn AdminClient>,
        policy: ExclusionPolicy,
        poll_interval: Duration,
        timeout: Duration,
        metrics: Arc<DriverMetrics>,
    ) -> Self {
        Self {
            admin,
            policy,
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
            timeout,
            metrics,
        }
    }

    /// Block until every task's pair settles or the timeout elapses.
    pub(crate) async fn watch(
        &self,
        tasks: &[CompactionTask],
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) -> MonitorOutcome {
        let mut pending: BTreeMap<PairKey, Pending> = tasks
            .iter()
            .map(|task| {
                (
                    task.pair.clone(),
                    Pending {
                        server: task.server.clone(),
                        attempts: 0,
                        acknowledged: false,
                        fragments_before: task.fragments_before,
                        last_observed: None,
                    },
                )
            })
            .collect();
        let mut settled: BTreeMap<PairKey, PairReport> = BTreeMap::new();

        let deadline = Instant::now() + self.timeout;
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;
        let mut timed_out = false;

        while !pending.is_empty() {
            tokio::select! {
                biased;
                _ = tokio::time::sleep_until(deadline) => {
                    timed_out = true;
                    break;
                }
                event = events.recv(), if events_open => match event {
                    Some(event) => self.apply(event, &mut pending, &mut settled),
                    None => events_open = false,
                },
                _ = ticker.tick() => self.poll(&mut pending, &mut settled, deadline).await,
            }
        }

        if timed_out {
            log_warn!(
                component = "monitor",
                event = "run_timed_out",
                timeout_ms = self.timeout.as_millis() as u64,
                pending = pending.len(),
            );
        }
        for (pair, state) in pending {
            settled.insert(pair.clone(), report(pair, state, PairStatus::TimedOut, None));
        }
        MonitorOutcome {
            pairs: settled.into_values().collect(),
            timed_out,
        }
    }

    fn apply(
        &self,
        event: WorkerEvent,
        pending: &mut BTreeMap<PairKey, Pending>,
        settled: &mut BTreeMap<PairKey, PairReport>,
    ) {
        match event {
            WorkerEvent::Acknowledged {
                pair,
                server,
                attempts,
            } => {
                if let Some(state) = pending.get_mut(&pair) {
                    state.acknowledged = true;
                    state.server = server;
                    state.attempts = attempts;
                }
            }
            WorkerEvent::Failed(failed) => {
                if let Some(mut state) = pending.remove(&failed.pair) {
                    state.server = failed.server.clone();
                    state.attempts = failed.attempts;
                    let error = failed.error.to_string();
                    settled.insert(
                        failed.pair.clone(),
                        report(failed.pair, state, PairStatus::Failed, Some(error)),
                    );
                }
            }
        }
    }

    /// One poll round over the acknowledged pairs. Every call is cut off at
    /// `deadline`, so a wedged server cannot hold the run past its timeout.
    async fn poll(
        &self,
        pending: &mut BTreeMap<PairKey, Pending>,
        settled: &mut BTreeMap<PairKey, PairReport>,
        deadline: Instant,
    ) {
        let acknowledged: Vec<PairKey> = pending
            .iter()
            .filter(|(_, state)| state.acknowledged)
            .map(|(pair, _)| pair.clone())
            .collect();
        if acknowledged.is_empty() {
            return;
        }
        let counts = join_all(acknowledged.iter().map(|pair| async move {
            tokio::time::timeout_at(
                deadline,
                self.admin.fragment_count(&pair.region, &pair.family),
            )
            .await
        }))
        .await;

        for (pair, count) in acknowledged.into_iter().zip(counts) {
            let count = match count {
                Ok(count) => count,
                Err(_) => {
                    self.metrics.record_poll(false);
                    log_debug!(
                        component = "monitor",
                        event = "poll_cut_off",
                        pair = %pair,
                    );
                    continue;
                }
            };
            match count {
                Ok(fragments) => {
                    self.metrics.record_poll(true);
                    if self.policy.is_converged(fragments) {
                        if let Some(mut state) = pending.remove(&pair) {
                            state.last_observed = Some(fragments);
                            self.metrics.record_converged();
                            log_debug!(
                                component = "monitor",
                                event = "pair_converged",
                                pair = %pair,
                                fragments = fragments,
                            );
                            settled.insert(
                                pair.clone(),
                                report(pair, state, PairStatus::Converged, None),
                            );
                        }
                    } else if let Some(state) = pending.get_mut(&pair) {
                        state.last_observed = Some(fragments);
                    }
                }
                Err(err) => {
                    self.metrics.record_poll(false);
                    log_debug!(
                        component = "monitor",
                        event = "poll_failed",
                        pair = %pair,
                        error = %err,
                    );
                }
            }
        }
        log_debug!(
            component = "monitor",
            event = "poll_round",
            pending = pending.len(),
            settled = settled.len(),
        );
    }
}

fn report(pair: PairKey, state: Pending, status: PairStatus, error: Option<String>) -> PairReport {
    PairReport {
        region: pair.region,
        family: pair.family,
        server: state.server,
        status,
        attempts: state.attempts,
        fragments_before: state.fragments_before,
        fragments_after: state.last_observed,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        admin::{AdminError, AdminFuture, RegionId, RegionLocation},
        mem::{ClusterOptions, InMemoryCluster},
        requester::CompactionRequestFailed,
    };

    /// Accepts every request but never answers a fragment count.
    struct WedgedCounts;

    impl AdminClient for WedgedCounts {
        fn list_regions<'a>(&'a self, table: &'a str) -> AdminFuture<'a, Vec<RegionLocation>> {
            Box::pin(async move { Err(AdminError::TableNotFound(table.to_string())) })
        }

        fn fragment_count<'a>(&'a self, _: &'a RegionId, _: &'a str) -> AdminFuture<'a, usize> {
            Box::pin(std::future::pending())
        }

        fn major_compact<'a>(&'a self, _: &'a RegionId, _: &'a str) -> AdminFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }

        fn region_location<'a>(&'a self, _: &'a RegionId) -> AdminFuture<'a, Option<ServerName>> {
            Box::pin(async { Ok(None) })
        }
    }

    fn policy() -> ExclusionPolicy {
        ExclusionPolicy {
            cutoff_ms: None,
            max_fragments: 1,
        }
    }

    fn seeded(cluster: &InMemoryCluster, regions: usize, flushes: usize) -> Vec<CompactionTask> {
        let ids = cluster.create_table("t", ["a"], regions);
        for _ in 0..flushes {
            let rows = (0..=255u8).map(|b| vec![b; 4]);
            cluster.put_rows("t", "a", rows).expect("put");
            cluster.flush("t").expect("flush");
        }
        ids.into_iter()
            .map(|region| {
                CompactionTask::new(
                    PairKey::new(region, "a"),
                    ServerName::from("server-0"),
                    flushes,
                )
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledged_pairs_converge_after_discharge() {
        let cluster = Arc::new(InMemoryCluster::new(
            ClusterOptions::default().discharger_interval(Duration::from_millis(30)),
        ));
        let tasks = seeded(&cluster, 2, 3);
        let metrics = Arc::new(DriverMetrics::new());
        let monitor = CompletionMonitor::new(
            cluster.clone(),
            policy(),
            Duration::from_millis(10),
            Duration::from_secs(5),
            metrics.clone(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        for task in &tasks {
            cluster
                .major_compact(&task.pair.region, &task.pair.family)
                .await
                .expect("compact");
            tx.send(WorkerEvent::Acknowledged {
                pair: task.pair.clone(),
                server: task.server.clone(),
                attempts: 1,
            })
            .expect("send");
        }

        let outcome = monitor.watch(&tasks, rx).await;
        assert!(!outcome.timed_out);
        assert_eq!(outcome.pairs.len(), 2);
        for pair in &outcome.pairs {
            assert_eq!(pair.status, PairStatus::Converged);
            assert_eq!(pair.fragments_before, 3);
            assert_eq!(pair.fragments_after, Some(1));
        }
        assert_eq!(metrics.snapshot().converged_pairs, 2);
        assert!(metrics.snapshot().polls >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_settle_and_stalls_time_out() {
        let cluster = Arc::new(InMemoryCluster::new(ClusterOptions::default()));
        let tasks = seeded(&cluster, 2, 2);
        cluster.pause_discharger(true);
        let monitor = CompletionMonitor::new(
            cluster.clone(),
            policy(),
            Duration::from_millis(10),
            Duration::from_millis(200),
            Arc::new(DriverMetrics::new()),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(WorkerEvent::Failed(CompactionRequestFailed {
            pair: tasks[0].pair.clone(),
            server: tasks[0].server.clone(),
            attempts: 4,
            error: AdminError::ServerUnavailable(tasks[0].server.clone()),
        }))
        .expect("send");
        cluster
            .major_compact(&tasks[1].pair.region, "a")
            .await
            .expect("compact");
        tx.send(WorkerEvent::Acknowledged {
            pair: tasks[1].pair.clone(),
            server: tasks[1].server.clone(),
            attempts: 1,
        })
        .expect("send");

        let started = Instant::now();
        let outcome = monitor.watch(&tasks, rx).await;
        assert!(outcome.timed_out);
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(outcome.pairs[0].status, PairStatus::Failed);
        assert_eq!(outcome.pairs[0].attempts, 4);
        assert!(outcome.pairs[0].error.is_some());
        assert_eq!(outcome.pairs[1].status, PairStatus::TimedOut);
        assert_eq!(outcome.pairs[1].fragments_after, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_fragment_count_still_times_out() {
        let metrics = Arc::new(DriverMetrics::new());
        let monitor = CompletionMonitor::new(
            Arc::new(WedgedCounts),
            policy(),
            Duration::from_millis(10),
            Duration::from_millis(200),
            metrics.clone(),
        );
        let task = CompactionTask::new(PairKey::new("r1", "a"), ServerName::from("s1"), 4);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(WorkerEvent::Acknowledged {
            pair: task.pair.clone(),
            server: task.server.clone(),
            attempts: 1,
        })
        .expect("send");

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            Duration::from_secs(3600),
            monitor.watch(std::slice::from_ref(&task), rx),
        )
        .await
        .expect("watch returns at its own deadline");
        assert!(outcome.timed_out);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(outcome.pairs.len(), 1);
        assert_eq!(outcome.pairs[0].status, PairStatus::TimedOut);
        assert_eq!(outcome.pairs[0].fragments_after, None);
        assert!(metrics.snapshot().poll_errors >= 1);
    }
}
