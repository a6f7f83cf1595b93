mod common;

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use common::{cluster, config, FAMILY, TABLE};
use major_compactor::{
    admin::AdminFuture,
    mem::{ClusterOptions, InMemoryCluster},
    AdminClient, AdminError, CompactorError, CompactorState, MajorCompactor, PairStatus,
    RegionId, RegionLocation, RunStatus, ServerName, TopologyError,
};

/// Delegates to an in-memory cluster; fragment counts hang once `wedged` is set.
struct WedgedCounts {
    inner: Arc<InMemoryCluster>,
    wedged: AtomicBool,
}

impl AdminClient for WedgedCounts {
    fn list_regions<'a>(&'a self, table: &'a str) -> AdminFuture<'a, Vec<RegionLocation>> {
        self.inner.list_regions(table)
    }

    fn fragment_count<'a>(&'a self, region: &'a RegionId, family: &'a str) -> AdminFuture<'a, usize> {
        if self.wedged.load(Ordering::SeqCst) {
            return Box::pin(std::future::pending());
        }
        self.inner.fragment_count(region, family)
    }

    fn major_compact<'a>(&'a self, region: &'a RegionId, family: &'a str) -> AdminFuture<'a, ()> {
        self.inner.major_compact(region, family)
    }

    fn region_location<'a>(&'a self, region: &'a RegionId) -> AdminFuture<'a, Option<ServerName>> {
        self.inner.region_location(region)
    }
}

/// The first request for each region reports it in transition and hands the
/// region to `target`, a server that hosted nothing when the run was planned.
struct RelocateOnFirstRequest {
    inner: Arc<InMemoryCluster>,
    target: ServerName,
    relocated: Mutex<HashSet<RegionId>>,
}

impl AdminClient for RelocateOnFirstRequest {
    fn list_regions<'a>(&'a self, table: &'a str) -> AdminFuture<'a, Vec<RegionLocation>> {
        self.inner.list_regions(table)
    }

    fn fragment_count<'a>(&'a self, region: &'a RegionId, family: &'a str) -> AdminFuture<'a, usize> {
        self.inner.fragment_count(region, family)
    }

    fn major_compact<'a>(&'a self, region: &'a RegionId, family: &'a str) -> AdminFuture<'a, ()> {
        let first = self
            .relocated
            .lock()
            .expect("relocated set")
            .insert(region.clone());
        if first {
            self.inner.assign_region(region, &self.target);
            let region = region.clone();
            return Box::pin(async move { Err(AdminError::RegionInTransition(region)) });
        }
        self.inner.major_compact(region, family)
    }

    fn region_location<'a>(&'a self, region: &'a RegionId) -> AdminFuture<'a, Option<ServerName>> {
        self.inner.region_location(region)
    }
}

#[tokio::test(start_paused = true)]
async fn unreachable_server_fails_only_its_regions() {
    let cluster = cluster(ClusterOptions::with_servers(3), 6, 3);
    let down = ServerName::from("server-2");
    let mut compactor = MajorCompactor::new(cluster.clone(), config().max_request_retries(3));
    compactor.initialize_work_queues().await.expect("init");
    cluster.set_server_reachable(&down, false);

    let report = compactor.compact_all_regions().await.expect("run");
    compactor.shutdown().await;

    assert_eq!(report.status, RunStatus::Partial);
    assert_eq!(report.exit_code(), 2);
    assert_eq!(report.count(PairStatus::Converged), 4);
    assert_eq!(report.count(PairStatus::Failed), 2);
    for pair in report.unconverged() {
        assert_eq!(pair.server, down);
        assert_eq!(pair.status, PairStatus::Failed);
        assert_eq!(pair.attempts, 4);
        assert!(pair.error.as_deref().unwrap_or_default().contains("server-2"));
    }
    assert_eq!(report.metrics.failed_pairs, 2);
    assert_eq!(report.metrics.retries, 6);
    assert_eq!(cluster.server_requests(&down), 0);
}

#[tokio::test(start_paused = true)]
async fn every_server_down_fails_the_run() {
    let cluster = cluster(ClusterOptions::with_servers(2), 2, 2);
    let mut compactor = MajorCompactor::new(cluster.clone(), config().max_request_retries(0));
    compactor.initialize_work_queues().await.expect("init");
    for server in cluster.servers_of(TABLE) {
        cluster.set_server_reachable(&server, false);
    }

    let report = compactor.compact_all_regions().await.expect("run");
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(compactor.state(), CompactorState::Failed);

    compactor.shutdown().await;
    assert_eq!(compactor.state(), CompactorState::Shutdown);
}

#[tokio::test(start_paused = true)]
async fn stalled_discharger_times_out() {
    let cluster = cluster(ClusterOptions::with_servers(2), 4, 3);
    let mut compactor = MajorCompactor::new(
        cluster.clone(),
        config().run_timeout(Duration::from_millis(500)),
    );
    compactor.initialize_work_queues().await.expect("init");
    cluster.pause_discharger(true);

    let started = tokio::time::Instant::now();
    let report = compactor.compact_all_regions().await.expect("run");
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert!(report.elapsed_ms >= 500);
    assert!(report.timed_out);
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.count(PairStatus::TimedOut), 4);
    for pair in &report.pairs {
        assert_eq!(pair.fragments_after, Some(3));
    }
    assert_eq!(cluster.total_compaction_requests(), 4);
    compactor.shutdown().await;

    // Once the servers catch up a fresh run converges.
    cluster.pause_discharger(false);
    compactor.initialize_work_queues().await.expect("re-init");
    let report = compactor.compact_all_regions().await.expect("rerun");
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(cluster.fragment_total(TABLE, FAMILY), 4);
    compactor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn moved_region_is_forwarded_to_its_new_server() {
    let cluster = cluster(ClusterOptions::with_servers(2), 4, 3);
    let mut compactor = MajorCompactor::new(cluster.clone(), config());
    compactor.initialize_work_queues().await.expect("init");

    let from = ServerName::from("server-0");
    let to = ServerName::from("server-1");
    let region = cluster.regions_on(&from)[0].clone();
    cluster.move_region(&region, &to);

    let report = compactor.compact_all_regions().await.expect("run");
    compactor.shutdown().await;

    assert_eq!(report.status, RunStatus::Completed);
    let moved = report
        .pairs
        .iter()
        .find(|p| p.region == region)
        .expect("moved pair reported");
    assert_eq!(moved.status, PairStatus::Converged);
    assert_eq!(moved.server, to);
    assert_eq!(moved.attempts, 2);
    assert_eq!(report.metrics.forwarded, 1);
    assert_eq!(cluster.compaction_requests(&region, FAMILY), 1);
}

#[tokio::test(start_paused = true)]
async fn region_in_transition_is_retried_until_reassigned() {
    let cluster = cluster(ClusterOptions::with_servers(2), 2, 2);
    let mut compactor = MajorCompactor::new(
        cluster.clone(),
        config()
            .retry_backoff(Duration::from_millis(20))
            .max_request_retries(5),
    );
    compactor.initialize_work_queues().await.expect("init");

    let server = ServerName::from("server-1");
    let region = cluster.regions_on(&server)[0].clone();
    cluster.unassign_region(&region);
    let reassign = {
        let cluster = cluster.clone();
        let region = region.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cluster.assign_region(&region, &server);
        })
    };

    let report = compactor.compact_all_regions().await.expect("run");
    reassign.await.expect("reassign task");
    compactor.shutdown().await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.count(PairStatus::Converged), 2);
    assert!(report.metrics.retries >= 1);
}

#[tokio::test(start_paused = true)]
async fn unassigned_region_is_retried_during_planning() {
    let cluster = cluster(ClusterOptions::with_servers(2), 2, 2);
    let server = ServerName::from("server-0");
    let region = cluster.regions_on(&server)[0].clone();
    cluster.unassign_region(&region);

    let mut compactor = MajorCompactor::new(
        cluster.clone(),
        config().topology_retries(3, Duration::from_millis(50)),
    );
    let reassign = {
        let cluster = cluster.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(75)).await;
            cluster.assign_region(&region, &server);
        })
    };
    compactor.initialize_work_queues().await.expect("init");
    reassign.await.expect("reassign task");
    assert_eq!(compactor.planned_tasks().len(), 2);
    compactor.shutdown().await;
}

#[tokio::test]
async fn missing_table_fails_initialization() {
    let cluster = cluster(ClusterOptions::with_servers(1), 1, 1);
    let mut compactor = MajorCompactor::new(
        cluster,
        config().with_target("NoSuchTable", [FAMILY]),
    );
    let err = compactor.initialize_work_queues().await.unwrap_err();
    assert!(matches!(
        err,
        CompactorError::Topology(TopologyError::TableNotFound(ref table)) if table == "NoSuchTable"
    ));
    assert_eq!(compactor.state(), CompactorState::Created);
}

#[tokio::test]
async fn lifecycle_misuse_is_rejected() {
    let cluster = cluster(ClusterOptions::with_servers(1), 2, 2);
    let mut compactor = MajorCompactor::new(cluster, config());

    compactor.shutdown().await;
    assert_eq!(compactor.state(), CompactorState::Shutdown);
    assert!(matches!(
        compactor.compact_all_regions().await,
        Err(CompactorError::NotInitialized)
    ));

    compactor.initialize_work_queues().await.expect("init");
    assert!(matches!(
        compactor.initialize_work_queues().await,
        Err(CompactorError::AlreadyInitialized)
    ));
    compactor.shutdown().await;
    compactor.shutdown().await;
    assert_eq!(compactor.state(), CompactorState::Shutdown);
}

#[tokio::test(start_paused = true)]
async fn hung_fragment_count_does_not_outlive_the_run_timeout() {
    let inner = cluster(ClusterOptions::with_servers(2), 4, 3);
    let admin = Arc::new(WedgedCounts {
        inner,
        wedged: AtomicBool::new(false),
    });
    let mut compactor = MajorCompactor::new(
        admin.clone(),
        config().run_timeout(Duration::from_millis(200)),
    );
    compactor.initialize_work_queues().await.expect("init");
    admin.wedged.store(true, Ordering::SeqCst);

    let report = tokio::time::timeout(Duration::from_secs(3600), compactor.compact_all_regions())
        .await
        .expect("run ends at its timeout")
        .expect("run");
    compactor.shutdown().await;

    assert!(report.timed_out);
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.count(PairStatus::TimedOut), 4);
    assert!(report.elapsed_ms >= 200);
    assert!(report.elapsed_ms < 1_000);
}

#[tokio::test(start_paused = true)]
async fn region_relocated_to_a_new_server_respects_its_limit() {
    let inner = cluster(
        ClusterOptions::with_servers(3).ack_latency(Duration::from_millis(50)),
        2,
        3,
    );
    let target = ServerName::from("server-2");
    assert!(inner.regions_on(&target).is_empty());
    let admin = Arc::new(RelocateOnFirstRequest {
        inner: inner.clone(),
        target: target.clone(),
        relocated: Mutex::new(HashSet::new()),
    });
    let mut compactor = MajorCompactor::new(admin, config().concurrency(1));
    compactor.initialize_work_queues().await.expect("init");

    let report = compactor.compact_all_regions().await.expect("run");
    compactor.shutdown().await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.count(PairStatus::Converged), 2);
    for pair in &report.pairs {
        assert_eq!(pair.server, target);
        assert_eq!(pair.attempts, 2);
    }
    assert_eq!(inner.peak_in_flight(&target), 1);
    assert_eq!(inner.server_requests(&target), 2);
    assert_eq!(report.peak_in_flight.get(&target).copied(), Some(1));
    assert_eq!(report.metrics.forwarded, 2);
    assert_eq!(inner.fragment_total(TABLE, FAMILY), 2);
}
