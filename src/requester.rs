//! Issues one major-compaction request per dispatched task.
//!
//! The requester only waits for the server's acknowledgement; the merge runs
//! asynchronously on the server and is observed by the completion monitor.

use std::sync::Arc;

use thiserror::Error;

use crate::{
    admin::{AdminClient, AdminError, ServerName},
    metrics::DriverMetrics,
    observability::{log_debug, log_warn},
    task::{CompactionTask, PairKey},
    topology::TopologyResolver,
};

/// A pair whose compaction request failed permanently or ran out of retries.
#[derive(Debug, Clone, Error)]
#[error("major compaction request for {pair} on {server} failed after {attempts} attempt(s): {error}")]
pub struct CompactionRequestFailed {
    /// Pair that could not be compacted.
    pub pair: PairKey,
    /// Server the last attempt was sent to.
    pub server: ServerName,
    /// Attempts made, including the last one.
    pub attempts: u32,
    /// Error returned by the last attempt.
    pub error: AdminError,
}

/// What a worker should do with a task after one request.
#[derive(Debug)]
pub(crate) enum Dispatch {
    /// The server accepted the request.
    Acknowledged(CompactionTask),
    /// Transient failure: re-enqueue the task on its (possibly new) server.
    Retry(CompactionTask),
    /// The pair is done trying.
    Failed(CompactionRequestFailed),
}

pub(crate) struct CompactionRequester {
    admin: Arc<dyn AdminClient>,
    topology: TopologyResolver,
    max_retries: u32,
    metrics: Arc<DriverMetrics>,
}

impl CompactionRequester {
    pub(crate) fn new(
        admin: Arc<dyn AdminClient>,
        topology: TopologyResolver,
        max_retries: u32,
        metrics: Arc<DriverMetrics>,
    ) -> Self {
        Self {
            admin,
            topology,
            max_retries,
            metrics,
        }
    }

    /// Send one request for `task` and classify the result.
    pub(crate) async fn dispatch(&self, task: CompactionTask) -> Dispatch {
        let pair = &task.pair;
        match self.admin.major_compact(&pair.region, &pair.family).await {
            Ok(()) => {
                self.metrics.record_dispatch();
                log_debug!(
                    component = "requester",
                    event = "compaction_requested",
                    task_id = %task.id,
                    pair = %pair,
                    server = %task.server,
                    attempt = task.attempts + 1,
                );
                Dispatch::Acknowledged(task)
            }
            Err(error) => {
                self.metrics.record_request_failure();
                if error.is_retryable() && task.attempts < self.max_retries {
                    let target = self.retarget(&task, &error).await;
                    self.metrics.record_retry(target != task.server);
                    log_debug!(
                        component = "requester",
                        event = "compaction_request_retry",
                        task_id = %task.id,
                        pair = %pair,
                        server = %task.server,
                        target = %target,
                        attempt = task.attempts + 1,
                        error = %error,
                    );
                    Dispatch::Retry(task.retry_on(target))
                } else {
                    self.metrics.record_failed_pair();
                    log_warn!(
                        component = "requester",
                        event = "compaction_request_failed",
                        task_id = %task.id,
                        pair = %pair,
                        server = %task.server,
                        attempts = task.attempts + 1,
                        error = %error,
                    );
                    Dispatch::Failed(CompactionRequestFailed {
                        pair: task.pair.clone(),
                        server: task.server.clone(),
                        attempts: task.attempts + 1,
                        error,
                    })
                }
            }
        }
    }

    /// Server whose queue should own the retry.
    async fn retarget(&self, task: &CompactionTask, error: &AdminError) -> ServerName {
        match error {
            AdminError::RegionMoved { server, .. } => server.clone(),
            AdminError::RegionInTransition(region) => match self.topology.locate(region).await {
                Ok(Some(server)) => server,
                _ => task.server.clone(),
            },
            _ => task.server.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mem::{ClusterOptions, InMemoryCluster};

    fn requester(cluster: &Arc<InMemoryCluster>, max_retries: u32) -> CompactionRequester {
        let admin: Arc<dyn AdminClient> = cluster.clone();
        CompactionRequester::new(
            admin.clone(),
            TopologyResolver::new(admin, 0, Duration::ZERO),
            max_retries,
            Arc::new(DriverMetrics::new()),
        )
    }

    #[tokio::test]
    async fn acknowledged_request_is_counted() {
        let cluster = Arc::new(InMemoryCluster::new(ClusterOptions::default()));
        let regions = cluster.create_table("t", ["a"], 1);
        let requester = requester(&cluster, 1);
        let task = CompactionTask::new(
            PairKey::new(regions[0].clone(), "a"),
            ServerName::from("server-0"),
            3,
        );
        assert!(matches!(
            requester.dispatch(task).await,
            Dispatch::Acknowledged(_)
        ));
        assert_eq!(requester.metrics.snapshot().dispatched, 1);
        assert_eq!(cluster.compaction_requests(&regions[0], "a"), 1);
    }

    #[tokio::test]
    async fn unavailable_server_retries_until_budget_is_spent() {
        let cluster = Arc::new(InMemoryCluster::new(ClusterOptions::default()));
        let regions = cluster.create_table("t", ["a"], 1);
        let server = ServerName::from("server-0");
        cluster.set_server_reachable(&server, false);
        let requester = requester(&cluster, 2);

        let mut task = CompactionTask::new(PairKey::new(regions[0].clone(), "a"), server, 3);
        for expected in 1..=2 {
            task = match requester.dispatch(task).await {
                Dispatch::Retry(next) => next,
                other => panic!("expected retry, got {other:?}"),
            };
            assert_eq!(task.attempts, expected);
        }
        match requester.dispatch(task).await {
            Dispatch::Failed(failed) => {
                assert_eq!(failed.attempts, 3);
                assert!(matches!(failed.error, AdminError::ServerUnavailable(_)));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        let snap = requester.metrics.snapshot();
        assert_eq!(snap.request_failures, 3);
        assert_eq!(snap.retries, 2);
        assert_eq!(snap.failed_pairs, 1);
    }

    #[tokio::test]
    async fn moved_region_is_retargeted() {
        let cluster = Arc::new(InMemoryCluster::new(ClusterOptions::with_servers(2)));
        let regions = cluster.create_table("t", ["a"], 1);
        let target = ServerName::from("server-1");
        cluster.move_region(&regions[0], &target);
        let requester = requester(&cluster, 3);

        let task = CompactionTask::new(
            PairKey::new(regions[0].clone(), "a"),
            ServerName::from("server-0"),
            3,
        );
        let id = task.id;
        match requester.dispatch(task).await {
            Dispatch::Retry(next) => {
                assert_eq!(next.server, target);
                assert_eq!(next.id, id);
            }
            other => panic!("expected retry, got {other:?}"),
        }
        assert_eq!(requester.metrics.snapshot().forwarded, 1);
    }

    #[tokio::test]
    async fn unknown_family_fails_immediately() {
        let cluster = Arc::new(InMemoryCluster::new(ClusterOptions::default()));
        let regions = cluster.create_table("t", ["a"], 1);
        let requester = requester(&cluster, 5);
        let task = CompactionTask::new(
            PairKey::new(regions[0].clone(), "zz"),
            ServerName::from("server-0"),
            3,
        );
        match requester.dispatch(task).await {
            Dispatch::Failed(failed) => assert_eq!(failed.attempts, 1),
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
