//! Handle over the spawned worker tasks of one run.

use std::time::Duration;

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::observability::log_warn;

/// Handle to the background workers of a compaction run.
///
/// Provides control over the workers' lifecycle. Workers are cancelled and
/// aborted when the handle is dropped, so a forgotten handle never keeps tasks
/// alive.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    cancel: CancellationToken,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            joins: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, join: JoinHandle<()>) {
        self.joins.push(join);
    }

    /// Number of spawned workers.
    pub(crate) fn len(&self) -> usize {
        self.joins.len()
    }

    /// Cancel and wait for every worker to exit.
    ///
    /// Workers finish the request they are issuing; any still running after
    /// `grace` are aborted.
    pub(crate) async fn shutdown(mut self, grace: Duration) {
        self.cancel.cancel();
        let joins = std::mem::take(&mut self.joins);
        let aborts: Vec<_> = joins.iter().map(JoinHandle::abort_handle).collect();
        match tokio::time::timeout(grace, join_all(joins)).await {
            Ok(results) => {
                for err in results.into_iter().filter_map(Result::err) {
                    if err.is_panic() {
                        log_warn!(
                            component = "queue",
                            event = "worker_panicked",
                            error = %err,
                        );
                    }
                }
            }
            Err(_) => {
                log_warn!(
                    component = "queue",
                    event = "worker_shutdown_timeout",
                    grace_ms = grace.as_millis() as u64,
                    workers = aborts.len(),
                );
                for abort in aborts {
                    abort.abort();
                }
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        for join in &self.joins {
            join.abort();
        }
    }
}
