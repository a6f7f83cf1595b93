//! Per-server work queues and their bounded worker pools.
//!
//! Every server hosting a planned pair gets one unbounded MPMC queue and
//! `concurrency` workers that drain it in submission order. Requests are
//! additionally gated by a semaphore keyed by the server a request is
//! addressed to, so a task that was re-located to a server without a queue of
//! its own (it rides on the queue it came from) still counts against that
//! server's limit. A single node never sees more than `concurrency`
//! simultaneous compaction requests while all servers proceed in parallel.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::sync::{mpsc, Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;

use crate::{
    admin::ServerName,
    handle::WorkerHandle,
    metrics::InFlightGauge,
    observability::{log_debug, log_warn},
    requester::{CompactionRequestFailed, CompactionRequester, Dispatch},
    task::{CompactionTask, PairKey},
};

/// Progress reported by workers to the completion monitor.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    /// The server acknowledged a request for the pair.
    Acknowledged {
        pair: PairKey,
        server: ServerName,
        attempts: u32,
    },
    /// The pair will not be compacted in this run.
    Failed(CompactionRequestFailed),
}

/// Pairs currently being requested; guards against double dispatch.
#[derive(Debug, Default)]
pub(crate) struct DispatchGuard {
    in_flight: Mutex<HashSet<PairKey>>,
}

impl DispatchGuard {
    /// Claim a pair; `false` if another worker already holds it.
    pub(crate) fn claim(&self, pair: &PairKey) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pair.clone())
    }

    pub(crate) fn release(&self, pair: &PairKey) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(pair);
    }
}

#[derive(Debug)]
struct ServerQueue {
    tx: flume::Sender<CompactionTask>,
    rx: flume::Receiver<CompactionTask>,
}

impl ServerQueue {
    fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }
}

/// Request budget of the server a request is addressed to.
#[derive(Debug)]
struct ServerSlots {
    permits: Semaphore,
    gauge: InFlightGauge,
}

/// Shared state handed to every worker of a run.
pub(crate) struct WorkerContext {
    pub(crate) requester: CompactionRequester,
    pub(crate) guard: DispatchGuard,
    pub(crate) events: mpsc::UnboundedSender<WorkerEvent>,
    pub(crate) retry_backoff: Duration,
}

/// Work queues of one run, keyed by server.
#[derive(Debug)]
pub(crate) struct WorkQueues {
    queues: BTreeMap<ServerName, ServerQueue>,
    slots: Mutex<BTreeMap<ServerName, Arc<ServerSlots>>>,
    concurrency: usize,
}

impl WorkQueues {
    /// Partition `tasks` by server, one queue per server in `servers`.
    ///
    /// Servers without tasks still get an (empty) queue so that retries can be
    /// forwarded to them when a region moves there.
    pub(crate) fn build<I>(servers: I, tasks: Vec<CompactionTask>, concurrency: usize) -> Self
    where
        I: IntoIterator<Item = ServerName>,
    {
        let mut queues: BTreeMap<ServerName, ServerQueue> = servers
            .into_iter()
            .map(|server| (server, ServerQueue::new()))
            .collect();
        for task in tasks {
            let queue = queues
                .entry(task.server.clone())
                .or_insert_with(ServerQueue::new);
            // The receiver lives in `queue`, so the channel cannot be disconnected.
            let _ = queue.tx.send(task);
        }
        let queues = Self {
            queues,
            slots: Mutex::new(BTreeMap::new()),
            concurrency: concurrency.max(1),
        };
        for server in queues.queues.keys() {
            queues.slots_for(server);
        }
        queues
    }

    /// Slots of `server`, created on first use for servers found mid-run.
    fn slots_for(&self, server: &ServerName) -> Arc<ServerSlots> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(server.clone()).or_insert_with(|| {
            Arc::new(ServerSlots {
                permits: Semaphore::new(self.concurrency),
                gauge: InFlightGauge::default(),
            })
        }))
    }

    /// Enqueue on the task's server. A server without a queue in this run
    /// borrows `fallback`'s queue; the task keeps its target, so its requests
    /// still count against the target's slots.
    pub(crate) fn enqueue(&self, task: CompactionTask, fallback: &ServerName) {
        let owner = if self.queues.contains_key(&task.server) {
            task.server.clone()
        } else {
            log_debug!(
                component = "queue",
                event = "task_borrowed_queue",
                task_id = %task.id,
                pair = %task.pair,
                target = %task.server,
                queue = %fallback,
            );
            fallback.clone()
        };
        if let Some(queue) = self.queues.get(&owner) {
            match queue.tx.send(task) {
                Ok(()) => log_debug!(
                    component = "queue",
                    event = "task_requeued",
                    server = %owner,
                    queued = self.queued_on(&owner),
                ),
                Err(flume::SendError(task)) => log_warn!(
                    component = "queue",
                    event = "enqueue_dropped",
                    task_id = %task.id,
                    pair = %task.pair,
                    server = %owner,
                ),
            }
        }
    }

    /// Servers with a queue.
    pub(crate) fn servers(&self) -> impl Iterator<Item = &ServerName> {
        self.queues.keys()
    }

    /// Tasks waiting across all queues.
    pub(crate) fn queued(&self) -> usize {
        self.queues.values().map(|q| q.rx.len()).sum()
    }

    /// Tasks waiting on one server's queue.
    pub(crate) fn queued_on(&self, server: &ServerName) -> usize {
        self.queues.get(server).map(|q| q.rx.len()).unwrap_or(0)
    }

    /// Highest number of simultaneous requests per target server so far.
    pub(crate) fn peak_in_flight(&self) -> BTreeMap<ServerName, usize> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(server, slots)| (server.clone(), slots.gauge.peak()))
            .collect()
    }

    /// Remove every undispatched task; returns how many were dropped.
    pub(crate) fn drain(&self) -> usize {
        self.queues.values().map(|q| q.rx.drain().count()).sum()
    }

    /// Spawn `concurrency` workers per server on the current tokio runtime.
    pub(crate) fn spawn_workers(
        self: &Arc<Self>,
        ctx: Arc<WorkerContext>,
        cancel: CancellationToken,
    ) -> WorkerHandle {
        let mut handle = WorkerHandle::new(cancel.clone());
        for server in self.queues.keys() {
            for slot in 0..self.concurrency {
                let worker = Worker {
                    queues: Arc::clone(self),
                    server: server.clone(),
                    slot,
                    ctx: Arc::clone(&ctx),
                    cancel: cancel.clone(),
                };
                handle.push(tokio::spawn(worker.run()));
            }
        }
        handle
    }
}

struct Worker {
    queues: Arc<WorkQueues>,
    server: ServerName,
    slot: usize,
    ctx: Arc<WorkerContext>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        let Some(queue) = self.queues.queues.get(&self.server) else {
            return;
        };
        let rx = queue.rx.clone();
        loop {
            let task = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                recv = rx.recv_async() => match recv {
                    Ok(task) => task,
                    Err(_) => break,
                },
            };
            if !self.ctx.guard.claim(&task.pair) {
                log_warn!(
                    component = "queue",
                    event = "pair_busy_requeued",
                    task_id = %task.id,
                    pair = %task.pair,
                    server = %self.server,
                );
                if !self.backoff().await {
                    break;
                }
                self.queues.enqueue(task, &self.server);
                continue;
            }
            let pair = task.pair.clone();
            let slots = self.queues.slots_for(&task.server);
            let Some(permit) = self.acquire(&slots).await else {
                self.ctx.guard.release(&pair);
                break;
            };
            let dispatch = {
                let _in_flight = slots.gauge.enter();
                log_debug!(
                    component = "queue",
                    event = "task_dispatched",
                    task_id = %task.id,
                    pair = %pair,
                    target = %task.server,
                    in_flight = slots.gauge.current(),
                );
                self.ctx.requester.dispatch(task).await
            };
            drop(permit);
            self.ctx.guard.release(&pair);

            match dispatch {
                Dispatch::Acknowledged(task) => {
                    let _ = self.ctx.events.send(WorkerEvent::Acknowledged {
                        pair: task.pair,
                        server: task.server,
                        attempts: task.attempts + 1,
                    });
                }
                Dispatch::Failed(failed) => {
                    let _ = self.ctx.events.send(WorkerEvent::Failed(failed));
                }
                Dispatch::Retry(task) => {
                    if !self.backoff().await {
                        break;
                    }
                    self.queues.enqueue(task, &self.server);
                }
            }
        }
        log_debug!(
            component = "queue",
            event = "worker_stopped",
            server = %self.server,
            slot = self.slot,
        );
    }

    /// Wait for a request slot on the target server; `None` once cancelled.
    async fn acquire<'a>(&self, slots: &'a ServerSlots) -> Option<SemaphorePermit<'a>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            permit = slots.permits.acquire() => permit.ok(),
        }
    }

    /// Sleep for the retry backoff; `false` once cancelled.
    async fn backoff(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.ctx.retry_backoff) => true,
        }
    }
}
