//! Bounded worker pool over a due-time ordered retry queue.
//!
//! The number of live tasks is the pool size, not the number of pending
//! orders. An order is either waiting in the queue or being cycled by exactly
//! one worker, so cycles for the same order never overlap.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{CycleOutcome, ReconcileError, Reconciler, MAX_RETRY_DELAY};
use crate::store::{OrderStore, StoreError};

/// Cap for the doubling backoff after consecutive storage failures.
const MAX_STORE_BACKOFF: Duration = Duration::from_secs(60);

fn due_in(delay: Duration) -> Instant {
    Instant::now() + delay.min(MAX_RETRY_DELAY)
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Due {
    at: Instant,
    seq: u64,
    order_id: String,
}

#[derive(Debug, Default)]
struct Queue {
    heap: BinaryHeap<Reverse<Due>>,
    tracked: HashSet<String>,
    /// Consecutive storage failures per order.
    failures: HashMap<String, u32>,
    seq: u64,
}

impl Queue {
    fn push(&mut self, order_id: String, at: Instant) {
        self.seq += 1;
        self.heap.push(Reverse(Due {
            at,
            seq: self.seq,
            order_id,
        }));
    }

    fn pop_due(&mut self, now: Instant) -> Result<String, Option<Instant>> {
        match self.heap.peek().map(|Reverse(due)| due.at) {
            Some(at) if at <= now => match self.heap.pop() {
                Some(Reverse(due)) => Ok(due.order_id),
                None => Err(None),
            },
            next => Err(next),
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    queue: Mutex<Queue>,
    wakeup: Notify,
}

impl Shared {
    async fn track(&self, order_id: String, at: Instant) -> bool {
        let mut queue = self.queue.lock().await;
        if !queue.tracked.insert(order_id.clone()) {
            return false;
        }
        queue.push(order_id, at);
        drop(queue);
        self.wakeup.notify_one();
        true
    }

    async fn requeue(&self, order_id: String, wait: Duration) {
        let mut queue = self.queue.lock().await;
        queue.failures.remove(&order_id);
        queue.push(order_id, due_in(wait));
        drop(queue);
        self.wakeup.notify_one();
    }

    /// Requeue after a storage failure, doubling `base` per consecutive failure.
    async fn requeue_failed(&self, order_id: String, base: Duration) -> Duration {
        let mut queue = self.queue.lock().await;
        let failures = queue.failures.entry(order_id.clone()).or_insert(0);
        *failures += 1;
        let wait = base
            .saturating_mul(1u32 << (*failures - 1).min(16))
            .min(MAX_STORE_BACKOFF);
        queue.push(order_id, due_in(wait));
        drop(queue);
        self.wakeup.notify_one();
        wait
    }

    async fn release(&self, order_id: &str) {
        let mut queue = self.queue.lock().await;
        queue.tracked.remove(order_id);
        queue.failures.remove(order_id);
    }

    /// Wait for the earliest order whose due time has passed.
    async fn next_due(&self) -> String {
        loop {
            let notified = self.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = self.queue.lock().await.pop_due(Instant::now());
            match next {
                Ok(order_id) => return order_id,
                Err(Some(at)) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {}
                        _ = &mut notified => {}
                    }
                }
                Err(None) => notified.await,
            }
        }
    }
}

/// Cloneable submission side of a running [`Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    /// Start reconciling `order_id` now.
    ///
    /// Returns `false` if the order is already queued or in a cycle.
    pub async fn submit(&self, order_id: impl Into<String>) -> bool {
        self.shared.track(order_id.into(), Instant::now()).await
    }

    /// Start reconciling `order_id` once `delay` has passed.
    pub async fn submit_after(&self, order_id: impl Into<String>, delay: Duration) -> bool {
        self.shared.track(order_id.into(), due_in(delay)).await
    }

    /// Orders currently queued or being cycled.
    pub async fn in_flight(&self) -> usize {
        self.shared.queue.lock().await.tracked.len()
    }

    pub async fn is_tracked(&self, order_id: &str) -> bool {
        self.shared.queue.lock().await.tracked.contains(order_id)
    }
}

/// Owns the reconciliation workers.
pub struct Scheduler {
    handle: SchedulerHandle,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn `workers` reconciliation workers.
    ///
    /// Cancelling `shutdown` (or calling [`Scheduler::shutdown`]) stops them
    /// at their next suspension point.
    pub fn start(reconciler: Arc<Reconciler>, workers: usize, shutdown: &CancellationToken) -> Self {
        let shared = Arc::new(Shared::default());
        let cancel = shutdown.child_token();
        let workers = (0..workers.max(1))
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    Arc::clone(&shared),
                    Arc::clone(&reconciler),
                    cancel.clone(),
                ))
            })
            .collect();

        Self {
            handle: SchedulerHandle { shared },
            cancel,
            workers,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Signal every worker and wait up to `grace` for them to stop.
    ///
    /// Returns `true` if all workers stopped in time; stragglers are aborted.
    pub async fn shutdown(self, grace: Duration) -> bool {
        self.cancel.cancel();
        let mut workers = self.workers;

        let drained = tokio::time::timeout(grace, futures::future::join_all(workers.iter_mut()))
            .await
            .is_ok();
        if !drained {
            tracing::warn!(
                grace_ms = grace.as_millis() as u64,
                "Reconciliation workers did not stop in time, aborting"
            );
            for worker in &workers {
                worker.abort();
            }
        }
        drained
    }
}

async fn worker_loop(
    id: usize,
    shared: Arc<Shared>,
    reconciler: Arc<Reconciler>,
    cancel: CancellationToken,
) {
    tracing::debug!(worker = id, "Reconciliation worker started");
    loop {
        let order_id = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            order_id = shared.next_due() => order_id,
        };

        match reconciler.run_cycle(&order_id, &cancel).await {
            Ok(CycleOutcome::RetryAfter(wait)) => {
                shared.requeue(order_id, wait).await;
            }
            Ok(CycleOutcome::Finished(_)) | Ok(CycleOutcome::Missing) => {
                shared.release(&order_id).await;
            }
            Err(ReconcileError::Cancelled) => break,
            Err(ReconcileError::Store(e)) => {
                let wait = shared
                    .requeue_failed(order_id.clone(), reconciler.policy().default_interval)
                    .await;
                tracing::error!(
                    worker = id,
                    order_id = %order_id,
                    error = %e,
                    retry_in_ms = wait.as_millis() as u64,
                    "Reconciliation cycle failed"
                );
            }
        }
    }
    tracing::debug!(worker = id, "Reconciliation worker stopped");
}

/// Queue every unfinished order in `store`, honouring its persisted
/// `next_retry_at`. Orders already tracked are skipped.
///
/// Returns the number of newly queued orders.
pub async fn recover_unfinished(
    store: &dyn OrderStore,
    scheduler: &SchedulerHandle,
) -> Result<usize, StoreError> {
    let now = Utc::now();
    let mut queued = 0;
    for order in store.unfinished_orders().await? {
        let delay = order
            .next_retry_at
            .and_then(|at| (at - now).to_std().ok())
            .unwrap_or(Duration::ZERO);
        if scheduler.submit_after(order.order_id, delay).await {
            queued += 1;
        }
    }
    Ok(queued)
}
