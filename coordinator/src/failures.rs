//! Failure aggregation on the coordinator
//!
//! Append-only log of every failure report the coordinator accepts,
//! plus the derived set of finished workers. Classification into
//! critical versus tolerable happens against the suite's tolerated
//! kinds at query time; records are never mutated after insertion.

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{error, info};

use gridbench_core::address::SimulatorAddress;
use gridbench_core::failure::{FailureKind, FailureOperation};

struct Inner {
    failures: Vec<FailureOperation>,
    finished_workers: BTreeSet<SimulatorAddress>,
    listeners: Vec<mpsc::UnboundedSender<FailureOperation>>,
}

/// Coordinator-side failure container
pub struct FailureContainer {
    inner: Mutex<Inner>,
    finished_changed: Notify,
}

impl FailureContainer {
    /// An empty container
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                failures: Vec::new(),
                finished_workers: BTreeSet::new(),
                listeners: Vec::new(),
            }),
            finished_changed: Notify::new(),
        }
    }

    /// Accept a failure report
    ///
    /// Terminal kinds grow the monotonic finished-workers set.
    /// Listener channels are only enqueued here; their consumers run on
    /// their own tasks, never under the container lock.
    pub fn add(&self, failure: FailureOperation) {
        let mut inner = self.inner.lock().expect("failure container lock");
        if failure.kind.is_terminal() {
            inner.finished_workers.insert(failure.worker_address);
        }

        if failure.kind.is_failure() {
            let number = inner.failures.iter().filter(|f| f.kind.is_failure()).count() + 1;
            error!("{}", failure.log_message(number));
        } else {
            info!(worker = %failure.worker_id, "Worker finished");
        }

        inner.failures.push(failure.clone());
        inner
            .listeners
            .retain(|listener| listener.send(failure.clone()).is_ok());
        drop(inner);

        self.finished_changed.notify_waiters();
    }

    /// Subscribe to every future insertion
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<FailureOperation> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .expect("failure container lock")
            .listeners
            .push(tx);
        rx
    }

    /// All reports accepted so far, including informational ones
    pub fn total_count(&self) -> usize {
        self.inner
            .lock()
            .expect("failure container lock")
            .failures
            .len()
    }

    /// Reports whose kind counts as a failure
    pub fn failure_count(&self) -> usize {
        self.inner
            .lock()
            .expect("failure container lock")
            .failures
            .iter()
            .filter(|failure| failure.kind.is_failure())
            .count()
    }

    /// Whether any accepted failure is critical under the given policy
    pub fn has_critical_failure(&self, tolerable: &BTreeSet<FailureKind>) -> bool {
        self.inner
            .lock()
            .expect("failure container lock")
            .failures
            .iter()
            .any(|failure| failure.kind.is_failure() && !tolerable.contains(&failure.kind))
    }

    /// Number of critical failures under the given policy
    pub fn critical_count(&self, tolerable: &BTreeSet<FailureKind>) -> usize {
        self.inner
            .lock()
            .expect("failure container lock")
            .failures
            .iter()
            .filter(|failure| failure.kind.is_failure() && !tolerable.contains(&failure.kind))
            .count()
    }

    /// Snapshot of the workers that reported any terminal kind
    pub fn finished_workers(&self) -> BTreeSet<SimulatorAddress> {
        self.inner
            .lock()
            .expect("failure container lock")
            .finished_workers
            .clone()
    }

    /// Wait until at least `expected_count` workers are finished
    ///
    /// Returns `false` when the timeout expires first.
    pub async fn wait_for_worker_shutdown(
        &self,
        expected_count: usize,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before the check so a concurrent insert
            // cannot slip between check and wait.
            let notified = self.finished_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.finished_count() >= expected_count {
                return true;
            }
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => return false,
            };
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return false;
            }
        }
    }

    fn finished_count(&self) -> usize {
        self.inner
            .lock()
            .expect("failure container lock")
            .finished_workers
            .len()
    }
}

impl Default for FailureContainer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(kind: FailureKind, worker: u32) -> FailureOperation {
        FailureOperation {
            message: "boom".into(),
            kind,
            worker_address: SimulatorAddress::worker(1, worker),
            agent_public_address: "10.0.0.1".into(),
            grid_address: None,
            worker_id: format!("worker-1-{worker}-member"),
            test_id: None,
            suite_id: "suite".into(),
            cause: None,
        }
    }

    #[test]
    fn test_counts_and_criticality() {
        let container = FailureContainer::new();
        container.add(failure(FailureKind::WorkerException, 1));
        container.add(failure(FailureKind::WorkerFinishedNormal, 2));

        assert_eq!(container.total_count(), 2);
        assert_eq!(container.failure_count(), 1);

        let tolerate_nothing = BTreeSet::new();
        assert!(container.has_critical_failure(&tolerate_nothing));
        assert_eq!(container.critical_count(&tolerate_nothing), 1);

        let tolerate_exceptions = BTreeSet::from([FailureKind::WorkerException]);
        assert!(!container.has_critical_failure(&tolerate_exceptions));
    }

    #[test]
    fn test_finished_workers_is_monotonic() {
        let container = FailureContainer::new();
        container.add(failure(FailureKind::WorkerException, 1));
        assert!(container.finished_workers().is_empty());

        container.add(failure(FailureKind::WorkerExit, 1));
        container.add(failure(FailureKind::WorkerFinishedNormal, 2));
        let finished = container.finished_workers();
        assert_eq!(finished.len(), 2);

        // Re-reporting the same worker does not shrink or grow the set.
        container.add(failure(FailureKind::WorkerOom, 1));
        assert_eq!(container.finished_workers(), finished);
    }

    #[tokio::test]
    async fn test_listener_sees_every_insert() {
        let container = FailureContainer::new();
        let mut rx = container.subscribe();

        container.add(failure(FailureKind::WorkerTimeout, 1));
        container.add(failure(FailureKind::WorkerExit, 2));

        assert_eq!(rx.recv().await.unwrap().kind, FailureKind::WorkerTimeout);
        assert_eq!(rx.recv().await.unwrap().kind, FailureKind::WorkerExit);
    }

    #[tokio::test]
    async fn test_wait_for_worker_shutdown_completes() {
        let container = std::sync::Arc::new(FailureContainer::new());

        let waiter = {
            let container = std::sync::Arc::clone(&container);
            tokio::spawn(async move {
                container
                    .wait_for_worker_shutdown(2, Duration::from_secs(5))
                    .await
            })
        };

        container.add(failure(FailureKind::WorkerFinishedNormal, 1));
        container.add(failure(FailureKind::WorkerFinishedNormal, 2));

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_for_worker_shutdown_times_out() {
        let container = FailureContainer::new();
        container.add(failure(FailureKind::WorkerFinishedNormal, 1));

        let done = container
            .wait_for_worker_shutdown(2, Duration::from_millis(50))
            .await;
        assert!(!done);
    }
}
