//! Phase barriers for parallel test execution
//!
//! Every phase up to and including the configured last-phase-to-sync
//! gets a countdown latch initialized to the number of active tests.
//! A runner counts down when it is ready to enter the phase and waits
//! for the latch to drain, so no test enters a synchronized phase
//! before every test has finished the previous one. Later phases get
//! zero-count latches and pass straight through.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;

use gridbench_core::phase::TestPhase;

/// A one-shot countdown latch
///
/// Waiters resume once the count reaches zero; counting below zero is
/// a no-op.
pub struct CountdownLatch {
    count: watch::Sender<usize>,
}

impl CountdownLatch {
    /// A latch with the given initial count
    pub fn new(count: usize) -> Self {
        Self {
            count: watch::Sender::new(count),
        }
    }

    /// Decrement the count, releasing waiters at zero
    pub fn count_down(&self) {
        self.count.send_modify(|count| {
            *count = count.saturating_sub(1);
        });
    }

    /// The current count
    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait until the count reaches zero
    pub async fn wait(&self) {
        let mut rx = self.count.subscribe();
        while *rx.borrow_and_update() > 0 {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// One latch per phase, shared by every runner of a suite
pub struct TestPhaseSyncMap {
    latches: BTreeMap<TestPhase, Arc<CountdownLatch>>,
}

impl TestPhaseSyncMap {
    /// Latches counted to `test_count` up to and including
    /// `last_phase_to_sync`, zero afterwards
    pub fn new(test_count: usize, last_phase_to_sync: Option<TestPhase>) -> Self {
        let mut latches = BTreeMap::new();
        let mut use_test_count = last_phase_to_sync.is_some();
        for phase in TestPhase::iter() {
            let count = if use_test_count { test_count } else { 0 };
            latches.insert(phase, Arc::new(CountdownLatch::new(count)));
            if Some(phase) == last_phase_to_sync {
                use_test_count = false;
            }
        }
        Self { latches }
    }

    /// A map whose every latch passes straight through (sequential mode)
    pub fn no_sync() -> Self {
        Self::new(0, None)
    }

    /// The latch guarding entry into a phase
    pub fn latch(&self, phase: TestPhase) -> Arc<CountdownLatch> {
        Arc::clone(self.latches.get(&phase).expect("latch for every phase"))
    }
}
