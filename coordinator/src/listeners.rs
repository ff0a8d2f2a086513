//! Phase-completion demultiplexing
//!
//! Workers report phase completions asynchronously; the connector
//! demultiplexes them by test index into the channel registered by the
//! test's runner.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;

use gridbench_core::address::SimulatorAddress;
use gridbench_core::phase::TestPhase;

/// One phase completion from one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseCompletion {
    /// The worker that completed the phase
    pub worker: SimulatorAddress,
    /// The completed phase
    pub phase: TestPhase,
}

/// Registry mapping test index to its runner's completion channel
#[derive(Default)]
pub struct TestPhaseListeners {
    listeners: Mutex<HashMap<u32, mpsc::UnboundedSender<PhaseCompletion>>>,
}

impl TestPhaseListeners {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for a test, replacing any previous one
    pub fn register(&self, test_index: u32) -> mpsc::UnboundedReceiver<PhaseCompletion> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .expect("listeners lock")
            .insert(test_index, tx);
        rx
    }

    /// Drop a test's listener
    pub fn unregister(&self, test_index: u32) {
        self.listeners
            .lock()
            .expect("listeners lock")
            .remove(&test_index);
    }

    /// Route one completion to the test's listener, if registered
    pub fn notify(&self, test_index: u32, worker: SimulatorAddress, phase: TestPhase) {
        let listeners = self.listeners.lock().expect("listeners lock");
        match listeners.get(&test_index) {
            Some(listener) => {
                let _ = listener.send(PhaseCompletion { worker, phase });
            }
            None => debug!(test_index, %phase, "Phase report for unknown test"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completions_demuxed_by_test_index() {
        let listeners = TestPhaseListeners::new();
        let mut first = listeners.register(1);
        let mut second = listeners.register(2);

        listeners.notify(1, SimulatorAddress::worker(1, 1), TestPhase::Setup);
        listeners.notify(2, SimulatorAddress::worker(1, 2), TestPhase::Run);

        let completion = first.recv().await.unwrap();
        assert_eq!(completion.worker, SimulatorAddress::worker(1, 1));
        assert_eq!(completion.phase, TestPhase::Setup);

        let completion = second.recv().await.unwrap();
        assert_eq!(completion.phase, TestPhase::Run);
    }

    #[tokio::test]
    async fn test_unknown_test_is_dropped() {
        let listeners = TestPhaseListeners::new();
        // No listener registered; must not panic.
        listeners.notify(9, SimulatorAddress::worker(1, 1), TestPhase::Setup);
    }

    #[tokio::test]
    async fn test_unregister_closes_the_channel() {
        let listeners = TestPhaseListeners::new();
        let mut rx = listeners.register(1);
        listeners.unregister(1);
        assert!(rx.recv().await.is_none());
    }
}
