//! Scripted in-memory agent for exercising the coordinator stack
//!
//! Speaks the real wire protocol over a duplex pipe: acknowledges
//! operations, reports launched workers, and (optionally) emits the
//! phase completions a live worker would send.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::DuplexStream;
use tracing::debug;

use gridbench_core::address::{AddressLevel, SimulatorAddress};
use gridbench_core::operation::Operation;
use gridbench_core::phase::TestPhase;
use gridbench_core::response::{Response, ResponseType};
use gridbench_core::wire::{read_frame, write_frame, Envelope, Payload};

/// Behavior knobs for a fake agent
#[derive(Clone, Default)]
pub(crate) struct FakeAgentBehavior {
    /// Emit `PhaseCompleted` after acknowledging each `StartPhase`
    pub auto_complete_phases: bool,
    /// Answer `StartPhase` of this phase with the given response type
    pub fail_phase: Option<(TestPhase, ResponseType)>,
    /// Never answer operations with these tags (provokes timeouts)
    pub silent_ops: HashSet<&'static str>,
    /// Worker addresses reported by `CreateWorkers`
    pub workers: Vec<SimulatorAddress>,
}

/// A record of everything the fake agent received
#[derive(Default)]
pub(crate) struct FakeAgentLog {
    entries: Mutex<Vec<(SimulatorAddress, String)>>,
}

impl FakeAgentLog {
    pub(crate) fn record(&self, destination: SimulatorAddress, tag: &str) {
        self.entries
            .lock()
            .unwrap()
            .push((destination, tag.to_string()));
    }

    /// Tags in arrival order
    pub(crate) fn tags(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(_, tag)| tag.clone())
            .collect()
    }

    /// `(destination, tag)` pairs in arrival order
    pub(crate) fn destinations(&self) -> Vec<(SimulatorAddress, String)> {
        self.entries.lock().unwrap().clone()
    }

    pub(crate) fn count_of(&self, tag: &str) -> usize {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, t)| t == tag)
            .count()
    }
}

/// Serve one fake agent on a duplex stream
pub(crate) fn spawn_fake_agent(
    stream: DuplexStream,
    agent_index: u32,
    behavior: FakeAgentBehavior,
) -> Arc<FakeAgentLog> {
    let log = Arc::new(FakeAgentLog::default());
    let log_task = Arc::clone(&log);
    let own_seq = AtomicU64::new(1_000_000);

    tokio::spawn(async move {
        let agent_address = SimulatorAddress::agent(agent_index);
        let (mut read_half, mut write_half) = tokio::io::split(stream);

        while let Ok(Some(envelope)) = read_frame(&mut read_half).await {
            let Payload::Operation { ref operation } = envelope.payload else {
                // Acks for our own emitted operations.
                continue;
            };
            let tag = match operation {
                Operation::StartPhase {
                    test_index, phase, ..
                } => format!("startPhase:{phase}:t{test_index}"),
                other => other.tag().to_string(),
            };
            log_task.record(envelope.destination, &tag);

            if behavior.silent_ops.contains(operation.tag()) {
                debug!(op = operation.tag(), "Fake agent staying silent");
                continue;
            }

            let response = match operation {
                Operation::CreateWorkers { .. } => {
                    let mut response = Response::new();
                    for worker in &behavior.workers {
                        response.add(*worker, ResponseType::Success);
                    }
                    response
                }
                Operation::StartPhase {
                    test_index, phase, ..
                } => {
                    let target = envelope.destination;
                    let response_type = match behavior.fail_phase {
                        Some((failing, outcome)) if failing == *phase => outcome,
                        _ => ResponseType::Success,
                    };
                    if response_type == ResponseType::Success && behavior.auto_complete_phases {
                        let completion = Envelope::operation(
                            own_seq.fetch_add(1, Ordering::Relaxed),
                            target,
                            SimulatorAddress::coordinator(),
                            Operation::PhaseCompleted {
                                test_index: *test_index,
                                phase: *phase,
                            },
                        );
                        if write_frame(&mut write_half, &completion).await.is_err() {
                            return;
                        }
                    }
                    Response::single(target, response_type)
                }
                _ => {
                    let target = match envelope.destination.level() {
                        AddressLevel::Agent => agent_address,
                        _ => envelope.destination,
                    };
                    Response::single(target, ResponseType::Success)
                }
            };

            let reply = Envelope::response(
                envelope.seq,
                agent_address,
                SimulatorAddress::coordinator(),
                response,
            );
            if write_frame(&mut write_half, &reply).await.is_err() {
                return;
            }
        }
    });

    log
}
