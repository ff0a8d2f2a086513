//! The coordinator's side of the message bus
//!
//! One TCP connection per agent. Outbound operations are queued FIFO
//! per agent and correlated with their responses by sequence number;
//! inbound operations (failures, phase completions, performance data)
//! are dispatched to the containers and acknowledged. When a worker
//! dies, pending operations addressed to it are completed with
//! `UNBLOCKED_BY_FAILURE` instead of hanging until their timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gridbench_core::address::SimulatorAddress;
use gridbench_core::operation::{LogLevel, Operation};
use gridbench_core::registry::{AgentData, ComponentRegistry};
use gridbench_core::response::{Response, ResponseType};
use gridbench_core::wire::{read_frame, write_frame, Envelope, Payload};

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::failures::FailureContainer;
use crate::listeners::TestPhaseListeners;
use crate::performance::PerformanceStatsContainer;

/// Outbound queue depth per agent connection
const OUTBOUND_BUFFER: usize = 256;

struct Pending {
    target: SimulatorAddress,
    tx: oneshot::Sender<Response>,
}

/// Coordinator connector: connection table plus pending-response table
///
/// Cheaply cloneable; clones share the same connections and pending
/// operations.
#[derive(Clone)]
pub struct CoordinatorConnector {
    channels: Arc<Mutex<HashMap<u32, mpsc::Sender<Envelope>>>>,
    pending: Arc<Mutex<HashMap<u64, Pending>>>,
    seq: Arc<AtomicU64>,
    failures: Arc<FailureContainer>,
    listeners: Arc<TestPhaseListeners>,
    performance: Arc<PerformanceStatsContainer>,
    cancel: CancellationToken,
}

impl CoordinatorConnector {
    /// Wire a connector to the coordinator's containers
    pub fn new(
        failures: Arc<FailureContainer>,
        listeners: Arc<TestPhaseListeners>,
        performance: Arc<PerformanceStatsContainer>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
            seq: Arc::new(AtomicU64::new(1)),
            failures,
            listeners,
            performance,
            cancel,
        })
    }

    /// Dial an agent's endpoint and attach the connection
    pub async fn connect(&self, agent: &AgentData, port: u16) -> CoordinatorResult<()> {
        let stream = TcpStream::connect((agent.public_address.as_str(), port))
            .await
            .map_err(|source| CoordinatorError::Connect {
                address: format!("{}:{port}", agent.public_address),
                source,
            })?;
        stream.set_nodelay(true).ok();
        self.attach(agent.address_index(), stream);
        info!(agent = %agent.address, address = %agent.public_address, "Connected to agent");
        Ok(())
    }

    /// Attach an established agent connection
    ///
    /// Generic over the stream so tests can attach in-memory pipes.
    pub fn attach<S>(&self, agent_index: u32, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(OUTBOUND_BUFFER);

        self.channels
            .lock()
            .expect("channels lock")
            .insert(agent_index, out_tx.clone());

        // Writer: FIFO per destination agent.
        let writer_cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => return,
                    envelope = out_rx.recv() => {
                        let Some(envelope) = envelope else { return };
                        if let Err(err) = write_frame(&mut write_half, &envelope).await {
                            warn!(agent_index, error = %err, "Write to agent failed");
                            return;
                        }
                    }
                }
            }
        });

        // Reader: demultiplex responses and upstream operations.
        let connector = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = connector.cancel.cancelled() => break,
                    frame = read_frame(&mut read_half) => {
                        match frame {
                            Ok(Some(envelope)) => connector.handle_inbound(envelope, &out_tx).await,
                            Ok(None) => break,
                            Err(err) => {
                                warn!(agent_index, error = %err, "Agent connection error");
                                break;
                            }
                        }
                    }
                }
            }
            connector.detach(agent_index);
        });
    }

    /// Whether an agent connection is currently attached
    pub fn is_connected(&self, agent_index: u32) -> bool {
        self.channels
            .lock()
            .expect("channels lock")
            .contains_key(&agent_index)
    }

    /// Send one operation and wait for its response
    ///
    /// The timeout turns into a `FAILURE_TIMEOUT` entry for the target
    /// rather than an error, so callers can merge partial broadcast
    /// results. Cancellation surfaces as [`CoordinatorError::Cancelled`].
    pub async fn send(
        &self,
        destination: SimulatorAddress,
        operation: Operation,
        timeout: Duration,
    ) -> CoordinatorResult<Response> {
        let agent_index = destination
            .agent_index()
            .ok_or(CoordinatorError::AgentNotFound(destination))?;
        let channel = self
            .channels
            .lock()
            .expect("channels lock")
            .get(&agent_index)
            .cloned()
            .ok_or_else(|| CoordinatorError::AgentNotFound(SimulatorAddress::agent(agent_index)))?;

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let (response_tx, response_rx) = oneshot::channel();
        self.pending.lock().expect("pending lock").insert(
            seq,
            Pending {
                target: destination,
                tx: response_tx,
            },
        );

        let envelope =
            Envelope::operation(seq, SimulatorAddress::coordinator(), destination, operation);
        if channel.send(envelope).await.is_err() {
            self.pending.lock().expect("pending lock").remove(&seq);
            return Err(CoordinatorError::AgentNotFound(SimulatorAddress::agent(
                agent_index,
            )));
        }

        tokio::select! {
            _ = self.cancel.cancelled() => {
                self.pending.lock().expect("pending lock").remove(&seq);
                Err(CoordinatorError::Cancelled)
            }
            outcome = tokio::time::timeout(timeout, response_rx) => match outcome {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(_)) => {
                    // Completer dropped without answering: connection lost.
                    Ok(Response::single(destination, ResponseType::FailureAgentNotFound))
                }
                Err(_) => {
                    self.pending.lock().expect("pending lock").remove(&seq);
                    debug!(%destination, "Operation timed out");
                    Ok(Response::single(destination, ResponseType::FailureTimeout))
                }
            }
        }
    }

    /// Complete every pending operation addressed to a dead worker
    pub fn unblock_worker(&self, worker: SimulatorAddress) {
        let unblocked: Vec<Pending> = {
            let mut pending = self.pending.lock().expect("pending lock");
            let seqs: Vec<u64> = pending
                .iter()
                .filter(|(_, entry)| {
                    entry.target == worker || entry.target.parent() == Some(worker)
                })
                .map(|(seq, _)| *seq)
                .collect();
            seqs.into_iter()
                .filter_map(|seq| pending.remove(&seq))
                .collect()
        };

        for entry in unblocked {
            debug!(worker = %worker, target = %entry.target, "Unblocking pending operation");
            let _ = entry.tx.send(Response::single(
                entry.target,
                ResponseType::UnblockedByFailure,
            ));
        }
    }

    /// Drop a lost connection and fail its in-flight operations
    fn detach(&self, agent_index: u32) {
        self.channels
            .lock()
            .expect("channels lock")
            .remove(&agent_index);

        let orphaned: Vec<Pending> = {
            let mut pending = self.pending.lock().expect("pending lock");
            let seqs: Vec<u64> = pending
                .iter()
                .filter(|(_, entry)| entry.target.agent_index() == Some(agent_index))
                .map(|(seq, _)| *seq)
                .collect();
            seqs.into_iter()
                .filter_map(|seq| pending.remove(&seq))
                .collect()
        };
        for entry in orphaned {
            let _ = entry.tx.send(Response::single(
                entry.target,
                ResponseType::FailureAgentNotFound,
            ));
        }
        debug!(agent_index, "Agent connection detached");
    }

    /// Dispatch one inbound envelope from an agent
    async fn handle_inbound(&self, envelope: Envelope, reply_tx: &mpsc::Sender<Envelope>) {
        match envelope.payload {
            Payload::Response { response } => {
                let entry = self.pending.lock().expect("pending lock").remove(&envelope.seq);
                match entry {
                    Some(pending) => {
                        let _ = pending.tx.send(response);
                    }
                    None => debug!(seq = envelope.seq, "Response for expired operation"),
                }
            }

            Payload::Operation { operation } => {
                let response_type = match operation {
                    Operation::Failure { failure } => {
                        self.failures.add(failure);
                        ResponseType::Success
                    }
                    Operation::PhaseCompleted { test_index, phase } => {
                        self.listeners.notify(test_index, envelope.source, phase);
                        ResponseType::Success
                    }
                    Operation::PerformanceSample { sample } => {
                        self.performance.update(envelope.source, sample);
                        ResponseType::Success
                    }
                    Operation::BenchmarkResults { report } => {
                        self.performance.store_report(envelope.source, report);
                        ResponseType::Success
                    }
                    Operation::Log { level, ref message } => {
                        match level {
                            LogLevel::Info => info!(source = %envelope.source, "{message}"),
                            LogLevel::Warn => warn!(source = %envelope.source, "{message}"),
                            LogLevel::Error => {
                                tracing::error!(source = %envelope.source, "{message}")
                            }
                        }
                        ResponseType::Success
                    }
                    other => {
                        warn!(op = other.tag(), "Operation not executable on the coordinator");
                        ResponseType::ExceptionDuringOperationExecution
                    }
                };

                let ack = Envelope::response(
                    envelope.seq,
                    SimulatorAddress::coordinator(),
                    envelope.source,
                    Response::single(SimulatorAddress::coordinator(), response_type),
                );
                let _ = reply_tx.send(ack).await;
            }
        }
    }
}

/// React to terminal failures: drop the worker from the registry and
/// unblock anything still waiting on it
pub fn spawn_failure_dispatcher(
    failures: &Arc<FailureContainer>,
    connector: Arc<CoordinatorConnector>,
    registry: Arc<ComponentRegistry>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut inserts = failures.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                failure = inserts.recv() => {
                    let Some(failure) = failure else { return };
                    if failure.kind.is_terminal() {
                        registry.remove_worker(failure.worker_address);
                        connector.unblock_worker(failure.worker_address);
                    }
                }
            }
        }
    })
}
