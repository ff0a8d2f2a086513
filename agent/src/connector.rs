//! The agent's network endpoint
//!
//! One TCP endpoint per agent. The coordinator dials in; operations
//! addressed to the agent are executed locally, operations addressed to
//! a worker are forwarded over the worker's stdin pipe, and everything
//! workers emit (responses, phase completions, failures, samples) is
//! pumped back upstream on the same connection.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use gridbench_core::address::{AddressLevel, SimulatorAddress};
use gridbench_core::failure::FailureOperation;
use gridbench_core::operation::{LogLevel, Operation};
use gridbench_core::response::{Response, ResponseType};
use gridbench_core::wire::{read_frame, write_frame, Envelope, Payload};

use crate::error::AgentResult;
use crate::monitor::{FailureSink, MonitorConfig, WorkerProcessFailureMonitor};
use crate::process::{termination_envelope, WorkerLaunchConfig, WorkerProcessManager};

/// How long an agent-originated operation waits for its ack
const UPSTREAM_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffered envelopes waiting for the coordinator connection
const UPSTREAM_BUFFER: usize = 1024;

/// Agent daemon configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Interface the TCP endpoint binds to
    pub bind_address: String,
    /// Port the TCP endpoint binds to
    pub port: u16,
    /// This agent's 1-based index from the agents file
    pub address_index: u32,
    /// Address the coordinator reaches this agent on
    pub public_address: String,
    /// Root directory for per-suite worker homes
    pub workers_dir: PathBuf,
    /// Binary forked for worker processes
    pub worker_program: PathBuf,
    /// Worker inactivity threshold; `0` disables timeout detection
    pub last_seen_timeout_seconds: u64,
}

/// Shared handle for sending agent-originated operations upstream
///
/// Envelopes are queued while the coordinator is away; the ack timeout
/// turns an absent coordinator into a failed delivery rather than a
/// hang.
#[derive(Clone)]
pub struct UpstreamSender {
    agent_address: SimulatorAddress,
    tx: mpsc::Sender<Envelope>,
    seq: Arc<AtomicU64>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>,
}

impl UpstreamSender {
    fn new(agent_address: SimulatorAddress, tx: mpsc::Sender<Envelope>) -> Self {
        Self {
            agent_address,
            tx,
            seq: Arc::new(AtomicU64::new(1)),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Reserve the next sequence number
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue an envelope without waiting for a response
    pub async fn forward(&self, envelope: Envelope) -> bool {
        self.tx.send(envelope).await.is_ok()
    }

    /// Send an operation to the coordinator and wait for its ack
    pub async fn send_operation(&self, operation: Operation) -> Option<Response> {
        let seq = self.next_seq();
        let (response_tx, response_rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock")
            .insert(seq, response_tx);

        let envelope = Envelope::operation(
            seq,
            self.agent_address,
            SimulatorAddress::coordinator(),
            operation,
        );
        if self.tx.send(envelope).await.is_err() {
            self.pending.lock().expect("pending lock").remove(&seq);
            return None;
        }

        match tokio::time::timeout(UPSTREAM_ACK_TIMEOUT, response_rx).await {
            Ok(Ok(response)) => Some(response),
            _ => {
                self.pending.lock().expect("pending lock").remove(&seq);
                None
            }
        }
    }

    /// Route an envelope a worker emitted
    ///
    /// Responses addressed to this agent complete the local pending
    /// table; everything else is forwarded to the coordinator. Returns
    /// `false` once the upstream queue is gone.
    pub async fn route_from_worker(&self, envelope: Envelope) -> bool {
        if envelope.destination == self.agent_address {
            return match envelope.payload {
                Payload::Response { response } => {
                    self.complete(envelope.seq, response);
                    true
                }
                // Workers have no operations for their own agent.
                Payload::Operation { .. } => true,
            };
        }
        self.forward(envelope).await
    }

    /// Complete a pending operation with the coordinator's response
    fn complete(&self, seq: u64, response: Response) {
        let entry = self.pending.lock().expect("pending lock").remove(&seq);
        match entry {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!(seq, "Response for unknown or expired operation"),
        }
    }
}

#[async_trait]
impl FailureSink for UpstreamSender {
    async fn publish(&self, failure: FailureOperation) -> bool {
        match self.send_operation(Operation::Failure { failure }).await {
            Some(response) => response.is_success(),
            None => false,
        }
    }
}

/// The agent daemon: endpoint, process manager, failure monitor
pub struct Agent {
    config: AgentConfig,
    address: SimulatorAddress,
    manager: Arc<WorkerProcessManager>,
    monitor: Arc<WorkerProcessFailureMonitor>,
    upstream: UpstreamSender,
    upstream_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Envelope>>>,
    suite_id: Arc<Mutex<Option<String>>>,
}

impl Agent {
    /// Wire up the agent's components; call [`run`](Self::run) to serve
    pub fn new(config: AgentConfig) -> Arc<Self> {
        let address = SimulatorAddress::agent(config.address_index);
        let (upstream_tx, upstream_rx) = mpsc::channel(UPSTREAM_BUFFER);
        let upstream = UpstreamSender::new(address, upstream_tx);

        let manager = Arc::new(WorkerProcessManager::new(
            address,
            WorkerLaunchConfig {
                program: config.worker_program.clone(),
                workers_dir: config.workers_dir.clone(),
            },
        ));

        let suite_id = Arc::new(Mutex::new(None));
        let sink: Arc<dyn FailureSink> = Arc::new(upstream.clone());
        let monitor = Arc::new(WorkerProcessFailureMonitor::new(
            Arc::clone(&manager),
            sink,
            config.public_address.clone(),
            Arc::clone(&suite_id),
            MonitorConfig {
                last_seen_timeout_seconds: config.last_seen_timeout_seconds,
                check_interval: Duration::from_secs(1),
            },
        ));

        Arc::new(Self {
            config,
            address,
            manager,
            monitor,
            upstream,
            upstream_rx: Arc::new(tokio::sync::Mutex::new(upstream_rx)),
            suite_id,
        })
    }

    /// This agent's simulator address
    pub fn address(&self) -> SimulatorAddress {
        self.address
    }

    /// The worker process manager
    pub fn manager(&self) -> &Arc<WorkerProcessManager> {
        &self.manager
    }

    /// The failure monitor
    pub fn monitor(&self) -> &Arc<WorkerProcessFailureMonitor> {
        &self.monitor
    }

    /// Bind the endpoint and serve coordinator connections until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> AgentResult<()> {
        let listener =
            TcpListener::bind((self.config.bind_address.as_str(), self.config.port)).await?;
        info!(
            address = %self.address,
            bind = %format!("{}:{}", self.config.bind_address, self.config.port),
            "Agent listening"
        );

        self.monitor.start();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    info!(%peer, "Coordinator connected");
                    // One coordinator at a time; the next run reconnects.
                    self.handle_connection(stream, cancel.clone()).await;
                    info!(%peer, "Coordinator connection closed");
                }
            }
        }

        self.monitor.shutdown().await;
        info!("Agent stopped");
        Ok(())
    }

    /// Serve one coordinator connection until it closes
    ///
    /// Generic over the stream so tests can drive it with in-memory
    /// pipes.
    pub async fn handle_connection<S>(&self, stream: S, cancel: CancellationToken)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let connection_done = CancellationToken::new();

        let writer = {
            let upstream_rx = Arc::clone(&self.upstream_rx);
            let done = connection_done.clone();
            tokio::spawn(async move {
                let mut upstream_rx = upstream_rx.lock().await;
                loop {
                    tokio::select! {
                        _ = done.cancelled() => return,
                        envelope = upstream_rx.recv() => {
                            let Some(envelope) = envelope else { return };
                            if let Err(err) = write_frame(&mut write_half, &envelope).await {
                                warn!(error = %err, "Could not write to coordinator");
                                return;
                            }
                        }
                    }
                }
            })
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = read_frame(&mut read_half) => {
                    match frame {
                        Ok(Some(envelope)) => self.route(envelope).await,
                        Ok(None) => break,
                        Err(err) => {
                            warn!(error = %err, "Coordinator connection error");
                            break;
                        }
                    }
                }
            }
        }

        connection_done.cancel();
        let _ = writer.await;
    }

    /// Dispatch one inbound envelope from the coordinator
    async fn route(&self, envelope: Envelope) {
        match &envelope.payload {
            Payload::Response { response } => {
                if envelope.destination.level() == AddressLevel::Agent {
                    self.upstream.complete(envelope.seq, response.clone());
                }
                // Acks for worker fire-and-forget reports need no routing.
            }
            Payload::Operation { operation } => match envelope.destination.level() {
                AddressLevel::Agent => {
                    let response = self.execute(operation).await;
                    let reply =
                        Envelope::response(envelope.seq, self.address, envelope.source, response);
                    if !self.upstream.forward(reply).await {
                        warn!("Upstream queue closed while answering the coordinator");
                    }
                }
                AddressLevel::Worker | AddressLevel::Test => {
                    self.forward_to_worker(envelope.clone()).await;
                }
                AddressLevel::Coordinator => {
                    warn!(op = operation.tag(), "Misrouted operation");
                }
            },
        }
    }

    /// Execute an agent-level operation
    async fn execute(&self, operation: &Operation) -> Response {
        let ok = |response_type| Response::single(self.address, response_type);
        match operation {
            Operation::InitTestSuite { suite } => {
                info!(suite = %suite.id, tests = suite.size(), "Initializing test suite");
                let suite_dir = self.config.workers_dir.join(&suite.id);
                if let Err(err) = tokio::fs::create_dir_all(&suite_dir).await {
                    error!(error = %err, "Could not create suite workers directory");
                    return ok(ResponseType::ExceptionDuringOperationExecution);
                }
                *self.suite_id.lock().expect("suite id lock") = Some(suite.id.clone());
                ok(ResponseType::Success)
            }

            Operation::CreateWorkers { settings } => {
                let suite_id = self.suite_id.lock().expect("suite id lock").clone();
                let Some(suite_id) = suite_id else {
                    error!("CreateWorkers before InitTestSuite");
                    return ok(ResponseType::ExceptionDuringOperationExecution);
                };

                let mut response = Response::new();
                for setting in settings {
                    match self
                        .manager
                        .launch(setting, &suite_id, self.upstream.clone())
                        .await
                    {
                        Ok(worker) => response.add(worker.address(), ResponseType::Success),
                        Err(err) => {
                            error!(error = %err, "Worker launch failed");
                            response
                                .add(self.address, ResponseType::ExceptionDuringOperationExecution);
                        }
                    }
                }
                response
            }

            Operation::TerminateWorkers => {
                self.monitor.stop_timeout_detection();
                let workers = self.manager.worker_processes();
                info!(count = workers.len(), "Terminating workers");
                for worker in workers {
                    let envelope = termination_envelope(
                        self.upstream.next_seq(),
                        self.address,
                        worker.address(),
                    );
                    if let Err(err) = worker.request_termination(&envelope).await {
                        debug!(worker = worker.id(), error = %err, "Termination write failed");
                    }
                    let manager = Arc::clone(&self.manager);
                    tokio::spawn(async move {
                        manager.shutdown(&worker).await;
                    });
                }
                ok(ResponseType::Success)
            }

            Operation::StartTimeoutDetection => {
                self.monitor.start_timeout_detection();
                ok(ResponseType::Success)
            }

            Operation::StopTimeoutDetection => {
                self.monitor.stop_timeout_detection();
                ok(ResponseType::Success)
            }

            Operation::Log { level, message } => {
                match level {
                    LogLevel::Info => info!("{message}"),
                    LogLevel::Warn => warn!("{message}"),
                    LogLevel::Error => error!("{message}"),
                }
                ok(ResponseType::Success)
            }

            Operation::Ping => ok(ResponseType::Success),

            other => {
                warn!(op = other.tag(), "Operation not executable on an agent");
                ok(ResponseType::ExceptionDuringOperationExecution)
            }
        }
    }

    /// Forward a worker-addressed envelope over the worker's stdin
    ///
    /// A worker that is not in the process table answers
    /// `FAILURE_WORKER_NOT_FOUND` on its behalf; the coordinator treats
    /// absence as completion where its policy allows.
    async fn forward_to_worker(&self, envelope: Envelope) {
        let worker = envelope
            .destination
            .worker_index()
            .and_then(|index| self.manager.get(index));

        match worker {
            Some(worker) => {
                worker.touch();
                if let Err(err) = worker.send(&envelope).await {
                    warn!(worker = worker.id(), error = %err, "Could not reach worker");
                    self.answer_worker_not_found(envelope).await;
                }
            }
            None => self.answer_worker_not_found(envelope).await,
        }
    }

    async fn answer_worker_not_found(&self, envelope: Envelope) {
        let reply = Envelope::response(
            envelope.seq,
            self.address,
            envelope.source,
            Response::single(envelope.destination, ResponseType::FailureWorkerNotFound),
        );
        let _ = self.upstream.forward(reply).await;
    }
}
