//! The worker message loop
//!
//! Reads operation envelopes from the agent on stdin (one JSON document
//! per line), executes them, and answers on stdout. Phase bodies run on
//! their own tasks so the loop keeps serving `StopRun` and termination
//! while a RUN phase is in flight.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use gridbench_core::address::SimulatorAddress;
use gridbench_core::operation::{LogLevel, Operation};
use gridbench_core::phase::TestPhase;
use gridbench_core::response::{Response, ResponseType};
use gridbench_core::wire::{decode_line, encode_line, Envelope, Payload};

use crate::error::{WorkerError, WorkerResult};
use crate::workload::{TestContext, Workload, WorkloadRegistry};

/// How often a running test streams performance samples upstream
const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Identity and environment of one worker process
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// This worker's simulator address
    pub address: SimulatorAddress,
    /// Directory for artifact files (`*.exception`, `worker.oome`)
    pub home: PathBuf,
    /// Interval between performance samples during RUN
    pub sample_interval: Duration,
}

impl WorkerConfig {
    /// Config with the default sample interval
    pub fn new(address: SimulatorAddress, home: PathBuf) -> Self {
        Self {
            address,
            home,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
        }
    }
}

struct ActiveTest {
    context: Arc<TestContext>,
    workload: Arc<dyn Workload>,
}

struct RuntimeState {
    config: WorkerConfig,
    out_tx: mpsc::Sender<Envelope>,
    seq: AtomicU64,
    tests: Mutex<HashMap<u32, ActiveTest>>,
    exception_seq: AtomicU64,
}

impl RuntimeState {
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    async fn send_operation(&self, operation: Operation) -> WorkerResult<()> {
        let envelope = Envelope::operation(
            self.next_seq(),
            self.config.address,
            SimulatorAddress::coordinator(),
            operation,
        );
        self.out_tx
            .send(envelope)
            .await
            .map_err(|_| WorkerError::OutboundClosed)
    }

    async fn send_response(
        &self,
        seq: u64,
        destination: SimulatorAddress,
        response_type: ResponseType,
    ) -> WorkerResult<()> {
        let envelope = Envelope::response(
            seq,
            self.config.address,
            destination,
            Response::single(self.config.address, response_type),
        );
        self.out_tx
            .send(envelope)
            .await
            .map_err(|_| WorkerError::OutboundClosed)
    }

    /// Drop an exception artifact for the agent's failure monitor
    async fn write_exception_artifact(&self, test_id: &str, cause: &str) {
        let number = self.exception_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let path = self.config.home.join(format!("{number}.exception"));
        let test_line = if test_id.is_empty() { "null" } else { test_id };
        let content = format!("{test_line}\n{cause}");
        if let Err(err) = tokio::fs::write(&path, content).await {
            error!(path = %path.display(), error = %err, "Could not write exception artifact");
        }
    }
}

/// The worker process runtime
pub struct WorkerRuntime {
    config: WorkerConfig,
    registry: WorkloadRegistry,
}

impl WorkerRuntime {
    /// Create a runtime with the built-in workload registry
    pub fn new(config: WorkerConfig) -> Self {
        Self::with_registry(config, WorkloadRegistry::builtin())
    }

    /// Create a runtime with a custom workload registry
    pub fn with_registry(config: WorkerConfig, registry: WorkloadRegistry) -> Self {
        Self { config, registry }
    }

    /// Serve the agent over stdin/stdout until terminated
    pub async fn run(self) -> WorkerResult<()> {
        let stdin = tokio::io::stdin();
        let stdout = tokio::io::stdout();
        self.run_with(stdin, stdout).await
    }

    /// Serve over arbitrary streams; exposed for in-memory harnesses
    pub async fn run_with<R, W>(self, reader: R, writer: W) -> WorkerResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (out_tx, out_rx) = mpsc::channel::<Envelope>(256);
        let writer_task = tokio::spawn(pump_outbound(out_rx, writer));

        let state = Arc::new(RuntimeState {
            config: self.config.clone(),
            out_tx,
            seq: AtomicU64::new(1),
            tests: Mutex::new(HashMap::new()),
            exception_seq: AtomicU64::new(0),
        });

        info!(address = %self.config.address, home = %self.config.home.display(), "Worker started");

        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            let envelope = match decode_line(&line) {
                Ok(Some(envelope)) => envelope,
                Ok(None) => continue,
                Err(err) => {
                    warn!(error = %err, "Dropping undecodable inbound line");
                    continue;
                }
            };

            match envelope.payload {
                Payload::Response { .. } => {
                    // Acks for our fire-and-forget reports; nothing to do.
                    continue;
                }
                Payload::Operation { operation } => {
                    let terminate = matches!(operation, Operation::TerminateWorkers);
                    let response_type =
                        handle_operation(&state, &self.registry, &operation).await;
                    state
                        .send_response(envelope.seq, envelope.source, response_type)
                        .await?;
                    if terminate {
                        info!("Worker received termination request");
                        break;
                    }
                }
            }
        }

        // Stop every workload so in-flight phase tasks wind down.
        {
            let tests = state.tests.lock().expect("tests lock");
            for test in tests.values() {
                test.context.stop();
            }
        }

        drop(state);
        let _ = writer_task.await;
        info!("Worker stopped");
        Ok(())
    }
}

async fn pump_outbound<W>(mut out_rx: mpsc::Receiver<Envelope>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = out_rx.recv().await {
        let line = match encode_line(&envelope) {
            Ok(line) => line,
            Err(err) => {
                error!(error = %err, "Could not encode outbound envelope");
                continue;
            }
        };
        if writer.write_all(line.as_bytes()).await.is_err() {
            return;
        }
        if writer.flush().await.is_err() {
            return;
        }
    }
}

async fn handle_operation(
    state: &Arc<RuntimeState>,
    registry: &WorkloadRegistry,
    operation: &Operation,
) -> ResponseType {
    match operation {
        Operation::InitTest { test_index, case } => match registry.create(case) {
            Ok(workload) => {
                let context = Arc::new(TestContext::new(case.id.clone(), *test_index));
                let mut tests = state.tests.lock().expect("tests lock");
                tests.insert(
                    *test_index,
                    ActiveTest { context, workload },
                );
                info!(test = %case.id, test_index, "Initialized test");
                ResponseType::Success
            }
            Err(err) => {
                error!(test = %case.id, error = %err, "Could not construct workload");
                ResponseType::ExceptionDuringOperationExecution
            }
        },

        Operation::StartPhase {
            test_id,
            test_index,
            phase,
        } => {
            let entry = {
                let tests = state.tests.lock().expect("tests lock");
                tests
                    .get(test_index)
                    .map(|test| (Arc::clone(&test.context), Arc::clone(&test.workload)))
            };
            match entry {
                Some((context, workload)) => {
                    spawn_phase(state, context, workload, test_id.clone(), *test_index, *phase);
                    ResponseType::Success
                }
                None => {
                    error!(test = %test_id, "StartPhase for unknown test");
                    ResponseType::ExceptionDuringOperationExecution
                }
            }
        }

        Operation::StopRun {
            test_id,
            test_index,
        } => {
            let tests = state.tests.lock().expect("tests lock");
            match tests.get(test_index) {
                Some(test) => {
                    debug!(test = %test_id, "Stopping run");
                    test.context.stop();
                    ResponseType::Success
                }
                None => ResponseType::ExceptionDuringOperationExecution,
            }
        }

        Operation::GetBenchmarkResults {
            test_id,
            test_index,
        } => {
            let report = {
                let tests = state.tests.lock().expect("tests lock");
                tests
                    .get(test_index)
                    .map(|test| test.context.tracker().benchmark_report(*test_index))
            };
            match report {
                Some(report) => {
                    if state
                        .send_operation(Operation::BenchmarkResults { report })
                        .await
                        .is_err()
                    {
                        return ResponseType::ExceptionDuringOperationExecution;
                    }
                    ResponseType::Success
                }
                None => {
                    warn!(test = %test_id, "Benchmark results requested for unknown test");
                    ResponseType::ExceptionDuringOperationExecution
                }
            }
        }

        Operation::TerminateWorkers => ResponseType::Success,

        Operation::Log { level, message } => {
            match level {
                LogLevel::Info => info!("{message}"),
                LogLevel::Warn => warn!("{message}"),
                LogLevel::Error => error!("{message}"),
            }
            ResponseType::Success
        }

        Operation::Ping => ResponseType::Success,

        other => {
            warn!(op = other.tag(), "Operation not executable on a worker");
            ResponseType::ExceptionDuringOperationExecution
        }
    }
}

/// Run one phase on its own task and report completion upstream
fn spawn_phase(
    state: &Arc<RuntimeState>,
    context: Arc<TestContext>,
    workload: Arc<dyn Workload>,
    test_id: String,
    test_index: u32,
    phase: TestPhase,
) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        debug!(test = %test_id, %phase, "Phase started");

        let sampler = (phase == TestPhase::Run).then(|| {
            let done = CancellationToken::new();
            let handle = tokio::spawn(stream_samples(
                Arc::clone(&state),
                Arc::clone(&context),
                test_index,
                done.clone(),
            ));
            (done, handle)
        });

        let result = execute_phase(&workload, &context, phase).await;

        if let Some((done, handle)) = sampler {
            done.cancel();
            let _ = handle.await;
        }

        match &result {
            Ok(()) => debug!(test = %test_id, %phase, "Phase completed"),
            Err(err) => {
                error!(test = %test_id, %phase, error = %err, "Phase failed");
                state
                    .write_exception_artifact(&test_id, &format!("{phase}: {err}"))
                    .await;
            }
        }

        if phase == TestPhase::LocalTeardown {
            let mut tests = state.tests.lock().expect("tests lock");
            tests.remove(&test_index);
        }

        if let Err(err) = state
            .send_operation(Operation::PhaseCompleted { test_index, phase })
            .await
        {
            warn!(error = %err, "Could not report phase completion");
        }
    });
}

async fn execute_phase(
    workload: &Arc<dyn Workload>,
    context: &Arc<TestContext>,
    phase: TestPhase,
) -> Result<(), crate::workload::WorkloadError> {
    match phase {
        TestPhase::Setup => workload.setup(context).await,
        TestPhase::LocalWarmup => workload.warmup(context, false).await,
        TestPhase::GlobalWarmup => workload.warmup(context, true).await,
        TestPhase::Run => {
            context.tracker().mark_run_started();
            let result = workload.run(context).await;
            context.tracker().mark_run_stopped();
            result
        }
        TestPhase::GlobalVerify => workload.verify(context, true).await,
        TestPhase::LocalVerify => workload.verify(context, false).await,
        TestPhase::GlobalTeardown => workload.teardown(context, true).await,
        TestPhase::LocalTeardown => workload.teardown(context, false).await,
    }
}

async fn stream_samples(
    state: Arc<RuntimeState>,
    context: Arc<TestContext>,
    test_index: u32,
    done: CancellationToken,
) {
    let mut ticker = tokio::time::interval(state.config.sample_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = done.cancelled() => return,
            _ = ticker.tick() => {
                let sample = context.tracker().interval_sample(test_index);
                if state
                    .send_operation(Operation::PerformanceSample { sample })
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridbench_core::suite::TestCase;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    struct Harness {
        to_worker: tokio::io::WriteHalf<tokio::io::DuplexStream>,
        lines: tokio::io::Lines<BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>>,
        runtime: tokio::task::JoinHandle<WorkerResult<()>>,
        seq: u64,
        home: tempfile::TempDir,
    }

    impl Harness {
        fn spawn() -> Self {
            let home = tempfile::tempdir().expect("tempdir");
            let config = WorkerConfig {
                address: SimulatorAddress::worker(1, 1),
                home: home.path().to_path_buf(),
                sample_interval: Duration::from_millis(20),
            };

            let (agent_side, worker_side) = tokio::io::duplex(64 * 1024);
            let (worker_read, worker_write) = tokio::io::split(worker_side);
            let (agent_read, agent_write) = tokio::io::split(agent_side);

            let runtime = tokio::spawn(
                WorkerRuntime::new(config).run_with(worker_read, worker_write),
            );

            Self {
                to_worker: agent_write,
                lines: BufReader::new(agent_read).lines(),
                runtime,
                seq: 0,
                home,
            }
        }

        async fn send(&mut self, operation: Operation) -> u64 {
            self.seq += 1;
            let envelope = Envelope::operation(
                self.seq,
                SimulatorAddress::coordinator(),
                SimulatorAddress::worker(1, 1),
                operation,
            );
            let line = encode_line(&envelope).unwrap();
            self.to_worker.write_all(line.as_bytes()).await.unwrap();
            self.seq
        }

        async fn next_envelope(&mut self) -> Envelope {
            let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .expect("timed out waiting for worker output")
                .unwrap()
                .expect("worker closed its output");
            decode_line(&line).unwrap().expect("envelope")
        }

        /// Read envelopes until the response answering `seq` arrives
        async fn response_for(&mut self, seq: u64) -> Response {
            loop {
                let envelope = self.next_envelope().await;
                if let Payload::Response { response } = envelope.payload {
                    if envelope.seq == seq {
                        return response;
                    }
                }
            }
        }

        /// Read envelopes until a phase completion arrives
        async fn phase_completed(&mut self) -> (u32, TestPhase) {
            loop {
                let envelope = self.next_envelope().await;
                if let Payload::Operation {
                    operation: Operation::PhaseCompleted { test_index, phase },
                } = envelope.payload
                {
                    return (test_index, phase);
                }
            }
        }
    }

    fn init_test(id: &str, class: &str, index: u32) -> Operation {
        Operation::InitTest {
            test_index: index,
            case: TestCase::new(id).with_property("class", class),
        }
    }

    #[tokio::test]
    async fn test_setup_phase_acks_and_completes() {
        let mut harness = Harness::spawn();

        let seq = harness.send(init_test("map", "success", 1)).await;
        assert!(harness.response_for(seq).await.is_success());

        let seq = harness
            .send(Operation::StartPhase {
                test_id: "map".into(),
                test_index: 1,
                phase: TestPhase::Setup,
            })
            .await;
        assert!(harness.response_for(seq).await.is_success());

        let (test_index, phase) = harness.phase_completed().await;
        assert_eq!(test_index, 1);
        assert_eq!(phase, TestPhase::Setup);
    }

    #[tokio::test]
    async fn test_unknown_workload_fails_init() {
        let mut harness = Harness::spawn();

        let seq = harness.send(init_test("map", "no-such-workload", 1)).await;
        let response = harness.response_for(seq).await;
        let (_, response_type) = response.first_error().expect("an error entry");
        assert_eq!(
            response_type,
            ResponseType::ExceptionDuringOperationExecution
        );
    }

    #[tokio::test]
    async fn test_run_stop_and_benchmark_results() {
        let mut harness = Harness::spawn();

        let seq = harness.send(init_test("map", "success", 1)).await;
        harness.response_for(seq).await;

        let seq = harness
            .send(Operation::StartPhase {
                test_id: "map".into(),
                test_index: 1,
                phase: TestPhase::Run,
            })
            .await;
        assert!(harness.response_for(seq).await.is_success());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let seq = harness
            .send(Operation::StopRun {
                test_id: "map".into(),
                test_index: 1,
            })
            .await;
        assert!(harness.response_for(seq).await.is_success());

        let (_, phase) = harness.phase_completed().await;
        assert_eq!(phase, TestPhase::Run);

        let seq = harness
            .send(Operation::GetBenchmarkResults {
                test_id: "map".into(),
                test_index: 1,
            })
            .await;

        // The report travels as an upstream operation next to the ack.
        let mut report = None;
        for _ in 0..10 {
            let envelope = harness.next_envelope().await;
            match envelope.payload {
                Payload::Operation {
                    operation: Operation::BenchmarkResults { report: r },
                } => {
                    report = Some(r);
                    break;
                }
                Payload::Response { response } if envelope.seq == seq => {
                    assert!(response.is_success());
                }
                _ => {}
            }
        }
        let report = report.expect("benchmark report");
        assert_eq!(report.test_index, 1);
        assert!(report.operation_count > 0);
    }

    #[tokio::test]
    async fn test_failing_run_drops_exception_artifact() {
        let mut harness = Harness::spawn();

        let seq = harness.send(init_test("bad", "failing", 1)).await;
        harness.response_for(seq).await;

        let seq = harness
            .send(Operation::StartPhase {
                test_id: "bad".into(),
                test_index: 1,
                phase: TestPhase::Run,
            })
            .await;
        assert!(harness.response_for(seq).await.is_success());

        let (_, phase) = harness.phase_completed().await;
        assert_eq!(phase, TestPhase::Run);

        let artifacts: Vec<_> = std::fs::read_dir(harness.home.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .path()
                    .extension()
                    .is_some_and(|ext| ext == "exception")
            })
            .collect();
        assert_eq!(artifacts.len(), 1);

        let content = std::fs::read_to_string(artifacts[0].path()).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some("bad"));
        assert!(content.contains("should fail"));
    }

    #[tokio::test]
    async fn test_termination_stops_the_runtime() {
        let mut harness = Harness::spawn();

        let seq = harness.send(Operation::TerminateWorkers).await;
        assert!(harness.response_for(seq).await.is_success());

        let result = tokio::time::timeout(Duration::from_secs(5), harness.runtime)
            .await
            .expect("runtime should stop")
            .expect("runtime task");
        assert!(result.is_ok());
    }
}
