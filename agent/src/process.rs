//! Worker process ownership
//!
//! The [`WorkerProcessManager`] owns every worker child process on an
//! agent: it assigns worker indexes, forks children with piped stdio,
//! tracks them, and shuts them down (graceful termination, timed wait,
//! hard kill). All mutation of the process table is serialized behind a
//! single lock.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use gridbench_core::address::SimulatorAddress;
use gridbench_core::operation::{Operation, WorkerSettings, WorkerType};
use gridbench_core::wire::{decode_line, encode_line, Envelope};

use crate::connector::UpstreamSender;
use crate::error::{AgentError, AgentResult};

/// How long a graceful shutdown waits before the hard kill
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Minimal view of a child process, so the monitor can be tested
/// without forking
pub trait ProcessProbe: Send {
    /// Exit code if the process has terminated, `None` while running
    fn try_exit_code(&mut self) -> std::io::Result<Option<i32>>;

    /// Begin killing the process; does not wait
    fn start_kill(&mut self) -> std::io::Result<()>;
}

/// Probe over a real child process
struct ChildProbe {
    child: tokio::process::Child,
}

impl ProcessProbe for ChildProbe {
    fn try_exit_code(&mut self) -> std::io::Result<Option<i32>> {
        match self.child.try_wait()? {
            None => Ok(None),
            Some(status) => Ok(Some(exit_code(status))),
        }
    }

    fn start_kill(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// One supervised worker child process
pub struct WorkerProcess {
    address: SimulatorAddress,
    id: String,
    worker_type: WorkerType,
    home: PathBuf,
    last_seen: Mutex<Instant>,
    finished: AtomicBool,
    oome_detected: AtomicBool,
    termination_requested: AtomicBool,
    probe: Mutex<Box<dyn ProcessProbe>>,
    stdin: tokio::sync::Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
}

impl WorkerProcess {
    /// Assemble a worker process record
    pub fn new(
        address: SimulatorAddress,
        id: String,
        worker_type: WorkerType,
        home: PathBuf,
        probe: Box<dyn ProcessProbe>,
        stdin: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    ) -> Self {
        Self {
            address,
            id,
            worker_type,
            home,
            last_seen: Mutex::new(Instant::now()),
            finished: AtomicBool::new(false),
            oome_detected: AtomicBool::new(false),
            termination_requested: AtomicBool::new(false),
            probe: Mutex::new(probe),
            stdin: tokio::sync::Mutex::new(stdin),
        }
    }

    /// The worker's simulator address
    pub fn address(&self) -> SimulatorAddress {
        self.address
    }

    /// The agent-assigned worker id string
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Member or client
    pub fn worker_type(&self) -> WorkerType {
        self.worker_type
    }

    /// The worker's home directory (artifact file contract)
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Seconds since the worker last produced a message
    pub fn seconds_since_last_seen(&self) -> u64 {
        self.last_seen.lock().expect("last_seen lock").elapsed().as_secs()
    }

    /// Reset the inactivity clock to now
    pub fn touch(&self) {
        *self.last_seen.lock().expect("last_seen lock") = Instant::now();
    }

    /// Move the inactivity clock into the past (tests only)
    #[cfg(test)]
    pub(crate) fn backdate_last_seen(&self, by: Duration) {
        *self.last_seen.lock().expect("last_seen lock") = Instant::now() - by;
    }

    /// Whether the process has been observed to exit cleanly
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Mark the worker finished; scans skip it afterwards
    pub fn set_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }

    /// Whether an OOM has been detected for this worker
    pub fn is_oome_detected(&self) -> bool {
        self.oome_detected.load(Ordering::Acquire)
    }

    /// Latch the OOM flag
    pub fn set_oome_detected(&self) {
        self.oome_detected.store(true, Ordering::Release);
    }

    /// Whether the agent asked this worker to terminate
    pub fn is_termination_requested(&self) -> bool {
        self.termination_requested.load(Ordering::Acquire)
    }

    /// Poll the child for an exit code
    pub fn try_exit_code(&self) -> std::io::Result<Option<i32>> {
        self.probe.lock().expect("probe lock").try_exit_code()
    }

    /// Write one envelope to the worker's stdin
    pub async fn send(&self, envelope: &Envelope) -> AgentResult<()> {
        let line = encode_line(envelope)?;
        let mut stdin = self.stdin.lock().await;
        let writer = stdin
            .as_mut()
            .ok_or_else(|| AgentError::WorkerNotFound(self.address.worker_index().unwrap_or(0)))?;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Ask the worker to terminate itself, marking the exit expected
    pub async fn request_termination(&self, envelope: &Envelope) -> AgentResult<()> {
        self.termination_requested.store(true, Ordering::Release);
        self.send(envelope).await
    }

    /// Close stdin so the worker sees EOF
    async fn close_stdin(&self) {
        let mut stdin = self.stdin.lock().await;
        if let Some(mut writer) = stdin.take() {
            let _ = writer.shutdown().await;
        }
    }

    fn start_kill(&self) -> std::io::Result<()> {
        self.probe.lock().expect("probe lock").start_kill()
    }
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("address", &self.address)
            .field("id", &self.id)
            .field("worker_type", &self.worker_type)
            .field("home", &self.home)
            .field("finished", &self.is_finished())
            .finish()
    }
}

struct ManagerInner {
    workers: BTreeMap<u32, std::sync::Arc<WorkerProcess>>,
    next_index: u32,
}

/// Launch settings shared by every worker the manager forks
#[derive(Debug, Clone)]
pub struct WorkerLaunchConfig {
    /// Binary to execute (the gridbench binary's `worker` subcommand)
    pub program: PathBuf,
    /// Root directory for per-suite worker homes
    pub workers_dir: PathBuf,
}

/// Owner of the agent's worker child processes
pub struct WorkerProcessManager {
    agent_address: SimulatorAddress,
    launch: WorkerLaunchConfig,
    inner: Mutex<ManagerInner>,
}

impl WorkerProcessManager {
    /// Create a manager for the given agent
    pub fn new(agent_address: SimulatorAddress, launch: WorkerLaunchConfig) -> Self {
        Self {
            agent_address,
            launch,
            inner: Mutex::new(ManagerInner {
                workers: BTreeMap::new(),
                next_index: 1,
            }),
        }
    }

    /// The owning agent's address
    pub fn agent_address(&self) -> SimulatorAddress {
        self.agent_address
    }

    /// Fork a worker child process and register it
    ///
    /// The worker's stdout is pumped through `upstream`; every line
    /// read refreshes the worker's inactivity clock.
    pub async fn launch(
        &self,
        settings: &WorkerSettings,
        suite_id: &str,
        upstream: UpstreamSender,
    ) -> AgentResult<std::sync::Arc<WorkerProcess>> {
        let (address, id) = self.assign_identity(settings.worker_type);
        let home = self
            .launch
            .workers_dir
            .join(suite_id)
            .join(&id);
        tokio::fs::create_dir_all(&home).await?;

        let mut child = Command::new(&self.launch.program)
            .arg("worker")
            .arg("--address")
            .arg(address.to_string())
            .arg("--worker-home")
            .arg(&home)
            .current_dir(&home)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(std::fs::File::create(home.join("worker.err"))?))
            .spawn()
            .map_err(|err| AgentError::Launch(format!("{}: {err}", self.launch.program.display())))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Launch("worker stdin not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Launch("worker stdout not piped".into()))?;

        let worker = std::sync::Arc::new(WorkerProcess::new(
            address,
            id,
            settings.worker_type,
            home,
            Box::new(ChildProbe { child }),
            Some(Box::new(stdin)),
        ));
        self.register(std::sync::Arc::clone(&worker));
        tokio::spawn(pump_worker_output(std::sync::Arc::clone(&worker), stdout, upstream));

        info!(worker = worker.id(), address = %address, "Launched worker");
        Ok(worker)
    }

    /// Reserve the next worker index and derive address and id
    fn assign_identity(&self, worker_type: WorkerType) -> (SimulatorAddress, String) {
        let mut inner = self.inner.lock().expect("manager lock");
        let index = inner.next_index;
        inner.next_index += 1;
        let agent_index = self.agent_address.agent_index().unwrap_or(0);
        let address = SimulatorAddress::worker(agent_index, index);
        let id = format!("worker-{agent_index}-{index}-{}", worker_type.name());
        (address, id)
    }

    /// Register an externally assembled worker (used by tests)
    pub fn register(&self, worker: std::sync::Arc<WorkerProcess>) {
        let mut inner = self.inner.lock().expect("manager lock");
        let index = worker.address().worker_index().unwrap_or(0);
        inner.workers.insert(index, worker);
    }

    /// Reserve a worker index without launching (used by tests)
    pub fn reserve_index(&self) -> u32 {
        let mut inner = self.inner.lock().expect("manager lock");
        let index = inner.next_index;
        inner.next_index += 1;
        index
    }

    /// Snapshot of all live workers in index order
    pub fn worker_processes(&self) -> Vec<std::sync::Arc<WorkerProcess>> {
        self.inner
            .lock()
            .expect("manager lock")
            .workers
            .values()
            .cloned()
            .collect()
    }

    /// Look up a worker by index
    pub fn get(&self, worker_index: u32) -> Option<std::sync::Arc<WorkerProcess>> {
        self.inner
            .lock()
            .expect("manager lock")
            .workers
            .get(&worker_index)
            .cloned()
    }

    /// Drop a worker from the process table
    pub fn remove(&self, address: SimulatorAddress) -> Option<std::sync::Arc<WorkerProcess>> {
        let index = address.worker_index()?;
        let removed = self
            .inner
            .lock()
            .expect("manager lock")
            .workers
            .remove(&index);
        if removed.is_some() {
            debug!(worker = %address, "Removed worker from process table");
        }
        removed
    }

    /// Best-effort shutdown: close stdin, timed wait, hard kill
    pub async fn shutdown(&self, worker: &std::sync::Arc<WorkerProcess>) {
        worker.close_stdin().await;

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            match worker.try_exit_code() {
                Ok(Some(code)) => {
                    debug!(worker = worker.id(), code, "Worker exited after shutdown");
                    return;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(worker = worker.id(), error = %err, "Could not poll worker exit");
                    break;
                }
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        warn!(worker = worker.id(), "Worker did not exit in time, killing");
        if let Err(err) = worker.start_kill() {
            warn!(worker = worker.id(), error = %err, "Kill failed");
        }
    }
}

/// Route every line a worker writes
///
/// Responses addressed to the agent (termination acks and the like)
/// complete the agent's own pending table; everything else travels
/// upstream to the coordinator. Each line refreshes the inactivity
/// clock.
async fn pump_worker_output(
    worker: std::sync::Arc<WorkerProcess>,
    stdout: tokio::process::ChildStdout,
    upstream: UpstreamSender,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                worker.touch();
                match decode_line(&line) {
                    Ok(Some(envelope)) => {
                        if !upstream.route_from_worker(envelope).await {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(worker = worker.id(), error = %err, "Undecodable worker output");
                    }
                }
            }
            Ok(None) => {
                debug!(worker = worker.id(), "Worker closed its output");
                return;
            }
            Err(err) => {
                warn!(worker = worker.id(), error = %err, "Error reading worker output");
                return;
            }
        }
    }
}

/// Build the termination envelope the manager writes to each worker
pub fn termination_envelope(seq: u64, agent: SimulatorAddress, worker: SimulatorAddress) -> Envelope {
    Envelope::operation(seq, agent, worker, Operation::TerminateWorkers)
}
