//! Worker process failure monitor
//!
//! A background scanner wakes on a fixed interval and checks every
//! non-finished worker, in order: exception artifacts, OOM artifacts,
//! inactivity, unexpected exit. Detected failures are forwarded to the
//! coordinator through a [`FailureSink`]; exception artifacts are
//! deleted on successful delivery and renamed with a `.sendFailure`
//! suffix otherwise, so nothing is re-emitted or silently lost.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use gridbench_core::failure::{FailureKind, FailureOperation};

use crate::process::{WorkerProcess, WorkerProcessManager};

/// Default scan interval
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Upstream delivery of failure reports
///
/// Implemented by the agent connector; tests plug in a recording mock.
#[async_trait]
pub trait FailureSink: Send + Sync {
    /// Forward a failure to the coordinator; `true` means the
    /// coordinator acknowledged it
    async fn publish(&self, failure: FailureOperation) -> bool;
}

/// Scanner settings
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Inactivity threshold; `0` disables timeout detection entirely
    pub last_seen_timeout_seconds: u64,
    /// How often the scanner wakes
    pub check_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            last_seen_timeout_seconds: 0,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }
}

/// The background failure scanner for one agent
pub struct WorkerProcessFailureMonitor {
    inner: Arc<MonitorInner>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct MonitorInner {
    manager: Arc<WorkerProcessManager>,
    sink: Arc<dyn FailureSink>,
    agent_public_address: String,
    suite_id: Arc<Mutex<Option<String>>>,
    config: MonitorConfig,
    detect_timeouts: AtomicBool,
    failure_count: AtomicUsize,
}

impl WorkerProcessFailureMonitor {
    /// Create a monitor; call [`start`](Self::start) to begin scanning
    pub fn new(
        manager: Arc<WorkerProcessManager>,
        sink: Arc<dyn FailureSink>,
        agent_public_address: String,
        suite_id: Arc<Mutex<Option<String>>>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                manager,
                sink,
                agent_public_address,
                suite_id,
                config,
                detect_timeouts: AtomicBool::new(false),
                failure_count: AtomicUsize::new(0),
            }),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the scan loop
    pub fn start(&self) {
        let inner = Arc::clone(&self.inner);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(inner.config.check_interval) => {
                        inner.scan_once().await;
                    }
                }
            }
        });
        *self.handle.lock().expect("monitor handle lock") = Some(handle);
    }

    /// Stop the scan loop and wait for it to exit
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().expect("monitor handle lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Reset every worker's inactivity clock and enable timeout checks
    pub fn start_timeout_detection(&self) {
        if self.inner.config.last_seen_timeout_seconds == 0 {
            return;
        }
        info!("Starting timeout detection for workers");
        for worker in self.inner.manager.worker_processes() {
            worker.touch();
        }
        self.inner.detect_timeouts.store(true, Ordering::Release);
    }

    /// Disable timeout checks
    pub fn stop_timeout_detection(&self) {
        if self.inner.config.last_seen_timeout_seconds == 0 {
            return;
        }
        info!("Stopping timeout detection for workers");
        self.inner.detect_timeouts.store(false, Ordering::Release);
    }

    /// Failures reported so far
    pub fn failure_count(&self) -> usize {
        self.inner.failure_count.load(Ordering::Acquire)
    }

    /// One full scan round over every worker (exposed for tests)
    pub async fn scan_once(&self) {
        self.inner.scan_once().await;
    }
}

impl MonitorInner {
    async fn scan_once(&self) {
        for worker in self.manager.worker_processes() {
            self.detect_failures(&worker).await;
        }
    }

    async fn detect_failures(&self, worker: &Arc<WorkerProcess>) {
        if worker.is_finished() {
            return;
        }

        self.detect_exceptions(worker).await;
        if worker.is_oome_detected() {
            return;
        }

        self.detect_oome(worker).await;
        self.detect_inactivity(worker).await;
        self.detect_unexpected_exit(worker).await;
    }

    /// Exception artifacts: one failure per `*.exception` file
    async fn detect_exceptions(&self, worker: &Arc<WorkerProcess>) {
        let files = match list_files_with_extension(worker.home(), "exception") {
            Ok(files) => files,
            Err(_) => return,
        };

        for path in files {
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Could not read exception artifact");
                    continue;
                }
            };

            let (first_line, cause) = match content.split_once('\n') {
                Some((first, rest)) => (first.trim(), rest),
                None => (content.trim(), ""),
            };
            let test_id = match first_line {
                "" | "null" => None,
                id => Some(id.to_string()),
            };

            let delivered = self
                .publish(
                    worker,
                    FailureKind::WorkerException,
                    "Worker ran into an unhandled exception".into(),
                    test_id,
                    Some(cause.to_string()),
                )
                .await;

            // Delete or rename so the same exception is never detected twice.
            if delivered {
                if let Err(err) = tokio::fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %err, "Could not delete exception artifact");
                }
            } else {
                let renamed = append_extension(&path, "sendFailure");
                if let Err(err) = tokio::fs::rename(&path, &renamed).await {
                    warn!(path = %path.display(), error = %err, "Could not rename exception artifact");
                }
            }
        }
    }

    /// OOM artifacts: the `worker.oome` sentinel or any heap dump
    async fn detect_oome(&self, worker: &Arc<WorkerProcess>) {
        if !oome_found(worker.home()) {
            return;
        }
        worker.set_oome_detected();

        self.publish(
            worker,
            FailureKind::WorkerOom,
            "Worker ran out of memory".into(),
            None,
            None,
        )
        .await;
        self.remove_worker(worker);
    }

    /// Heartbeat timeout: fires once per `last_seen_timeout_seconds`
    async fn detect_inactivity(&self, worker: &Arc<WorkerProcess>) {
        let timeout = self.config.last_seen_timeout_seconds;
        if timeout == 0 || !self.detect_timeouts.load(Ordering::Acquire) {
            return;
        }

        let elapsed = worker.seconds_since_last_seen();
        if elapsed > 0 && elapsed % timeout == 0 {
            self.publish(
                worker,
                FailureKind::WorkerTimeout,
                format!("Worker has not sent a message for {elapsed} seconds"),
                None,
                None,
            )
            .await;
        }
    }

    /// Process exit: clean exits finish the worker, others fail it
    async fn detect_unexpected_exit(&self, worker: &Arc<WorkerProcess>) {
        let exit_code = match worker.try_exit_code() {
            Ok(Some(code)) => code,
            Ok(None) => return,
            Err(err) => {
                warn!(worker = worker.id(), error = %err, "Could not poll worker process");
                return;
            }
        };

        if exit_code == 0 {
            worker.set_finished();
            let kind = if worker.is_termination_requested() {
                FailureKind::WorkerFinishedNormal
            } else {
                FailureKind::WorkerFinished
            };
            self.publish(worker, kind, "Worker terminated normally".into(), None, None)
                .await;
            self.remove_worker(worker);
            return;
        }

        worker.set_finished();
        self.manager.shutdown(worker).await;
        self.publish(
            worker,
            FailureKind::WorkerExit,
            format!("Worker terminated with exit code {exit_code} instead of 0"),
            None,
            None,
        )
        .await;
        self.remove_worker(worker);
    }

    fn remove_worker(&self, worker: &Arc<WorkerProcess>) {
        info!(worker = %worker.address(), "Removing worker from process table");
        self.manager.remove(worker.address());
    }

    async fn publish(
        &self,
        worker: &Arc<WorkerProcess>,
        kind: FailureKind,
        message: String,
        test_id: Option<String>,
        cause: Option<String>,
    ) -> bool {
        let suite_id = self
            .suite_id
            .lock()
            .expect("suite id lock")
            .clone()
            .unwrap_or_default();
        let failure = FailureOperation {
            message,
            kind,
            worker_address: worker.address(),
            agent_public_address: self.agent_public_address.clone(),
            grid_address: None,
            worker_id: worker.id().to_string(),
            test_id,
            suite_id,
            cause,
        };

        if kind.is_failure() {
            let number = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
            error!("{}", failure.log_message(number));
        } else {
            info!(worker = worker.id(), "Worker finished");
        }

        let delivered = self.sink.publish(failure).await;
        if !delivered {
            error!(worker = worker.id(), %kind, "Could not send failure to coordinator");
        }
        delivered
    }
}

/// Files in `dir` whose final extension equals `extension`, sorted
fn list_files_with_extension(dir: &Path, extension: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == extension))
        .collect();
    files.sort();
    Ok(files)
}

fn oome_found(home: &Path) -> bool {
    if home.join("worker.oome").exists() {
        return true;
    }
    // The sentinel file is written only after the heap dump completes,
    // which can take long enough to trip timeout detection first. The
    // dump file itself is the earlier signal.
    matches!(list_files_with_extension(home, "hprof"), Ok(files) if !files.is_empty())
}

fn append_extension(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}
