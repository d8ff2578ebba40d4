//! Spawns and supervises one worker process per active download.

use crate::core::error::RunnerError;
use crate::core::model::{Download, DownloadId, Settings};
use crate::core::paths;
use crate::core::progress::{self, ParsedLine, ProgressEvent};
use crate::plugins::registry::WorkerDriver;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// How long a worker gets to exit after a termination request before it is killed.
    pub stop_grace: Duration,
    /// Non-progress output lines kept for error reporting.
    pub tail_lines: usize,
    /// How long to wait for output pipes to close once the worker is gone.
    pub drain_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(5),
            tail_lines: 20,
            drain_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Exited { code: i32 },
    Signaled,
    /// The worker was terminated because [`StopHandle::stop`] was called.
    StoppedByRequest,
    WaitFailed(String),
}

#[derive(Debug)]
pub enum RunnerEvent {
    Progress(ProgressEvent),
    Destination(PathBuf),
    /// Always the last event of a run.
    Exit { outcome: ExitOutcome, tail: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct StopHandle {
    token: CancellationToken,
}

impl StopHandle {
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

pub struct RunHandle {
    pub id: DownloadId,
    pub stop: StopHandle,
    pub events: mpsc::Receiver<RunnerEvent>,
}

type LiveSet = Arc<std::sync::Mutex<HashSet<DownloadId>>>;

/// Holds an id in the live set until the supervising task lets go of it.
struct LiveGuard {
    id: DownloadId,
    live: LiveSet,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        live.remove(&self.id);
    }
}

type Tail = Arc<std::sync::Mutex<VecDeque<String>>>;

#[derive(Clone)]
pub struct ProcessRunner {
    driver: Arc<dyn WorkerDriver>,
    config: RunnerConfig,
    live: LiveSet,
}

impl ProcessRunner {
    pub fn new(driver: Arc<dyn WorkerDriver>, config: RunnerConfig) -> Self {
        Self { driver, config, live: Arc::new(std::sync::Mutex::new(HashSet::new())) }
    }

    pub fn worker_name(&self) -> &'static str {
        self.driver.name()
    }

    pub fn is_live(&self, id: DownloadId) -> bool {
        let live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        live.contains(&id)
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn claim(&self, id: DownloadId) -> Result<LiveGuard, RunnerError> {
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        if !live.insert(id) {
            return Err(RunnerError::AlreadyRunning(id));
        }
        Ok(LiveGuard { id, live: self.live.clone() })
    }

    pub async fn start(
        &self,
        download: &Download,
        settings: &Settings,
        resume: bool,
    ) -> Result<RunHandle, RunnerError> {
        let guard = self.claim(download.id)?;

        let program = self
            .driver
            .locate()
            .await
            .ok_or(RunnerError::BinaryNotFound { worker: self.driver.name() })?;
        let args = self.driver.build_args(download, settings, resume);

        tracing::debug!(id = %download.id, program = %program.display(), ?args, "spawning worker");

        let mut child = worker_command(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunnerError::Spawn { program: program.clone(), source })?;

        let stdout = child.stdout.take().ok_or(RunnerError::MissingPipe)?;
        let stderr = child.stderr.take().ok_or(RunnerError::MissingPipe)?;

        let (tx, rx) = mpsc::channel(64);
        let token = CancellationToken::new();
        let sup = Supervisor {
            id: download.id,
            config: self.config.clone(),
            token: token.clone(),
            tx,
            tail: Arc::new(std::sync::Mutex::new(VecDeque::new())),
        };
        tokio::spawn(sup.run(child, stdout, stderr, guard));

        Ok(RunHandle { id: download.id, stop: StopHandle { token }, events: rx })
    }
}

fn worker_command(program: &Path) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.env("PATH", paths::enhanced_path());
    cmd.env("PYTHONIOENCODING", "utf-8");
    cmd.env("PYTHONUTF8", "1");
    cmd
}

struct Supervisor {
    id: DownloadId,
    config: RunnerConfig,
    token: CancellationToken,
    tx: mpsc::Sender<RunnerEvent>,
    tail: Tail,
}

impl Supervisor {
    async fn run<O, E>(self, mut child: Child, stdout: O, stderr: E, guard: LiveGuard)
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let out_task = tokio::spawn(pump(self.id, stdout, self.tx.clone(), self.tail.clone(), self.config.tail_lines));
        let err_task = tokio::spawn(pump(self.id, stderr, self.tx.clone(), self.tail.clone(), self.config.tail_lines));

        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(s) => classify(s),
                Err(e) => ExitOutcome::WaitFailed(e.to_string()),
            },
            _ = self.token.cancelled() => {
                terminate(&mut child, self.config.stop_grace, self.id).await;
                ExitOutcome::StoppedByRequest
            }
        };

        // Grandchildren (ffmpeg) can keep the pipes open after the worker is gone.
        for task in [out_task, err_task] {
            let abort = task.abort_handle();
            if tokio::time::timeout(self.config.drain_timeout, task).await.is_err() {
                abort.abort();
            }
        }

        let tail: Vec<String> = {
            let mut t = self.tail.lock().unwrap_or_else(|e| e.into_inner());
            t.drain(..).collect()
        };

        tracing::debug!(id = %self.id, ?outcome, "worker finished");

        drop(guard);
        let _ = self.tx.send(RunnerEvent::Exit { outcome, tail }).await;
    }
}

async fn pump<R>(id: DownloadId, mut reader: R, tx: mpsc::Sender<RunnerEvent>, tail: Tail, tail_lines: usize)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    let mut carry = Vec::new();
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for line in progress::feed(&mut carry, &buf[..n]) {
            forward(id, line, &tx, &tail, tail_lines).await;
        }
    }
    for line in progress::finish(&mut carry) {
        forward(id, line, &tx, &tail, tail_lines).await;
    }
}

async fn forward(id: DownloadId, line: ParsedLine, tx: &mpsc::Sender<RunnerEvent>, tail: &Tail, tail_lines: usize) {
    match line {
        ParsedLine::Progress(p) => {
            let _ = tx.send(RunnerEvent::Progress(p)).await;
        }
        ParsedLine::Destination(path) => {
            let _ = tx.send(RunnerEvent::Destination(path)).await;
        }
        ParsedLine::Other(text) => {
            tracing::trace!(id = %id, "worker: {}", text);
            let mut t = tail.lock().unwrap_or_else(|e| e.into_inner());
            t.push_back(text);
            while t.len() > tail_lines.max(1) {
                t.pop_front();
            }
        }
    }
}

fn classify(status: ExitStatus) -> ExitOutcome {
    match status.code() {
        Some(code) => ExitOutcome::Exited { code },
        None => ExitOutcome::Signaled,
    }
}

async fn terminate(child: &mut Child, grace: Duration, id: DownloadId) {
    if request_termination(child).await {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(_) => return,
            Err(_) => tracing::warn!(id = %id, "worker still running after {:?}; killing", grace),
        }
    }
    if let Err(e) = child.kill().await {
        tracing::debug!(id = %id, "kill after stop request: {}", e);
    }
}

#[cfg(unix)]
async fn request_termination(child: &Child) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    tokio::process::Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(not(unix))]
async fn request_termination(_child: &Child) -> bool {
    false
}
