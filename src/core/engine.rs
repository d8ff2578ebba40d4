use crate::core::error::{Ack, InvalidRequest, QueueError};
use crate::core::events::{EventBus, QueueEvent};
use crate::core::model::*;
use crate::core::mutex::SectionMutex;
use crate::core::progress::ProgressEvent;
use crate::core::runner::{ExitOutcome, ProcessRunner, RunnerEvent, StopHandle};
use crate::core::settings::SettingsProvider;
use crate::core::store::SqliteStore;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tokio::time::{Duration, Instant};

const DOWNLOADS: &str = "downloads";
const SETTINGS: &str = "settings";

/// Worker messages that name a condition a retry will not fix.
const PERMANENT_FAILURES: &[&str] = &[
    "unsupported url",
    "is not a valid url",
    "video unavailable",
    "private video",
    "has been removed",
    "account associated with this video has been terminated",
];

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Minimum spacing between persisted/published progress updates per download.
    pub progress_interval: Duration,
    /// Re-queue downloads that were mid-transfer when the previous process died,
    /// instead of leaving them paused.
    pub resume_recovered: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { progress_interval: Duration::from_millis(250), resume_recovered: false }
    }
}

pub struct ProgressThrottle {
    last_emit: Option<Instant>,
    min_interval: Duration,
}

impl ProgressThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self { last_emit: None, min_interval }
    }

    pub fn should_emit(&mut self) -> bool {
        let now = Instant::now();
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }
}

struct ActiveJob {
    run_id: u64,
    stop: StopHandle,
    throttle: ProgressThrottle,
    /// In-memory progress is ahead of what was last persisted.
    dirty: bool,
    destination: Option<PathBuf>,
}

#[derive(Default)]
struct QueueState {
    items: Vec<Download>,
    active: HashMap<DownloadId, ActiveJob>,
    next_ticket: i64,
    next_run_id: u64,
}

impl QueueState {
    fn get(&self, id: DownloadId) -> Option<&Download> {
        self.items.iter().find(|d| d.id == id)
    }

    fn downloading_count(&self) -> usize {
        self.items
            .iter()
            .filter(|d| d.status == DownloadStatus::Downloading)
            .count()
    }

    fn next_queued(&self, skip: &HashSet<DownloadId>) -> Option<Download> {
        self.items
            .iter()
            .filter(|d| d.status == DownloadStatus::Queued && !skip.contains(&d.id))
            .min_by_key(|d| d.queue_ticket)
            .cloned()
    }

    fn take_ticket(&mut self) -> i64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn apply(&mut self, id: DownloadId, patch: &DownloadPatch) -> Option<Download> {
        let d = self.items.iter_mut().find(|d| d.id == id)?;
        d.apply(patch);
        Some(d.clone())
    }

    fn is_current(&self, id: DownloadId, run_id: u64) -> bool {
        self.active
            .get(&id)
            .map(|j| j.run_id == run_id && !j.stop.is_stopped())
            .unwrap_or(false)
    }

    fn is_idle(&self) -> bool {
        !self
            .items
            .iter()
            .any(|d| matches!(d.status, DownloadStatus::Queued | DownloadStatus::Downloading))
    }
}

/// The download queue: admission control, the per-download state machine and
/// the glue between runner, store and event bus.
///
/// Every state transition runs inside the `downloads` section: read the
/// in-memory record, write the store, then apply the change in memory and
/// publish. A failed write therefore leaves both the store and memory as they
/// were, and observers never hear about a state the store does not hold.
#[derive(Clone)]
pub struct Engine {
    store: SqliteStore,
    locks: SectionMutex,
    bus: EventBus,
    runner: ProcessRunner,
    settings: SettingsProvider,
    config: EngineConfig,
    state: Arc<Mutex<QueueState>>,
    started: Arc<AtomicBool>,
    watching: Arc<AtomicBool>,
    idle: Arc<Notify>,
}

impl Engine {
    /// Loads settings and every stored download. Records left `downloading` by a
    /// previous process have no worker behind them any more; they come back
    /// `paused` (or `queued` with `resume_recovered`). No worker is started
    /// until [`Engine::start`].
    pub async fn open(store: SqliteStore, runner: ProcessRunner, config: EngineConfig) -> Result<Self, QueueError> {
        let settings = match store.get_settings().await? {
            Some(s) => s,
            None => {
                let s = Settings::default().normalized();
                store.put_settings(&s).await?;
                s
            }
        };

        let mut items = store.load_all().await?;
        let next_ticket = store.max_queue_ticket().await?;

        let recovered_status = if config.resume_recovered {
            DownloadStatus::Queued
        } else {
            DownloadStatus::Paused
        };
        let recovered: Vec<(DownloadId, DownloadPatch)> = items
            .iter()
            .filter(|d| d.status == DownloadStatus::Downloading)
            .map(|d| (d.id, DownloadPatch::status(recovered_status).clear_metrics()))
            .collect();
        if !recovered.is_empty() {
            store.update_many(&recovered).await?;
            for (id, patch) in &recovered {
                if let Some(d) = items.iter_mut().find(|d| d.id == *id) {
                    d.apply(patch);
                }
            }
            tracing::info!(count = recovered.len(), status = %recovered_status, "recovered interrupted downloads");
        }

        tracing::info!(downloads = items.len(), concurrency = settings.concurrency, "queue loaded");

        Ok(Self {
            store,
            locks: SectionMutex::new(),
            bus: EventBus::default(),
            runner,
            settings: SettingsProvider::new(settings),
            config,
            state: Arc::new(Mutex::new(QueueState { items, next_ticket, ..Default::default() })),
            started: Arc::new(AtomicBool::new(false)),
            watching: Arc::new(AtomicBool::new(false)),
            idle: Arc::new(Notify::new()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.bus.subscribe()
    }

    /// Publishes the loaded snapshot, turns admission on and reacts to settings
    /// changes from then on. Calling it while already started is a no-op;
    /// calling it after [`Engine::shutdown`] turns admission back on.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        self.locks
            .run(DOWNLOADS, || async {
                let downloads = self.state.lock().await.items.clone();
                self.bus.publish(QueueEvent::Loaded { downloads });
            })
            .await;

        // one watcher for the engine's lifetime, however often admission is toggled
        if !self.watching.swap(true, Ordering::SeqCst) {
            let engine = self.clone();
            let mut rx = self.settings.subscribe();
            tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    tracing::debug!("settings changed; running admission");
                    engine.admit().await;
                }
            });
        }

        self.admit().await;
    }

    /// Stops admitting, pauses everything that is running and waits (bounded)
    /// for the workers to go away.
    pub async fn shutdown(&self, wait: Duration) -> Result<usize, QueueError> {
        self.started.store(false, Ordering::SeqCst);
        let paused = self.pause_all().await?;

        let deadline = Instant::now() + wait;
        while self.live_workers() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(paused)
    }

    pub async fn snapshot(&self) -> Vec<Download> {
        self.state.lock().await.items.clone()
    }

    pub async fn get(&self, id: DownloadId) -> Option<Download> {
        self.state.lock().await.get(id).cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.state.lock().await.downloading_count()
    }

    /// Worker processes still alive, including ones winding down after a stop.
    pub fn live_workers(&self) -> usize {
        self.runner.live_count()
    }

    pub fn settings(&self) -> Settings {
        self.settings.get()
    }

    /// Resolves once nothing is queued or downloading.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.state.lock().await.is_idle() {
                return;
            }
            notified.await;
        }
    }

    pub async fn add(&self, req: DownloadRequest) -> Result<DownloadId, QueueError> {
        let url = req.url.trim().to_string();
        if url.is_empty() || url::Url::parse(&url).is_err() {
            return Err(QueueError::InvalidUrl(req.url));
        }
        let req = DownloadRequest { url, ..req };

        let id = self
            .locks
            .run(DOWNLOADS, || async {
                let ticket = self.state.lock().await.take_ticket();
                let d = Download::new(req, ticket);
                self.store.insert(&d).await?;

                self.state.lock().await.items.push(d.clone());
                tracing::info!(id = %d.id, url = %d.url, "download added");
                let id = d.id;
                self.bus.publish(QueueEvent::Added { download: d });
                Ok::<_, QueueError>(id)
            })
            .await?;

        self.admit().await;
        Ok(id)
    }

    pub async fn pause(&self, id: DownloadId) -> Result<Ack, QueueError> {
        let ack = self.locks.run(DOWNLOADS, || self.pause_locked(id)).await?;
        if ack.is_applied() {
            self.admit().await;
        }
        Ok(ack)
    }

    async fn pause_locked(&self, id: DownloadId) -> Result<Ack, QueueError> {
        let current = self.state.lock().await.get(id).cloned();
        let Some(d) = current else {
            return Ok(Ack::Ignored(InvalidRequest::UnknownId));
        };
        if d.status != DownloadStatus::Downloading {
            tracing::debug!(id = %id, status = %d.status, "pause ignored");
            return Ok(Ack::Ignored(InvalidRequest::NotDownloading));
        }

        self.flush_progress(id).await;

        let progress = self.state.lock().await.get(id).map(|d| d.progress).unwrap_or(d.progress);
        let patch = DownloadPatch::status(DownloadStatus::Paused)
            .with_progress(progress)
            .clear_metrics();
        self.store.update(id, &patch).await?;

        let snapshot = {
            let mut st = self.state.lock().await;
            if let Some(job) = st.active.remove(&id) {
                job.stop.stop();
            }
            st.apply(id, &patch)
        };
        if let Some(download) = snapshot {
            tracing::info!(id = %id, progress, "download paused");
            self.bus.publish(QueueEvent::Paused { download });
        }
        Ok(Ack::Applied)
    }

    pub async fn pause_all(&self) -> Result<usize, QueueError> {
        let paused = self
            .locks
            .run(DOWNLOADS, || async {
                let targets: Vec<DownloadId> = {
                    let st = self.state.lock().await;
                    st.items
                        .iter()
                        .filter(|d| d.status == DownloadStatus::Downloading)
                        .map(|d| d.id)
                        .collect()
                };
                for id in &targets {
                    self.flush_progress(*id).await;
                }

                let patches: Vec<(DownloadId, DownloadPatch)> = {
                    let st = self.state.lock().await;
                    targets
                        .iter()
                        .filter_map(|id| st.get(*id))
                        .map(|d| {
                            let patch = DownloadPatch::status(DownloadStatus::Paused)
                                .with_progress(d.progress)
                                .clear_metrics();
                            (d.id, patch)
                        })
                        .collect()
                };
                if patches.is_empty() {
                    return Ok::<_, QueueError>(0);
                }
                self.store.update_many(&patches).await?;

                let snapshots: Vec<Download> = {
                    let mut st = self.state.lock().await;
                    patches
                        .iter()
                        .filter_map(|(id, patch)| {
                            if let Some(job) = st.active.remove(id) {
                                job.stop.stop();
                            }
                            st.apply(*id, patch)
                        })
                        .collect()
                };
                let n = snapshots.len();
                for download in snapshots {
                    self.bus.publish(QueueEvent::Paused { download });
                }
                tracing::info!(count = n, "paused all downloads");
                Ok(n)
            })
            .await?;

        if paused > 0 {
            self.admit().await;
        }
        Ok(paused)
    }

    /// Paused → downloading when a slot is free right now, otherwise paused → queued.
    pub async fn resume(&self, id: DownloadId) -> Result<Ack, QueueError> {
        let ack = self
            .locks
            .run(DOWNLOADS, || async {
                let (current, has_slot) = {
                    let st = self.state.lock().await;
                    let has_slot = st.downloading_count() < self.settings.get().concurrency;
                    (st.get(id).cloned(), has_slot)
                };
                let Some(d) = current else {
                    return Ok(Ack::Ignored(InvalidRequest::UnknownId));
                };
                if d.status != DownloadStatus::Paused {
                    tracing::debug!(id = %id, status = %d.status, "resume ignored");
                    return Ok(Ack::Ignored(InvalidRequest::NotPaused));
                }

                let admitting = self.started.load(Ordering::SeqCst);
                if admitting && has_slot && !self.runner.is_live(id) && self.no_older_queued(&d).await {
                    self.launch(d, &self.settings.get()).await?;
                    return Ok(Ack::Applied);
                }

                let ticket = self.state.lock().await.take_ticket();
                let patch = DownloadPatch::status(DownloadStatus::Queued).with_ticket(ticket);
                self.store.update(id, &patch).await?;
                let snapshot = self.state.lock().await.apply(id, &patch);
                if let Some(download) = snapshot {
                    tracing::info!(id = %id, "download re-queued");
                    self.bus.publish(QueueEvent::Queued { download });
                }
                Ok::<_, QueueError>(Ack::Applied)
            })
            .await?;

        if ack.is_applied() {
            self.admit().await;
        }
        Ok(ack)
    }

    /// True when no other queued download is waiting; a resumed download does
    /// not jump ahead of jobs that are already queued.
    async fn no_older_queued(&self, d: &Download) -> bool {
        let st = self.state.lock().await;
        !st.items
            .iter()
            .any(|o| o.id != d.id && o.status == DownloadStatus::Queued)
    }

    /// Re-queues every paused download (in queue order) and runs one admission pass.
    pub async fn resume_all(&self) -> Result<usize, QueueError> {
        let n = self
            .locks
            .run(DOWNLOADS, || async {
                let patches: Vec<(DownloadId, DownloadPatch)> = {
                    let mut st = self.state.lock().await;
                    let mut paused: Vec<(DownloadId, i64)> = st
                        .items
                        .iter()
                        .filter(|d| d.status == DownloadStatus::Paused)
                        .map(|d| (d.id, d.queue_ticket))
                        .collect();
                    paused.sort_by_key(|(_, t)| *t);
                    paused
                        .into_iter()
                        .map(|(id, _)| {
                            let ticket = st.take_ticket();
                            (id, DownloadPatch::status(DownloadStatus::Queued).with_ticket(ticket))
                        })
                        .collect()
                };
                if patches.is_empty() {
                    return Ok::<_, QueueError>(0);
                }
                self.store.update_many(&patches).await?;

                let snapshots: Vec<Download> = {
                    let mut st = self.state.lock().await;
                    patches.iter().filter_map(|(id, p)| st.apply(*id, p)).collect()
                };
                let n = snapshots.len();
                for download in snapshots {
                    self.bus.publish(QueueEvent::Queued { download });
                }
                tracing::info!(count = n, "resumed all downloads");
                Ok(n)
            })
            .await?;

        self.admit().await;
        Ok(n)
    }

    /// Error → queued, at the back of the queue. URL, format and options are kept.
    pub async fn retry(&self, id: DownloadId) -> Result<Ack, QueueError> {
        let ack = self
            .locks
            .run(DOWNLOADS, || async {
                let current = self.state.lock().await.get(id).cloned();
                let Some(d) = current else {
                    return Ok(Ack::Ignored(InvalidRequest::UnknownId));
                };
                if d.status != DownloadStatus::Error {
                    tracing::debug!(id = %id, status = %d.status, "retry ignored");
                    return Ok(Ack::Ignored(InvalidRequest::NotRetryable));
                }

                let ticket = self.state.lock().await.take_ticket();
                let patch = DownloadPatch::status(DownloadStatus::Queued)
                    .with_error(None)
                    .with_ticket(ticket)
                    .clear_metrics();
                self.store.update(id, &patch).await?;
                let snapshot = self.state.lock().await.apply(id, &patch);
                if let Some(download) = snapshot {
                    tracing::info!(id = %id, "download retried");
                    self.bus.publish(QueueEvent::Queued { download });
                }
                Ok::<_, QueueError>(Ack::Applied)
            })
            .await?;

        if ack.is_applied() {
            self.admit().await;
        }
        Ok(ack)
    }

    /// Removes the record from the store and memory, stopping its worker if one runs.
    pub async fn delete(&self, id: DownloadId) -> Result<Ack, QueueError> {
        let ack = self
            .locks
            .run(DOWNLOADS, || async {
                {
                    let st = self.state.lock().await;
                    if st.get(id).is_none() {
                        return Ok(Ack::Ignored(InvalidRequest::UnknownId));
                    }
                    // if the delete below fails, this run's exit lands as `paused`
                    if let Some(job) = st.active.get(&id) {
                        job.stop.stop();
                    }
                }
                self.store.delete(id).await?;

                {
                    let mut st = self.state.lock().await;
                    st.active.remove(&id);
                    st.items.retain(|d| d.id != id);
                }
                tracing::info!(id = %id, "download deleted");
                self.bus.publish(QueueEvent::Deleted { id });
                Ok::<_, QueueError>(Ack::Applied)
            })
            .await?;

        if ack.is_applied() {
            self.admit().await;
        }
        Ok(ack)
    }

    pub async fn update_settings(&self, settings: Settings) -> Result<(), QueueError> {
        let settings = settings.normalized();
        self.locks
            .run(SETTINGS, || self.store.put_settings(&settings))
            .await?;
        tracing::info!(concurrency = settings.concurrency, speed_limit = settings.speed_limit, "settings updated");
        self.settings.set(settings);
        Ok(())
    }

    async fn admit(&self) {
        if self.started.load(Ordering::SeqCst) {
            if let Err(e) = self.locks.run(DOWNLOADS, || self.admit_locked()).await {
                tracing::error!("admission pass failed: {}", e);
            }
        }
        if self.state.lock().await.is_idle() {
            self.idle.notify_waiters();
        }
    }

    /// Promotes queued downloads, oldest ticket first, while slots are free.
    async fn admit_locked(&self) -> Result<(), QueueError> {
        let settings = self.settings.get();
        // ids whose previous worker is still shutting down
        let mut blocked = HashSet::new();
        loop {
            let candidate = {
                let st = self.state.lock().await;
                if st.downloading_count() >= settings.concurrency {
                    return Ok(());
                }
                match st.next_queued(&blocked) {
                    Some(d) => d,
                    None => return Ok(()),
                }
            };
            if self.runner.is_live(candidate.id) {
                blocked.insert(candidate.id);
                continue;
            }
            let id = candidate.id;
            if !self.launch(candidate, &settings).await? {
                blocked.insert(id);
            }
        }
    }

    /// Starts a worker for `d`. Returns `false` if the runner still holds a
    /// process for this id and nothing changed.
    async fn launch(&self, d: Download, settings: &Settings) -> Result<bool, QueueError> {
        let resume = d.progress > 0;
        match self.runner.start(&d, settings, resume).await {
            Ok(handle) => {
                let patch = DownloadPatch::status(DownloadStatus::Downloading)
                    .with_error(None)
                    .clear_metrics();
                if let Err(e) = self.store.update(d.id, &patch).await {
                    handle.stop.stop();
                    return Err(e.into());
                }

                let (run_id, snapshot) = {
                    let mut st = self.state.lock().await;
                    st.next_run_id += 1;
                    let run_id = st.next_run_id;
                    st.active.insert(
                        d.id,
                        ActiveJob {
                            run_id,
                            stop: handle.stop.clone(),
                            throttle: ProgressThrottle::new(self.config.progress_interval),
                            dirty: false,
                            destination: None,
                        },
                    );
                    (run_id, st.apply(d.id, &patch))
                };
                if let Some(download) = snapshot {
                    tracing::info!(id = %d.id, resume, worker = self.runner.worker_name(), "download started");
                    self.bus.publish(QueueEvent::Started { download });
                }
                tokio::spawn(self.clone().drive(d.id, run_id, handle.events));
                Ok(true)
            }
            Err(e) if !e.is_spawn_failure() => {
                tracing::warn!(id = %d.id, "worker for this download is still running; admission deferred");
                Ok(false)
            }
            // no process ever existed, so the record goes queued -> error without a `started` event
            Err(e) => {
                tracing::warn!(id = %d.id, "worker failed to start: {}", e);
                let error = DownloadError { kind: ErrorKind::Spawn, message: e.to_string(), retryable: true };
                let patch = DownloadPatch::status(DownloadStatus::Error)
                    .with_error(Some(error))
                    .clear_metrics();
                self.store.update(d.id, &patch).await?;
                let snapshot = self.state.lock().await.apply(d.id, &patch);
                if let Some(download) = snapshot {
                    self.bus.publish(QueueEvent::Error { download });
                }
                Ok(true)
            }
        }
    }

    // Boxed so the spawn inside `launch` does not make this future's type recursive.
    fn drive(
        self,
        id: DownloadId,
        run_id: u64,
        events: mpsc::Receiver<RunnerEvent>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            self.drive_inner(id, run_id, events).await;
        })
    }

    async fn drive_inner(self, id: DownloadId, run_id: u64, mut events: mpsc::Receiver<RunnerEvent>) {
        let mut exited = false;
        while let Some(ev) = events.recv().await {
            match ev {
                RunnerEvent::Progress(p) => self.on_progress(id, run_id, p).await,
                RunnerEvent::Destination(path) => {
                    let mut st = self.state.lock().await;
                    if let Some(job) = st.active.get_mut(&id).filter(|j| j.run_id == run_id) {
                        job.destination = Some(path);
                    }
                }
                RunnerEvent::Exit { outcome, tail } => {
                    self.on_exit(id, run_id, outcome, tail).await;
                    exited = true;
                    break;
                }
            }
        }
        if !exited {
            let outcome = ExitOutcome::WaitFailed("worker supervisor ended without an exit status".to_string());
            self.on_exit(id, run_id, outcome, vec![]).await;
        }
        self.admit().await;
    }

    async fn on_progress(&self, id: DownloadId, run_id: u64, p: ProgressEvent) {
        let snapshot = {
            let mut guard = self.state.lock().await;
            let st = &mut *guard;
            if !st.is_current(id, run_id) {
                // termination was requested; late output must not revive the record
                return;
            }
            let Some(d) = st.items.iter_mut().find(|d| d.id == id) else {
                return;
            };
            if d.status != DownloadStatus::Downloading {
                return;
            }
            merge_progress(d, &p);
            let snapshot = d.clone();

            let Some(job) = st.active.get_mut(&id) else {
                return;
            };
            if job.throttle.should_emit() {
                job.dirty = false;
                Some(snapshot)
            } else {
                job.dirty = true;
                None
            }
        };

        if let Some(snapshot) = snapshot {
            self.locks
                .run(DOWNLOADS, || self.persist_progress(id, Some(run_id), snapshot))
                .await;
        }
    }

    /// Writes the current progress if throttling held some back. Caller holds the section.
    async fn flush_progress(&self, id: DownloadId) {
        let snapshot = {
            let mut guard = self.state.lock().await;
            let st = &mut *guard;
            match st.active.get_mut(&id) {
                Some(job) if job.dirty => job.dirty = false,
                _ => return,
            }
            st.get(id).cloned()
        };
        if let Some(snapshot) = snapshot {
            self.persist_progress(id, None, snapshot).await;
        }
    }

    /// Caller holds the section. With `run_id`, the write is skipped when that
    /// run has been stopped or replaced in the meantime.
    async fn persist_progress(&self, id: DownloadId, run_id: Option<u64>, snapshot: Download) {
        if let Some(run_id) = run_id {
            if !self.state.lock().await.is_current(id, run_id) {
                return;
            }
        }
        let patch = DownloadPatch {
            updated_at: snapshot.updated_at,
            ..DownloadPatch::progress(snapshot.progress, snapshot.metrics.clone())
        };
        match self.store.update(id, &patch).await {
            Ok(()) => self.bus.publish(QueueEvent::Progress { download: snapshot }),
            Err(e) => tracing::warn!(id = %id, "progress not persisted: {}", e),
        }
    }

    async fn on_exit(&self, id: DownloadId, run_id: u64, outcome: ExitOutcome, tail: Vec<String>) {
        self.locks
            .run(DOWNLOADS, || async {
                {
                    let st = self.state.lock().await;
                    if !st.active.get(&id).is_some_and(|j| j.run_id == run_id) {
                        // paused or deleted while running; that command already recorded the state
                        tracing::debug!(id = %id, ?outcome, "exit of a stopped worker ignored");
                        return;
                    }
                }

                self.flush_progress(id).await;

                let (progress, destination) = {
                    let st = self.state.lock().await;
                    (
                        st.get(id).map(|d| d.progress).unwrap_or(0),
                        st.active.get(&id).and_then(|j| j.destination.clone()),
                    )
                };

                let patch = match &outcome {
                    ExitOutcome::Exited { code: 0 } => DownloadPatch::status(DownloadStatus::Completed)
                        .with_progress(100)
                        .with_file_path(destination)
                        .clear_metrics(),
                    ExitOutcome::StoppedByRequest => DownloadPatch::status(DownloadStatus::Paused)
                        .with_progress(progress)
                        .clear_metrics(),
                    failed => {
                        let message = describe_failure(failed, &tail);
                        let retryable = is_retryable(&message);
                        DownloadPatch::status(DownloadStatus::Error)
                            .with_progress(progress)
                            .with_error(Some(DownloadError { kind: ErrorKind::Worker, message, retryable }))
                            .clear_metrics()
                    }
                };

                let persisted = self.store.update(id, &patch).await;
                let snapshot = {
                    let mut st = self.state.lock().await;
                    st.active.remove(&id);
                    match &persisted {
                        Ok(()) => st.apply(id, &patch),
                        Err(_) => None,
                    }
                };
                if let Err(e) = persisted {
                    tracing::error!(id = %id, ?outcome, "worker exit not persisted: {}", e);
                    return;
                }

                if let Some(download) = snapshot {
                    let event = match download.status {
                        DownloadStatus::Completed => {
                            tracing::info!(id = %id, file = ?download.file_path, "download completed");
                            QueueEvent::Completed { download }
                        }
                        DownloadStatus::Paused => QueueEvent::Paused { download },
                        _ => {
                            tracing::warn!(id = %id, error = ?download.error, "download failed");
                            QueueEvent::Error { download }
                        }
                    };
                    self.bus.publish(event);
                }
            })
            .await
    }
}

fn merge_progress(d: &mut Download, p: &ProgressEvent) {
    if let Some(pct) = p.percent {
        let pct = pct.clamp(0.0, 100.0).floor() as u8;
        d.progress = d.progress.max(pct);
    }
    if p.speed_value.is_some() {
        d.metrics.speed_value = p.speed_value;
        d.metrics.speed_text = p.speed_text.clone();
    }
    if let Some(eta) = &p.eta {
        d.metrics.eta = Some(eta.clone());
    }
    if let Some(total) = p.total_size {
        d.metrics.total_size = Some(total);
    }
    d.updated_at = Utc::now();
}

fn describe_failure(outcome: &ExitOutcome, tail: &[String]) -> String {
    if let Some(line) = tail.iter().rev().find(|l| l.starts_with("ERROR:")) {
        return line.trim_start_matches("ERROR:").trim().to_string();
    }
    let base = match outcome {
        ExitOutcome::Exited { code } => format!("worker exited with code {}", code),
        ExitOutcome::Signaled => "worker was terminated by a signal".to_string(),
        ExitOutcome::WaitFailed(msg) => format!("lost track of worker: {}", msg),
        ExitOutcome::StoppedByRequest => "worker stopped".to_string(),
    };
    match tail.last() {
        Some(last) => format!("{}: {}", base, last),
        None => base,
    }
}

fn is_retryable(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    !PERMANENT_FAILURES.iter().any(|p| m.contains(p))
}
