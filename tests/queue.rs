#![cfg(unix)]

use async_trait::async_trait;
use media_queue::core::engine::{Engine, EngineConfig};
use media_queue::core::error::{Ack, InvalidRequest, QueueError};
use media_queue::core::events::QueueEvent;
use media_queue::core::model::{
    Download, DownloadOptions, DownloadRequest, DownloadStatus, ErrorKind, Settings,
};
use media_queue::core::runner::{ProcessRunner, RunnerConfig};
use media_queue::core::store::SqliteStore;
use media_queue::plugins::registry::WorkerDriver;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

/// Behaviour is picked from the URL:
/// `.../fail` exits with a permanent error, `.../flaky` with a transient one,
/// `.../hold` reports 30% and then blocks, `.../burst` prints 10..70% at once and
/// exits 2, anything else runs five steps and completes.
const WORKER: &str = r#"#!/bin/sh
url="$1"
case "$url" in
  *fail*)
    echo "ERROR: [generic] Unsupported URL: $url" >&2
    exit 1 ;;
  *flaky*)
    echo "ERROR: unable to download video data: HTTP Error 503" >&2
    exit 1 ;;
  *hold*)
    printf '[download]  30.0%% of 1.00MiB at 1.00KiB/s ETA 00:10\n'
    exec sleep 30 ;;
  *burst*)
    for pct in 10 20 30 40 50 60 70; do
      printf '[download] %5.1f%% of 1.00MiB at 2.00MiB/s ETA 00:01\n' "$pct"
    done
    echo "ERROR: unable to download video data: HTTP Error 500" >&2
    exit 2 ;;
esac
echo "[download] Destination: /tmp/media-queue-test/out.mp4"
for pct in 20 40 60 80 100; do
  printf '[download] %5.1f%% of 1.00MiB at 2.00MiB/s ETA 00:01\n' "$pct"
  sleep 0.1
done
exit 0
"#;

struct FakeWorker {
    path: Option<PathBuf>,
}

#[async_trait]
impl WorkerDriver for FakeWorker {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn locate(&self) -> Option<PathBuf> {
        self.path.clone()
    }

    fn build_args(&self, d: &Download, _s: &Settings, _resume: bool) -> Vec<String> {
        vec![d.url.clone()]
    }
}

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let worker = dir.path().join("worker.sh");
        std::fs::write(&worker, WORKER).unwrap();
        std::fs::set_permissions(&worker, std::fs::Permissions::from_mode(0o755)).unwrap();
        Self { dir }
    }

    fn db(&self) -> PathBuf {
        self.dir.path().join("queue.sqlite")
    }

    fn worker(&self) -> PathBuf {
        self.dir.path().join("worker.sh")
    }

    async fn store(&self) -> SqliteStore {
        SqliteStore::open(&self.db()).await.unwrap()
    }

    async fn engine(&self, concurrency: usize) -> Engine {
        self.engine_with(Some(self.worker()), concurrency, EngineConfig::default()).await
    }

    async fn engine_with(&self, worker: Option<PathBuf>, concurrency: usize, config: EngineConfig) -> Engine {
        let runner = ProcessRunner::new(
            Arc::new(FakeWorker { path: worker }),
            RunnerConfig { stop_grace: Duration::from_millis(500), ..Default::default() },
        );
        let engine = Engine::open(self.store().await, runner, config).await.unwrap();
        engine
            .update_settings(Settings {
                concurrency,
                download_directory: self.dir.path().join("out"),
                ..Settings::default()
            })
            .await
            .unwrap();
        engine
    }
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<QueueEvent>, mut f: F) -> QueueEvent
where
    F: FnMut(&QueueEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(e) if f(&e) => return e,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn is_for(e: &QueueEvent, topic: &str, id: uuid::Uuid) -> bool {
    e.topic() == topic && e.download().map(|d| d.id) == Some(id)
}

async fn wait_until<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        while !cond().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

async fn stored(store: &SqliteStore, id: uuid::Uuid) -> Option<Download> {
    store.load_all().await.unwrap().into_iter().find(|d| d.id == id)
}

#[tokio::test]
async fn concurrent_adds_are_all_persisted() {
    let fx = Fixture::new();
    let engine = fx.engine(2).await;

    let adds = (0..50).map(|i| {
        let engine = engine.clone();
        async move { engine.add(DownloadRequest::new(format!("https://example.com/v/{i}"))).await }
    });
    let ids: Vec<_> = futures::future::join_all(adds)
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    let rows = fx.store().await.load_all().await.unwrap();
    assert_eq!(rows.len(), 50);
    assert!(rows.iter().all(|d| d.status == DownloadStatus::Queued));
    for id in &ids {
        assert!(rows.iter().any(|d| d.id == *id));
    }

    let mut tickets: Vec<_> = rows.iter().map(|d| d.queue_ticket).collect();
    tickets.sort();
    tickets.dedup();
    assert_eq!(tickets.len(), 50);
}

#[tokio::test]
async fn invalid_urls_are_rejected_without_a_record() {
    let fx = Fixture::new();
    let engine = fx.engine(2).await;

    assert!(matches!(engine.add(DownloadRequest::new("   ")).await, Err(QueueError::InvalidUrl(_))));
    assert!(matches!(engine.add(DownloadRequest::new("not a url")).await, Err(QueueError::InvalidUrl(_))));
    assert!(engine.snapshot().await.is_empty());
}

#[tokio::test]
async fn running_downloads_never_exceed_concurrency() {
    let fx = Fixture::new();
    let engine = fx.engine(2).await;
    let mut rx = engine.subscribe();

    let mut ids = vec![];
    for i in 0..6 {
        ids.push(engine.add(DownloadRequest::new(format!("https://example.com/ok/{i}"))).await.unwrap());
    }
    engine.start().await;

    let mut running = 0i32;
    let mut peak = 0i32;
    let mut finished = 0;
    tokio::time::timeout(Duration::from_secs(20), async {
        while finished < 6 {
            match rx.recv().await {
                Ok(QueueEvent::Started { .. }) => {
                    running += 1;
                    peak = peak.max(running);
                }
                Ok(QueueEvent::Completed { .. }) | Ok(QueueEvent::Error { .. }) => {
                    running -= 1;
                    finished += 1;
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
    .await
    .expect("downloads did not finish");

    assert!(peak <= 2, "peak concurrency was {peak}");
    assert_eq!(peak, 2);

    engine.wait_idle().await;
    let store = fx.store().await;
    for id in ids {
        let d = stored(&store, id).await.unwrap();
        assert_eq!(d.status, DownloadStatus::Completed);
        assert_eq!(d.progress, 100);
        assert_eq!(d.file_path, Some(PathBuf::from("/tmp/media-queue-test/out.mp4")));
        assert!(d.metrics.speed_value.is_none());
    }
}

#[tokio::test]
async fn pause_and_resume_keep_the_request() {
    let fx = Fixture::new();
    let engine = fx.engine(2).await;
    let mut rx = engine.subscribe();

    let req = DownloadRequest {
        url: "https://example.com/hold/1".into(),
        format_id: Some("137+140".into()),
        options: DownloadOptions { audio_only: false, audio_format: None, quality: Some("1080p".into()) },
    };
    let id = engine.add(req).await.unwrap();
    engine.start().await;

    wait_for(&mut rx, |e| is_for(e, "progress", id) && e.download().map(|d| d.progress) == Some(30)).await;

    assert_eq!(engine.pause(id).await.unwrap(), Ack::Applied);
    assert_eq!(engine.pause(id).await.unwrap(), Ack::Ignored(InvalidRequest::NotDownloading));

    let d = stored(&fx.store().await, id).await.unwrap();
    assert_eq!(d.status, DownloadStatus::Paused);
    assert_eq!(d.progress, 30);
    assert_eq!(d.url, "https://example.com/hold/1");
    assert_eq!(d.format_id.as_deref(), Some("137+140"));
    assert_eq!(d.options.quality.as_deref(), Some("1080p"));
    assert_eq!(engine.active_count().await, 0);

    assert_eq!(engine.resume(id).await.unwrap(), Ack::Applied);
    wait_for(&mut rx, |e| is_for(e, "started", id)).await;
    let d = engine.get(id).await.unwrap();
    assert_eq!(d.status, DownloadStatus::Downloading);
    assert_eq!(d.progress, 30);

    engine.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn permanent_failure_is_not_retryable_but_can_still_be_retried() {
    let fx = Fixture::new();
    let engine = fx.engine(1).await;
    let mut rx = engine.subscribe();

    let id = engine.add(DownloadRequest::new("https://example.com/fail")).await.unwrap();
    engine.start().await;

    let e = wait_for(&mut rx, |e| is_for(e, "error", id)).await;
    let err = e.download().and_then(|d| d.error.clone()).unwrap();
    assert_eq!(err.kind, ErrorKind::Worker);
    assert!(!err.retryable);
    assert!(err.message.contains("Unsupported URL"), "{}", err.message);

    assert_eq!(engine.retry(id).await.unwrap(), Ack::Applied);
    wait_for(&mut rx, |e| is_for(e, "queued", id)).await;
    wait_for(&mut rx, |e| is_for(e, "error", id)).await;

    assert_eq!(
        engine.retry(uuid::Uuid::new_v4()).await.unwrap(),
        Ack::Ignored(InvalidRequest::UnknownId)
    );
}

#[tokio::test]
async fn transient_failure_is_retryable() {
    let fx = Fixture::new();
    let engine = fx.engine(1).await;
    let mut rx = engine.subscribe();

    let id = engine.add(DownloadRequest::new("https://example.com/flaky")).await.unwrap();
    engine.start().await;

    let e = wait_for(&mut rx, |e| is_for(e, "error", id)).await;
    let err = e.download().and_then(|d| d.error.clone()).unwrap();
    assert!(err.retryable);
    assert!(err.message.contains("503"));
}

#[tokio::test]
async fn missing_worker_binary_puts_the_download_in_error() {
    let fx = Fixture::new();
    let engine = fx.engine_with(None, 2, EngineConfig::default()).await;
    let mut rx = engine.subscribe();

    let id = engine.add(DownloadRequest::new("https://example.com/v")).await.unwrap();
    engine.start().await;

    wait_for(&mut rx, |e| is_for(e, "error", id)).await;
    let d = stored(&fx.store().await, id).await.unwrap();
    assert_eq!(d.status, DownloadStatus::Error);
    let err = d.error.unwrap();
    assert_eq!(err.kind, ErrorKind::Spawn);
    assert!(err.retryable);
    assert_eq!(engine.active_count().await, 0);
}

#[tokio::test]
async fn deleting_a_running_download_removes_it_for_good() {
    let fx = Fixture::new();
    let engine = fx.engine(2).await;
    let mut rx = engine.subscribe();

    let id = engine.add(DownloadRequest::new("https://example.com/hold/del")).await.unwrap();
    engine.start().await;
    wait_for(&mut rx, |e| is_for(e, "started", id)).await;

    assert_eq!(engine.delete(id).await.unwrap(), Ack::Applied);
    wait_for(&mut rx, |e| matches!(e, QueueEvent::Deleted { id: d } if *d == id)).await;
    assert!(engine.get(id).await.is_none());
    assert_eq!(engine.delete(id).await.unwrap(), Ack::Ignored(InvalidRequest::UnknownId));
    let e = &engine;
    wait_until(|| async move { e.live_workers() == 0 }).await;

    drop(engine);
    let reopened = fx.engine(2).await;
    assert!(reopened.get(id).await.is_none());
    assert!(stored(&fx.store().await, id).await.is_none());
}

async fn seed_interrupted(store: &SqliteStore) -> Download {
    let mut d = Download::new(DownloadRequest::new("https://example.com/hold/crash"), 1);
    d.status = DownloadStatus::Downloading;
    d.progress = 55;
    store.insert(&d).await.unwrap();
    d
}

#[tokio::test]
async fn interrupted_download_comes_back_paused() {
    let fx = Fixture::new();
    let seeded = seed_interrupted(&fx.store().await).await;

    let engine = fx.engine(2).await;
    let d = engine.get(seeded.id).await.unwrap();
    assert_eq!(d.status, DownloadStatus::Paused);
    assert_eq!(d.progress, 55);
    assert_eq!(stored(&fx.store().await, seeded.id).await.unwrap().status, DownloadStatus::Paused);

    // stays paused after start, too
    engine.start().await;
    assert_eq!(engine.active_count().await, 0);
    assert_eq!(engine.get(seeded.id).await.unwrap().status, DownloadStatus::Paused);
}

#[tokio::test]
async fn interrupted_download_can_be_requeued_on_recovery() {
    let fx = Fixture::new();
    let seeded = seed_interrupted(&fx.store().await).await;

    let config = EngineConfig { resume_recovered: true, ..Default::default() };
    let engine = fx.engine_with(Some(fx.worker()), 2, config).await;
    assert_eq!(engine.get(seeded.id).await.unwrap().status, DownloadStatus::Queued);

    let mut rx = engine.subscribe();
    engine.start().await;
    wait_for(&mut rx, |e| is_for(e, "started", seeded.id)).await;
    engine.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn raising_concurrency_admits_waiting_downloads() {
    let fx = Fixture::new();
    let engine = fx.engine(1).await;

    for i in 0..3 {
        engine.add(DownloadRequest::new(format!("https://example.com/hold/{i}"))).await.unwrap();
    }
    engine.start().await;
    assert_eq!(engine.active_count().await, 1);

    let mut s = engine.settings();
    s.concurrency = 3;
    engine.update_settings(s).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.active_count().await < 3 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("queued downloads were not admitted");

    assert_eq!(engine.shutdown(Duration::from_secs(2)).await.unwrap(), 3);
    assert_eq!(engine.active_count().await, 0);
}

#[tokio::test]
async fn settings_survive_a_restart() {
    let fx = Fixture::new();
    let engine = fx.engine(4).await;
    let mut s = engine.settings();
    s.speed_limit = 512;
    s.proxy = Some("socks5://127.0.0.1:1080".into());
    engine.update_settings(s).await.unwrap();
    drop(engine);

    let stored = fx.store().await.get_settings().await.unwrap().unwrap();
    assert_eq!(stored.concurrency, 4);
    assert_eq!(stored.speed_limit, 512);
    assert_eq!(stored.proxy.as_deref(), Some("socks5://127.0.0.1:1080"));
    assert_eq!(stored.download_directory, fx.dir.path().join("out"));
}

#[tokio::test]
async fn queued_downloads_start_oldest_first() {
    let fx = Fixture::new();
    let engine = fx.engine(1).await;
    let mut rx = engine.subscribe();

    let mut ids = vec![];
    for i in 0..4 {
        ids.push(engine.add(DownloadRequest::new(format!("https://example.com/ok/{i}"))).await.unwrap());
    }
    engine.start().await;

    let mut started = vec![];
    while started.len() < ids.len() {
        if let QueueEvent::Started { download } = wait_for(&mut rx, |e| e.topic() == "started").await {
            started.push(download.id);
        }
    }
    assert_eq!(started, ids);
    engine.wait_idle().await;
}

#[tokio::test]
async fn resume_all_respects_a_lowered_limit() {
    let fx = Fixture::new();
    let engine = fx.engine(3).await;
    let mut rx = engine.subscribe();

    let mut ids = vec![];
    for i in 0..3 {
        ids.push(engine.add(DownloadRequest::new(format!("https://example.com/hold/{i}"))).await.unwrap());
    }
    engine.start().await;
    for id in &ids {
        wait_for(&mut rx, |e| is_for(e, "progress", *id) && e.download().map(|d| d.progress) == Some(30)).await;
    }

    assert_eq!(engine.pause_all().await.unwrap(), 3);
    assert_eq!(engine.active_count().await, 0);

    let mut s = engine.settings();
    s.concurrency = 1;
    engine.update_settings(s).await.unwrap();

    assert_eq!(engine.resume_all().await.unwrap(), 3);
    let e = &engine;
    wait_until(|| async move { e.active_count().await == 1 }).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let all = engine.snapshot().await;
    let count = |st: DownloadStatus| all.iter().filter(|d| d.status == st).count();
    assert_eq!(count(DownloadStatus::Downloading), 1);
    assert_eq!(count(DownloadStatus::Queued), 2);
    assert!(all.iter().all(|d| d.progress == 30));

    engine.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn throttled_progress_is_saved_before_the_error() {
    let fx = Fixture::new();
    let config = EngineConfig { progress_interval: Duration::from_secs(60), ..Default::default() };
    let engine = fx.engine_with(Some(fx.worker()), 1, config).await;
    let mut rx = engine.subscribe();

    let id = engine.add(DownloadRequest::new("https://example.com/burst")).await.unwrap();
    engine.start().await;

    let e = wait_for(&mut rx, |e| is_for(e, "error", id)).await;
    assert_eq!(e.download().map(|d| d.progress), Some(70));

    let d = stored(&fx.store().await, id).await.unwrap();
    assert_eq!(d.status, DownloadStatus::Error);
    assert_eq!(d.progress, 70);
    assert!(d.error.unwrap().message.contains("HTTP Error 500"));
}

#[tokio::test]
async fn retried_download_waits_behind_queued_jobs() {
    let fx = Fixture::new();
    let engine = fx.engine(1).await;
    let mut rx = engine.subscribe();

    let failed = engine.add(DownloadRequest::new("https://example.com/fail")).await.unwrap();
    let first = engine.add(DownloadRequest::new("https://example.com/hold/a")).await.unwrap();
    let second = engine.add(DownloadRequest::new("https://example.com/hold/b")).await.unwrap();
    engine.start().await;

    wait_for(&mut rx, |e| is_for(e, "error", failed)).await;
    wait_for(&mut rx, |e| is_for(e, "started", first)).await;

    assert_eq!(engine.retry(failed).await.unwrap(), Ack::Applied);
    let retried = engine.get(failed).await.unwrap();
    assert_eq!(retried.status, DownloadStatus::Queued);
    assert!(retried.error.is_none());
    assert!(retried.queue_ticket > engine.get(second).await.unwrap().queue_ticket);

    assert_eq!(engine.pause(first).await.unwrap(), Ack::Applied);
    wait_for(&mut rx, |e| is_for(e, "started", second)).await;
    assert_eq!(engine.get(failed).await.unwrap().status, DownloadStatus::Queued);

    engine.shutdown(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn start_after_shutdown_turns_admission_back_on() {
    let fx = Fixture::new();
    let engine = fx.engine(1).await;
    let mut rx = engine.subscribe();

    let id = engine.add(DownloadRequest::new("https://example.com/hold/x")).await.unwrap();
    let waiting = engine.add(DownloadRequest::new("https://example.com/hold/y")).await.unwrap();
    engine.start().await;
    wait_for(&mut rx, |e| is_for(e, "started", id)).await;

    assert_eq!(engine.shutdown(Duration::from_secs(2)).await.unwrap(), 1);
    assert_eq!(engine.live_workers(), 0);
    assert_eq!(engine.get(waiting).await.unwrap().status, DownloadStatus::Queued);

    engine.start().await;
    wait_for(&mut rx, |e| matches!(e, QueueEvent::Loaded { .. })).await;
    wait_for(&mut rx, |e| is_for(e, "started", waiting)).await;

    // the settings watcher still reacts after the restart
    let mut s = engine.settings();
    s.concurrency = 2;
    engine.update_settings(s).await.unwrap();
    assert_eq!(engine.resume(id).await.unwrap(), Ack::Applied);
    let e = &engine;
    wait_until(|| async move { e.active_count().await == 2 }).await;

    engine.shutdown(Duration::from_secs(2)).await.unwrap();
}
