use clap::{Arg, ArgAction, ArgMatches, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use media_queue::core::engine::{Engine, EngineConfig};
use media_queue::core::error::{Ack, QueueError};
use media_queue::core::events::QueueEvent;
use media_queue::core::model::{Download, DownloadId, DownloadOptions, DownloadRequest, DownloadStatus};
use media_queue::core::paths;
use media_queue::core::runner::{ProcessRunner, RunnerConfig};
use media_queue::core::store::SqliteStore;
use media_queue::plugins::registry::{PluginRegistry, WorkerCliConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;

fn id_arg() -> Arg {
    Arg::new("id").help("Download id").required(true).num_args(1)
}

fn build_cli(registry: &PluginRegistry) -> Command {
    let run = Command::new("run")
        .about("Queue URLs (if any) and download until the queue is empty")
        .arg(
            Arg::new("urls")
                .help("URLs to add before starting")
                .action(ArgAction::Append)
                .num_args(0..),
        )
        .arg(
            Arg::new("format")
                .long("format")
                .short('f')
                .help("Worker format id for the added URLs")
                .num_args(1),
        )
        .arg(
            Arg::new("quality")
                .long("quality")
                .help("Maximum video height, e.g. 720p")
                .num_args(1),
        )
        .arg(
            Arg::new("audio")
                .long("audio")
                .help("Extract audio only")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("audio_format")
                .long("audio-format")
                .help("Audio codec when --audio is set (default: mp3)")
                .requires("audio")
                .num_args(1),
        )
        .arg(
            Arg::new("resume_recovered")
                .long("resume-recovered")
                .help("Re-queue downloads interrupted by a previous crash instead of leaving them paused")
                .action(ArgAction::SetTrue),
        );
    let run = registry.augment_run_command(run);

    let list = Command::new("list").about("Show stored downloads").arg(
        Arg::new("json")
            .long("json")
            .help("Print records as JSON")
            .action(ArgAction::SetTrue),
    );

    let settings = Command::new("settings")
        .about("Show or change queue settings")
        .arg(Arg::new("concurrency").long("concurrency").help("Simultaneous downloads").num_args(1))
        .arg(Arg::new("speed_limit").long("speed-limit").help("Per-download limit in KiB/s, 0 = unlimited").num_args(1))
        .arg(Arg::new("dir").long("dir").help("Download directory").num_args(1))
        .arg(Arg::new("proxy").long("proxy").help("Proxy URL, empty to clear").num_args(1))
        .arg(Arg::new("default_format").long("default-format").help("Fallback format selector, empty to clear").num_args(1));

    Command::new("media-queue")
        .about("Download queue for yt-dlp with bounded concurrency and crash recovery")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("db")
                .long("db")
                .global(true)
                .help("Queue database (default: <data dir>/media-queue/queue.sqlite)")
                .num_args(1),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .help("More log output (-v debug, -vv trace)")
                .action(ArgAction::Count),
        )
        .subcommand(run)
        .subcommand(list)
        .subcommand(Command::new("pause").about("Pause a download").arg(id_arg()))
        .subcommand(Command::new("resume").about("Resume a paused download").arg(id_arg()))
        .subcommand(Command::new("retry").about("Re-queue a failed download").arg(id_arg()))
        .subcommand(Command::new("delete").about("Remove a download").arg(id_arg()))
        .subcommand(Command::new("pause-all").about("Pause every running download"))
        .subcommand(Command::new("resume-all").about("Re-queue every paused download"))
        .subcommand(settings)
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let registry = PluginRegistry::with_defaults();
    let app = build_cli(&registry);
    let matches = app.get_matches();

    init_logging(matches.get_count("verbose"));

    let db_path = matches
        .get_one::<String>("db")
        .map(PathBuf::from)
        .unwrap_or_else(paths::default_db_path);
    let store = SqliteStore::open(&db_path).await?;
    tracing::debug!(db = %db_path.display(), "store opened");

    match matches.subcommand() {
        Some(("run", m)) => run(&registry, store, m).await?,
        Some(("list", m)) => list(store, m.get_flag("json")).await?,
        Some(("settings", m)) => settings(store, m).await?,
        Some((cmd @ ("pause" | "resume" | "retry" | "delete"), m)) => {
            let id = parse_id(m)?;
            let engine = open_engine(&registry, store, &WorkerCliConfig::default(), EngineConfig::default()).await?;
            let ack = match cmd {
                "pause" => engine.pause(id).await?,
                "resume" => engine.resume(id).await?,
                "retry" => engine.retry(id).await?,
                _ => engine.delete(id).await?,
            };
            match ack {
                Ack::Applied => println!("{} {}: ok", cmd, id),
                Ack::Ignored(reason) => println!("{} {}: ignored ({})", cmd, id, reason),
            }
        }
        Some((cmd @ ("pause-all" | "resume-all"), _)) => {
            let engine = open_engine(&registry, store, &WorkerCliConfig::default(), EngineConfig::default()).await?;
            let n = match cmd {
                "pause-all" => engine.pause_all().await?,
                _ => engine.resume_all().await?,
            };
            println!("{}: {} download(s) changed", cmd, n);
        }
        _ => {}
    }

    Ok(())
}

fn parse_id(m: &ArgMatches) -> anyhow::Result<DownloadId> {
    let raw = m
        .get_one::<String>("id")
        .ok_or_else(|| anyhow::anyhow!("missing download id"))?;
    Ok(raw.parse()?)
}

async fn open_engine(
    registry: &PluginRegistry,
    store: SqliteStore,
    worker: &WorkerCliConfig,
    config: EngineConfig,
) -> Result<Engine, QueueError> {
    let runner = ProcessRunner::new(registry.worker_driver(worker), RunnerConfig::default());
    Engine::open(store, runner, config).await
}

async fn run(registry: &PluginRegistry, store: SqliteStore, m: &ArgMatches) -> anyhow::Result<()> {
    let mut worker = WorkerCliConfig::default();
    registry.apply_run_matches(m, &mut worker)?;

    let config = EngineConfig {
        resume_recovered: m.get_flag("resume_recovered"),
        ..Default::default()
    };
    let engine = open_engine(registry, store, &worker, config).await?;
    tokio::fs::create_dir_all(&engine.settings().download_directory).await?;

    let rx = engine.subscribe();
    let ui_task = tokio::spawn(render(rx));

    let options = DownloadOptions {
        audio_only: m.get_flag("audio"),
        audio_format: m.get_one::<String>("audio_format").cloned(),
        quality: m.get_one::<String>("quality").cloned(),
    };
    for url in m.get_many::<String>("urls").into_iter().flatten() {
        let req = DownloadRequest {
            url: url.clone(),
            format_id: m.get_one::<String>("format").cloned(),
            options: options.clone(),
        };
        match engine.add(req).await {
            Ok(id) => tracing::debug!(id = %id, url = %url, "queued"),
            Err(QueueError::InvalidUrl(u)) => eprintln!("skipping invalid url: {}", u),
            Err(e) => return Err(e.into()),
        }
    }

    engine.start().await;

    tokio::select! {
        _ = engine.wait_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            let grace = RunnerConfig::default().stop_grace + Duration::from_secs(1);
            let paused = engine.shutdown(grace).await?;
            eprintln!("interrupted; paused {} download(s)", paused);
        }
    }

    ui_task.abort();
    let _ = ui_task.await;

    print_summary(&engine.snapshot().await);
    Ok(())
}

async fn render(mut rx: broadcast::Receiver<QueueEvent>) {
    let mp = MultiProgress::new();
    let sty = match ProgressStyle::with_template("{prefix} {bar:40.cyan/blue} {pos:>3}% {wide_msg}") {
        Ok(s) => s,
        Err(_) => ProgressStyle::default_bar(),
    };
    let mut bars: HashMap<DownloadId, ProgressBar> = HashMap::new();

    loop {
        let evt = match rx.recv().await {
            Ok(e) => e,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!(skipped = n, "progress view lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match evt {
            QueueEvent::Loaded { downloads } => {
                for d in downloads.iter().filter(|d| !d.status.is_terminal()) {
                    let pb = bar_for(&mp, &sty, &mut bars, d);
                    pb.set_position(d.progress as u64);
                    pb.set_message(format!("{} {}", d.status, d.url));
                }
            }
            QueueEvent::Added { download } | QueueEvent::Queued { download } => {
                bar_for(&mp, &sty, &mut bars, &download).set_message(format!("queued {}", download.url));
            }
            QueueEvent::Started { download } => {
                let pb = bar_for(&mp, &sty, &mut bars, &download);
                pb.set_position(download.progress as u64);
                pb.set_message(format!("downloading {}", download.url));
            }
            QueueEvent::Progress { download } => {
                let pb = bar_for(&mp, &sty, &mut bars, &download);
                pb.set_position(download.progress as u64);
                let speed = download.metrics.speed_text.as_deref().unwrap_or("-");
                let eta = download.metrics.eta.as_deref().unwrap_or("-");
                pb.set_message(format!("{} | eta {} | {}", speed, eta, download.url));
            }
            QueueEvent::Paused { download } => {
                bar_for(&mp, &sty, &mut bars, &download).set_message(format!("paused {}", download.url));
            }
            QueueEvent::Completed { download } => {
                let target = download
                    .file_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| download.url.clone());
                bar_for(&mp, &sty, &mut bars, &download).finish_with_message(format!("done {}", target));
            }
            QueueEvent::Error { download } => {
                let reason = download.error.as_ref().map(|e| e.message.as_str()).unwrap_or("failed");
                bar_for(&mp, &sty, &mut bars, &download).abandon_with_message(format!("error: {}", reason));
            }
            QueueEvent::Deleted { id } => {
                if let Some(pb) = bars.remove(&id) {
                    pb.finish_and_clear();
                }
            }
        }
    }
}

fn bar_for(
    mp: &MultiProgress,
    sty: &ProgressStyle,
    bars: &mut HashMap<DownloadId, ProgressBar>,
    d: &Download,
) -> ProgressBar {
    bars.entry(d.id)
        .or_insert_with(|| {
            let pb = mp.add(ProgressBar::new(100));
            pb.set_style(sty.clone());
            pb.set_prefix(short_id(d.id));
            pb.set_message(d.url.clone());
            pb
        })
        .clone()
}

async fn list(store: SqliteStore, json: bool) -> anyhow::Result<()> {
    let downloads = store.load_all().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&downloads)?);
        return Ok(());
    }
    if downloads.is_empty() {
        println!("queue is empty");
        return Ok(());
    }
    for d in &downloads {
        println!("{}", describe(d));
    }
    Ok(())
}

async fn settings(store: SqliteStore, m: &ArgMatches) -> anyhow::Result<()> {
    let mut s = store.get_settings().await?.unwrap_or_default();
    let mut changed = false;

    if let Some(v) = m.get_one::<String>("concurrency") {
        s.concurrency = v.parse()?;
        changed = true;
    }
    if let Some(v) = m.get_one::<String>("speed_limit") {
        s.speed_limit = v.parse()?;
        changed = true;
    }
    if let Some(v) = m.get_one::<String>("dir") {
        s.download_directory = PathBuf::from(v);
        changed = true;
    }
    if let Some(v) = m.get_one::<String>("proxy") {
        s.proxy = Some(v.clone());
        changed = true;
    }
    if let Some(v) = m.get_one::<String>("default_format") {
        s.default_format = Some(v.clone());
        changed = true;
    }

    let s = s.normalized();
    if changed {
        store.put_settings(&s).await?;
    }
    println!("{}", serde_json::to_string_pretty(&s)?);
    Ok(())
}

fn print_summary(downloads: &[Download]) {
    let mut counts: HashMap<DownloadStatus, usize> = HashMap::new();
    for d in downloads {
        *counts.entry(d.status).or_default() += 1;
    }
    println!();
    println!("Summary:");
    for status in [
        DownloadStatus::Completed,
        DownloadStatus::Error,
        DownloadStatus::Paused,
        DownloadStatus::Queued,
        DownloadStatus::Downloading,
    ] {
        if let Some(n) = counts.get(&status) {
            println!("  {:<12} {}", status.as_str(), n);
        }
    }
    for d in downloads.iter().filter(|d| d.status == DownloadStatus::Error) {
        println!("{}", describe(d));
    }
}

fn describe(d: &Download) -> String {
    let mut line = format!("{}  {:<11} {:>3}%  {}", d.id, d.status.as_str(), d.progress, d.url);
    if let Some(p) = &d.file_path {
        line.push_str(&format!("\n    -> {}", p.display()));
    }
    if let Some(e) = &d.error {
        let hint = if e.retryable { "retryable" } else { "permanent" };
        line.push_str(&format!("\n    error ({}): {}", hint, e.message));
    }
    line
}

fn short_id(id: DownloadId) -> String {
    let s = id.to_string();
    format!("[{}]", &s[..8])
}
