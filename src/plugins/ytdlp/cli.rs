use crate::plugins::registry::{CliPlugin, WorkerCliConfig};
use clap::{Arg, ArgMatches, Command};
use std::path::PathBuf;

pub struct YtDlpCliPlugin;

impl YtDlpCliPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl CliPlugin for YtDlpCliPlugin {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    fn augment_run_command(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("ytdlp_bin")
                .long("ytdlp-bin")
                .help_heading("YT-DLP")
                .help("Path to the yt-dlp binary (default: PATH, then the managed bin dir)")
                .num_args(1),
        )
    }

    fn apply_run_matches(&self, matches: &ArgMatches, cfg: &mut WorkerCliConfig) -> anyhow::Result<()> {
        if let Some(v) = matches.get_one::<String>("ytdlp_bin") {
            cfg.worker_bin = Some(PathBuf::from(v));
        }
        Ok(())
    }
}
