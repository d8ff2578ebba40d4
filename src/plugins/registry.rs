use async_trait::async_trait;
use crate::core::model::{Download, Settings};
use clap::{ArgMatches, Command};
use std::path::PathBuf;
use std::sync::Arc;

/// Builds the command line for one external worker tool.
#[async_trait]
pub trait WorkerDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Resolves the executable. `None` means the worker cannot be started.
    async fn locate(&self) -> Option<PathBuf>;

    /// Arguments for one run. `resume` is set when earlier progress exists and
    /// the worker should continue partial files.
    fn build_args(&self, download: &Download, settings: &Settings, resume: bool) -> Vec<String>;
}

#[derive(Debug, Clone, Default)]
pub struct WorkerCliConfig {
    pub worker_bin: Option<PathBuf>,
}

pub trait CliPlugin: Send + Sync {
    fn name(&self) -> &'static str;
    fn augment_run_command(&self, cmd: Command) -> Command;
    fn apply_run_matches(&self, matches: &ArgMatches, cfg: &mut WorkerCliConfig) -> anyhow::Result<()>;
}

pub struct PluginRegistry {
    cli_plugins: Vec<Box<dyn CliPlugin>>,
}

impl PluginRegistry {
    pub fn with_defaults() -> Self {
        let mut reg = Self { cli_plugins: vec![] };
        reg.cli_plugins.push(Box::new(crate::plugins::ytdlp::cli::YtDlpCliPlugin::new()));
        reg
    }

    pub fn augment_run_command(&self, cmd: Command) -> Command {
        self.cli_plugins
            .iter()
            .fold(cmd, |c, p| p.augment_run_command(c))
    }

    pub fn apply_run_matches(&self, matches: &ArgMatches, cfg: &mut WorkerCliConfig) -> anyhow::Result<()> {
        for p in &self.cli_plugins {
            p.apply_run_matches(matches, cfg)?;
        }
        Ok(())
    }

    pub fn worker_driver(&self, cfg: &WorkerCliConfig) -> Arc<dyn WorkerDriver> {
        Arc::new(crate::plugins::ytdlp::driver::YtDlpDriver::new(cfg.worker_bin.clone()))
    }
}
