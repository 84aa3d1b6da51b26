use crate::{metrics::RankingKey, outcome::Classifier};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

pub const SUPPORTED_EXECUTORS: [&str; 2] = ["local", "process"];

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound)
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config {path:?}: {source}")]
    Read { path: PathBuf, source: Error },
    #[error("Config is not valid: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Executor not supported: {0}")]
    UnsupportedExecutor(String),
    #[error("File not found")]
    FileNotFound,
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
    #[error("Preflight checks failed, see the log for details")]
    Preflight,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    // job catalogue document, see `catalogue::Catalogue::load`
    pub catalogue: PathBuf,
    // dataset handed to the evaluator for every job
    pub dataset: PathBuf,
    pub executor: ExecutorConfig,
    pub evaluator: EvaluatorConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    // metric deciding which parameter set of a job is the best one
    #[serde(default)]
    pub ranking: RankingKey,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    // Name of the selected executor, see Executors::load for the selection proccess
    #[serde(default = "default_executor")]
    pub name: String,
    // number of workers, i.e., chunks the pending jobs are split into
    #[serde(default = "default_workers")]
    pub workers: usize,
    // pin each worker thread of the local executor to its own core
    #[serde(default)]
    pub pin_cores: bool,
    // coarse timeout in seconds for a whole chunk, only honoured by the process executor
    #[serde(default)]
    pub chunk_timeout: Option<u64>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct EvaluatorConfig {
    pub exec: PathBuf,
    #[serde(default)]
    pub params: Vec<String>,
    // wall clock budget per job in seconds
    pub timeout: u64,
    // additional attempts for jobs classified as ERROR
    #[serde(default)]
    pub retries: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct CheckpointConfig {
    // write a checkpoint after this many parameter sets
    #[serde(default = "default_checkpoint_every")]
    pub every: usize,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ClassifierConfig {
    #[serde(default = "default_min_signals")]
    pub min_signals: u64,
    #[serde(default = "default_true")]
    pub use_fallback_signals: bool,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MonitorMode {
    #[default]
    Checkpoint,
    Log,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    // poll interval in seconds
    #[serde(default = "default_monitor_interval")]
    pub interval: u64,
    #[serde(default)]
    pub mode: MonitorMode,
    // progress log lines are prefixed with `[tag]`
    #[serde(default = "default_tag")]
    pub tag: String,
    // seconds without progress before a worker is flagged as stalled
    #[serde(default = "default_stall_after")]
    pub stall_after: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    #[serde(default = "default_checkpoints")]
    pub checkpoints: PathBuf,
    #[serde(default = "default_results")]
    pub results: PathBuf,
    #[serde(default = "default_outcomes")]
    pub outcomes: PathBuf,
    #[serde(default = "default_logs")]
    pub logs: PathBuf,
    #[serde(default = "default_pids")]
    pub pids: PathBuf,
    #[serde(default = "default_ledger")]
    pub ledger: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            every: default_checkpoint_every(),
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            min_signals: default_min_signals(),
            use_fallback_signals: true,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: default_monitor_interval(),
            mode: MonitorMode::default(),
            tag: default_tag(),
            stall_after: default_stall_after(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            checkpoints: default_checkpoints(),
            results: default_results(),
            outcomes: default_outcomes(),
            logs: default_logs(),
            pids: default_pids(),
            ledger: default_ledger(),
        }
    }
}

impl ClassifierConfig {
    pub fn classifier(&self) -> Classifier {
        Classifier {
            min_signals: self.min_signals,
            use_fallback_signals: self.use_fallback_signals,
        }
    }
}

impl EvaluatorConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }
}

impl RunnerConfig {
    /// load the config and resolve relative paths against the config's directory
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let content = fs::read_to_string(path).map_err(|source| ConfigErrors::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml(&content)?;

        if let Some(base) = path.parent() {
            config.rebase(base);
        }

        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigErrors> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// make every relative path relative to `base`
    pub fn rebase(&mut self, base: &Path) {
        let rebase = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };

        rebase(&mut self.catalogue);
        rebase(&mut self.dataset);
        // bare command names are looked up in PATH, only rebase explicit relative paths
        if self.evaluator.exec.components().count() > 1 {
            rebase(&mut self.evaluator.exec);
        }
        rebase(&mut self.paths.checkpoints);
        rebase(&mut self.paths.results);
        rebase(&mut self.paths.outcomes);
        rebase(&mut self.paths.logs);
        rebase(&mut self.paths.pids);
        rebase(&mut self.paths.ledger);
    }

    /// Check the config for problems before any work is started, returns true if an error
    /// was found. All problems are reported instead of stopping at the first one.
    pub fn preflight_checks(&mut self) -> bool {
        let mut contains_error = false;

        self.executor.name = self.executor.name.to_lowercase();
        if !SUPPORTED_EXECUTORS.contains(&self.executor.name.as_str()) {
            error!(
                "executor.name ({}) is not supported, please use one of {SUPPORTED_EXECUTORS:?}",
                self.executor.name
            );
            contains_error = true;
        }

        if self.executor.workers == 0 {
            error!("executor.workers cannot be 0, there would be nobody to run the jobs");
            contains_error = true;
        } else if self.executor.workers > num_cpus::get() {
            warn!(
                "executor.workers ({}) exceeds the number of cores ({}), workers will compete for CPU time",
                self.executor.workers,
                num_cpus::get()
            );
        }

        if self.executor.chunk_timeout.is_some() && self.executor.name == "local" {
            warn!("executor.chunk_timeout is only honoured by the process executor and will be ignored");
        }

        if !self.catalogue.is_file() {
            error!(
                "Failed to find the catalogue. Either not a file or not found at {}",
                self.catalogue.to_string_lossy()
            );
            contains_error = true;
        }

        if !self.dataset.exists() {
            error!(
                "Failed to find the dataset at {}",
                self.dataset.to_string_lossy()
            );
            contains_error = true;
        }

        if self.evaluator.exec.components().count() > 1 {
            match check_executable(&self.evaluator.exec) {
                Ok(true) => {}
                Ok(false) => {
                    error!(
                        "Evaluator {} is not executable",
                        self.evaluator.exec.to_string_lossy()
                    );
                    contains_error = true;
                }
                Err(e) => {
                    error!(
                        "Failed to determine if evaluator.exec ({}) is an executable: {e}",
                        self.evaluator.exec.to_string_lossy()
                    );
                    contains_error = true;
                }
            }
        }

        if self.evaluator.timeout == 0 {
            error!("evaluator.timeout cannot be 0, every job would time out immediately");
            contains_error = true;
        }

        if self.checkpoint.every == 0 {
            warn!("checkpoint.every is 0. Falling back to a checkpoint after every parameter set");
            self.checkpoint.every = 1;
        }

        if self.monitor.interval == 0 {
            error!("monitor.interval cannot be 0, the monitor would spin");
            contains_error = true;
        }

        if self.monitor.tag.is_empty() || self.monitor.tag.contains(&['[', ']'][..]) {
            error!(
                "monitor.tag ({}) must be non-empty and must not contain brackets",
                self.monitor.tag
            );
            contains_error = true;
        }

        if self.classifier.min_signals == 0 {
            warn!("classifier.min_signals is 0, no job will ever be classified as FEW_SIGNALS");
        }

        contains_error
    }
}

fn default_executor() -> String {
    "local".to_string()
}

fn default_workers() -> usize {
    num_cpus::get()
}

fn default_checkpoint_every() -> usize {
    1
}

fn default_min_signals() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_monitor_interval() -> u64 {
    20
}

fn default_tag() -> String {
    "PROGRESS".to_string()
}

fn default_stall_after() -> u64 {
    900
}

fn default_checkpoints() -> PathBuf {
    PathBuf::from("state/checkpoints")
}

fn default_results() -> PathBuf {
    PathBuf::from("results")
}

fn default_outcomes() -> PathBuf {
    PathBuf::from("state/outcomes")
}

fn default_logs() -> PathBuf {
    PathBuf::from("state/logs")
}

fn default_pids() -> PathBuf {
    PathBuf::from("state/pids")
}

fn default_ledger() -> PathBuf {
    PathBuf::from("state/ledger.json")
}
