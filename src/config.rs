//! Engine configuration loaded from `fleetbench.toml`.
//!
//! Every field has a default, so an absent file or a partial one is fine.
//! `FLEETBENCH_EXPERIMENT_ID` and `FLEETBENCH_AGENT_ID` take precedence over
//! the `[archive]` section.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::api::AgentClient;
use crate::clock::{Clock, SystemClock};
use crate::engine::{DEFAULT_HEARTBEAT_TIMEOUT, DEFAULT_ONLINE_TIMEOUT, EngineBuilder, WorkloadEngine};
use crate::error::{Error, Result};
use crate::metrics::{ArchiveTarget, DirectoryArtifactSink, JsonLinesTelemetrySink, TelemetrySink, TracingTelemetrySink};
use crate::packages::DirectoryPackageResolver;
use crate::process::DEFAULT_START_ATTEMPTS;
use crate::profiling::ProgressMonitor;
use crate::retry::{Backoff, RetryPolicy};
use crate::state::{FileStateBackend, StateStore};
use crate::sync::DEFAULT_POLL_INTERVAL;
use crate::workloads::WorkloadsConfig;

pub const DEFAULT_CONFIG_FILE: &str = "fleetbench.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Attempts per peer flow. Only retryable errors trigger another one.
    #[serde(default = "default_flow_attempts")]
    pub flow_attempts: u32,

    #[serde(default)]
    pub process: ProcessConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub state: StateConfig,

    #[serde(default)]
    pub packages: PackagesConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub archive: ArchiveConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub workloads: WorkloadsConfig,
}

fn default_flow_attempts() -> u32 {
    1
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flow_attempts: default_flow_attempts(),
            process: ProcessConfig::default(),
            sync: SyncConfig::default(),
            state: StateConfig::default(),
            packages: PackagesConfig::default(),
            api: ApiConfig::default(),
            archive: ArchiveConfig::default(),
            telemetry: TelemetryConfig::default(),
            workloads: WorkloadsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Retry policy for spawning a process. A running process is never retried.
    #[serde(default = "default_start_policy")]
    pub start_policy: RetryPolicy,

    /// How often a long-running workload logs that it is still alive.
    #[serde(default = "default_progress_interval_secs")]
    pub progress_interval_secs: u64,
}

fn default_start_policy() -> RetryPolicy {
    RetryPolicy::immediate(DEFAULT_START_ATTEMPTS)
}

fn default_progress_interval_secs() -> u64 {
    60
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            start_policy: default_start_policy(),
            progress_interval_secs: default_progress_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,

    #[serde(default = "default_online_timeout_secs")]
    pub online_timeout_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL.as_secs()
}

fn default_heartbeat_timeout_secs() -> u64 {
    DEFAULT_HEARTBEAT_TIMEOUT.as_secs()
}

fn default_online_timeout_secs() -> u64 {
    DEFAULT_ONLINE_TIMEOUT.as_secs()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            online_timeout_secs: default_online_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateConfig {
    /// Directory holding one JSON file per state key.
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackagesConfig {
    /// Each package is a subdirectory named after it.
    #[serde(default = "default_packages_root")]
    pub root: PathBuf,
}

fn default_packages_root() -> PathBuf {
    PathBuf::from("packages")
}

impl Default for PackagesConfig {
    fn default() -> Self {
        Self {
            root: default_packages_root(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Where result artifacts are copied. Archiving is off without `dir`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub dir: Option<PathBuf>,

    #[serde(default)]
    pub experiment_id: String,

    #[serde(default = "default_agent_id")]
    pub agent_id: String,
}

fn default_agent_id() -> String {
    "local".to_string()
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            dir: None,
            experiment_id: String::new(),
            agent_id: default_agent_id(),
        }
    }
}

/// Metrics go to the log unless `jsonl_path` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub jsonl_path: Option<PathBuf>,
}

impl EngineConfig {
    /// Loads `path`, or `fleetbench.toml` in the working directory when no
    /// path is given. A missing default file yields the defaults; a missing
    /// explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Applies environment overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup("FLEETBENCH_EXPERIMENT_ID")
            && !id.is_empty()
        {
            self.archive.experiment_id = id;
        }
        if let Some(id) = lookup("FLEETBENCH_AGENT_ID")
            && !id.is_empty()
        {
            self.archive.agent_id = id;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.flow_attempts == 0 {
            return Err(Error::Config("flow_attempts must be at least 1".to_string()));
        }
        if self.process.start_policy.max_attempts == 0 {
            return Err(Error::Config(
                "process.start_policy.max_attempts must be at least 1".to_string(),
            ));
        }
        let durations = [
            ("process.progress_interval_secs", self.process.progress_interval_secs),
            ("sync.poll_interval_secs", self.sync.poll_interval_secs),
            ("sync.heartbeat_timeout_secs", self.sync.heartbeat_timeout_secs),
            ("sync.online_timeout_secs", self.sync.online_timeout_secs),
            ("api.request_timeout_secs", self.api.request_timeout_secs),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, secs)| *secs == 0) {
            return Err(Error::Config(format!("{name} must be at least 1")));
        }
        if self.archive.dir.is_some() && self.archive.experiment_id.trim().is_empty() {
            return Err(Error::Config(
                "archive.experiment_id (or FLEETBENCH_EXPERIMENT_ID) is required when archive.dir is set".to_string(),
            ));
        }
        self.workloads.validate()
    }

    /// A builder wired to the file state store, local packages and the
    /// agent API. The caller adds the layout.
    pub fn engine_builder(&self) -> Result<EngineBuilder> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let agent = Arc::new(AgentClient::new(Duration::from_secs(self.api.request_timeout_secs))?);
        let state = StateStore::new(Arc::new(FileStateBackend::new(&self.state.dir)?)).with_remote(agent.clone());
        let telemetry: Arc<dyn TelemetrySink> = match &self.telemetry.jsonl_path {
            Some(path) => Arc::new(JsonLinesTelemetrySink::new(path)),
            None => Arc::new(TracingTelemetrySink),
        };

        let mut builder = WorkloadEngine::builder()
            .clock(clock.clone())
            .state(state)
            .packages(Arc::new(DirectoryPackageResolver::new(&self.packages.root)))
            .remote_status(agent)
            .telemetry(telemetry)
            .monitor(Arc::new(ProgressMonitor::new(
                clock,
                Duration::from_secs(self.process.progress_interval_secs),
            )))
            .start_policy(self.process.start_policy)
            .flow_policy(RetryPolicy::new(self.flow_attempts, Backoff::None)?)
            .poll_interval(Duration::from_secs(self.sync.poll_interval_secs))
            .sync_timeouts(
                Duration::from_secs(self.sync.heartbeat_timeout_secs),
                Duration::from_secs(self.sync.online_timeout_secs),
            );

        if let Some(dir) = &self.archive.dir {
            builder = builder.artifacts(
                Arc::new(DirectoryArtifactSink::new(dir)),
                ArchiveTarget {
                    experiment_id: self.archive.experiment_id.clone(),
                    agent_id: self.archive.agent_id.clone(),
                },
            );
        }
        Ok(builder)
    }
}
