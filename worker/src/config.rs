use std::path::{Path, PathBuf};
use std::time::Duration;

use gearcheck_broker::Endpoint;
use gearcheck_common::{TransportMode, DEFAULT_MAX_OUTPUT_BYTES};
use gearcheck_sandbox::{ExecMode, SandboxSettings};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::WorkerError;

pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_JOBS: u64 = 1000;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 180;
pub const DEFAULT_RESULT_RETRIES: u32 = 1;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 5;

/// Queue registered after every real one; jobs on it are acknowledged unrun.
pub const DUMMY_QUEUE: &str = "dummy";

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Runs unsupervised.
    #[default]
    Standalone,
    /// Runs under a parent that tracks active jobs and reaps idle workers.
    Pooled,
}

impl Mode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "standalone" => Some(Mode::Standalone),
            "pooled" | "pool" => Some(Mode::Pooled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Standalone => "standalone",
            Mode::Pooled => "pooled",
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Shared active-job counter file.
    pub counter_path: Option<PathBuf>,
    /// Exit after this long without a job. 0 disables the watchdog.
    pub idle_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            counter_path: None,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub servers: Vec<String>,
    pub hosts: bool,
    pub services: bool,
    pub events: bool,
    pub hostgroups: Vec<String>,
    pub servicegroups: Vec<String>,
    pub job_timeout: u64,
    /// Seconds; 0 disables the staleness check.
    pub max_age: u64,
    pub fork_on_exec: bool,
    pub debug_result: bool,
    /// Exit cleanly after this many jobs; 0 means unlimited.
    pub max_jobs: u64,
    pub mode: Mode,
    pub transport: TransportMode,
    pub max_output_bytes: usize,
    pub result_retries: u32,
    pub retry_delay_secs: u64,
    pub identity: Option<String>,
    pub pool: PoolConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            hosts: false,
            services: false,
            events: false,
            hostgroups: Vec::new(),
            servicegroups: Vec::new(),
            job_timeout: DEFAULT_JOB_TIMEOUT_SECS,
            max_age: 0,
            fork_on_exec: true,
            debug_result: false,
            max_jobs: DEFAULT_MAX_JOBS,
            mode: Mode::Standalone,
            transport: TransportMode::Base64,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            result_retries: DEFAULT_RESULT_RETRIES,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            identity: None,
            pool: PoolConfig::default(),
        }
    }
}

/// Values given on the command line or through `GEARCHECK_*` variables.
/// Anything set here wins over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub servers: Vec<String>,
    pub hosts: bool,
    pub services: bool,
    pub events: bool,
    pub hostgroups: Vec<String>,
    pub servicegroups: Vec<String>,
    pub job_timeout: Option<u64>,
    pub max_age: Option<u64>,
    pub fork_on_exec: Option<bool>,
    pub debug_result: bool,
    pub max_jobs: Option<u64>,
    pub mode: Option<Mode>,
    pub transport: Option<TransportMode>,
    pub identity: Option<String>,
    pub counter_path: Option<PathBuf>,
    pub idle_timeout_secs: Option<u64>,
}

impl WorkerConfig {
    pub fn load(path: &Path) -> Result<Self, WorkerError> {
        let contents = std::fs::read_to_string(path).map_err(|source| WorkerError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config: WorkerConfig =
            toml::from_str(&contents).map_err(|source| WorkerError::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?;
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// File config when a path is given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, WorkerError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if !overrides.servers.is_empty() {
            self.servers = overrides.servers;
        }
        // Category switches only ever enable.
        self.hosts |= overrides.hosts;
        self.services |= overrides.services;
        self.events |= overrides.events;
        self.debug_result |= overrides.debug_result;
        if !overrides.hostgroups.is_empty() {
            self.hostgroups = overrides.hostgroups;
        }
        if !overrides.servicegroups.is_empty() {
            self.servicegroups = overrides.servicegroups;
        }
        if let Some(value) = overrides.job_timeout {
            self.job_timeout = value;
        }
        if let Some(value) = overrides.max_age {
            self.max_age = value;
        }
        if let Some(value) = overrides.fork_on_exec {
            self.fork_on_exec = value;
        }
        if let Some(value) = overrides.max_jobs {
            self.max_jobs = value;
        }
        if let Some(value) = overrides.mode {
            self.mode = value;
        }
        if let Some(value) = overrides.transport {
            self.transport = value;
        }
        if overrides.identity.is_some() {
            self.identity = overrides.identity;
        }
        if overrides.counter_path.is_some() {
            self.pool.counter_path = overrides.counter_path;
        }
        if let Some(value) = overrides.idle_timeout_secs {
            self.pool.idle_timeout_secs = value;
        }
    }

    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.servers.is_empty() {
            return Err(WorkerError::InvalidConfig("no job server specified".into()));
        }
        Endpoint::parse_all(&self.servers)?;
        if queue_names(self).is_empty() {
            return Err(WorkerError::InvalidConfig(
                "no queue enabled: set hosts, services, events, hostgroups or servicegroups"
                    .into(),
            ));
        }
        if self.job_timeout == 0 {
            return Err(WorkerError::InvalidConfig("job_timeout must be positive".into()));
        }
        if self.max_output_bytes == 0 {
            return Err(WorkerError::InvalidConfig(
                "max_output_bytes must be positive".into(),
            ));
        }
        if self.mode == Mode::Pooled && self.pool.counter_path.is_none() {
            return Err(WorkerError::InvalidConfig(
                "pooled mode needs pool.counter_path".into(),
            ));
        }
        Ok(())
    }

    pub fn sandbox_settings(&self) -> SandboxSettings {
        SandboxSettings {
            default_timeout: Duration::from_secs(self.job_timeout),
            max_age: (self.max_age > 0).then(|| Duration::from_secs(self.max_age)),
            exec_mode: ExecMode::from_fork_on_exec(self.fork_on_exec),
            max_output_bytes: self.max_output_bytes,
            ..SandboxSettings::default()
        }
    }

    /// Idle window for the pooled-mode watchdog.
    pub fn idle_timeout(&self) -> Option<Duration> {
        match (self.mode, self.pool.idle_timeout_secs) {
            (Mode::Pooled, secs) if secs > 0 => Some(Duration::from_secs(secs)),
            _ => None,
        }
    }

    /// Name prefixed to verbose results; the OS host name unless configured.
    pub fn resolved_identity(&self) -> String {
        if let Some(identity) = self.identity.as_deref().filter(|s| !s.trim().is_empty()) {
            return identity.trim().to_string();
        }
        match nix::unistd::gethostname() {
            Ok(name) => name.to_string_lossy().into_owned(),
            Err(err) => {
                warn!("failed to read host name: {}", err);
                "localhost".to_string()
            }
        }
    }
}

/// Queues this worker takes jobs from, in registration order.
pub fn queue_names(config: &WorkerConfig) -> Vec<String> {
    let mut queues = Vec::new();
    if config.hosts {
        queues.push("host".to_string());
    }
    if config.services {
        queues.push("service".to_string());
    }
    if config.events {
        queues.push("eventhandler".to_string());
    }

    let groups = config
        .hostgroups
        .iter()
        .map(|name| ("hostgroup", name))
        .chain(config.servicegroups.iter().map(|name| ("servicegroup", name)));
    for (prefix, name) in groups {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        let queue = format!("{}_{}", prefix, name);
        if !queues.contains(&queue) {
            queues.push(queue);
        }
    }
    queues
}

/// Split comma separated list arguments, dropping blanks.
pub fn split_list(raw: &[String]) -> Vec<String> {
    raw.iter()
        .flat_map(|entry| entry.split(','))
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}
