// # -----------------------------
// # crates/sandbox/src/lib.rs
// # -----------------------------
//! Runs a job's check command under a hard wall-clock timeout.
//!
//! The command runs through `/bin/sh -c`. On timeout the check is sent
//! SIGINT, given a one second grace period, then SIGKILL. The shell leads
//! its own process group in every [`ExecMode`] and both signals go to the
//! whole group, so anything the plugin forked dies too.

pub mod backend;
mod classify;

use std::os::unix::process::ExitStatusExt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use gearcheck_common::{
    CheckOutcome, Job, JobType, OutputBuffer, Timeval, DEFAULT_MAX_OUTPUT_BYTES, STATE_CRITICAL,
    STATE_UNKNOWN,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, trace, warn};

pub use backend::ExecMode;
pub use classify::{classify_exit, raw_exit_code};

pub const STALE_MESSAGE: &str = "(Could Not Start Check In Time)";
pub const FORK_ERROR_MESSAGE: &str = "(Error On Fork)";
const KILL_GRACE: Duration = Duration::from_secs(1);

/// OS-level failure running a check. Never escapes [`Sandbox::run`]: the
/// message becomes the outcome's output.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("(Error On Fork)")]
    Spawn(#[source] std::io::Error),
    #[error("(Error Waiting For Check: {0})")]
    Wait(#[source] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct SandboxSettings {
    /// Applied when the job carries no timeout of its own.
    pub default_timeout: Duration,
    /// Jobs older than this (seconds since scheduling) are not run. `None` disables the check.
    pub max_age: Option<Duration>,
    pub exec_mode: ExecMode,
    pub max_output_bytes: usize,
    pub kill_grace: Duration,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(60),
            max_age: None,
            exec_mode: ExecMode::ProcessGroup,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            kill_grace: KILL_GRACE,
        }
    }
}

/// What the sandbox did with a job.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub outcome: CheckOutcome,
    /// Only host and service checks are reported back.
    pub reportable: bool,
}

/// Raw observation of one command run, before exit classification.
struct RawRun {
    exit_code: i32,
    output: String,
    timed_out: bool,
}

pub struct Sandbox {
    settings: SandboxSettings,
    current_child: AtomicU32,
}

impl Sandbox {
    pub fn new(settings: SandboxSettings) -> Self {
        Self {
            settings,
            current_child: AtomicU32::new(0),
        }
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    /// Pid of the check currently running, 0 when idle.
    pub fn current_child(&self) -> u32 {
        self.current_child.load(Ordering::SeqCst)
    }

    /// Run a job. Returns `None` when the job lacks a type or command and
    /// was discarded without execution.
    pub async fn run(&self, job: &Job) -> Option<Execution> {
        let Some((job_type, command_line)) = job.runnable() else {
            warn!(
                host = job.host_name.as_deref().unwrap_or(""),
                "discarded invalid job"
            );
            return None;
        };

        match job_type {
            JobType::Service => debug!(
                host = job.host_name.as_deref().unwrap_or(""),
                service = job.service_description.as_deref().unwrap_or(""),
                "got service job"
            ),
            JobType::Host => debug!(host = job.host_name.as_deref().unwrap_or(""), "got host job"),
            JobType::Event => debug!("got eventhandler job"),
            JobType::Other(name) => debug!(job_type = %name, "got job"),
        }

        let reportable = job_type.is_check();
        let start_time = Timeval::now();

        if let Some(max_age) = self.settings.max_age {
            let age = job.age_at(&start_time);
            if age > max_age.as_secs() as i64 {
                info!(
                    job_type = %job_type,
                    age,
                    max_age = max_age.as_secs(),
                    "discarded too old job"
                );
                let outcome = CheckOutcome::synthetic(start_time, STATE_UNKNOWN, STALE_MESSAGE);
                return Some(Execution {
                    outcome,
                    reportable,
                });
            }
        }

        let timeout = job
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(self.settings.default_timeout);
        trace!(timeout_secs = timeout.as_secs(), command = command_line, "running check");

        let started = Instant::now();
        let mut outcome = CheckOutcome::new(start_time);
        match self.execute(command_line, timeout).await {
            Ok(raw) => {
                let (return_code, output) =
                    classify_exit(raw.exit_code, raw.output, self.settings.max_output_bytes);
                outcome.return_code = return_code;
                outcome.output = Some(output);

                // Timeout wins over whatever exit status was observed.
                if raw.timed_out || started.elapsed() > timeout {
                    outcome.return_code = STATE_CRITICAL;
                    outcome.early_timeout = true;
                    if let Some(message) = job_type.timeout_message() {
                        outcome.output = Some(message.to_string());
                    }
                }
            }
            Err(err) => {
                outcome.return_code = STATE_CRITICAL;
                outcome.exited_ok = false;
                outcome.output = Some(err.to_string());
            }
        }
        outcome.finish_time = Timeval::now();

        debug!(
            return_code = outcome.return_code,
            early_timeout = outcome.early_timeout,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "check finished"
        );

        Some(Execution {
            outcome,
            reportable,
        })
    }

    /// Spawn, capture and reap one command.
    async fn execute(&self, command_line: &str, timeout: Duration) -> Result<RawRun, SandboxError> {
        let mode = self.settings.exec_mode;
        let mut command = backend::build_command(command_line, mode);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(mode = mode.as_str(), "failed to start check: {}", err);
                return Err(SandboxError::Spawn(err));
            }
        };
        let pid = child.id().unwrap_or(0);
        self.current_child.store(pid, Ordering::SeqCst);
        trace!(pid, mode = mode.as_str(), "started check");

        let stdout = child.stdout.take();
        let budget = self.settings.max_output_bytes;

        let captured = tokio::time::timeout(timeout, async {
            let mut buffer = OutputBuffer::new(budget);
            if let Some(stdout) = stdout {
                let mut reader = BufReader::new(stdout);
                let mut line = Vec::new();
                while !buffer.is_full() {
                    line.clear();
                    match reader.read_until(b'\n', &mut line).await {
                        Ok(0) => break,
                        Ok(_) => buffer.push_line(&line),
                        Err(err) => {
                            warn!(pid, "failed to read check output: {}", err);
                            break;
                        }
                    }
                }
                // Drain the rest so the plugin never blocks on a full pipe.
                if let Err(err) = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await {
                    debug!(pid, "failed to drain check output: {}", err);
                }
            }
            if buffer.discarded() > 0 {
                debug!(pid, discarded = buffer.discarded(), "check output truncated");
            }
            (buffer.finish(), child.wait().await)
        })
        .await;

        let result = match captured {
            Ok((output, Ok(status))) => Ok(RawRun {
                exit_code: raw_exit_code(status.code(), status.signal()),
                output,
                timed_out: false,
            }),
            Ok((_, Err(err))) => {
                warn!(pid, "failed to wait for check: {}", err);
                Err(SandboxError::Wait(err))
            }
            Err(_) => {
                info!(pid, timeout_secs = timeout.as_secs(), "check timed out, killing");
                // pid 0 would address our own process group.
                if pid != 0 {
                    backend::escalate_kill(pid, mode, self.settings.kill_grace).await;
                }
                let exit_code = match child.wait().await {
                    Ok(status) => raw_exit_code(status.code(), status.signal()),
                    Err(err) => {
                        debug!(pid, "failed to reap timed out check: {}", err);
                        STATE_UNKNOWN
                    }
                };
                Ok(RawRun {
                    exit_code,
                    output: String::new(),
                    timed_out: true,
                })
            }
        };

        self.current_child.store(0, Ordering::SeqCst);
        trace!(pid, "finished check");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_failure_reads_as_fork_error() {
        let err = SandboxError::Spawn(std::io::Error::from_raw_os_error(11));
        assert_eq!(err.to_string(), FORK_ERROR_MESSAGE);
    }

    #[test]
    fn settings_default_to_process_group_without_staleness() {
        let settings = SandboxSettings::default();
        assert_eq!(settings.exec_mode, ExecMode::ProcessGroup);
        assert_eq!(settings.max_age, None);
        assert_eq!(settings.default_timeout, Duration::from_secs(60));
    }
}
