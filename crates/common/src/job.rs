//! Job records and the `key=value` payload decoder.
//!
//! A payload is a sequence of `key=value` lines. Unknown keys, lines without
//! `=` and lines with an empty value are ignored. Numeric fields are parsed
//! leniently: malformed text yields the field's zero value instead of
//! failing the whole payload.

use std::fmt;

use chrono::Utc;
use thiserror::Error;
use tracing::trace;

/// Appended to every command line so stderr is captured with stdout.
pub const STDERR_MERGE_SUFFIX: &str = " 2>&1";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload is empty")]
    Empty,
}

/// Wall-clock timestamp with microsecond resolution, as exchanged on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timeval {
    pub sec: i64,
    pub usec: i64,
}

impl Timeval {
    pub fn new(sec: i64, usec: i64) -> Self {
        Self { sec, usec }
    }

    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            sec: now.timestamp(),
            usec: i64::from(now.timestamp_subsec_micros()),
        }
    }

    /// Parse `<sec>[.<usec>]`. Both halves are read like `atoi`, so the
    /// fractional part is taken as a microsecond count, not a decimal fraction.
    pub fn parse(raw: &str) -> Self {
        let (sec, usec) = match raw.split_once('.') {
            Some((sec, usec)) => (sec, usec),
            None => (raw, ""),
        };
        Self {
            sec: parse_int_lenient(sec),
            usec: parse_int_lenient(usec),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.sec == 0 && self.usec == 0
    }

    /// Whole seconds elapsed from `self` until `later`.
    pub fn secs_until(&self, later: &Timeval) -> i64 {
        later.sec - self.sec
    }
}

impl fmt::Display for Timeval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.sec, self.usec)
    }
}

/// Category of a job. Group queues still carry `host` or `service` here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobType {
    Host,
    Service,
    Event,
    Other(String),
}

impl JobType {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "host" => JobType::Host,
            "service" => JobType::Service,
            "event" => JobType::Event,
            other => JobType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            JobType::Host => "host",
            JobType::Service => "service",
            JobType::Event => "event",
            JobType::Other(name) => name.as_str(),
        }
    }

    /// Host and service checks produce a result for the monitoring core.
    pub fn is_check(&self) -> bool {
        matches!(self, JobType::Host | JobType::Service)
    }

    /// Message used when the command overran its timeout.
    pub fn timeout_message(&self) -> Option<&'static str> {
        match self {
            JobType::Host => Some("(Host Check Timed Out)"),
            JobType::Service => Some("(Service Check Timed Out)"),
            _ => None,
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One check-execution request as retrieved from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub job_type: Option<JobType>,
    pub host_name: Option<String>,
    pub service_description: Option<String>,
    /// Command with [`STDERR_MERGE_SUFFIX`] already appended.
    pub command_line: Option<String>,
    pub result_queue: Option<String>,
    pub check_options: i32,
    pub scheduled_check: bool,
    pub reschedule_check: bool,
    /// Seconds; `None` means the worker default applies.
    pub timeout: Option<u64>,
    pub latency: f64,
    pub core_start_time: Timeval,
}

impl Default for Job {
    fn default() -> Self {
        Self {
            job_type: None,
            host_name: None,
            service_description: None,
            command_line: None,
            result_queue: None,
            check_options: 0,
            scheduled_check: true,
            reschedule_check: true,
            timeout: None,
            latency: 0.0,
            core_start_time: Timeval::default(),
        }
    }
}

impl Job {
    /// Type and command, or `None` when the job must be discarded.
    pub fn runnable(&self) -> Option<(&JobType, &str)> {
        Some((self.job_type.as_ref()?, self.command_line.as_deref()?))
    }

    /// Command as the scheduler sent it, without the stderr redirection.
    pub fn raw_command(&self) -> Option<&str> {
        self.command_line
            .as_deref()
            .map(|cmd| cmd.strip_suffix(STDERR_MERGE_SUFFIX).unwrap_or(cmd))
    }

    /// Seconds between scheduling and `now`. Zero when no scheduling time was sent.
    pub fn age_at(&self, now: &Timeval) -> i64 {
        if self.core_start_time.is_zero() {
            return 0;
        }
        self.core_start_time.secs_until(now)
    }

    /// Serialize back into the payload format understood by [`decode`].
    pub fn encode_payload(&self) -> String {
        let mut out = String::new();
        let mut push = |key: &str, value: &str| {
            if !value.is_empty() {
                out.push_str(key);
                out.push('=');
                out.push_str(value);
                out.push('\n');
            }
        };

        if let Some(job_type) = &self.job_type {
            push("type", job_type.as_str());
        }
        if let Some(host) = &self.host_name {
            push("host_name", host);
        }
        if let Some(service) = &self.service_description {
            push("service_description", service);
        }
        if let Some(queue) = &self.result_queue {
            push("result_queue", queue);
        }
        if let Some(command) = self.raw_command() {
            push("command_line", command);
        }
        push("check_options", &self.check_options.to_string());
        push("scheduled_check", if self.scheduled_check { "1" } else { "0" });
        push("reschedule_check", if self.reschedule_check { "1" } else { "0" });
        push("latency", &format!("{:.6}", self.latency));
        if !self.core_start_time.is_zero() {
            push("start_time", &self.core_start_time.to_string());
        }
        if let Some(timeout) = self.timeout {
            push("timeout", &timeout.to_string());
        }
        out
    }
}

/// Decode a plaintext payload into a [`Job`].
///
/// Only a payload with no content at all is rejected; jobs missing their type
/// or command are returned as-is and discarded later by the sandbox.
pub fn decode(plaintext: &[u8]) -> Result<Job, DecodeError> {
    let text = String::from_utf8_lossy(plaintext);
    if text.trim().is_empty() {
        return Err(DecodeError::Empty);
    }

    let mut job = Job::default();
    for line in text.split('\n') {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if value.is_empty() {
            continue;
        }

        match key {
            "type" => job.job_type = Some(JobType::parse(value)),
            "host_name" => job.host_name = Some(value.to_string()),
            "service_description" => job.service_description = Some(value.to_string()),
            "result_queue" => job.result_queue = Some(value.to_string()),
            "check_options" => job.check_options = parse_int_lenient(value) as i32,
            "scheduled_check" => job.scheduled_check = parse_int_lenient(value) != 0,
            "reschedule_check" => job.reschedule_check = parse_int_lenient(value) != 0,
            "latency" => job.latency = parse_float_lenient(value),
            "start_time" | "core_start_time" => job.core_start_time = Timeval::parse(value),
            "timeout" => {
                let secs = parse_int_lenient(value);
                job.timeout = (secs > 0).then_some(secs as u64);
            }
            "command_line" => {
                job.command_line = Some(format!("{}{}", value, STDERR_MERGE_SUFFIX));
            }
            other => trace!(key = other, "ignoring unknown payload key"),
        }
    }

    Ok(job)
}

/// `atoi`-style parse: optional leading whitespace and sign, then as many
/// digits as are present. Anything unparsable yields 0.
fn parse_int_lenient(raw: &str) -> i64 {
    let trimmed = raw.trim_start();
    let (negative, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };

    let mut value: i64 = 0;
    for byte in digits.bytes() {
        if !byte.is_ascii_digit() {
            break;
        }
        value = value
            .saturating_mul(10)
            .saturating_add(i64::from(byte - b'0'));
    }

    if negative {
        -value
    } else {
        value
    }
}

fn parse_float_lenient(raw: &str) -> f64 {
    let trimmed = raw.trim();
    if let Ok(value) = trimmed.parse::<f64>() {
        if value.is_finite() {
            return value;
        }
        return 0.0;
    }

    // Longest numeric prefix, as `atof` would read it.
    let end = trimmed
        .char_indices()
        .take_while(|(idx, c)| c.is_ascii_digit() || *c == '.' || (*idx == 0 && (*c == '-' || *c == '+')))
        .map(|(idx, c)| idx + c.len_utf8())
        .last()
        .unwrap_or(0);
    trimmed[..end].parse::<f64>().unwrap_or(0.0)
}
