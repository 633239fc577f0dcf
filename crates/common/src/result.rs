//! Result record sent back to the monitoring core.
//!
//! ```text
//! host_name=<name>
//! core_start_time=<sec>.<usec>
//! start_time=<sec>.<usec>
//! finish_time=<sec>.<usec>
//! latency=<float>
//! return_code=<int>
//! exited_ok=<0|1>
//! service_description=<desc>      (service checks only)
//! output=[(<identity>) - ]<text>
//! <blank line>
//! ```

use crate::job::{Job, Timeval};
use crate::outcome::CheckOutcome;

#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    pub host_name: String,
    pub service_description: Option<String>,
    pub core_start_time: Timeval,
    pub start_time: Timeval,
    pub finish_time: Timeval,
    pub latency: f64,
    pub return_code: i32,
    pub exited_ok: bool,
    pub output: String,
}

impl ResultRecord {
    /// Build a record; `None` when the outcome carries no output.
    ///
    /// `identity` is prefixed to the output when verbose results are enabled.
    pub fn from_job(job: &Job, outcome: &CheckOutcome, identity: Option<&str>) -> Option<Self> {
        let text = outcome.output.as_deref()?;
        let output = match identity {
            Some(host) => format!("({}) - {}", host, text),
            None => text.to_string(),
        };

        Some(Self {
            host_name: job.host_name.clone().unwrap_or_default(),
            service_description: job.service_description.clone(),
            core_start_time: job.core_start_time,
            start_time: outcome.start_time,
            finish_time: outcome.finish_time,
            latency: job.latency,
            return_code: outcome.return_code,
            exited_ok: outcome.exited_ok,
            output,
        })
    }

    pub fn render(&self) -> String {
        let mut out = format!(
            "host_name={}\ncore_start_time={}\nstart_time={}\nfinish_time={}\nlatency={:.6}\nreturn_code={}\nexited_ok={}\n",
            self.host_name,
            self.core_start_time,
            self.start_time,
            self.finish_time,
            self.latency,
            self.return_code,
            u8::from(self.exited_ok),
        );
        if let Some(service) = &self.service_description {
            out.push_str("service_description=");
            out.push_str(service);
            out.push('\n');
        }
        out.push_str("output=");
        out.push_str(&self.output);
        out.push_str("\n\n");
        out
    }
}
