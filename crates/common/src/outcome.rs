use crate::job::Timeval;

pub const STATE_OK: i32 = 0;
pub const STATE_WARNING: i32 = 1;
pub const STATE_CRITICAL: i32 = 2;
pub const STATE_UNKNOWN: i32 = 3;

/// Output budget applied to captured plugin output.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 5 * 1024;

/// Result of running a job's command.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub return_code: i32,
    /// Single-line, escaped and bounded. `None` when nothing should be reported.
    pub output: Option<String>,
    pub exited_ok: bool,
    pub early_timeout: bool,
    pub start_time: Timeval,
    pub finish_time: Timeval,
}

impl CheckOutcome {
    pub fn new(start_time: Timeval) -> Self {
        Self {
            return_code: STATE_OK,
            output: None,
            exited_ok: true,
            early_timeout: false,
            start_time,
            finish_time: start_time,
        }
    }

    /// Synthetic outcome for a command that never produced its own result.
    pub fn synthetic(start_time: Timeval, return_code: i32, output: &str) -> Self {
        Self {
            return_code,
            output: Some(output.to_string()),
            exited_ok: true,
            early_timeout: false,
            start_time,
            finish_time: Timeval::now(),
        }
    }
}

/// Escape backslashes and newlines so the text fits on one line.
pub fn escape_newlines(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => {}
            other => escaped.push(other),
        }
    }
    escaped
}

/// Truncate to at most `max` bytes without splitting a character.
pub fn truncate_to(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}

/// Accumulates command output line by line up to a byte budget; anything
/// past the budget is dropped.
#[derive(Debug)]
pub struct OutputBuffer {
    raw: Vec<u8>,
    limit: usize,
    discarded: usize,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            raw: Vec::new(),
            limit,
            discarded: 0,
        }
    }

    pub fn push_line(&mut self, line: &[u8]) {
        let room = self.limit.saturating_sub(self.raw.len());
        let take = room.min(line.len());
        self.raw.extend_from_slice(&line[..take]);
        self.discarded += line.len() - take;
    }

    pub fn is_full(&self) -> bool {
        self.raw.len() >= self.limit
    }

    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Escaped single-line text, trailing line breaks removed, within budget.
    pub fn finish(self) -> String {
        let text = String::from_utf8_lossy(&self.raw);
        let mut escaped = escape_newlines(text.trim_end_matches(['\n', '\r']));
        truncate_to(&mut escaped, self.limit);
        escaped
    }
}
