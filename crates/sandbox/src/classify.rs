use gearcheck_common::{truncate_to, STATE_CRITICAL, STATE_UNKNOWN};

use crate::backend::unix::signal_name;

const NOT_EXECUTABLE: &str = "CRITICAL: Return code of 126 is out of bounds. Make sure the plugin you're trying to run is executable.";
const NOT_FOUND: &str = "CRITICAL: Return code of 127 is out of bounds. Make sure the plugin you're trying to run actually exists.";

/// Collapse an exit status into one number: the exit code, or 128 + signal
/// for a process that was killed.
pub fn raw_exit_code(code: Option<i32>, signal: Option<i32>) -> i32 {
    match (code, signal) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => STATE_UNKNOWN,
    }
}

/// Map a raw exit code onto the monitoring status scale.
///
/// 0-125 pass through; 126 and 127 become CRITICAL with a hint appended;
/// 128-255 become CRITICAL with the terminating signal named. The result is
/// kept within `max_bytes`.
pub fn classify_exit(raw: i32, output: String, max_bytes: usize) -> (i32, String) {
    let (code, mut output) = match raw {
        126 => (STATE_CRITICAL, append(output, NOT_EXECUTABLE)),
        127 => (STATE_CRITICAL, append(output, NOT_FOUND)),
        128..=255 => {
            let signal = raw - 128;
            (
                STATE_CRITICAL,
                format!(
                    "CRITICAL: Return code of {} is out of bounds. Plugin exited by signal {}",
                    signal,
                    signal_name(signal)
                ),
            )
        }
        other => (other, output),
    };
    truncate_to(&mut output, max_bytes);
    (code, output)
}

/// `output` is already escaped, so the separator is a literal backslash followed by `n`.
fn append(output: String, message: &str) -> String {
    if output.is_empty() {
        return message.to_string();
    }
    format!("{}\\n{}", output, message)
}
