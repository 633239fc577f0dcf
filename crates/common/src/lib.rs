// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
//! Shared data model for the check worker: the job record decoded from a
//! broker payload, the outcome of running it, and the result record sent
//! back to the monitoring core.

pub mod codec;
pub mod job;
pub mod outcome;
pub mod result;

pub use codec::{CodecError, TransportMode};
pub use job::{decode, DecodeError, Job, JobType, Timeval, STDERR_MERGE_SUFFIX};
pub use outcome::{
    escape_newlines, truncate_to, CheckOutcome, OutputBuffer, DEFAULT_MAX_OUTPUT_BYTES,
    STATE_CRITICAL, STATE_OK, STATE_UNKNOWN, STATE_WARNING,
};
pub use result::ResultRecord;
