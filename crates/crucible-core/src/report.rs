//! Resource accounting
//!
//! The backend leaves a JSON status record in the output directory; this
//! module normalizes it into the wire report. Every raw field maps to
//! exactly one report field and counters the backend omits are reported as
//! zero rather than dropped.

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

/// How the program's top-level process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusType {
    /// Exited on its own; `status_value` is the exit code.
    Exited,
    /// Terminated by a signal; `status_value` is the signal number.
    Killed,
}

/// Raw status record as written by the backend.
#[derive(Debug, Clone, Deserialize)]
pub struct RawStatus {
    pub status_type: StatusType,
    pub status_value: i32,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub real: u64,
    #[serde(default)]
    pub kernel: u64,
    #[serde(default)]
    pub user: u64,
    #[serde(default)]
    pub max_mem: u64,
    #[serde(default)]
    pub waits: u64,
    #[serde(default)]
    pub preemptions: u64,
    #[serde(default)]
    pub major_page_faults: u64,
    #[serde(default)]
    pub minor_page_faults: u64,
    #[serde(default)]
    pub input_ops: u64,
    #[serde(default)]
    pub output_ops: u64,
}

impl RawStatus {
    /// Parse the backend's JSON status record.
    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// Terminal report for one invocation.
///
/// Timings are integer microseconds; `max_mem` is KiB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub status_type: StatusType,
    pub status_value: i32,
    pub timed_out: bool,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub real: u64,
    pub kernel: u64,
    pub user: u64,
    pub max_mem: u64,
    pub waits: u64,
    pub preemptions: u64,
    pub major_page_faults: u64,
    pub minor_page_faults: u64,
    pub input_ops: u64,
    pub output_ops: u64,
}

impl ExecutionReport {
    /// Build the report from the backend's record and the session's own
    /// observations. A timeout kill issued by the session marks the report
    /// timed out even if the backend died before noticing.
    #[must_use]
    pub fn from_raw(
        raw: RawStatus,
        stdout_truncated: bool,
        stderr_truncated: bool,
        session_timed_out: bool,
    ) -> Self {
        Self {
            status_type: raw.status_type,
            status_value: raw.status_value,
            timed_out: raw.timed_out || session_timed_out,
            stdout_truncated,
            stderr_truncated,
            real: raw.real,
            kernel: raw.kernel,
            user: raw.user,
            max_mem: raw.max_mem,
            waits: raw.waits,
            preemptions: raw.preemptions,
            major_page_faults: raw.major_page_faults,
            minor_page_faults: raw.minor_page_faults,
            input_ops: raw.input_ops,
            output_ops: raw.output_ops,
        }
    }

    /// Report for an invocation whose backend never produced a status
    /// record: killed by the session, crashed, or failed while staging.
    #[must_use]
    pub fn aborted(timed_out: bool, stdout_truncated: bool, stderr_truncated: bool) -> Self {
        Self {
            status_type: StatusType::Killed,
            status_value: Signal::SIGKILL as i32,
            timed_out,
            stdout_truncated,
            stderr_truncated,
            real: 0,
            kernel: 0,
            user: 0,
            max_mem: 0,
            waits: 0,
            preemptions: 0,
            major_page_faults: 0,
            minor_page_faults: 0,
            input_ops: 0,
            output_ops: 0,
        }
    }
}
