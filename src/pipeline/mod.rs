//! Compile/execute pipeline for batch submissions
//!
//! State machine per request: Stage -> Compile -> ValidateBinary -> Run ->
//! Analyze. Every sandbox invocation performs its teardown exactly once,
//! on every path.

mod run;

pub use run::compile_and_run;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Hard ceiling on any single sandboxed invocation
pub const MAX_WALL_CLOCK: Duration = Duration::from_secs(30);

/// Batch compile-and-run request
#[derive(Debug, Clone, Deserialize)]
pub struct CompileRequest {
    /// C source code
    pub code: String,
    /// Stdin lines, each newline-terminated when joined
    #[serde(default)]
    pub input_lines: Vec<String>,
    /// Single stdin blob (used when `input_lines` is empty)
    #[serde(default)]
    pub input: String,
    /// Requested run timeout in seconds; clamped to (0, 30], default 10
    #[serde(default)]
    pub timeout_secs: u64,
}

impl CompileRequest {
    /// Effective run deadline: caller value clamped to (0, 30] seconds,
    /// with the configured default when unspecified or out of range.
    pub fn run_deadline(&self, default: Duration) -> Duration {
        if self.timeout_secs > 0 && self.timeout_secs <= MAX_WALL_CLOCK.as_secs() {
            Duration::from_secs(self.timeout_secs)
        } else {
            default
        }
    }

    /// Stdin for the run: joined lines (each newline-terminated) or the
    /// single blob with a trailing newline guaranteed.
    pub fn stdin_data(&self) -> Option<String> {
        if !self.input_lines.is_empty() {
            Some(format!("{}\n", self.input_lines.join("\n")))
        } else if !self.input.is_empty() {
            let mut data = self.input.clone();
            if !data.ends_with('\n') {
                data.push('\n');
            }
            Some(data)
        } else {
            None
        }
    }
}

/// Batch compile-and-run response. Exactly one of `output`/`error` is the
/// primary outcome; `analysis` is attachable regardless.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompileResponse {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub analysis: String,
}

impl CompileResponse {
    pub fn failure(error: impl Into<String>) -> Self {
        CompileResponse {
            error: error.into(),
            ..Default::default()
        }
    }
}

/// Decode recognized fatal terminations into a human-readable suffix.
/// Exit codes follow the 128+signal convention the container tier
/// reports; direct children may instead expose the raw signal.
pub fn decode_exit(status: &std::process::ExitStatus) -> Option<&'static str> {
    #[cfg(unix)]
    let code = {
        use std::os::unix::process::ExitStatusExt;
        status
            .signal()
            .map(|s| s as u32 + 128)
            .or_else(|| status.code().map(|c| c as u32))
    };
    #[cfg(not(unix))]
    let code = status.code().map(|c| c as u32);

    code.and_then(decode_exit_code)
}

/// Same mapping for callers that only see a 128+signal exit code.
pub fn decode_exit_code(code: u32) -> Option<&'static str> {
    match code {
        136 => Some("Floating point exception (core dumped)"),
        137 => Some("Killed"),
        139 => Some("Segmentation fault (core dumped)"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(timeout_secs: u64) -> CompileRequest {
        CompileRequest {
            code: String::new(),
            input_lines: Vec::new(),
            input: String::new(),
            timeout_secs,
        }
    }

    #[test]
    fn test_timeout_clamping() {
        let default = Duration::from_secs(10);
        assert_eq!(req(0).run_deadline(default), default);
        assert_eq!(req(2).run_deadline(default), Duration::from_secs(2));
        assert_eq!(req(30).run_deadline(default), Duration::from_secs(30));
        assert_eq!(req(31).run_deadline(default), default);
    }

    #[test]
    fn test_stdin_lines_are_newline_terminated() {
        let mut r = req(0);
        r.input_lines = vec!["2".to_string(), "3".to_string()];
        assert_eq!(r.stdin_data().unwrap(), "2\n3\n");
    }

    #[test]
    fn test_stdin_blob_gets_trailing_newline() {
        let mut r = req(0);
        r.input = "2\n3".to_string();
        assert_eq!(r.stdin_data().unwrap(), "2\n3\n");

        r.input = "2\n3\n".to_string();
        assert_eq!(r.stdin_data().unwrap(), "2\n3\n");
    }

    #[test]
    fn test_no_stdin() {
        assert!(req(0).stdin_data().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_decode_exit_signals() {
        use std::os::unix::process::ExitStatusExt;
        use std::process::ExitStatus;

        // Raw signals, as reported for direct children
        assert_eq!(
            decode_exit(&ExitStatus::from_raw(8)),
            Some("Floating point exception (core dumped)")
        );
        assert_eq!(
            decode_exit(&ExitStatus::from_raw(11)),
            Some("Segmentation fault (core dumped)")
        );
        // 128+signal exit codes, as the container tier reports them
        assert_eq!(
            decode_exit(&ExitStatus::from_raw(136 << 8)),
            Some("Floating point exception (core dumped)")
        );
        assert_eq!(decode_exit(&ExitStatus::from_raw(137 << 8)), Some("Killed"));
        assert_eq!(
            decode_exit(&ExitStatus::from_raw(139 << 8)),
            Some("Segmentation fault (core dumped)")
        );
        // Ordinary failure carries no suffix
        assert_eq!(decode_exit(&ExitStatus::from_raw(1 << 8)), None);
    }
}
