//! Remote shell collaborator contract.
//!
//! A [`Shell`] runs one command line on a remote host and reports what
//! happened as an [`ExecResult`]. The return code, the decoded output and
//! the raw output bytes are returned together so they always belong to the
//! same invocation.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Raw outcome of one remote command run.
///
/// `output` is `None` when nothing was captured at all, which is distinct
/// from `Some("")` (the command ran and printed nothing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub return_code: i32,
    pub output: Option<String>,
    pub output_bytes: Vec<u8>,
}

impl ExecResult {
    /// Build a result whose raw bytes are the UTF-8 encoding of `output`.
    pub fn new(return_code: i32, output: Option<String>) -> Self {
        let output_bytes = output
            .as_deref()
            .map(|o| o.as_bytes().to_vec())
            .unwrap_or_default();
        Self {
            return_code,
            output,
            output_bytes,
        }
    }

    /// Build a result from captured bytes, decoding them lossily.
    pub fn from_bytes(return_code: i32, output_bytes: Vec<u8>) -> Self {
        Self {
            return_code,
            output: Some(String::from_utf8_lossy(&output_bytes).into_owned()),
            output_bytes,
        }
    }

    pub fn is_success(&self) -> bool {
        self.return_code == 0
    }
}

/// Per-call execution flags passed through to the shell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOptions {
    /// Zero means "use the shell's own default".
    pub timeout: Duration,
    /// On timeout, hand back whatever output arrived instead of failing.
    pub wait_for_timeout: bool,
    pub use_cache: bool,
    pub use_sudo: bool,
    /// Run the whole pipeline under one privileged shell.
    pub preserve_sudo_context: bool,
}

/// Failures of the shell itself; the command never produced a result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShellError {
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("shell unavailable: {0}")]
    Unavailable(String),
}

/// A live remote shell.
#[async_trait]
pub trait Shell: Send + Sync {
    /// Run `cmdline` once and capture its outcome.
    async fn exec(&self, cmdline: &str, options: &ExecOptions) -> Result<ExecResult, ShellError>;

    /// Capability flag used to pick the executor variant.
    fn is_windows(&self) -> bool;
}

/// Single-quote `s` for a POSIX shell.
pub fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Rewrite `cmdline` to run through `sudo` without prompting.
///
/// With `preserve_context` the whole line, pipes included, runs inside one
/// privileged `sh -c`; otherwise only the first stage is elevated.
pub fn privileged_cmdline(cmdline: &str, preserve_context: bool) -> String {
    if preserve_context {
        format!("sudo -n sh -c {}", shell_escape(cmdline))
    } else {
        format!("sudo -n {}", cmdline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod exec_result {
        use super::*;

        #[test]
        fn test_new_derives_bytes() {
            let r = ExecResult::new(0, Some("abc".to_string()));
            assert_eq!(r.output_bytes, b"abc");
            assert!(r.is_success());
        }

        #[test]
        fn test_none_output_has_no_bytes() {
            let r = ExecResult::new(1, None);
            assert!(r.output.is_none());
            assert!(r.output_bytes.is_empty());
            assert!(!r.is_success());
        }

        #[test]
        fn test_from_bytes_is_lossy() {
            let r = ExecResult::from_bytes(0, vec![b'o', b'k', 0xff]);
            assert_eq!(r.output.as_deref(), Some("ok\u{fffd}"));
            assert_eq!(r.output_bytes.len(), 3);
        }
    }

    mod escaping {
        use super::*;

        #[test]
        fn test_plain_string() {
            assert_eq!(shell_escape("ls -la"), "'ls -la'");
        }

        #[test]
        fn test_embedded_quote() {
            assert_eq!(shell_escape("it's"), "'it'\\''s'");
        }

        #[test]
        fn test_privileged_first_stage() {
            assert_eq!(
                privileged_cmdline("db2level | head -1", false),
                "sudo -n db2level | head -1"
            );
        }

        #[test]
        fn test_privileged_whole_pipeline() {
            assert_eq!(
                privileged_cmdline("db2level | head -1", true),
                "sudo -n sh -c 'db2level | head -1'"
            );
        }
    }
}
