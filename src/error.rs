//! Error taxonomy for command execution and credential fallback.
//!
//! Every failure the pipeline can observe is one variant of [`CommandError`].
//! Variants that stem from a command that actually ran carry the raw
//! [`ExecResult`] so callers can inspect the return code and output without
//! re-running anything.
//!
//! The module also hosts the message classifier used in two places:
//!
//! 1. the SSH backend decides whether a transport failure is transient and
//!    worth reconnecting ([`is_retryable_error`]);
//! 2. the orchestrator sharpens a "connection failed" report into
//!    "permission denied" or "timeout" ([`is_auth_failure`], [`is_timeout`]).
//!
//! Authentication patterns always take precedence over connection patterns.

use thiserror::Error;

use crate::shell::ExecResult;

/// Closed set of failures produced by commands, handlers and connections.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// The command produced no usable output, or a handler rejected it.
    #[error("{message}")]
    Execute {
        message: String,
        result: Option<ExecResult>,
    },

    /// Return code outside the accepted set.
    #[error("invalid return code {}, accepted {:?}", .result.return_code, .accepted)]
    InvalidReturnCode {
        result: ExecResult,
        accepted: Vec<i32>,
    },

    /// The semantic target of the command does not exist.
    #[error("not found: {message}")]
    NotFound {
        message: String,
        result: Option<ExecResult>,
    },

    /// Opening the connection (or reaching the shell) failed before any
    /// command could run.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The discovery body failed for a domain reason after connecting.
    #[error("discovery failed: {0}")]
    Discovery(String),
}

impl CommandError {
    pub fn execute(message: impl Into<String>) -> Self {
        Self::Execute {
            message: message.into(),
            result: None,
        }
    }

    pub fn execute_with(message: impl Into<String>, result: ExecResult) -> Self {
        Self::Execute {
            message: message.into(),
            result: Some(result),
        }
    }

    pub fn invalid_return_code(result: ExecResult, accepted: &[i32]) -> Self {
        Self::InvalidReturnCode {
            result,
            accepted: accepted.to_vec(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
            result: None,
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    pub fn discovery(message: impl Into<String>) -> Self {
        Self::Discovery(message.into())
    }

    /// The raw result attached to the error, if the command ran at all.
    pub fn result(&self) -> Option<&ExecResult> {
        match self {
            Self::Execute { result, .. } | Self::NotFound { result, .. } => result.as_ref(),
            Self::InvalidReturnCode { result, .. } => Some(result),
            Self::Connection(_) | Self::Discovery(_) => None,
        }
    }

    /// `true` for the execute family: `Execute` and its refinements
    /// `InvalidReturnCode` and `NotFound`.
    pub fn is_execute_error(&self) -> bool {
        matches!(
            self,
            Self::Execute { .. } | Self::InvalidReturnCode { .. } | Self::NotFound { .. }
        )
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Authentication error patterns that indicate permanent failures.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "permission denied",
    "publickey",
    "auth fail",
    "no authentication",
    "access denied",
    "login failed",
    "all authentication methods failed",
];

/// Patterns for transient transport failures.
const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "timeout",
    "timed out",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "resource temporarily unavailable",
    "handshake failed",
    "failed to connect",
    "broken pipe",
];

const TIMEOUT_ERRORS: &[&str] = &["timeout", "timed out"];

fn contains_any(haystack: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| haystack.contains(p))
}

/// `true` when the message reads like rejected credentials.
pub fn is_auth_failure(error: &str) -> bool {
    contains_any(&error.to_lowercase(), AUTH_ERRORS)
}

/// `true` when the message reads like a timeout and not like an auth failure.
pub fn is_timeout(error: &str) -> bool {
    let error_lower = error.to_lowercase();
    !contains_any(&error_lower, AUTH_ERRORS) && contains_any(&error_lower, TIMEOUT_ERRORS)
}

/// Decide whether a transport failure is transient.
///
/// Rules, in order:
///
/// 1. authentication failures are never retryable;
/// 2. known connection failures are retryable;
/// 3. anything else mentioning "ssh" is a protocol error and is not retried
///    unless it also talks about connecting or timing out;
/// 4. remaining unknown messages are retried.
pub(crate) fn is_retryable_error(error: &str) -> bool {
    let error_lower = error.to_lowercase();

    if contains_any(&error_lower, AUTH_ERRORS) {
        return false;
    }

    if contains_any(&error_lower, RETRYABLE_ERRORS) {
        return true;
    }

    !error_lower.contains("ssh")
        || error_lower.contains("timeout")
        || error_lower.contains("connect")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(code: i32) -> ExecResult {
        ExecResult::new(code, Some("boom".to_string()))
    }

    mod taxonomy {
        use super::*;

        #[test]
        fn test_invalid_return_code_carries_result() {
            let err = CommandError::invalid_return_code(failed(2), &[0]);
            assert_eq!(err.result().map(|r| r.return_code), Some(2));
            assert!(err.is_execute_error());
            assert!(!err.is_connection());
        }

        #[test]
        fn test_connection_never_carries_result() {
            let err = CommandError::connection("refused");
            assert!(err.result().is_none());
            assert!(err.is_connection());
            assert!(!err.is_execute_error());
        }

        #[test]
        fn test_discovery_is_not_execute_family() {
            let err = CommandError::discovery("no db2 instance");
            assert!(!err.is_execute_error());
            assert!(err.result().is_none());
        }

        #[test]
        fn test_not_found_is_execute_family() {
            assert!(CommandError::not_found("db2ilist").is_execute_error());
        }

        #[test]
        fn test_display_messages() {
            assert_eq!(
                CommandError::invalid_return_code(failed(127), &[0, 1]).to_string(),
                "invalid return code 127, accepted [0, 1]"
            );
            assert_eq!(
                CommandError::connection("refused").to_string(),
                "connection failed: refused"
            );
            assert_eq!(
                CommandError::execute("output is empty").to_string(),
                "output is empty"
            );
        }
    }

    mod classification {
        use super::*;

        #[test]
        fn test_auth_failures() {
            assert!(is_auth_failure("Permission denied (publickey,password)"));
            assert!(is_auth_failure("SQL30082N Security processing failed: access denied"));
            assert!(!is_auth_failure("Connection refused"));
        }

        #[test]
        fn test_timeouts() {
            assert!(is_timeout("Connection timed out after 30s"));
            assert!(is_timeout("Operation TIMEOUT"));
            assert!(!is_timeout("Connection timeout during authentication failed"));
            assert!(!is_timeout("Connection refused"));
        }
    }

    mod retryable {
        use super::*;

        #[test]
        fn test_auth_errors_not_retryable() {
            assert!(!is_retryable_error("Authentication failed"));
            assert!(!is_retryable_error("PERMISSION DENIED"));
            assert!(!is_retryable_error("all authentication methods failed"));
        }

        #[test]
        fn test_connection_errors_retryable() {
            assert!(is_retryable_error("Connection refused"));
            assert!(is_retryable_error("No route to host"));
            assert!(is_retryable_error("SSH handshake failed"));
        }

        #[test]
        fn test_ssh_protocol_errors_not_retryable() {
            assert!(!is_retryable_error("SSH protocol error"));
            assert!(is_retryable_error("SSH failed to connect"));
        }

        #[test]
        fn test_auth_takes_precedence() {
            assert!(!is_retryable_error(
                "Connection timeout during authentication failed"
            ));
        }

        #[test]
        fn test_unknown_errors_retryable() {
            assert!(is_retryable_error(""));
            assert!(is_retryable_error("Something went wrong"));
        }
    }
}
