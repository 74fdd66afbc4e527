//! User-facing failure reports.
//!
//! The orchestrator never raises to its caller. Failures and non-fatal
//! warnings leave the core as [`ErrorObject`]s pushed into a [`Reporter`].

use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::{CommandError, is_auth_failure, is_timeout};

/// Error codes emitted by the core. Adapters carry their own under `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NoCredentials,
    ConnectionFailed,
    PermissionDenied,
    ConnectionTimeout,
    FailedGettingInformation,
    Other(u32),
}

/// A classified, user-facing report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: ErrorCode,
    pub params: Vec<String>,
    pub message: String,
}

impl ErrorObject {
    pub fn create(code: ErrorCode, params: Vec<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            params,
            message: message.into(),
        }
    }

    pub fn no_credentials(protocol: &str) -> Self {
        Self::create(
            ErrorCode::NoCredentials,
            vec![protocol.to_string()],
            format!("No credentials configured for protocol {}", protocol),
        )
    }

    /// Connection failure, sharpened to permission / timeout when the
    /// message says so.
    pub fn connection_failed(protocol: &str, cause: &CommandError) -> Self {
        let message = cause.to_string();
        let code = if is_auth_failure(&message) {
            ErrorCode::PermissionDenied
        } else if is_timeout(&message) {
            ErrorCode::ConnectionTimeout
        } else {
            ErrorCode::ConnectionFailed
        };
        Self::create(code, vec![protocol.to_string(), message.clone()], message)
    }

    pub fn failed_getting_information(protocol: &str, cause: &CommandError) -> Self {
        let message = cause.to_string();
        Self::create(
            ErrorCode::FailedGettingInformation,
            vec![protocol.to_string(), message.clone()],
            message,
        )
    }
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.code, self.message)
    }
}

/// Fire-and-forget sink for reports.
pub trait Reporter: Send + Sync {
    fn report_warning(&self, warning: ErrorObject);
    fn report_error(&self, error: ErrorObject);
}

/// Reports through `tracing`.
#[derive(Debug, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report_warning(&self, warning: ErrorObject) {
        warn!(code = ?warning.code, params = ?warning.params, "{}", warning.message);
    }

    fn report_error(&self, report: ErrorObject) {
        error!(code = ?report.code, params = ?report.params, "{}", report.message);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

/// One entry of a [`RecordingReporter`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reported {
    pub severity: Severity,
    pub error: ErrorObject,
    /// RFC3339 timestamp
    pub reported_at: String,
}

/// Keeps every report in arrival order.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<Reported>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, severity: Severity, error: ErrorObject) {
        let entry = Reported {
            severity,
            error,
            reported_at: chrono::Utc::now().to_rfc3339(),
        };
        // A poisoned lock still holds every earlier report.
        match self.reports.lock() {
            Ok(mut reports) => reports.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
    }

    pub fn reports(&self) -> Vec<Reported> {
        match self.reports.lock() {
            Ok(reports) => reports.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn with_severity(&self, severity: Severity) -> Vec<ErrorObject> {
        self.reports()
            .into_iter()
            .filter(|r| r.severity == severity)
            .map(|r| r.error)
            .collect()
    }

    pub fn warnings(&self) -> Vec<ErrorObject> {
        self.with_severity(Severity::Warning)
    }

    pub fn errors(&self) -> Vec<ErrorObject> {
        self.with_severity(Severity::Error)
    }
}

impl Reporter for RecordingReporter {
    fn report_warning(&self, warning: ErrorObject) {
        self.push(Severity::Warning, warning);
    }

    fn report_error(&self, error: ErrorObject) {
        self.push(Severity::Error, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod classification {
        use super::*;

        #[test]
        fn test_no_credentials() {
            let e = ErrorObject::no_credentials("db2");
            assert_eq!(e.code, ErrorCode::NoCredentials);
            assert_eq!(e.params, vec!["db2"]);
        }

        #[test]
        fn test_connection_failed_plain() {
            let e = ErrorObject::connection_failed("ssh", &CommandError::connection("refused"));
            assert_eq!(e.code, ErrorCode::ConnectionFailed);
            assert_eq!(e.params, vec!["ssh", "connection failed: refused"]);
        }

        #[test]
        fn test_connection_failed_sharpened() {
            let denied = CommandError::connection("Permission denied (publickey)");
            assert_eq!(
                ErrorObject::connection_failed("ssh", &denied).code,
                ErrorCode::PermissionDenied
            );

            let slow = CommandError::connection("Connection timed out after 30s");
            assert_eq!(
                ErrorObject::connection_failed("ssh", &slow).code,
                ErrorCode::ConnectionTimeout
            );
        }

        #[test]
        fn test_failed_getting_information() {
            let e = ErrorObject::failed_getting_information(
                "db2",
                &CommandError::not_found("db2ilist"),
            );
            assert_eq!(e.code, ErrorCode::FailedGettingInformation);
            assert_eq!(e.message, "not found: db2ilist");
        }
    }

    mod recording {
        use super::*;

        #[test]
        fn test_keeps_order_and_severity() {
            let reporter = RecordingReporter::new();
            reporter.report_warning(ErrorObject::no_credentials("a"));
            reporter.report_error(ErrorObject::no_credentials("b"));
            reporter.report_warning(ErrorObject::no_credentials("c"));

            let all = reporter.reports();
            assert_eq!(all.len(), 3);
            assert_eq!(all[1].severity, Severity::Error);
            assert!(!all[0].reported_at.is_empty());

            let warned: Vec<_> = reporter.warnings().into_iter().map(|w| w.params[0].clone()).collect();
            assert_eq!(warned, vec!["a", "c"]);
            assert_eq!(reporter.errors().len(), 1);
        }

        #[test]
        fn test_reporter_is_send_sync() {
            fn assert_send_sync<T: Send + Sync>() {}
            assert_send_sync::<RecordingReporter>();
            assert_send_sync::<TracingReporter>();
        }
    }

    mod serialization {
        use super::*;

        #[test]
        fn test_json_shape() {
            let e = ErrorObject::create(ErrorCode::Other(42), vec!["x".into()], "custom");
            let json = serde_json::to_value(&e).unwrap();
            assert_eq!(json["code"]["other"], 42);
            assert_eq!(json["message"], "custom");

            let json = serde_json::to_value(ErrorObject::no_credentials("ssh")).unwrap();
            assert_eq!(json["code"], "no_credentials");
        }
    }
}
