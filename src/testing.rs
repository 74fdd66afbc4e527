//! Test doubles shared by the unit test suites.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::shell::{ExecOptions, ExecResult, Shell, ShellError};

/// Shell answering from a fixed script and recording every call.
pub(crate) struct ScriptedShell {
    windows: bool,
    script: HashMap<String, Result<ExecResult, ShellError>>,
    calls: Mutex<Vec<(String, ExecOptions)>>,
    capability_checks: AtomicUsize,
}

impl ScriptedShell {
    fn with_os(windows: bool) -> Self {
        Self {
            windows,
            script: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            capability_checks: AtomicUsize::new(0),
        }
    }

    pub(crate) fn unix() -> Self {
        Self::with_os(false)
    }

    pub(crate) fn windows() -> Self {
        Self::with_os(true)
    }

    pub(crate) fn respond(mut self, cmdline: &str, return_code: i32, output: Option<&str>) -> Self {
        self.script.insert(
            cmdline.to_string(),
            Ok(ExecResult::new(return_code, output.map(String::from))),
        );
        self
    }

    pub(crate) fn fail(mut self, cmdline: &str, error: ShellError) -> Self {
        self.script.insert(cmdline.to_string(), Err(error));
        self
    }

    pub(crate) fn calls(&self) -> Vec<(String, ExecOptions)> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn capability_checks(&self) -> usize {
        self.capability_checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Shell for ScriptedShell {
    async fn exec(&self, cmdline: &str, options: &ExecOptions) -> Result<ExecResult, ShellError> {
        self.calls
            .lock()
            .unwrap()
            .push((cmdline.to_string(), *options));

        self.script.get(cmdline).cloned().unwrap_or_else(|| {
            Ok(ExecResult::new(
                127,
                Some(format!("{}: command not found", cmdline)),
            ))
        })
    }

    fn is_windows(&self) -> bool {
        self.capability_checks.fetch_add(1, Ordering::SeqCst);
        self.windows
    }
}
