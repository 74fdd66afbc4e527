//! Binding commands to a live shell.
//!
//! An [`Executor`] runs a [`Cmd`] exactly once against a [`Shell`] and hands
//! back a [`CmdResult`] that still carries the command's own handler. The
//! executor variant is picked once, at construction, from the shell's
//! capabilities:
//!
//! - Windows shells get [`ExecutorKind::Default`] and never escalate;
//! - everything else gets [`ExecutorKind::PrivilegeEscalating`], honouring
//!   the `use_sudo` / `preserve_sudo_context` settings.
//!
//! No retries happen here. A shell failure surfaces as
//! [`CommandError::Connection`] and is never confused with a non-zero return
//! code.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::CommandError;
use crate::shell::{ExecOptions, Shell};

use super::{Cmd, CmdResult};

/// Execution flags shared by every command an executor runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorSettings {
    /// Zero defers to the shell's configured timeout.
    pub timeout: Duration,
    pub wait_for_timeout: bool,
    pub use_cache: bool,
    pub use_sudo: bool,
    pub preserve_sudo_context: bool,
}

impl ExecutorSettings {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn with_sudo(mut self, use_sudo: bool, preserve_sudo_context: bool) -> Self {
        self.use_sudo = use_sudo;
        self.preserve_sudo_context = preserve_sudo_context;
        self
    }
}

/// The two executor variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    Default,
    PrivilegeEscalating {
        use_sudo: bool,
        preserve_sudo_context: bool,
    },
}

impl ExecutorKind {
    /// One capability check: Windows shells cannot escalate.
    pub fn select<S: Shell + ?Sized>(shell: &S, settings: &ExecutorSettings) -> Self {
        if shell.is_windows() {
            Self::Default
        } else {
            Self::PrivilegeEscalating {
                use_sudo: settings.use_sudo,
                preserve_sudo_context: settings.preserve_sudo_context,
            }
        }
    }
}

/// Runs commands against one shell.
pub struct Executor<'a, S: Shell + ?Sized> {
    shell: &'a S,
    settings: ExecutorSettings,
    kind: ExecutorKind,
}

impl<'a, S: Shell + ?Sized> Executor<'a, S> {
    pub fn new(shell: &'a S, settings: ExecutorSettings) -> Self {
        let kind = ExecutorKind::select(shell, &settings);
        Self {
            shell,
            settings,
            kind,
        }
    }

    pub fn kind(&self) -> ExecutorKind {
        self.kind
    }

    fn options(&self) -> ExecOptions {
        let (use_sudo, preserve_sudo_context) = match self.kind {
            ExecutorKind::Default => (false, false),
            ExecutorKind::PrivilegeEscalating {
                use_sudo,
                preserve_sudo_context,
            } => (use_sudo, preserve_sudo_context),
        };

        ExecOptions {
            timeout: self.settings.timeout,
            wait_for_timeout: self.settings.wait_for_timeout,
            use_cache: self.settings.use_cache,
            use_sudo,
            preserve_sudo_context,
        }
    }

    /// Run `cmd` once and pair the raw result with `cmd`'s handler.
    pub async fn process<T: 'static>(&self, cmd: &Cmd<T>) -> Result<CmdResult<T>, CommandError> {
        debug!("Executing {:?} via {:?}", cmd.cmdline(), self.kind);

        let result = self
            .shell
            .exec(cmd.cmdline(), &self.options())
            .await
            .map_err(|e| {
                warn!("Command {:?} did not run: {}", cmd.cmdline(), e);
                CommandError::connection(format!("{}: {}", cmd.cmdline(), e))
            })?;

        debug!(
            "Command {:?} returned {} ({} bytes)",
            cmd.cmdline(),
            result.return_code,
            result.output_bytes.len()
        );

        Ok(CmdResult::new(result, cmd.handler().clone()))
    }

    /// [`process`](Self::process) followed by the handler chain.
    pub async fn run<T: 'static>(&self, cmd: &Cmd<T>) -> Result<T, CommandError> {
        self.process(cmd).await?.produce()
    }

    /// Best-effort run: any failure, executor-level or handler-level, yields
    /// `default`.
    pub async fn run_safe<T: 'static>(&self, cmd: &Cmd<T>, default: T) -> T {
        match self.run(cmd).await {
            Ok(value) => value,
            Err(e) => {
                debug!("Best-effort command {:?} failed: {}", cmd.cmdline(), e);
                default
            }
        }
    }
}
