//! Commands, results and the executors that connect them.
//!
//! A [`Cmd<T>`] is an immutable pairing of a command line with the handler
//! that turns its raw [`ExecResult`] into a `T`. Commands compose like shell
//! pipelines: `a | b` joins the command lines with `" | "` and keeps `b`'s
//! handler, since only the last stage decides how the pipeline output reads.
//!
//! ```ignore
//! let cmd = Cmd::posix("db2ls") | Cmd::posix("tail -n +4");
//! let executor = Executor::new(&shell, ExecutorSettings::default());
//! let listing: String = executor.run(&cmd).await?;
//! ```

pub mod executor;
pub mod handler;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::BitOr;

use once_cell::sync::Lazy;

use crate::error::CommandError;
use crate::shell::ExecResult;

use handler::{
    Handler, identity, normalize_newlines, output, raise_on_non_zero_return_code,
    raise_when_output_is_none, strip,
};

pub use executor::{Executor, ExecutorKind, ExecutorSettings};

/// A family of commands sharing one default handler chain.
pub trait CmdKind {
    type Output: 'static;

    /// The kind's chain, composed once per process.
    fn default_handler() -> &'static Handler<ExecResult, Self::Output>;
}

/// Hands back the raw result untouched.
pub struct Raw;

/// POSIX command: zero return code, captured output, stripped.
pub struct Posix;

/// Windows command: like [`Posix`] with CRLF folded to LF first.
pub struct Windows;

static RAW_HANDLER: Lazy<Handler<ExecResult, ExecResult>> = Lazy::new(identity);

static POSIX_HANDLER: Lazy<Handler<ExecResult, String>> = Lazy::new(|| {
    raise_on_non_zero_return_code()
        .then(raise_when_output_is_none())
        .then(output())
        .then(strip())
});

static WINDOWS_HANDLER: Lazy<Handler<ExecResult, String>> = Lazy::new(|| {
    raise_on_non_zero_return_code()
        .then(raise_when_output_is_none())
        .then(output())
        .then(normalize_newlines())
        .then(strip())
});

impl CmdKind for Raw {
    type Output = ExecResult;

    fn default_handler() -> &'static Handler<ExecResult, ExecResult> {
        &RAW_HANDLER
    }
}

impl CmdKind for Posix {
    type Output = String;

    fn default_handler() -> &'static Handler<ExecResult, String> {
        &POSIX_HANDLER
    }
}

impl CmdKind for Windows {
    type Output = String;

    fn default_handler() -> &'static Handler<ExecResult, String> {
        &WINDOWS_HANDLER
    }
}

/// A command line plus the handler that interprets its result.
pub struct Cmd<T> {
    cmdline: String,
    handler: Handler<ExecResult, T>,
}

impl<T: 'static> Cmd<T> {
    pub fn new(cmdline: impl Into<String>, handler: Handler<ExecResult, T>) -> Self {
        Self {
            cmdline: cmdline.into(),
            handler,
        }
    }

    /// Build a command using the default chain of kind `K`.
    pub fn of<K: CmdKind<Output = T>>(cmdline: impl Into<String>) -> Self {
        Self::new(cmdline, K::default_handler().clone())
    }

    pub fn cmdline(&self) -> &str {
        &self.cmdline
    }

    pub fn handler(&self) -> &Handler<ExecResult, T> {
        &self.handler
    }

    /// Same command line, different interpretation.
    pub fn with_handler<U: 'static>(self, handler: Handler<ExecResult, U>) -> Cmd<U> {
        Cmd::new(self.cmdline, handler)
    }

    /// Append a stage after the current handler.
    pub fn and_then<U: 'static>(self, next: Handler<T, U>) -> Cmd<U> {
        let handler = self.handler.then(next);
        Cmd::new(self.cmdline, handler)
    }
}

impl Cmd<ExecResult> {
    pub fn raw(cmdline: impl Into<String>) -> Self {
        Self::of::<Raw>(cmdline)
    }
}

impl Cmd<String> {
    pub fn posix(cmdline: impl Into<String>) -> Self {
        Self::of::<Posix>(cmdline)
    }

    pub fn windows(cmdline: impl Into<String>) -> Self {
        Self::of::<Windows>(cmdline)
    }
}

impl<T> Clone for Cmd<T> {
    fn clone(&self) -> Self {
        Self {
            cmdline: self.cmdline.clone(),
            handler: self.handler.clone(),
        }
    }
}

impl<T> fmt::Debug for Cmd<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Cmd").field(&self.cmdline).finish()
    }
}

impl<T> fmt::Display for Cmd<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cmdline)
    }
}

impl<T> PartialEq for Cmd<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmdline == other.cmdline
    }
}

impl<T> Eq for Cmd<T> {}

impl<T> Hash for Cmd<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.cmdline.hash(state);
    }
}

impl<A, B> BitOr<Cmd<B>> for Cmd<A> {
    type Output = Cmd<B>;

    fn bitor(self, rhs: Cmd<B>) -> Cmd<B> {
        Cmd {
            cmdline: format!("{} | {}", self.cmdline, rhs.cmdline),
            handler: rhs.handler,
        }
    }
}

impl<A, B> BitOr<&Cmd<B>> for &Cmd<A> {
    type Output = Cmd<B>;

    fn bitor(self, rhs: &Cmd<B>) -> Cmd<B> {
        Cmd {
            cmdline: format!("{} | {}", self.cmdline, rhs.cmdline),
            handler: rhs.handler.clone(),
        }
    }
}

/// Outcome of running a [`Cmd`]: the raw result plus the command's handler.
pub struct CmdResult<T> {
    result: ExecResult,
    handler: Handler<ExecResult, T>,
}

impl<T: 'static> CmdResult<T> {
    pub fn new(result: ExecResult, handler: Handler<ExecResult, T>) -> Self {
        Self { result, handler }
    }

    pub fn result(&self) -> &ExecResult {
        &self.result
    }

    pub fn return_code(&self) -> i32 {
        self.result.return_code
    }

    pub fn output(&self) -> Option<&str> {
        self.result.output.as_deref()
    }

    pub fn output_bytes(&self) -> &[u8] {
        &self.result.output_bytes
    }

    pub fn handler(&self) -> &Handler<ExecResult, T> {
        &self.handler
    }

    /// Apply the carried handler to the carried result.
    pub fn produce(self) -> Result<T, CommandError> {
        self.handler.apply(self.result)
    }

    pub fn into_result(self) -> ExecResult {
        self.result
    }
}

impl<T> fmt::Debug for CmdResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmdResult")
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}
