#![cfg_attr(not(test), deny(clippy::unwrap_used))]

//! Command execution and credential fallback for remote discovery adapters.
//!
//! The crate has two halves:
//!
//! - the **command layer** ([`command`], [`shell`]): typed commands whose
//!   results flow through composable handler chains, executed once against a
//!   remote [`Shell`](shell::Shell) by an executor picked from the shell's
//!   capabilities;
//! - the **credential layer** ([`credentials`], [`orchestrator`], [`dns`]):
//!   every configured credential for a target is tried in order, with scoped
//!   connections, until one discovery succeeds. Failures leave only as
//!   classified [`report`]s.
//!
//! [`ssh`] provides a russh-backed connection factory and shell.

pub mod command;
pub mod config;
pub mod credentials;
pub mod dns;
pub mod error;
pub mod orchestrator;
pub mod report;
pub mod shell;
pub mod ssh;

#[cfg(test)]
mod testing;

pub use command::{Cmd, CmdKind, CmdResult, Executor, ExecutorKind, ExecutorSettings};
pub use credentials::{CredentialDescriptor, CredentialStore, MergePolicy, TriggerContext};
pub use error::CommandError;
pub use orchestrator::{
    ClientFactory, CredentialFallback, CredentialSet, Discover, Discovered, FinalState, Outcome,
};
pub use report::{ErrorCode, ErrorObject, Reporter};
pub use shell::{ExecOptions, ExecResult, Shell};
