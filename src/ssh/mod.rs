//! russh-backed client factory and shell.
//!
//! [`SshClientFactory`] opens one authenticated [`SshConnection`] per
//! credential descriptor. The connection is both the orchestrator's
//! [`Client`](crate::orchestrator::Client) and a [`Shell`](crate::shell::Shell)
//! for the command executors.
//!
//! Host keys are not verified.

pub mod auth;
mod connection;
mod factory;

pub use auth::{AgentAuth, AuthChain, AuthError, AuthStrategy, KeyAuth, PasswordAuth};
pub use connection::{SshClientHandler, SshConnection};
pub use factory::{DEFAULT_SSH_PORT, SshClientFactory, SshSettings};
