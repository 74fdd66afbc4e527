//! An authenticated SSH session used both as a discovery client and as a
//! command shell.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use russh::{ChannelMsg, Disconnect, client, keys};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::credentials::CredentialId;
use crate::error::CommandError;
use crate::orchestrator::Client;
use crate::shell::{ExecOptions, ExecResult, Shell, ShellError, privileged_cmdline};

/// Accepts every host key, like `StrictHostKeyChecking=no`.
pub struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Probe run once per connection; anything but success means Windows.
pub(crate) const OS_PROBE: &str = "uname -s";

/// Run `cmdline` on a fresh session channel and collect stdout plus the
/// exit status. A missing exit status reads as -1.
pub(crate) async fn run_channel(
    handle: &client::Handle<SshClientHandler>,
    cmdline: &str,
    timeout: Duration,
    wait_for_timeout: bool,
) -> Result<ExecResult, ShellError> {
    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|e| ShellError::Channel(format!("failed to open channel: {}", e)))?;

    channel
        .exec(true, cmdline)
        .await
        .map_err(|e| ShellError::Channel(format!("failed to execute command: {}", e)))?;

    let mut stdout = Vec::with_capacity(4096);
    let mut exit_code: Option<u32> = None;

    let finished = tokio::time::timeout(timeout, async {
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = Some(exit_status),
                Some(ChannelMsg::Eof) if exit_code.is_some() => break,
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }
    })
    .await
    .is_ok();

    let _ = channel.close().await;

    if !finished {
        warn!(
            "Command {:?} timed out after {:?} ({} bytes collected)",
            cmdline,
            timeout,
            stdout.len()
        );
    }
    channel_result(finished, exit_code, stdout, timeout, wait_for_timeout)
}

/// What a channel produced, as a command result.
///
/// An unfinished channel is a [`ShellError::Timeout`] unless
/// `wait_for_timeout` asks for the partial output, which then carries
/// return code -1.
pub(crate) fn channel_result(
    finished: bool,
    exit_code: Option<u32>,
    stdout: Vec<u8>,
    timeout: Duration,
    wait_for_timeout: bool,
) -> Result<ExecResult, ShellError> {
    if !finished {
        if !wait_for_timeout {
            return Err(ShellError::Timeout(timeout));
        }
        return Ok(ExecResult::from_bytes(-1, stdout));
    }

    let return_code = exit_code.map(|c| c as i32).unwrap_or(-1);
    Ok(ExecResult::from_bytes(return_code, stdout))
}

/// Results of earlier commands on one connection, keyed by the command line
/// actually sent.
#[derive(Default)]
pub(crate) struct CommandCache {
    entries: DashMap<String, ExecResult>,
}

impl CommandCache {
    pub(crate) fn lookup(&self, cmdline: &str, options: &ExecOptions) -> Option<ExecResult> {
        if !options.use_cache {
            return None;
        }
        self.entries.get(cmdline).map(|cached| cached.clone())
    }

    pub(crate) fn remember(&self, cmdline: String, options: &ExecOptions, result: &ExecResult) {
        if options.use_cache {
            self.entries.insert(cmdline, result.clone());
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&self) {
        self.entries.clear();
    }
}

/// One open SSH connection for one credential.
pub struct SshConnection {
    id: Uuid,
    credential_id: CredentialId,
    handle: client::Handle<SshClientHandler>,
    command_timeout: Duration,
    windows: bool,
    cache: CommandCache,
}

impl SshConnection {
    /// Wrap an authenticated handle and probe the remote OS family.
    pub(crate) async fn open(
        handle: client::Handle<SshClientHandler>,
        credential_id: CredentialId,
        command_timeout: Duration,
    ) -> Self {
        let probe = run_channel(&handle, OS_PROBE, command_timeout, false).await;
        let windows = !matches!(&probe, Ok(result) if result.is_success());
        let id = Uuid::new_v4();
        info!(
            "SSH connection {} open for credential {} (windows: {})",
            id, credential_id, windows
        );

        Self {
            id,
            credential_id,
            handle,
            command_timeout,
            windows,
            cache: CommandCache::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn credential_id(&self) -> &str {
        &self.credential_id
    }

    fn effective_timeout(&self, options: &ExecOptions) -> Duration {
        if options.timeout.is_zero() {
            self.command_timeout
        } else {
            options.timeout
        }
    }
}

/// The command line actually sent for `options`.
pub(crate) fn effective_cmdline(cmdline: &str, options: &ExecOptions) -> String {
    if options.use_sudo {
        privileged_cmdline(cmdline, options.preserve_sudo_context)
    } else {
        cmdline.to_string()
    }
}

#[async_trait]
impl Shell for SshConnection {
    async fn exec(&self, cmdline: &str, options: &ExecOptions) -> Result<ExecResult, ShellError> {
        let cmdline = effective_cmdline(cmdline, options);

        if let Some(cached) = self.cache.lookup(&cmdline, options) {
            debug!("[{}] Cache hit for {:?}", self.id, cmdline);
            return Ok(cached);
        }

        debug!("[{}] Running {:?}", self.id, cmdline);
        let result = run_channel(
            &self.handle,
            &cmdline,
            self.effective_timeout(options),
            options.wait_for_timeout,
        )
        .await?;

        self.cache.remember(cmdline, options, &result);
        Ok(result)
    }

    fn is_windows(&self) -> bool {
        self.windows
    }
}

#[async_trait]
impl Client for SshConnection {
    async fn close(&mut self) -> Result<(), CommandError> {
        debug!(
            "[{}] Closing SSH connection ({} cached results)",
            self.id,
            self.cache.len()
        );
        self.cache.clear();
        self.handle
            .disconnect(Disconnect::ByApplication, "discovery finished", "en")
            .await
            .map_err(|e| CommandError::connection(format!("disconnect failed: {}", e)))
    }
}
