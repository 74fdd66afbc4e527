//! Opening SSH connections for credential descriptors.
//!
//! ## Connection Lifecycle
//!
//! 1. **Target**: the descriptor supplies host and port (default 22); the
//!    credential store supplies user name, password and key path.
//! 2. **Transport**: TCP connect bounded by the connect timeout, with
//!    keepalive and optional zlib compression.
//! 3. **Authentication**: the credential's [`AuthChain`].
//! 4. **Probe**: the OS family is detected once on the new connection.
//!
//! ## Retry Strategy
//!
//! Transport failures can be retried with exponential backoff and jitter
//! (`backon`), capped at [`MAX_RETRY_DELAY`]. Only transient failures are
//! retried; authentication failures never are, to avoid account lockouts.
//! The default is zero retries: moving to the next credential is the
//! orchestrator's job.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use russh::client;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{
    self, DEFAULT_COMMAND_TIMEOUT_SECS, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_MAX_RETRIES,
    DEFAULT_RETRY_DELAY_MS, MAX_RETRY_DELAY,
};
use crate::credentials::{
    CredentialDescriptor, CredentialStore, KEY_PATH_PROPERTY, PASSWORD_PROPERTY,
    USERNAME_PROPERTY,
};
use crate::error::{CommandError, is_retryable_error};
use crate::orchestrator::ClientFactory;

use super::auth::{AuthChain, AuthError, AuthStrategy};
use super::connection::{SshClientHandler, SshConnection};

pub const DEFAULT_SSH_PORT: u16 = 22;

/// Transport tunables shared by every connection a factory opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SshSettings {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub compression: bool,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            compression: true,
        }
    }
}

impl SshSettings {
    /// Environment values over built-in defaults.
    pub fn from_env() -> Self {
        Self {
            connect_timeout: config::resolve_connect_timeout(None),
            command_timeout: config::resolve_command_timeout(None),
            max_retries: config::resolve_max_retries(None),
            retry_delay: config::resolve_retry_delay(None),
            compression: config::resolve_compression(None),
        }
    }
}

/// Build russh client configuration.
///
/// The inactivity timeout follows the connect timeout; keepalive probes run
/// every 30 seconds and three missed probes drop the connection.
pub(crate) fn build_client_config(timeout: Duration, compress: bool) -> Arc<client::Config> {
    let compression = if compress {
        (&[russh::compression::ZLIB, russh::compression::NONE][..]).into()
    } else {
        (&[russh::compression::NONE][..]).into()
    };

    let preferred = russh::Preferred {
        compression,
        ..Default::default()
    };

    Arc::new(client::Config {
        inactivity_timeout: Some(timeout),
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        preferred,
        ..Default::default()
    })
}

/// Everything needed to reach and log into one host.
pub(crate) struct SshTarget {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) username: String,
    pub(crate) password: Option<String>,
    pub(crate) key_path: Option<String>,
}

impl SshTarget {
    pub(crate) fn from_descriptor(
        descriptor: &CredentialDescriptor,
        store: &dyn CredentialStore,
    ) -> Result<Self, CommandError> {
        let property = |name: &str| {
            store
                .get_protocol_property(&descriptor.id, name)
                .filter(|v| !v.is_empty())
        };

        let host = descriptor.ip.clone().ok_or_else(|| {
            CommandError::connection(format!("credential {} has no target address", descriptor.id))
        })?;

        let port = match &descriptor.port {
            None => DEFAULT_SSH_PORT,
            Some(_) => descriptor.port_number().ok_or_else(|| {
                CommandError::connection(format!(
                    "credential {} has an invalid port {:?}",
                    descriptor.id, descriptor.port
                ))
            })?,
        };

        let username = property(USERNAME_PROPERTY).ok_or_else(|| {
            CommandError::connection(format!("credential {} has no user name", descriptor.id))
        })?;

        Ok(Self {
            host,
            port,
            username,
            password: property(PASSWORD_PROPERTY),
            key_path: property(KEY_PATH_PROPERTY),
        })
    }

    fn auth_chain(&self) -> AuthChain {
        AuthChain::for_credential(self.password.as_deref(), self.key_path.as_deref())
    }
}

/// Why one connect attempt failed.
#[derive(Debug, Error)]
pub(crate) enum ConnectError {
    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to connect: {0}")]
    Transport(russh::Error),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl ConnectError {
    /// Authentication is decided from the typed error; only transport
    /// failures fall back to message classification.
    pub(crate) fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Auth(e) if e.is_permanent() => false,
            Self::Auth(_) | Self::Transport(_) => is_retryable_error(&self.to_string()),
        }
    }
}

async fn connect(
    target: &SshTarget,
    settings: &SshSettings,
) -> Result<client::Handle<SshClientHandler>, ConnectError> {
    let config = build_client_config(settings.connect_timeout, settings.compression);
    let connecting = client::connect(config, (target.host.as_str(), target.port), SshClientHandler);

    let mut handle = tokio::time::timeout(settings.connect_timeout, connecting)
        .await
        .map_err(|_| ConnectError::Timeout(settings.connect_timeout))?
        .map_err(ConnectError::Transport)?;

    target
        .auth_chain()
        .authenticate(&mut handle, &target.username)
        .await?;

    Ok(handle)
}

/// Connect and authenticate, retrying transient transport failures.
async fn connect_with_retry(
    target: &SshTarget,
    settings: &SshSettings,
) -> Result<client::Handle<SshClientHandler>, CommandError> {
    let attempts = AtomicU32::new(0);

    let backoff = ExponentialBuilder::default()
        .with_min_delay(settings.retry_delay)
        .with_max_delay(MAX_RETRY_DELAY)
        .with_max_times(settings.max_retries as usize)
        .with_jitter();

    let result = (|| async {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst);
        if attempt > 0 {
            warn!(
                "SSH reconnect attempt {} to {}@{}:{}",
                attempt, target.username, target.host, target.port
            );
        }
        connect(target, settings).await
    })
    .retry(backoff)
    .when(ConnectError::is_retryable)
    .notify(|e, delay| warn!("SSH connection failed: {}. Retrying in {:?}", e, delay))
    .await;

    let total = attempts.load(Ordering::SeqCst);
    result.map_err(|e| {
        CommandError::connection(format!(
            "{}@{}:{}: {} (after {} attempt(s))",
            target.username, target.host, target.port, e, total
        ))
    })
}

/// [`ClientFactory`] producing [`SshConnection`]s.
pub struct SshClientFactory {
    store: Arc<dyn CredentialStore>,
    settings: SshSettings,
}

impl SshClientFactory {
    pub fn new(store: Arc<dyn CredentialStore>, settings: SshSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> &SshSettings {
        &self.settings
    }
}

#[async_trait]
impl ClientFactory for SshClientFactory {
    type Client = SshConnection;

    async fn create_client(
        &self,
        descriptor: &CredentialDescriptor,
    ) -> Result<SshConnection, CommandError> {
        let target = SshTarget::from_descriptor(descriptor, self.store.as_ref())?;
        debug!(
            "Connecting to {}@{}:{} with credential {} ({:?})",
            target.username,
            target.host,
            target.port,
            descriptor.id,
            target.auth_chain().names()
        );

        let handle = connect_with_retry(&target, &self.settings).await?;
        info!(
            "Authenticated {}@{}:{} with credential {}",
            target.username, target.host, target.port, descriptor.id
        );

        Ok(SshConnection::open(handle, descriptor.id.clone(), self.settings.command_timeout).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CredentialRecord, InMemoryCredentialStore};

    fn store() -> InMemoryCredentialStore {
        InMemoryCredentialStore::new(vec![
            CredentialRecord::new("root-pw", "ssh")
                .with_property(USERNAME_PROPERTY, "root")
                .with_property(PASSWORD_PROPERTY, "secret"),
            CredentialRecord::new("deploy-key", "ssh")
                .with_property(USERNAME_PROPERTY, "deploy")
                .with_property(PASSWORD_PROPERTY, "")
                .with_property(KEY_PATH_PROPERTY, "/home/deploy/.ssh/id_ed25519"),
            CredentialRecord::new("anonymous", "ssh"),
        ])
    }

    mod targets {
        use super::*;

        #[test]
        fn test_default_port_and_password() {
            let target = SshTarget::from_descriptor(
                &CredentialDescriptor::new("root-pw").with_ip("10.0.0.1"),
                &store(),
            )
            .unwrap();
            assert_eq!(target.host, "10.0.0.1");
            assert_eq!(target.port, DEFAULT_SSH_PORT);
            assert_eq!(target.username, "root");
            assert_eq!(target.password.as_deref(), Some("secret"));
            assert_eq!(target.key_path, None);
            assert_eq!(target.auth_chain().names(), vec!["password"]);
        }

        #[test]
        fn test_explicit_port_and_key() {
            let target = SshTarget::from_descriptor(
                &CredentialDescriptor::new("deploy-key")
                    .with_ip("10.0.0.1")
                    .with_port("2222"),
                &store(),
            )
            .unwrap();
            assert_eq!(target.port, 2222);
            assert_eq!(target.password, None);
            assert_eq!(target.auth_chain().names(), vec!["key"]);
        }

        #[test]
        fn test_missing_pieces_are_connection_errors() {
            let s = store();
            let no_ip = SshTarget::from_descriptor(&CredentialDescriptor::new("root-pw"), &s);
            assert!(no_ip.err().is_some_and(|e| e.is_connection()));

            let no_user = SshTarget::from_descriptor(
                &CredentialDescriptor::new("anonymous").with_ip("10.0.0.1"),
                &s,
            );
            assert!(no_user.err().is_some_and(|e| e.is_connection()));

            let bad_port = SshTarget::from_descriptor(
                &CredentialDescriptor::new("root-pw")
                    .with_ip("10.0.0.1")
                    .with_port("ssh"),
                &s,
            );
            assert!(bad_port.err().is_some_and(|e| e.is_connection()));
        }
    }

    mod client_config {
        use super::*;

        #[test]
        fn test_timeouts_and_keepalive() {
            let config = build_client_config(Duration::from_secs(30), true);
            assert_eq!(config.inactivity_timeout, Some(Duration::from_secs(30)));
            assert_eq!(config.keepalive_interval, Some(Duration::from_secs(30)));
            assert_eq!(config.keepalive_max, 3);
        }

        #[test]
        fn test_compression_preference() {
            let on = build_client_config(Duration::from_secs(5), true);
            assert_eq!(on.preferred.compression.len(), 2);

            let off = build_client_config(Duration::from_secs(5), false);
            assert_eq!(off.preferred.compression.len(), 1);
        }
    }

    mod settings {
        use super::*;

        #[test]
        fn test_defaults() {
            let s = SshSettings::default();
            assert_eq!(s.connect_timeout, Duration::from_secs(30));
            assert_eq!(s.command_timeout, Duration::from_secs(180));
            assert_eq!(s.max_retries, 0);
            assert!(s.compression);
        }
    }

    mod retry_decisions {
        use super::*;
        use std::path::PathBuf;

        #[test]
        fn test_timeout_is_retried() {
            assert!(ConnectError::Timeout(Duration::from_secs(30)).is_retryable());
        }

        #[test]
        fn test_auth_failures_are_never_retried() {
            let missing_key = ConnectError::from(AuthError::Key {
                path: PathBuf::from("/home/deploy/id_ed25519"),
                message: "No such file or directory (os error 2)".into(),
            });
            assert!(!missing_key.is_retryable());
            assert!(!ConnectError::from(AuthError::Agent("cannot connect".into())).is_retryable());
            assert!(!ConnectError::from(AuthError::Rejected("password")).is_retryable());
            assert!(!ConnectError::from(AuthError::NoStrategies).is_retryable());
        }

        #[test]
        fn test_auth_message_passes_through() {
            let e = ConnectError::from(AuthError::Rejected("password"));
            assert_eq!(e.to_string(), "password authentication failed");
        }
    }

    mod connecting {
        use super::*;

        #[tokio::test]
        async fn test_missing_address_fails_before_connecting() {
            let factory = SshClientFactory::new(Arc::new(store()), SshSettings::default());
            let result = factory.create_client(&CredentialDescriptor::new("root-pw")).await;
            assert!(result.err().is_some_and(|e| e.is_connection()));
        }
    }
}
