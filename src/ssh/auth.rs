//! SSH authentication strategies.
//!
//! A credential may carry a password, a private key path, both, or neither.
//! [`AuthChain::for_credential`] turns that into an ordered list of
//! strategies: password, then key, with the local SSH agent as the only
//! strategy when the credential carries nothing.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, keys};
use thiserror::Error;
use tracing::debug;

use super::connection::SshClientHandler;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{0} authentication failed")]
    Rejected(&'static str),

    #[error("cannot load private key {path:?}: {message}")]
    Key { path: PathBuf, message: String },

    #[error("ssh agent: {0}")]
    Agent(String),

    #[error("authentication transport error: {0}")]
    Transport(#[from] russh::Error),

    #[error("no authentication methods configured")]
    NoStrategies,
}

impl AuthError {
    /// `false` only for transport errors; everything else fails the same
    /// way on every reconnect.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, Self::Transport(_))
    }

    fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

/// The failure a chain reports once every strategy failed.
///
/// A server rejection outranks local failures such as an unreadable key or
/// an unreachable agent; otherwise the last error wins.
pub(crate) fn chain_failure(errors: impl IntoIterator<Item = AuthError>) -> AuthError {
    let mut failure: Option<AuthError> = None;
    for error in errors {
        failure = match failure {
            Some(rejected) if rejected.is_rejection() && !error.is_rejection() => Some(rejected),
            _ => Some(error),
        };
    }
    failure.unwrap_or(AuthError::NoStrategies)
}

#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// `Ok(())` once the server accepted the user.
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<(), AuthError>;

    fn name(&self) -> &'static str;
}

pub struct PasswordAuth {
    password: String,
}

impl PasswordAuth {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<(), AuthError> {
        let result = handle.authenticate_password(username, &self.password).await?;
        if result.success() {
            Ok(())
        } else {
            Err(AuthError::Rejected(self.name()))
        }
    }

    fn name(&self) -> &'static str {
        "password"
    }
}

/// Passphrase-less private key file.
pub struct KeyAuth {
    key_path: PathBuf,
}

impl KeyAuth {
    pub fn new(key_path: impl Into<PathBuf>) -> Self {
        Self {
            key_path: key_path.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<(), AuthError> {
        let key_pair = keys::load_secret_key(&self.key_path, None).map_err(|e| AuthError::Key {
            path: self.key_path.clone(),
            message: e.to_string(),
        })?;

        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        debug!("Key auth with RSA hash {:?}", hash_alg);

        let key = keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg);
        let result = handle.authenticate_publickey(username, key).await?;
        if result.success() {
            Ok(())
        } else {
            Err(AuthError::Rejected(self.name()))
        }
    }

    fn name(&self) -> &'static str {
        "key"
    }
}

/// Every identity held by the agent behind `SSH_AUTH_SOCK`.
#[derive(Default)]
pub struct AgentAuth;

#[async_trait]
impl AuthStrategy for AgentAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<(), AuthError> {
        let mut agent = keys::agent::client::AgentClient::connect_env()
            .await
            .map_err(|e| AuthError::Agent(format!("cannot connect: {}", e)))?;

        let identities = agent
            .request_identities()
            .await
            .map_err(|e| AuthError::Agent(format!("cannot list identities: {}", e)))?;

        for identity in identities {
            debug!("Trying agent identity {:?}", identity.comment());
            let hash_alg = handle
                .best_supported_rsa_hash()
                .await
                .ok()
                .flatten()
                .flatten();

            match handle
                .authenticate_publickey_with(username, identity, hash_alg, &mut agent)
                .await
            {
                Ok(result) if result.success() => return Ok(()),
                Ok(_) => debug!("Agent identity rejected"),
                Err(e) => debug!("Agent identity failed: {}", e),
            }
        }

        Err(AuthError::Rejected(self.name()))
    }

    fn name(&self) -> &'static str {
        "agent"
    }
}

/// Strategies tried in order until one is accepted.
#[derive(Default)]
pub struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Password, then key; the agent only when neither is configured.
    pub fn for_credential(password: Option<&str>, key_path: Option<&str>) -> Self {
        let mut chain = Self::new();
        if let Some(password) = password {
            chain = chain.with(PasswordAuth::new(password));
        }
        if let Some(key_path) = key_path {
            chain = chain.with(KeyAuth::new(key_path));
        }
        if chain.is_empty() {
            chain = chain.with(AgentAuth);
        }
        chain
    }

    pub fn with(mut self, strategy: impl AuthStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }
}

#[async_trait]
impl AuthStrategy for AuthChain {
    /// See [`chain_failure`] for the error returned when none is accepted.
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<(), AuthError> {
        let mut errors = Vec::with_capacity(self.strategies.len());

        for strategy in &self.strategies {
            match strategy.authenticate(handle, username).await {
                Ok(()) => {
                    debug!("Authenticated {} with {}", username, strategy.name());
                    return Ok(());
                }
                Err(e) => {
                    debug!("Strategy {} failed for {}: {}", strategy.name(), username, e);
                    errors.push(e);
                }
            }
        }

        Err(chain_failure(errors))
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}
