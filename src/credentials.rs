//! Credential records and connection-parameter resolution.
//!
//! A destination (IP) plus a protocol name selects an ordered list of
//! configured credential ids from a [`CredentialStore`]. For each id the
//! [`DescriptorResolver`] merges the values carried by the triggering CI with
//! the values stored on the credential record into a [`CredentialDescriptor`].
//!
//! # Merge rule
//!
//! A value is *meaningful* when it is present, not blank and not the
//! [`NOT_AVAILABLE`] sentinel. Under the default [`MergePolicy::PreferStored`]
//! the stored value wins whenever it is meaningful and the triggering value
//! fills the gaps; [`MergePolicy::PreferTriggering`] flips the precedence.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Opaque credential identifier.
pub type CredentialId = String;

/// Sentinel used by triggering CIs for "value not available".
pub const NOT_AVAILABLE: &str = "NA";

pub const PORT_PROPERTY: &str = "protocol_port";
pub const DB_NAME_PROPERTY: &str = "protocol_dbname";
pub const USERNAME_PROPERTY: &str = "protocol_username";
pub const PASSWORD_PROPERTY: &str = "protocol_password";
pub const KEY_PATH_PROPERTY: &str = "protocol_keyfile";

/// Effective connection parameters for one credential.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialDescriptor {
    pub id: CredentialId,
    pub ip: Option<String>,
    pub db_name: Option<String>,
    pub port: Option<String>,
}

impl CredentialDescriptor {
    pub fn new(id: impl Into<CredentialId>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }

    pub fn with_db_name(mut self, db_name: impl Into<String>) -> Self {
        self.db_name = Some(db_name.into());
        self
    }

    /// Port parsed as a number, if it is one.
    pub fn port_number(&self) -> Option<u16> {
        self.port.as_deref().and_then(|p| p.trim().parse().ok())
    }
}

/// What the triggering CI tells us about the target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerContext {
    pub ip: String,
    pub hostname: Option<String>,
    pub port: Option<String>,
    pub db_name: Option<String>,
}

impl TriggerContext {
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            ..Default::default()
        }
    }

    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }

    pub fn with_db_name(mut self, db_name: impl Into<String>) -> Self {
        self.db_name = Some(db_name.into());
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }
}

/// Locally configured credentials.
pub trait CredentialStore: Send + Sync {
    fn get_protocol_property(&self, credential_id: &str, property: &str) -> Option<String>;

    /// Credential ids usable for `protocol` on `ip`, in configuration order.
    fn get_available_protocols(&self, ip: &str, protocol: &str) -> Vec<CredentialId>;
}

/// One configured credential as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub id: CredentialId,
    pub protocol: String,
    /// Destinations the credential applies to; empty means all.
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl CredentialRecord {
    pub fn new(id: impl Into<CredentialId>, protocol: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            protocol: protocol.into(),
            scope: Vec::new(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_scope(mut self, ip: impl Into<String>) -> Self {
        self.scope.push(ip.into());
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    fn applies_to(&self, ip: &str, protocol: &str) -> bool {
        self.protocol.eq_ignore_ascii_case(protocol)
            && (self.scope.is_empty() || self.scope.iter().any(|s| s == ip))
    }
}

#[derive(Debug, Error)]
pub enum CredentialStoreError {
    #[error("cannot read credential file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid credential file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Credential store backed by an ordered list of records.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCredentialStore {
    records: Vec<CredentialRecord>,
}

impl InMemoryCredentialStore {
    pub fn new(records: Vec<CredentialRecord>) -> Self {
        Self { records }
    }

    /// Parse a JSON array of [`CredentialRecord`]s.
    pub fn from_json(json: &str) -> Result<Self, CredentialStoreError> {
        Ok(Self::new(serde_json::from_str(json)?))
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, CredentialStoreError> {
        let json = tokio::fs::read_to_string(path.as_ref()).await?;
        let store = Self::from_json(&json)?;
        debug!(
            "Loaded {} credential record(s) from {:?}",
            store.records.len(),
            path.as_ref()
        );
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn get_protocol_property(&self, credential_id: &str, property: &str) -> Option<String> {
        self.records
            .iter()
            .find(|r| r.id == credential_id)
            .and_then(|r| r.properties.get(property).cloned())
    }

    fn get_available_protocols(&self, ip: &str, protocol: &str) -> Vec<CredentialId> {
        self.records
            .iter()
            .filter(|r| r.applies_to(ip, protocol))
            .map(|r| r.id.clone())
            .collect()
    }
}

/// Which side wins when both the triggering CI and the credential record
/// carry a meaningful value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MergePolicy {
    #[default]
    PreferStored,
    PreferTriggering,
}

fn meaningful(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty() && *v != NOT_AVAILABLE)
}

/// Merge one parameter according to `policy`. Idempotent: merging a merged
/// value against the same stored value changes nothing.
pub fn merge_value(
    triggering: Option<&str>,
    stored: Option<&str>,
    policy: MergePolicy,
) -> Option<String> {
    let triggering = meaningful(triggering);
    let stored = meaningful(stored);
    let chosen = match policy {
        MergePolicy::PreferStored => stored.or(triggering),
        MergePolicy::PreferTriggering => triggering.or(stored),
    };
    chosen.map(String::from)
}

/// Turns credential ids into effective descriptors.
pub struct DescriptorResolver<'a> {
    store: &'a dyn CredentialStore,
    policy: MergePolicy,
}

impl<'a> DescriptorResolver<'a> {
    pub fn new(store: &'a dyn CredentialStore, policy: MergePolicy) -> Self {
        Self { store, policy }
    }

    /// Unmerged candidates: one per configured credential, carrying only the
    /// triggering values.
    pub fn candidates(&self, ctx: &TriggerContext, protocol: &str) -> Vec<CredentialDescriptor> {
        self.store
            .get_available_protocols(&ctx.ip, protocol)
            .into_iter()
            .map(|id| CredentialDescriptor {
                id,
                ip: Some(ctx.ip.clone()),
                db_name: ctx.db_name.clone(),
                port: ctx.port.clone(),
            })
            .collect()
    }

    /// Merge a candidate with the values stored on its credential record.
    pub fn resolve(&self, candidate: &CredentialDescriptor) -> CredentialDescriptor {
        let stored_port = self
            .store
            .get_protocol_property(&candidate.id, PORT_PROPERTY);
        let stored_db_name = self
            .store
            .get_protocol_property(&candidate.id, DB_NAME_PROPERTY);

        CredentialDescriptor {
            id: candidate.id.clone(),
            ip: meaningful(candidate.ip.as_deref()).map(String::from),
            port: merge_value(candidate.port.as_deref(), stored_port.as_deref(), self.policy),
            db_name: merge_value(
                candidate.db_name.as_deref(),
                stored_db_name.as_deref(),
                self.policy,
            ),
        }
    }

    /// Candidates for `ctx`, already merged.
    pub fn resolve_all(&self, ctx: &TriggerContext, protocol: &str) -> Vec<CredentialDescriptor> {
        self.candidates(ctx, protocol)
            .iter()
            .map(|c| self.resolve(c))
            .collect()
    }
}
