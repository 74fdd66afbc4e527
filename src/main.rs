#![deny(clippy::unwrap_used)]

//! Reference adapter: SSH host discovery with credential fallback.
//!
//! Reads `DISCO_TARGET`, `DISCO_CREDENTIALS` (JSON credential file) and
//! optionally `DISCO_PROTOCOL` (default `ssh`), tries every matching
//! credential and prints one JSON line per discovered host fragment.

use std::sync::Arc;

use async_trait::async_trait;
use dotenv::dotenv;
use regex::Regex;
use serde::Serialize;
use tracing::info;

use disco_core::command::handler::first_capture;
use disco_core::command::{Cmd, Executor, ExecutorSettings};
use disco_core::config::{self, require_env};
use disco_core::credentials::{CredentialDescriptor, CredentialStore, InMemoryCredentialStore};
use disco_core::dns::{DnsResolverChain, HostsFileResolver};
use disco_core::error::CommandError;
use disco_core::orchestrator::{
    CredentialFallback, Discover, Discovered, Warnings, configured_credentials,
};
use disco_core::report::TracingReporter;
use disco_core::shell::Shell;
use disco_core::ssh::{SshClientFactory, SshConnection, SshSettings};
use disco_core::TriggerContext;

const TARGET_ENV_VAR: &str = "DISCO_TARGET";
const CREDENTIALS_ENV_VAR: &str = "DISCO_CREDENTIALS";
const PROTOCOL_ENV_VAR: &str = "DISCO_PROTOCOL";

#[derive(Debug, Serialize)]
struct HostFragment {
    credential_id: String,
    address: Option<String>,
    windows: bool,
    system: String,
    hostname: Option<String>,
    os_name: Option<String>,
}

struct HostDiscoverer {
    protocol: String,
    settings: ExecutorSettings,
}

#[async_trait]
impl Discover<SshConnection> for HostDiscoverer {
    type Fragment = HostFragment;

    async fn discover(
        &self,
        client: &SshConnection,
        descriptor: &CredentialDescriptor,
    ) -> Result<Discovered<HostFragment>, CommandError> {
        let executor = Executor::new(client, self.settings);
        let mut warnings = Warnings::new(self.protocol.as_str());
        let windows = client.is_windows();

        let (system, hostname, os_name) = if windows {
            let system = executor.run(&Cmd::windows("ver")).await?;
            let hostname = executor.run(&Cmd::windows("hostname")).await;
            (system, warnings.discover_or_warn("hostname", hostname), None)
        } else {
            let system = executor.run(&Cmd::posix("uname -a")).await?;
            let hostname = executor.run(&Cmd::posix("hostname")).await;

            let pretty_name = Regex::new(r#"PRETTY_NAME="?([^"\n]*)"?"#)
                .map_err(|e| CommandError::execute(e.to_string()))?;
            let os_release = Cmd::posix("cat /etc/os-release")
                | Cmd::posix("grep '^PRETTY_NAME='").and_then(first_capture(pretty_name));
            let os_name = executor.run(&os_release).await;

            (
                system,
                warnings.discover_or_warn("hostname", hostname),
                warnings.discover_or_warn("os-release", os_name),
            )
        };

        let fragment = HostFragment {
            credential_id: descriptor.id.clone(),
            address: descriptor.ip.clone(),
            windows,
            system,
            hostname,
            os_name,
        };
        Ok(Discovered::with_warnings(vec![fragment], warnings))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Logs go to stderr; stdout carries the JSON fragments
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let target = require_env(TARGET_ENV_VAR)?;
    let credentials_path = require_env(CREDENTIALS_ENV_VAR)?;
    let protocol = std::env::var(PROTOCOL_ENV_VAR).unwrap_or_else(|_| "ssh".to_string());

    let store: Arc<dyn CredentialStore> =
        Arc::new(InMemoryCredentialStore::load(&credentials_path).await?);
    let hosts = HostsFileResolver::from_path(config::resolve_hosts_file(None)).await;
    let dns = DnsResolverChain::default_chain(hosts, None);

    let settings = SshSettings::from_env();
    let factory = SshClientFactory::new(Arc::clone(&store), settings);
    let reporter = TracingReporter;
    let discoverer = HostDiscoverer {
        protocol: protocol.clone(),
        settings: ExecutorSettings::default()
            .with_timeout(settings.command_timeout)
            .with_cache(true),
    };

    info!("Discovering {} over {}", target, protocol);

    let outcome = CredentialFallback::new(protocol.as_str(), &factory, store.as_ref(), &reporter)
        .stop_on_first(config::resolve_stop_on_first(None))
        .with_dns(&dns)
        .resolve_hostnames(true)
        .run(
            &TriggerContext::new(target.as_str()),
            configured_credentials(protocol.as_str()),
            &discoverer,
        )
        .await;

    for fragment in &outcome.fragments {
        println!("{}", serde_json::to_string(fragment)?);
    }

    if !outcome.is_discovered() {
        return Err(format!(
            "{} discovery of {} ended with {:?} after {} attempt(s)",
            protocol, target, outcome.state, outcome.attempts
        )
        .into());
    }

    Ok(())
}
