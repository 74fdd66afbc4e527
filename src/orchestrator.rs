//! Credential-fallback orchestration.
//!
//! [`CredentialFallback`] drives one discovery attempt across every
//! configured credential for a target until one connection works:
//!
//! 1. **Enumerate** candidates with a caller-supplied function.
//! 2. **Guard**: no set, or a set that yields nothing, reports a single
//!    "no credentials" error and stops.
//! 3. **Iterate** candidates in enumeration order. Each one is optionally
//!    DNS-resolved, connected through [`with_client`] (closed on every exit
//!    path) and handed to the [`Discover`] body.
//! 4. **Finalize**: on any success, report the collected warnings and return
//!    the fragments; otherwise report every connection error and every
//!    discovery error and return nothing.
//!
//! Flat sets are merged against the credential store before connecting and
//! honour `stop_on_first`. Row sets (2-D) use their tuples as given; within a
//! row the first success ends the row, and iteration always moves on to the
//! next row.
//!
//! Nothing escapes [`CredentialFallback::run`]: failures leave only as
//! reports and as the [`Outcome`] bookkeeping.

use std::net::IpAddr;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::credentials::{
    CredentialDescriptor, CredentialId, CredentialStore, DescriptorResolver, MergePolicy,
    TriggerContext,
};
use crate::dns::DnsResolverChain;
use crate::error::CommandError;
use crate::report::{ErrorObject, Reporter};

/// An open connection to a target.
#[async_trait]
pub trait Client: Send + Sync {
    async fn close(&mut self) -> Result<(), CommandError>;
}

/// Opens connections for credential descriptors.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    type Client: Client;

    async fn create_client(
        &self,
        descriptor: &CredentialDescriptor,
    ) -> Result<Self::Client, CommandError>;
}

/// Open a client, run `body` with it, close it, return what `body` returned.
///
/// A failed open is always reported as [`CommandError::Connection`]. The
/// client is closed whether `body` succeeds or fails; a failing close is
/// logged and does not change the result.
///
/// A panic in `body` unwinds past `close`. The client is then only dropped,
/// so implementations must release their transport on drop as well.
pub async fn with_client<F, T>(
    factory: &F,
    descriptor: &CredentialDescriptor,
    body: impl AsyncFnOnce(&F::Client) -> Result<T, CommandError>,
) -> Result<T, CommandError>
where
    F: ClientFactory + ?Sized,
{
    let mut client = factory.create_client(descriptor).await.map_err(|e| {
        if e.is_connection() {
            e
        } else {
            CommandError::connection(e.to_string())
        }
    })?;

    let outcome = body(&client).await;

    if let Err(e) = client.close().await {
        warn!("Failed to close client for credential {}: {}", descriptor.id, e);
    }

    outcome
}

/// What one successful candidate produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Discovered<F> {
    pub fragments: Vec<F>,
    /// Already classified, non-fatal problems.
    pub warnings: Vec<ErrorObject>,
}

impl<F> Discovered<F> {
    pub fn new(fragments: Vec<F>) -> Self {
        Self {
            fragments,
            warnings: Vec::new(),
        }
    }

    pub fn with_warnings(fragments: Vec<F>, warnings: Warnings) -> Self {
        Self {
            fragments,
            warnings: warnings.into_vec(),
        }
    }
}

/// Collects non-fatal problems during one discovery body.
#[derive(Debug, Clone)]
pub struct Warnings {
    protocol: String,
    items: Vec<ErrorObject>,
}

impl Warnings {
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            items: Vec::new(),
        }
    }

    /// Keep the value of a best-effort step, or record its failure as a
    /// warning and carry on.
    pub fn discover_or_warn<T>(&mut self, what: &str, result: Result<T, CommandError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                debug!("Step {:?} failed, downgrading to warning: {}", what, e);
                let cause = CommandError::discovery(format!("{}: {}", what, e));
                self.items
                    .push(ErrorObject::failed_getting_information(&self.protocol, &cause));
                None
            }
        }
    }

    pub fn push(&mut self, warning: ErrorObject) {
        self.items.push(warning);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_vec(self) -> Vec<ErrorObject> {
        self.items
    }
}

/// The discovery body run once per connected candidate.
#[async_trait]
pub trait Discover<C: Send + Sync>: Send + Sync {
    type Fragment: Send;

    async fn discover(
        &self,
        client: &C,
        descriptor: &CredentialDescriptor,
    ) -> Result<Discovered<Self::Fragment>, CommandError>;
}

/// Candidates to try, produced lazily.
pub enum CredentialSet {
    /// One descriptor per attempt.
    Flat(Box<dyn Iterator<Item = CredentialDescriptor> + Send>),
    /// Rows of alternatives for the same logical target.
    Rows(Box<dyn Iterator<Item = Vec<CredentialDescriptor>> + Send>),
}

impl CredentialSet {
    pub fn flat(candidates: Vec<CredentialDescriptor>) -> Self {
        Self::Flat(Box::new(candidates.into_iter()))
    }

    pub fn rows(rows: Vec<Vec<CredentialDescriptor>>) -> Self {
        Self::Rows(Box::new(rows.into_iter()))
    }
}

/// Enumeration over every credential the store holds for the target.
pub fn configured_credentials(
    protocol: impl Into<String>,
) -> impl FnOnce(&TriggerContext, &dyn CredentialStore) -> Option<CredentialSet> {
    let protocol = protocol.into();
    move |ctx, store| {
        let candidates =
            DescriptorResolver::new(store, MergePolicy::default()).candidates(ctx, &protocol);
        Some(CredentialSet::flat(candidates))
    }
}

/// The one final state reported per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalState {
    Discovered,
    NoCredentials,
    AllFailed,
}

/// A failed candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateError {
    pub credential_id: CredentialId,
    /// Row index for 2-D sets.
    pub row: Option<usize>,
    pub error: CommandError,
}

/// Result of one orchestrator run.
#[derive(Debug)]
pub struct Outcome<F> {
    pub fragments: Vec<F>,
    pub state: FinalState,
    pub attempts: usize,
    pub warnings: Vec<ErrorObject>,
    pub connection_errors: Vec<CandidateError>,
    pub discovery_errors: Vec<CandidateError>,
}

impl<F> Outcome<F> {
    fn empty(state: FinalState) -> Self {
        Self {
            fragments: Vec::new(),
            state,
            attempts: 0,
            warnings: Vec::new(),
            connection_errors: Vec::new(),
            discovery_errors: Vec::new(),
        }
    }

    pub fn is_discovered(&self) -> bool {
        self.state == FinalState::Discovered
    }
}

/// The credential-fallback control loop.
pub struct CredentialFallback<'a, F: ClientFactory + ?Sized> {
    protocol: String,
    factory: &'a F,
    store: &'a dyn CredentialStore,
    reporter: &'a dyn Reporter,
    dns: Option<&'a DnsResolverChain>,
    stop_on_first: bool,
    resolve_hostnames: bool,
    merge_policy: MergePolicy,
}

impl<'a, F: ClientFactory + ?Sized> CredentialFallback<'a, F> {
    pub fn new(
        protocol: impl Into<String>,
        factory: &'a F,
        store: &'a dyn CredentialStore,
        reporter: &'a dyn Reporter,
    ) -> Self {
        Self {
            protocol: protocol.into(),
            factory,
            store,
            reporter,
            dns: None,
            stop_on_first: true,
            resolve_hostnames: false,
            merge_policy: MergePolicy::default(),
        }
    }

    /// Stop after the first successful flat candidate (default `true`).
    pub fn stop_on_first(mut self, stop_on_first: bool) -> Self {
        self.stop_on_first = stop_on_first;
        self
    }

    pub fn with_dns(mut self, dns: &'a DnsResolverChain) -> Self {
        self.dns = Some(dns);
        self
    }

    /// Resolve non-IP endpoints through the attached DNS chain.
    pub fn resolve_hostnames(mut self, resolve: bool) -> Self {
        self.resolve_hostnames = resolve;
        self
    }

    pub fn merge_policy(mut self, policy: MergePolicy) -> Self {
        self.merge_policy = policy;
        self
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Run discovery for `ctx` across the enumerated credentials.
    pub async fn run<E, D>(
        &self,
        ctx: &TriggerContext,
        enumerate: E,
        discoverer: &D,
    ) -> Outcome<D::Fragment>
    where
        E: FnOnce(&TriggerContext, &dyn CredentialStore) -> Option<CredentialSet>,
        D: Discover<F::Client> + ?Sized,
    {
        info!("Starting {} discovery of {}", self.protocol, ctx.ip);

        let mut outcome = Outcome::empty(FinalState::AllFailed);

        match enumerate(ctx, self.store) {
            None => return self.no_credentials(),
            Some(CredentialSet::Flat(candidates)) => {
                let mut candidates = candidates.peekable();
                if candidates.peek().is_none() {
                    return self.no_credentials();
                }

                let resolver = DescriptorResolver::new(self.store, self.merge_policy);
                for candidate in candidates {
                    let descriptor = resolver.resolve(&candidate);
                    let succeeded = self.attempt(descriptor, None, discoverer, &mut outcome).await;
                    if succeeded && self.stop_on_first {
                        debug!("Stopping after first successful credential");
                        break;
                    }
                }
            }
            Some(CredentialSet::Rows(rows)) => {
                let mut rows = rows.enumerate().filter(|(_, row)| !row.is_empty()).peekable();
                if rows.peek().is_none() {
                    return self.no_credentials();
                }

                for (index, row) in rows {
                    debug!("Trying credential row {} ({} alternatives)", index, row.len());
                    for descriptor in row {
                        if self.attempt(descriptor, Some(index), discoverer, &mut outcome).await {
                            break;
                        }
                    }
                }
            }
        }

        self.finalize(outcome)
    }

    fn no_credentials<T>(&self) -> Outcome<T> {
        warn!("No credentials configured for protocol {}", self.protocol);
        self.reporter
            .report_error(ErrorObject::no_credentials(&self.protocol));
        Outcome::empty(FinalState::NoCredentials)
    }

    /// Try one candidate; `true` when it produced a result.
    async fn attempt<D>(
        &self,
        descriptor: CredentialDescriptor,
        row: Option<usize>,
        discoverer: &D,
        outcome: &mut Outcome<D::Fragment>,
    ) -> bool
    where
        D: Discover<F::Client> + ?Sized,
    {
        let descriptor = self.resolve_endpoint(descriptor).await;
        outcome.attempts += 1;
        debug!(
            "Trying credential {} for {:?} (port {:?}, db {:?})",
            descriptor.id, descriptor.ip, descriptor.port, descriptor.db_name
        );

        let result = with_client(self.factory, &descriptor, async |client| {
            discoverer.discover(client, &descriptor).await
        })
        .await;

        match result {
            Ok(discovered) => {
                debug!(
                    "Credential {} produced {} fragment(s), {} warning(s)",
                    descriptor.id,
                    discovered.fragments.len(),
                    discovered.warnings.len()
                );
                outcome.fragments.extend(discovered.fragments);
                outcome.warnings.extend(discovered.warnings);
                outcome.state = FinalState::Discovered;
                true
            }
            Err(error) => {
                warn!("Credential {} failed: {}", descriptor.id, error);
                let failure = CandidateError {
                    credential_id: descriptor.id,
                    row,
                    error,
                };
                if failure.error.is_connection() {
                    outcome.connection_errors.push(failure);
                } else {
                    outcome.discovery_errors.push(failure);
                }
                false
            }
        }
    }

    async fn resolve_endpoint(&self, mut descriptor: CredentialDescriptor) -> CredentialDescriptor {
        if !self.resolve_hostnames {
            return descriptor;
        }
        let Some(dns) = self.dns else {
            return descriptor;
        };
        let Some(host) = descriptor.ip.clone() else {
            return descriptor;
        };
        if host.parse::<IpAddr>().is_ok() {
            return descriptor;
        }

        let ips = dns.resolve_ips(&host).await;
        match ips.first() {
            Some(ip) => {
                debug!("Resolved {} to {}", host, ip);
                descriptor.ip = Some(ip.to_string());
            }
            None => debug!("Could not resolve {}, proceeding with the hostname", host),
        }
        descriptor
    }

    fn finalize<T>(&self, outcome: Outcome<T>) -> Outcome<T> {
        if outcome.is_discovered() {
            for warning in &outcome.warnings {
                self.reporter.report_warning(warning.clone());
            }
            info!(
                "{} discovery succeeded: {} fragment(s) after {} attempt(s)",
                self.protocol,
                outcome.fragments.len(),
                outcome.attempts
            );
        } else {
            for failure in &outcome.connection_errors {
                self.reporter
                    .report_error(ErrorObject::connection_failed(&self.protocol, &failure.error));
            }
            for failure in &outcome.discovery_errors {
                self.reporter.report_error(ErrorObject::failed_getting_information(
                    &self.protocol,
                    &failure.error,
                ));
            }
            info!(
                "{} discovery failed: {} connection error(s), {} discovery error(s)",
                self.protocol,
                outcome.connection_errors.len(),
                outcome.discovery_errors.len()
            );
        }
        outcome
    }
}
