//! Hostname resolution fallback chain.
//!
//! Resolution is best effort. Every resolver answers with an empty list or
//! `None` instead of failing, and [`DnsResolverChain`] returns the first
//! non-empty answer in registration order. Callers treat an empty answer as
//! "carry on without this address".

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::command::handler::{
    Handler, normalize_newlines, output, raise_on_non_zero_return_code,
};
use crate::command::{Cmd, Executor, ExecutorSettings};
use crate::error::CommandError;
use crate::shell::Shell;

/// One resolution strategy.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// Addresses for `hostname`; empty when unknown.
    async fn resolve_ips(&self, hostname: &str) -> Vec<IpAddr>;

    /// Canonical name for `ip`, if any.
    async fn resolve_fqdn(&self, ip: IpAddr) -> Option<String>;

    fn name(&self) -> &'static str;
}

/// Ordered resolvers, first non-empty answer wins.
#[derive(Default)]
pub struct DnsResolverChain {
    resolvers: Vec<Box<dyn DnsResolver>>,
}

impl DnsResolverChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, resolver: impl DnsResolver + 'static) -> Self {
        self.resolvers.push(Box::new(resolver));
        self
    }

    /// Hosts file, then active lookup when a shell is available, then the
    /// system resolver.
    pub fn default_chain(hosts: HostsFileResolver, nslookup: Option<NsLookupResolver>) -> Self {
        let chain = Self::new().with(hosts);
        let chain = match nslookup {
            Some(ns) => chain.with(ns),
            None => chain,
        };
        chain.with(SocketResolver)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.resolvers.iter().map(|r| r.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.resolvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolvers.is_empty()
    }

    pub async fn resolve_ips(&self, hostname: &str) -> Vec<IpAddr> {
        for resolver in &self.resolvers {
            let ips = resolver.resolve_ips(hostname).await;
            if !ips.is_empty() {
                debug!("{} resolved {} to {:?}", resolver.name(), hostname, ips);
                return ips;
            }
        }
        debug!("No resolver could resolve {}", hostname);
        Vec::new()
    }

    pub async fn resolve_fqdn(&self, ip: IpAddr) -> Option<String> {
        for resolver in &self.resolvers {
            if let Some(fqdn) = resolver.resolve_fqdn(ip).await {
                debug!("{} resolved {} to {}", resolver.name(), ip, fqdn);
                return Some(fqdn);
            }
        }
        None
    }
}

fn dedup(ips: impl IntoIterator<Item = IpAddr>) -> Vec<IpAddr> {
    let mut seen = HashSet::new();
    ips.into_iter().filter(|ip| seen.insert(*ip)).collect()
}

/// Static entries in `/etc/hosts` format.
#[derive(Debug, Clone, Default)]
pub struct HostsFileResolver {
    entries: Vec<(IpAddr, Vec<String>)>,
}

impl HostsFileResolver {
    /// Lines that do not start with a valid address are skipped.
    pub fn from_content(content: &str) -> Self {
        let entries = content
            .lines()
            .filter_map(|line| {
                let line = line.split('#').next().unwrap_or_default();
                let mut fields = line.split_whitespace();
                let ip = fields.next()?.parse::<IpAddr>().ok()?;
                let names: Vec<String> = fields.map(String::from).collect();
                (!names.is_empty()).then_some((ip, names))
            })
            .collect();
        Self { entries }
    }

    /// An unreadable file gives an empty resolver.
    pub async fn from_path(path: impl AsRef<Path>) -> Self {
        match tokio::fs::read_to_string(path.as_ref()).await {
            Ok(content) => Self::from_content(&content),
            Err(e) => {
                warn!("Cannot read hosts file {:?}: {}", path.as_ref(), e);
                Self::default()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl DnsResolver for HostsFileResolver {
    async fn resolve_ips(&self, hostname: &str) -> Vec<IpAddr> {
        dedup(
            self.entries
                .iter()
                .filter(|(_, names)| names.iter().any(|n| n.eq_ignore_ascii_case(hostname)))
                .map(|(ip, _)| *ip),
        )
    }

    async fn resolve_fqdn(&self, ip: IpAddr) -> Option<String> {
        self.entries
            .iter()
            .find(|(entry, _)| *entry == ip)
            .and_then(|(_, names)| names.first().cloned())
    }

    fn name(&self) -> &'static str {
        "hosts-file"
    }
}

/// Characters allowed in an nslookup argument; anything else is refused
/// rather than quoted, since the shell may be `cmd.exe`.
fn is_lookup_safe(query: &str) -> bool {
    !query.is_empty()
        && query
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':'))
}

/// Addresses listed after the first `Name:` line. Handles both the
/// one-`Address:`-per-line layout and the indented `Addresses:` block.
fn parse_nslookup_addresses() -> Handler<String, Vec<IpAddr>> {
    Handler::new(|text: String| {
        let mut ips = Vec::new();
        let mut answered = false;
        let mut in_block = false;

        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.starts_with("Name:") {
                answered = true;
                in_block = false;
                continue;
            }
            if !answered {
                continue;
            }

            let value = trimmed
                .strip_prefix("Addresses:")
                .or_else(|| trimmed.strip_prefix("Address:"));
            match value {
                Some(v) => {
                    in_block = true;
                    ips.extend(v.split_whitespace().filter_map(|t| t.parse::<IpAddr>().ok()));
                }
                None if in_block && line.starts_with(char::is_whitespace) => {
                    ips.extend(trimmed.parse::<IpAddr>().ok());
                }
                None => in_block = false,
            }
        }

        if ips.is_empty() {
            return Err(CommandError::not_found("nslookup returned no addresses"));
        }
        Ok(dedup(ips))
    })
}

/// `name = host.` (reverse answer) or the value of the `Name:` line.
fn parse_nslookup_name() -> Handler<String, String> {
    Handler::new(|text: String| {
        let from_ptr = text.lines().find_map(|line| {
            line.split_once("name = ")
                .map(|(_, name)| name.trim().trim_end_matches('.').to_string())
        });
        let from_name = || {
            text.lines().find_map(|line| {
                line.trim()
                    .strip_prefix("Name:")
                    .map(|name| name.trim().trim_end_matches('.').to_string())
            })
        };

        from_ptr
            .or_else(from_name)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| CommandError::not_found("nslookup returned no name"))
    })
}

/// Active lookup through `nslookup` on a remote or local shell.
pub struct NsLookupResolver {
    shell: Arc<dyn Shell>,
    settings: ExecutorSettings,
}

impl NsLookupResolver {
    pub fn new(shell: Arc<dyn Shell>) -> Self {
        Self {
            shell,
            settings: ExecutorSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: ExecutorSettings) -> Self {
        self.settings = settings;
        self
    }

    fn lookup<T: 'static>(query: &str, parse: Handler<String, T>) -> Cmd<T> {
        Cmd::new(
            format!("nslookup {}", query),
            raise_on_non_zero_return_code()
                .then(output())
                .then(normalize_newlines())
                .then(parse),
        )
    }
}

#[async_trait]
impl DnsResolver for NsLookupResolver {
    async fn resolve_ips(&self, hostname: &str) -> Vec<IpAddr> {
        if !is_lookup_safe(hostname) {
            debug!("Refusing to look up {:?}", hostname);
            return Vec::new();
        }
        let executor = Executor::new(self.shell.as_ref(), self.settings);
        let cmd = Self::lookup(hostname, parse_nslookup_addresses());
        executor.run_safe(&cmd, Vec::new()).await
    }

    async fn resolve_fqdn(&self, ip: IpAddr) -> Option<String> {
        let executor = Executor::new(self.shell.as_ref(), self.settings);
        let cmd = Self::lookup(&ip.to_string(), parse_nslookup_name());
        match executor.run(&cmd).await {
            Ok(name) => Some(name),
            Err(e) => {
                debug!("Reverse lookup of {} failed: {}", ip, e);
                None
            }
        }
    }

    fn name(&self) -> &'static str {
        "nslookup"
    }
}

/// The runtime's system resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketResolver;

#[async_trait]
impl DnsResolver for SocketResolver {
    async fn resolve_ips(&self, hostname: &str) -> Vec<IpAddr> {
        match tokio::net::lookup_host((hostname, 0)).await {
            Ok(addrs) => dedup(addrs.map(|a| a.ip())),
            Err(e) => {
                debug!("System resolver failed for {}: {}", hostname, e);
                Vec::new()
            }
        }
    }

    async fn resolve_fqdn(&self, _ip: IpAddr) -> Option<String> {
        None
    }

    fn name(&self) -> &'static str {
        "socket"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::testing::ScriptedShell;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    const HOSTS: &str = "\
# static entries
127.0.0.1   localhost
10.0.0.5    db2-prod db2-prod.corp.example  # primary
10.0.0.6    DB2-Prod
::1         localhost ip6-localhost
not-an-ip   ignored
10.0.0.7
";

    /// Answers with fixed values and counts calls.
    struct Fixed {
        ips: Vec<IpAddr>,
        fqdn: Option<String>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DnsResolver for Fixed {
        async fn resolve_ips(&self, _hostname: &str) -> Vec<IpAddr> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.ips.clone()
        }

        async fn resolve_fqdn(&self, _ip: IpAddr) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.fqdn.clone()
        }

        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    fn fixed(ips: &[&str], fqdn: Option<&str>) -> (Fixed, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = Fixed {
            ips: ips.iter().map(|s| ip(s)).collect(),
            fqdn: fqdn.map(String::from),
            calls: Arc::clone(&calls),
        };
        (resolver, calls)
    }

    mod hosts_file {
        use super::*;

        #[test]
        fn test_parse_skips_comments_and_garbage() {
            let hosts = HostsFileResolver::from_content(HOSTS);
            assert_eq!(hosts.len(), 4);
        }

        #[tokio::test]
        async fn test_case_insensitive_lookup() {
            let hosts = HostsFileResolver::from_content(HOSTS);
            assert_eq!(
                hosts.resolve_ips("db2-PROD").await,
                vec![ip("10.0.0.5"), ip("10.0.0.6")]
            );
            assert_eq!(
                hosts.resolve_ips("db2-prod.corp.example").await,
                vec![ip("10.0.0.5")]
            );
            assert!(hosts.resolve_ips("unknown").await.is_empty());
        }

        #[tokio::test]
        async fn test_ipv6_and_fqdn() {
            let hosts = HostsFileResolver::from_content(HOSTS);
            assert_eq!(
                hosts.resolve_ips("ip6-localhost").await,
                vec![ip("::1")]
            );
            assert_eq!(
                hosts.resolve_fqdn(ip("10.0.0.5")).await,
                Some("db2-prod".to_string())
            );
            assert_eq!(hosts.resolve_fqdn(ip("10.9.9.9")).await, None);
        }

        #[tokio::test]
        async fn test_missing_file_is_empty() {
            let hosts = HostsFileResolver::from_path("/nonexistent/hosts").await;
            assert!(hosts.is_empty());
        }
    }

    mod chain {
        use super::*;

        #[tokio::test]
        async fn test_first_non_empty_wins() {
            let (empty, empty_calls) = fixed(&[], None);
            let (first, first_calls) = fixed(&["10.0.0.1"], Some("first.example"));
            let (second, second_calls) = fixed(&["10.0.0.2"], Some("second.example"));
            let chain = DnsResolverChain::new().with(empty).with(first).with(second);

            assert_eq!(chain.resolve_ips("host").await, vec![ip("10.0.0.1")]);
            assert_eq!(
                chain.resolve_fqdn(ip("10.0.0.1")).await,
                Some("first.example".to_string())
            );
            assert_eq!(empty_calls.load(Ordering::SeqCst), 2);
            assert_eq!(first_calls.load(Ordering::SeqCst), 2);
            assert_eq!(second_calls.load(Ordering::SeqCst), 0);
        }

        #[tokio::test]
        async fn test_all_empty_is_empty() {
            let (a, _) = fixed(&[], None);
            let (b, _) = fixed(&[], None);
            let chain = DnsResolverChain::new().with(a).with(b);

            assert!(chain.resolve_ips("host").await.is_empty());
            assert_eq!(chain.resolve_fqdn(ip("10.0.0.1")).await, None);
            assert!(DnsResolverChain::new().resolve_ips("host").await.is_empty());
        }

        #[test]
        fn test_default_chain_order() {
            let shell: Arc<dyn Shell> = Arc::new(ScriptedShell::unix());
            let chain = DnsResolverChain::default_chain(
                HostsFileResolver::default(),
                Some(NsLookupResolver::new(shell)),
            );
            assert_eq!(chain.names(), vec!["hosts-file", "nslookup", "socket"]);

            let chain = DnsResolverChain::default_chain(HostsFileResolver::default(), None);
            assert_eq!(chain.names(), vec!["hosts-file", "socket"]);
        }
    }

    mod nslookup {
        use super::*;

        const UNIX_FORWARD: &str = "\
Server:\t\t127.0.0.53
Address:\t127.0.0.53#53

Non-authoritative answer:
Name:\tdb2-prod.corp.example
Address: 10.0.0.5
Name:\tdb2-prod.corp.example
Address: fd00::5
";

        const WINDOWS_FORWARD: &str = "\
Server:  dns.corp.example\r
Address:  10.0.0.53\r
\r
Non-authoritative answer:\r
Name:    db2-prod.corp.example\r
Addresses:  fd00::5\r
          10.0.0.5\r
\r
";

        const UNIX_REVERSE: &str = "\
5.0.0.10.in-addr.arpa\tname = db2-prod.corp.example.
";

        const WINDOWS_REVERSE: &str = "\
Server:  dns.corp.example
Address:  10.0.0.53

Name:    db2-prod.corp.example
Address:  10.0.0.5
";

        fn resolver(shell: ScriptedShell) -> NsLookupResolver {
            NsLookupResolver::new(Arc::new(shell))
        }

        #[tokio::test]
        async fn test_unix_forward() {
            let ns = resolver(
                ScriptedShell::unix().respond("nslookup db2-prod", 0, Some(UNIX_FORWARD)),
            );
            assert_eq!(
                ns.resolve_ips("db2-prod").await,
                vec![ip("10.0.0.5"), ip("fd00::5")]
            );
        }

        #[tokio::test]
        async fn test_windows_forward() {
            let ns = resolver(
                ScriptedShell::windows().respond("nslookup db2-prod", 0, Some(WINDOWS_FORWARD)),
            );
            assert_eq!(
                ns.resolve_ips("db2-prod").await,
                vec![ip("fd00::5"), ip("10.0.0.5")]
            );
        }

        #[tokio::test]
        async fn test_server_address_is_not_an_answer() {
            let only_server = "Server:  10.0.0.53\nAddress:  10.0.0.53#53\n\n** server can't find x: NXDOMAIN\n";
            let ns = resolver(ScriptedShell::unix().respond("nslookup x", 0, Some(only_server)));
            assert!(ns.resolve_ips("x").await.is_empty());
        }

        #[tokio::test]
        async fn test_failure_is_empty() {
            let ns = resolver(ScriptedShell::unix().respond("nslookup gone", 1, Some("NXDOMAIN")));
            assert!(ns.resolve_ips("gone").await.is_empty());
            assert!(ns.resolve_ips("bad; rm -rf /").await.is_empty());
        }

        #[tokio::test]
        async fn test_reverse_lookups() {
            let ns = resolver(
                ScriptedShell::unix().respond("nslookup 10.0.0.5", 0, Some(UNIX_REVERSE)),
            );
            assert_eq!(
                ns.resolve_fqdn(ip("10.0.0.5")).await,
                Some("db2-prod.corp.example".to_string())
            );

            let ns = resolver(
                ScriptedShell::windows().respond("nslookup 10.0.0.5", 0, Some(WINDOWS_REVERSE)),
            );
            assert_eq!(
                ns.resolve_fqdn(ip("10.0.0.5")).await,
                Some("db2-prod.corp.example".to_string())
            );
        }

        #[tokio::test]
        async fn test_reverse_failure_is_none() {
            let ns = resolver(ScriptedShell::unix());
            assert_eq!(ns.resolve_fqdn(ip("10.0.0.9")).await, None);
        }

        #[test]
        fn test_lookup_safe() {
            assert!(is_lookup_safe("db2-prod.corp.example"));
            assert!(is_lookup_safe("fd00::5"));
            assert!(!is_lookup_safe(""));
            assert!(!is_lookup_safe("a b"));
            assert!(!is_lookup_safe("x&&y"));
        }
    }

    mod socket {
        use super::*;

        #[tokio::test]
        async fn test_ip_literal_resolves_to_itself() {
            assert_eq!(
                SocketResolver.resolve_ips("127.0.0.1").await,
                vec![ip("127.0.0.1")]
            );
        }

        #[tokio::test]
        async fn test_no_reverse_lookup() {
            assert_eq!(SocketResolver.resolve_fqdn(ip("127.0.0.1")).await, None);
        }
    }
}
