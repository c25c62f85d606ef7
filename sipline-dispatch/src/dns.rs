//! Pluggable DNS backend behind the resolver.
//!
//! The built-in backend is hickory-resolver; `StaticDns` replaces it for
//! tests or for callers that carry their own records.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::TokioAsyncResolver;

use crate::error::{Error, Result};

/// One SRV record, target left unresolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub priority: u16,
    pub weight: u16,
    pub target: String,
    pub port: u16,
}

/// DNS lookups the resolver needs. Nonexistent names yield empty lists;
/// errors are reserved for lookup failures.
#[async_trait]
pub trait DnsBackend: Send + Sync + 'static {
    async fn srv(&self, name: &str) -> Result<Vec<SrvRecord>>;

    /// Combined A/AAAA addresses for a hostname.
    async fn host(&self, name: &str) -> Result<Vec<IpAddr>>;
}

fn no_records(err: &ResolveError) -> bool {
    matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. })
}

/// hickory-resolver backed implementation.
pub struct SystemDns {
    resolver: TokioAsyncResolver,
}

impl SystemDns {
    /// Resolver with library-default upstream configuration.
    pub fn new() -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        }
    }

    /// Resolver configured from /etc/resolv.conf (or platform equivalent).
    pub fn from_system_conf() -> Result<Self> {
        let resolver =
            TokioAsyncResolver::tokio_from_system_conf().map_err(|e| Error::dns(e.to_string()))?;
        Ok(Self { resolver })
    }
}

impl Default for SystemDns {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DnsBackend for SystemDns {
    async fn srv(&self, name: &str) -> Result<Vec<SrvRecord>> {
        match self.resolver.srv_lookup(name).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|srv| SrvRecord {
                    priority: srv.priority(),
                    weight: srv.weight(),
                    target: srv.target().to_utf8().trim_end_matches('.').to_owned(),
                    port: srv.port(),
                })
                .collect()),
            Err(e) if no_records(&e) => Ok(Vec::new()),
            Err(e) => Err(Error::dns(e.to_string())),
        }
    }

    async fn host(&self, name: &str) -> Result<Vec<IpAddr>> {
        match self.resolver.lookup_ip(name).await {
            Ok(lookup) => Ok(lookup.iter().collect()),
            Err(e) if no_records(&e) => Ok(Vec::new()),
            Err(e) => Err(Error::dns(e.to_string())),
        }
    }
}

/// Fixed record set; the test mock and the `dnsresolv`-style override.
#[derive(Debug, Default)]
pub struct StaticDns {
    srv: Mutex<HashMap<String, Vec<SrvRecord>>>,
    hosts: Mutex<HashMap<String, Vec<IpAddr>>>,
}

fn key(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

impl StaticDns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_srv(&self, name: &str, record: SrvRecord) {
        self.srv
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key(name))
            .or_default()
            .push(record);
    }

    pub fn add_host(&self, name: &str, addr: IpAddr) {
        self.hosts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(key(name))
            .or_default()
            .push(addr);
    }
}

#[async_trait]
impl DnsBackend for StaticDns {
    async fn srv(&self, name: &str) -> Result<Vec<SrvRecord>> {
        Ok(self
            .srv
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key(name))
            .cloned()
            .unwrap_or_default())
    }

    async fn host(&self, name: &str) -> Result<Vec<IpAddr>> {
        Ok(self
            .hosts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key(name))
            .cloned()
            .unwrap_or_default())
    }
}
