use std::time::Duration;

use serde::Deserialize;

use sipline_core::{Address, DomainMap};

/// Dispatcher configuration.
///
/// Loadable from TOML; addresses use the `proto:ip:port` string form.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Fallback destination when URI resolution yields nothing else.
    pub outgoing_proxy: Option<Address>,
    /// Domain patterns consulted before DNS; exact, `*.suffix` or `*`.
    pub domain_proxies: Vec<DomainProxy>,
    /// Default retransmit behaviour per delivery; stateless proxies turn
    /// this off.
    pub do_retransmits: bool,
    /// RFC 3261 T1 in milliseconds (retransmit base).
    pub t1_ms: u64,
    /// RFC 3261 T2 in milliseconds (retransmit cap).
    pub t2_ms: u64,
}

/// One domain-to-proxy route.
#[derive(Debug, Clone, Deserialize)]
pub struct DomainProxy {
    pub domain: String,
    pub proxy: Address,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            outgoing_proxy: None,
            domain_proxies: Vec::new(),
            do_retransmits: true,
            t1_ms: 500,
            t2_ms: 4_000,
        }
    }
}

impl DispatchConfig {
    pub fn t1(&self) -> Duration {
        Duration::from_millis(self.t1_ms)
    }

    pub fn t2(&self) -> Duration {
        Duration::from_millis(self.t2_ms)
    }

    /// Transaction lifetime, 64·T1.
    pub fn transaction_lifetime(&self) -> Duration {
        self.t1() * 64
    }

    pub(crate) fn domain_map(&self) -> DomainMap<Address> {
        let mut map = DomainMap::new();
        for route in &self.domain_proxies {
            map.insert(&route.domain, route.proxy.clone());
        }
        map
    }
}
