//! Partial RFC 3263: SIP URI to an ordered list of destinations, each
//! paired with a leg able to reach it.
//!
//! Resolution order: configured proxy routes (domain table, then the
//! outgoing proxy), literal IP hosts, SRV, and finally plain host
//! records. NAPTR is deliberately not consulted.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{debug, trace};

use sipline_core::{Address, DomainMap, Scheme, SipUri, TransportProto};
use sipline_transport::{Leg, LegRegistry};

use crate::dns::DnsBackend;
use crate::error::{Error, Result};

/// Default protocol preference for plain `sip:` URIs.
const DEFAULT_PROTOS: [TransportProto; 2] = [TransportProto::Udp, TransportProto::Tcp];

pub struct Resolver {
    dns: Arc<dyn DnsBackend>,
    domain_proxies: DomainMap<Address>,
    outgoing_proxy: Option<Address>,
}

impl Resolver {
    pub fn new(
        dns: Arc<dyn DnsBackend>,
        domain_proxies: DomainMap<Address>,
        outgoing_proxy: Option<Address>,
    ) -> Self {
        Self {
            dns,
            domain_proxies,
            outgoing_proxy,
        }
    }

    /// Resolve `uri` into `(destination, leg)` pairs, best first.
    ///
    /// `allowed_protos` narrows the protocol preference (`sips:` and a
    /// `;transport=` parameter narrow it further); `allowed_legs`
    /// restricts which legs may be paired. Destinations no leg can reach
    /// are dropped; an empty result is `HostUnreachable`.
    pub async fn resolve_uri(
        &self,
        uri: &SipUri,
        allowed_protos: Option<&[TransportProto]>,
        legs: &LegRegistry,
        allowed_legs: Option<&[Leg]>,
    ) -> Result<Vec<(Address, Leg)>> {
        let mut protos: Vec<TransportProto> = if uri.scheme == Scheme::Sips {
            vec![TransportProto::Tls]
        } else {
            allowed_protos
                .map(|protos| protos.to_vec())
                .unwrap_or_else(|| DEFAULT_PROTOS.to_vec())
        };
        if let Some(forced) = uri.transport_param() {
            protos.retain(|p| *p == forced);
            if protos.is_empty() {
                protos = vec![forced];
            }
        }

        let addrs = self.candidate_addrs(uri, &protos).await?;
        trace!(uri = %uri, candidates = addrs.len(), "resolution candidates");

        let mut out = Vec::with_capacity(addrs.len());
        for addr in addrs {
            match legs.find_for(&addr, allowed_legs) {
                Some(leg) => out.push((addr, leg)),
                None => debug!(dst = %addr, "no leg reaches candidate, dropped"),
            }
        }
        if out.is_empty() {
            return Err(Error::HostUnreachable);
        }
        Ok(out)
    }

    async fn candidate_addrs(
        &self,
        uri: &SipUri,
        protos: &[TransportProto],
    ) -> Result<Vec<Address>> {
        let domain = uri.host.trim_start_matches('[').trim_end_matches(']');

        // Configured proxies short-circuit DNS entirely; the outgoing
        // proxy is the lowest-precedence catch-all.
        let proxied = self
            .domain_proxies
            .lookup(domain)
            .cloned()
            .or_else(|| self.outgoing_proxy.clone());
        if let Some(proxy) = proxied {
            debug!(uri = %uri, proxy = %proxy, "routed via configured proxy");
            return Ok(vec![proxy]);
        }

        // Literal IP: one candidate per allowed protocol, explicit port
        // or the protocol default.
        if let Some(ip) = uri.host_ip() {
            return Ok(protos
                .iter()
                .map(|p| {
                    Address::with_host(*p, uri.host.clone(), ip, uri.port_or_default(*p))
                })
                .collect());
        }

        self.dns_candidates(uri, domain, protos).await
    }

    async fn dns_candidates(
        &self,
        uri: &SipUri,
        domain: &str,
        protos: &[TransportProto],
    ) -> Result<Vec<Address>> {
        let mut out = Vec::new();

        // An explicit port suppresses SRV (RFC 3263 §4.2).
        if uri.port.is_none() {
            for proto in protos {
                let mut records = self.dns.srv(&proto.srv_owner(domain)).await?;
                records.sort_by_key(|r| r.priority);
                for srv in records {
                    if let Ok(ip) = srv.target.parse::<IpAddr>() {
                        out.push(Address::with_host(*proto, srv.target.clone(), ip, srv.port));
                        continue;
                    }
                    for ip in self.dns.host(&srv.target).await? {
                        out.push(Address::with_host(*proto, srv.target.clone(), ip, srv.port));
                    }
                }
            }
        }

        if out.is_empty() {
            let ips = self.dns.host(domain).await?;
            for proto in protos {
                for ip in &ips {
                    out.push(Address::with_host(
                        *proto,
                        domain.to_owned(),
                        *ip,
                        uri.port_or_default(*proto),
                    ));
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{SrvRecord, StaticDns};
    use async_trait::async_trait;
    use sipline_core::Packet;
    use sipline_transport::{LegOptions, PacketSink};

    struct NullSink;

    #[async_trait]
    impl PacketSink for NullSink {
        async fn incoming(&self, _packet: Packet, _leg: Leg, _from: Address) {}
    }

    async fn registry_with(protos: &[TransportProto]) -> LegRegistry {
        let registry = LegRegistry::new();
        let sink: Arc<dyn PacketSink> = Arc::new(NullSink);
        for proto in protos {
            let leg = Leg::bind(*proto, "127.0.0.1".parse().unwrap(), 0, LegOptions::default())
                .await
                .unwrap();
            registry.add(leg, sink.clone());
        }
        registry
    }

    fn resolver(dns: Arc<dyn DnsBackend>) -> Resolver {
        Resolver::new(dns, DomainMap::new(), None)
    }

    #[tokio::test]
    async fn srv_then_host_lookup() {
        let dns = Arc::new(StaticDns::new());
        dns.add_srv(
            "_sip._udp.example.org",
            SrvRecord {
                priority: 10,
                weight: 0,
                target: "sip.example.org".into(),
                port: 5060,
            },
        );
        dns.add_host("sip.example.org", "10.0.0.1".parse().unwrap());
        let legs = registry_with(&[TransportProto::Udp]).await;

        let uri: SipUri = "sip:alice@example.org".parse().unwrap();
        let out = resolver(dns).resolve_uri(&uri, None, &legs, None).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0.proto, TransportProto::Udp);
        assert_eq!(out[0].0.addr, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(out[0].0.port, 5060);
        assert_eq!(out[0].0.host, "sip.example.org");
    }

    #[tokio::test]
    async fn srv_priority_orders_candidates() {
        let dns = Arc::new(StaticDns::new());
        for (prio, target) in [(20, "backup.example.org"), (10, "primary.example.org")] {
            dns.add_srv(
                "_sip._udp.example.org",
                SrvRecord {
                    priority: prio,
                    weight: 0,
                    target: target.into(),
                    port: 5060,
                },
            );
        }
        dns.add_host("primary.example.org", "10.0.0.1".parse().unwrap());
        dns.add_host("backup.example.org", "10.0.0.2".parse().unwrap());
        let legs = registry_with(&[TransportProto::Udp]).await;

        let uri: SipUri = "sip:example.org".parse().unwrap();
        let r = resolver(dns);
        let out = r.resolve_uri(&uri, None, &legs, None).await.unwrap();
        assert_eq!(out[0].0.host, "primary.example.org");
        assert_eq!(out[1].0.host, "backup.example.org");

        // Deterministic across repeated resolution.
        let again = r.resolve_uri(&uri, None, &legs, None).await.unwrap();
        let addrs: Vec<_> = out.iter().map(|(a, _)| a.clone()).collect();
        let addrs_again: Vec<_> = again.iter().map(|(a, _)| a.clone()).collect();
        assert_eq!(addrs, addrs_again);
    }

    #[tokio::test]
    async fn host_fallback_without_srv() {
        let dns = Arc::new(StaticDns::new());
        dns.add_host("example.org", "10.0.0.7".parse().unwrap());
        let legs = registry_with(&[TransportProto::Udp]).await;

        let uri: SipUri = "sip:bob@example.org".parse().unwrap();
        let out = resolver(dns).resolve_uri(&uri, None, &legs, None).await.unwrap();
        assert_eq!(out[0].0.port, 5060);
        assert_eq!(out[0].0.addr, "10.0.0.7".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn explicit_port_skips_srv() {
        let dns = Arc::new(StaticDns::new());
        dns.add_srv(
            "_sip._udp.example.org",
            SrvRecord {
                priority: 1,
                weight: 0,
                target: "srv.example.org".into(),
                port: 9999,
            },
        );
        dns.add_host("example.org", "10.0.0.3".parse().unwrap());
        let legs = registry_with(&[TransportProto::Udp]).await;

        let uri: SipUri = "sip:bob@example.org:5080".parse().unwrap();
        let out = resolver(dns).resolve_uri(&uri, None, &legs, None).await.unwrap();
        assert_eq!(out[0].0.port, 5080);
    }

    #[tokio::test]
    async fn literal_ip_needs_no_dns() {
        let dns = Arc::new(StaticDns::new());
        let legs = registry_with(&[TransportProto::Udp, TransportProto::Tcp]).await;

        let uri: SipUri = "sip:bob@10.1.2.3".parse().unwrap();
        let out = resolver(dns).resolve_uri(&uri, None, &legs, None).await.unwrap();
        // One candidate per allowed protocol, preference order kept.
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].0.proto, TransportProto::Udp);
        assert_eq!(out[1].0.proto, TransportProto::Tcp);
        assert_eq!(out[0].0.port, 5060);
    }

    #[tokio::test]
    async fn sips_forces_tls() {
        let dns = Arc::new(StaticDns::new());
        let legs = registry_with(&[TransportProto::Udp, TransportProto::Tcp]).await;

        let uri: SipUri = "sips:bob@10.1.2.3".parse().unwrap();
        let err = resolver(dns).resolve_uri(&uri, None, &legs, None).await;
        // TLS candidates only, and no TLS leg exists.
        assert!(matches!(err, Err(Error::HostUnreachable)));
    }

    #[tokio::test]
    async fn transport_param_narrows_protocols() {
        let dns = Arc::new(StaticDns::new());
        let legs = registry_with(&[TransportProto::Udp, TransportProto::Tcp]).await;

        let uri: SipUri = "sip:bob@10.1.2.3;transport=tcp".parse().unwrap();
        let out = resolver(dns).resolve_uri(&uri, None, &legs, None).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0.proto, TransportProto::Tcp);
    }

    #[tokio::test]
    async fn domain_proxy_short_circuits_dns() {
        let dns = Arc::new(StaticDns::new());
        let mut proxies = DomainMap::new();
        let proxy: Address = "udp:10.9.9.9:5060".parse().unwrap();
        proxies.insert("*.example.com", proxy.clone());
        let legs = registry_with(&[TransportProto::Udp]).await;

        let r = Resolver::new(dns, proxies, None);
        let uri: SipUri = "sip:carol@pc.example.com".parse().unwrap();
        let out = r.resolve_uri(&uri, None, &legs, None).await.unwrap();
        assert_eq!(out[0].0, proxy);
    }

    #[tokio::test]
    async fn outgoing_proxy_is_the_fallback() {
        let dns = Arc::new(StaticDns::new());
        let mut proxies = DomainMap::new();
        let override_proxy: Address = "udp:10.8.8.8:5060".parse().unwrap();
        proxies.insert("special.example", override_proxy.clone());
        let default_proxy: Address = "udp:10.9.9.9:5060".parse().unwrap();
        let legs = registry_with(&[TransportProto::Udp]).await;

        let r = Resolver::new(dns, proxies, Some(default_proxy.clone()));
        let special: SipUri = "sip:a@special.example".parse().unwrap();
        let other: SipUri = "sip:a@other.example".parse().unwrap();
        let out = r.resolve_uri(&special, None, &legs, None).await.unwrap();
        assert_eq!(out[0].0, override_proxy);
        let out = r.resolve_uri(&other, None, &legs, None).await.unwrap();
        assert_eq!(out[0].0, default_proxy);
    }

    #[tokio::test]
    async fn unknown_name_is_unreachable() {
        let dns = Arc::new(StaticDns::new());
        let legs = registry_with(&[TransportProto::Udp]).await;
        let uri: SipUri = "sip:nobody@nowhere.invalid".parse().unwrap();
        let err = resolver(dns).resolve_uri(&uri, None, &legs, None).await;
        assert!(matches!(err, Err(Error::HostUnreachable)));
    }
}
