// SRV resolution driven through the public resolver API with a fixed
// DNS record set.

use std::sync::Arc;

use async_trait::async_trait;
use sipline_core::{Address, DomainMap, Packet, SipUri, TransportProto};
use sipline_dispatch::{DnsBackend, Resolver, SrvRecord, StaticDns};
use sipline_integration_tests::init_tracing;
use sipline_transport::{Leg, LegOptions, LegRegistry, PacketSink};

struct NullSink;

#[async_trait]
impl PacketSink for NullSink {
    async fn incoming(&self, _packet: Packet, _leg: Leg, _from: Address) {}
}

async fn udp_registry() -> LegRegistry {
    let registry = LegRegistry::new();
    let leg = Leg::bind(
        TransportProto::Udp,
        "127.0.0.1".parse().unwrap(),
        0,
        LegOptions::default(),
    )
    .await
    .unwrap();
    registry.add(leg, Arc::new(NullSink));
    registry
}

#[tokio::test]
async fn srv_fallback_resolution() -> anyhow::Result<()> {
    init_tracing();
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
    dns.add_host("sip.example.org", "10.0.0.1".parse()?);

    let legs = udp_registry().await;
    let resolver = Resolver::new(dns.clone(), DomainMap::new(), None);
    let uri: SipUri = "sip:alice@example.org".parse()?;

    let out = resolver.resolve_uri(&uri, None, &legs, None).await?;
    assert_eq!(out.len(), 1);
    let (addr, leg) = &out[0];
    assert_eq!(addr.proto, TransportProto::Udp);
    assert_eq!(addr.addr, "10.0.0.1".parse::<std::net::IpAddr>()?);
    assert_eq!(addr.port, 5060);
    assert!(leg.can_deliver_to(addr));

    // The SRV path consulted the mock, not a real resolver.
    assert!(dns.host("sip.example.org").await?.len() == 1);
    Ok(())
}

#[tokio::test]
async fn resolution_is_stable_across_calls() -> anyhow::Result<()> {
    init_tracing();
    let dns = Arc::new(StaticDns::new());
    for (priority, target, ip) in [
        (20u16, "b.example.org", "10.0.0.2"),
        (10u16, "a.example.org", "10.0.0.1"),
        (30u16, "c.example.org", "10.0.0.3"),
    ] {
        dns.add_srv(
            "_sip._udp.example.org",
            SrvRecord {
                priority,
                weight: 0,
                target: target.into(),
                port: 5060,
            },
        );
        dns.add_host(target, ip.parse()?);
    }

    let legs = udp_registry().await;
    let resolver = Resolver::new(dns, DomainMap::new(), None);
    let uri: SipUri = "sip:alice@example.org".parse()?;

    let first: Vec<Address> = resolver
        .resolve_uri(&uri, None, &legs, None)
        .await?
        .into_iter()
        .map(|(a, _)| a)
        .collect();
    assert_eq!(first.len(), 3);
    assert_eq!(first[0].host, "a.example.org");
    assert_eq!(first[1].host, "b.example.org");
    assert_eq!(first[2].host, "c.example.org");

    for _ in 0..3 {
        let again: Vec<Address> = resolver
            .resolve_uri(&uri, None, &legs, None)
            .await?
            .into_iter()
            .map(|(a, _)| a)
            .collect();
        assert_eq!(again, first);
    }
    Ok(())
}
