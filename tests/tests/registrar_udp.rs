// Registrar scenarios over a real UDP loopback leg: the full inbound
// path (socket, leg, dispatcher, registrar) and the response path back.

use sipline_integration_tests::{init_tracing, register_wire, UdpStack};
use sipline_registrar::RegistrarConfig;

#[tokio::test]
async fn basic_udp_register() -> anyhow::Result<()> {
    init_tracing();
    let stack = UdpStack::start(RegistrarConfig::default()).await?;

    stack
        .send(&register_wire(
            1,
            Some("<sip:ua@1.2.3.4:5060>;expires=300"),
            Some("300"),
        ))
        .await?;

    let resp = stack.recv().await?;
    assert_eq!(resp.code(), Some(200));
    let contact = resp
        .headers()
        .get("Contact")
        .expect("200 OK carries the binding");
    assert!(contact.contains("sip:ua@1.2.3.4:5060"));
    let expires: u64 = contact
        .rsplit("expires=")
        .next()
        .unwrap()
        .parse()
        .expect("numeric expires");
    assert!((299..=301).contains(&expires), "expires={expires}");

    // The response traverses the same transaction: Call-ID and CSeq echo.
    assert_eq!(resp.headers().get("Call-ID"), Some("integration-reg-1"));
    assert_eq!(resp.headers().get("CSeq"), Some("1 REGISTER"));
    Ok(())
}

#[tokio::test]
async fn interval_too_brief_is_rejected() -> anyhow::Result<()> {
    init_tracing();
    let config = RegistrarConfig {
        min_expires_s: 30,
        ..Default::default()
    };
    let stack = UdpStack::start(config).await?;

    stack
        .send(&register_wire(
            1,
            Some("<sip:ua@1.2.3.4:5060>;expires=5"),
            Some("5"),
        ))
        .await?;

    let resp = stack.recv().await?;
    assert_eq!(resp.code(), Some(423));
    assert_eq!(resp.headers().get("Min-Expires"), Some("30"));
    assert!(stack.registrar.store().contacts("ua@example.com").is_empty());
    Ok(())
}

#[tokio::test]
async fn wildcard_deregister_empties_the_store() -> anyhow::Result<()> {
    init_tracing();
    let stack = UdpStack::start(RegistrarConfig::default()).await?;

    stack
        .send(&register_wire(
            1,
            Some("<sip:ua@1.2.3.4:5060>;expires=300"),
            Some("300"),
        ))
        .await?;
    let resp = stack.recv().await?;
    assert_eq!(resp.code(), Some(200));
    assert_eq!(stack.registrar.store().contacts("ua@example.com").len(), 1);

    stack.send(&register_wire(2, Some("*"), Some("0"))).await?;
    let resp = stack.recv().await?;
    assert_eq!(resp.code(), Some(200));
    assert!(resp.headers().get("Contact").is_none());
    assert!(stack.registrar.store().contacts("ua@example.com").is_empty());
    Ok(())
}

#[tokio::test]
async fn malformed_datagrams_are_counted_and_dropped() -> anyhow::Result<()> {
    init_tracing();
    let stack = UdpStack::start(RegistrarConfig::default()).await?;

    stack.send("this is not sip\r\n\r\n").await?;
    stack
        .send(&register_wire(
            1,
            Some("<sip:ua@1.2.3.4:5060>;expires=300"),
            None,
        ))
        .await?;

    // The garbage is swallowed; the stack keeps serving.
    let resp = stack.recv().await?;
    assert_eq!(resp.code(), Some(200));
    assert!(
        stack
            .leg
            .stats()
            .parse_errors
            .load(std::sync::atomic::Ordering::Relaxed)
            >= 1
    );
    Ok(())
}

#[tokio::test]
async fn crlf_keepalive_gets_a_pong() -> anyhow::Result<()> {
    init_tracing();
    let stack = UdpStack::start(RegistrarConfig::default()).await?;

    stack.send("\r\n\r\n").await?;
    let mut buf = [0u8; 8];
    let (n, from) = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        stack.client.recv_from(&mut buf),
    )
    .await??;
    assert_eq!(&buf[..n], b"\r\n");
    assert_eq!(from, stack.leg_addr());
    Ok(())
}
