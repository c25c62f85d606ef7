// SIP over a TCP leg: RFC 3261 framing on a byte stream and response
// delivery over the same pooled connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use sipline_core::{Packet, TransportProto};
use sipline_dispatch::{DispatchConfig, Dispatcher, StaticDns};
use sipline_integration_tests::init_tracing;
use sipline_registrar::{Registrar, RegistrarConfig};
use sipline_transport::LegOptions;

const REGISTER: &str = "REGISTER sip:example.com SIP/2.0\r\n\
Via: SIP/2.0/TCP 127.0.0.1:5060;branch=z9hG4bKtcpreg\r\n\
Max-Forwards: 70\r\n\
From: <sip:ua@example.com>;tag=tcp1\r\n\
To: <sip:ua@example.com>\r\n\
Call-ID: tcp-reg-1\r\n\
CSeq: 1 REGISTER\r\n\
Contact: <sip:ua@1.2.3.4:5060;transport=tcp>;expires=300\r\n\
Content-Length: 0\r\n\r\n";

async fn read_one_message(stream: &mut TcpStream) -> anyhow::Result<Packet> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = tokio::time::timeout(Duration::from_secs(3), stream.read(&mut chunk)).await??;
        anyhow::ensure!(n > 0, "connection closed before a full message");
        buf.extend_from_slice(&chunk[..n]);
        if let Ok(packet) = Packet::parse(&buf) {
            return Ok(packet);
        }
    }
}

#[tokio::test]
async fn register_over_tcp() -> anyhow::Result<()> {
    init_tracing();
    let dispatcher = Dispatcher::with_dns(DispatchConfig::default(), Arc::new(StaticDns::new()));
    let leg = dispatcher
        .bind_leg(
            TransportProto::Tcp,
            "127.0.0.1".parse()?,
            0,
            LegOptions::default(),
        )
        .await?;
    let registrar = Registrar::new(dispatcher.clone(), RegistrarConfig::default());
    dispatcher.set_receiver(Arc::new(registrar.clone()));

    let mut client = TcpStream::connect(leg.local().socket_addr()).await?;

    // Dribble the request to exercise stream reassembly.
    let wire = REGISTER.as_bytes();
    let (head, tail) = wire.split_at(wire.len() / 2);
    client.write_all(head).await?;
    client.flush().await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.write_all(tail).await?;
    client.flush().await?;

    let resp = read_one_message(&mut client).await?;
    assert_eq!(resp.code(), Some(200));
    let contact = resp.headers().get("Contact").expect("binding echoed");
    assert!(contact.contains("transport=tcp"));
    assert_eq!(registrar.store().contacts("ua@example.com").len(), 1);

    // Second REGISTER on the same connection reuses it.
    client.write_all(REGISTER.replace("CSeq: 1", "CSeq: 2").as_bytes()).await?;
    client.flush().await?;
    let resp = read_one_message(&mut client).await?;
    assert_eq!(resp.code(), Some(200));
    assert_eq!(resp.headers().get("CSeq"), Some("2 REGISTER"));
    Ok(())
}
