#![forbid(unsafe_code)]

//! Shared fixtures for the sipline integration suite.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;

use sipline_core::{Address, Packet, TransportProto};
use sipline_dispatch::{DispatchConfig, Dispatcher, StaticDns};
use sipline_registrar::{Registrar, RegistrarConfig};
use sipline_transport::{Leg, LegOptions};

/// Initialize test logging once; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// A dispatcher + UDP leg + registrar wired together on loopback, plus a
/// plain client socket to drive them from the outside.
pub struct UdpStack {
    pub dispatcher: Dispatcher,
    pub registrar: Registrar,
    pub leg: Leg,
    pub client: UdpSocket,
}

impl UdpStack {
    pub async fn start(registrar_config: RegistrarConfig) -> anyhow::Result<UdpStack> {
        Self::start_with(DispatchConfig::default(), registrar_config).await
    }

    pub async fn start_with(
        dispatch_config: DispatchConfig,
        registrar_config: RegistrarConfig,
    ) -> anyhow::Result<UdpStack> {
        let dispatcher = Dispatcher::with_dns(dispatch_config, Arc::new(StaticDns::new()));
        let leg = dispatcher
            .bind_leg(
                TransportProto::Udp,
                "127.0.0.1".parse()?,
                0,
                LegOptions::default(),
            )
            .await?;
        let registrar = Registrar::new(dispatcher.clone(), registrar_config);
        dispatcher.set_receiver(Arc::new(registrar.clone()));
        let client = UdpSocket::bind("127.0.0.1:0").await?;
        Ok(UdpStack {
            dispatcher,
            registrar,
            leg,
            client,
        })
    }

    pub fn leg_addr(&self) -> SocketAddr {
        self.leg.local().socket_addr()
    }

    pub fn client_addr(&self) -> Address {
        Address::from_socket_addr(
            TransportProto::Udp,
            self.client.local_addr().expect("client socket has an addr"),
        )
    }

    /// Fire one raw SIP message at the leg.
    pub async fn send(&self, wire: &str) -> anyhow::Result<()> {
        self.client.send_to(wire.as_bytes(), self.leg_addr()).await?;
        Ok(())
    }

    /// Await one parsed packet on the client socket.
    pub async fn recv(&self) -> anyhow::Result<Packet> {
        let mut buf = [0u8; 8192];
        let (n, _) = tokio::time::timeout(Duration::from_secs(3), self.client.recv_from(&mut buf))
            .await??;
        Ok(Packet::parse(&buf[..n])?)
    }
}

/// A REGISTER request in wire form, client-side Via included.
pub fn register_wire(seq: u32, contact_line: Option<&str>, expires_line: Option<&str>) -> String {
    let mut msg = String::new();
    msg.push_str("REGISTER sip:example.com SIP/2.0\r\n");
    msg.push_str("Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKclient1\r\n");
    msg.push_str("Max-Forwards: 70\r\n");
    msg.push_str("From: <sip:ua@example.com>;tag=it1\r\n");
    msg.push_str("To: <sip:ua@example.com>\r\n");
    msg.push_str("Call-ID: integration-reg-1\r\n");
    msg.push_str(&format!("CSeq: {seq} REGISTER\r\n"));
    if let Some(contact) = contact_line {
        msg.push_str(&format!("Contact: {contact}\r\n"));
    }
    if let Some(expires) = expires_line {
        msg.push_str(&format!("Expires: {expires}\r\n"));
    }
    msg.push_str("Content-Length: 0\r\n\r\n");
    msg
}
