#![forbid(unsafe_code)]

//! SIP transport legs for the sipline stack.
//!
//! A [`Leg`] is one socket-bound transport endpoint. It serializes and
//! stamps outbound packets (Via for requests), parses inbound traffic,
//! and owns the branch tag used for loop detection and response
//! matching. The [`LegRegistry`] tracks the active legs and wires their
//! receive loops to a [`PacketSink`], normally the dispatcher.

use std::sync::Arc;

use async_trait::async_trait;
use sipline_core::{Address, Packet};

pub mod codec;
pub mod error;
pub mod leg;
pub mod registry;
pub mod tls;
mod stream;
mod udp;

pub use codec::SipCodec;
pub use error::{Error, Result};
pub use leg::{Leg, LegMatch, LegOptions, LegStats, MAGIC_COOKIE};
pub use registry::LegRegistry;
pub use tls::TlsConfig;
pub use udp::UdpTransport;

/// Consumer of inbound packets; every started leg feeds one of these.
#[async_trait]
pub trait PacketSink: Send + Sync + 'static {
    async fn incoming(&self, packet: Packet, leg: Leg, from: Address);
}
