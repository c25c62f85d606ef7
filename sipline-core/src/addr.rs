use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Transport protocol of a SIP hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProto {
    Udp,
    Tcp,
    Tls,
}

impl TransportProto {
    /// Default SIP port for this transport (RFC 3261 §19.1.2).
    pub fn default_port(self) -> u16 {
        match self {
            TransportProto::Udp | TransportProto::Tcp => 5060,
            TransportProto::Tls => 5061,
        }
    }

    /// Reliable transports get no retransmission layer.
    pub fn is_reliable(self) -> bool {
        !matches!(self, TransportProto::Udp)
    }

    /// Transport token as it appears in a Via header.
    pub fn via_token(self) -> &'static str {
        match self {
            TransportProto::Udp => "UDP",
            TransportProto::Tcp => "TCP",
            TransportProto::Tls => "TLS",
        }
    }

    /// SRV owner name for RFC 3263 resolution. TLS is looked up under
    /// the `_sips._tcp` service.
    pub fn srv_owner(self, domain: &str) -> String {
        match self {
            TransportProto::Udp => format!("_sip._udp.{domain}"),
            TransportProto::Tcp => format!("_sip._tcp.{domain}"),
            TransportProto::Tls => format!("_sips._tcp.{domain}"),
        }
    }
}

impl fmt::Display for TransportProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportProto::Udp => "udp",
            TransportProto::Tcp => "tcp",
            TransportProto::Tls => "tls",
        };
        f.write_str(s)
    }
}

impl FromStr for TransportProto {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(TransportProto::Udp),
            "tcp" => Ok(TransportProto::Tcp),
            "tls" => Ok(TransportProto::Tls),
            other => Err(Error::addr(format!("unknown transport {other:?}"))),
        }
    }
}

/// A fully resolved SIP destination or local binding.
///
/// `addr` is authoritative for socket syscalls; `host` keeps the name the
/// address was resolved from so TLS can validate certificates and set SNI.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    pub proto: TransportProto,
    pub host: String,
    pub addr: IpAddr,
    pub port: u16,
}

impl Address {
    pub fn new(proto: TransportProto, addr: IpAddr, port: u16) -> Self {
        Self {
            proto,
            host: addr.to_string(),
            addr,
            port,
        }
    }

    /// Build an address that keeps the original hostname next to the
    /// resolved IP.
    pub fn with_host(proto: TransportProto, host: impl Into<String>, addr: IpAddr, port: u16) -> Self {
        Self {
            proto,
            host: host.into(),
            addr,
            port,
        }
    }

    pub fn from_socket_addr(proto: TransportProto, sa: SocketAddr) -> Self {
        Self::new(proto, sa.ip(), sa.port())
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }

    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    /// Same address family as `other`.
    pub fn same_family(&self, other: &Address) -> bool {
        self.is_ipv4() == other.is_ipv4()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.proto, self.socket_addr())
    }
}

impl FromStr for Address {
    type Err = Error;

    /// Parses the `proto:ip:port` form, e.g. `udp:10.0.0.1:5060` or
    /// `tls:[::1]:5061`.
    fn from_str(s: &str) -> Result<Self> {
        let (proto, rest) = s
            .split_once(':')
            .ok_or_else(|| Error::addr(format!("missing transport prefix in {s:?}")))?;
        let proto: TransportProto = proto.parse()?;
        let sa: SocketAddr = rest
            .parse()
            .map_err(|_| Error::addr(format!("invalid socket address {rest:?}")))?;
        Ok(Address::from_socket_addr(proto, sa))
    }
}

impl TryFrom<String> for Address {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Address> for String {
    fn from(a: Address) -> String {
        a.to_string()
    }
}
