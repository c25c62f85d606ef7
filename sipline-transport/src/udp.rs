use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Type};
use tokio::net::UdpSocket;

/// Shared UDP socket for one leg.
///
/// Bound through `socket2` so `SO_REUSEADDR` can be set before bind, then
/// handed to tokio in non-blocking mode.
#[derive(Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let domain = Domain::for_address(addr);
        let socket = socket2::Socket::new(domain, Type::DGRAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        let std_sock: std::net::UdpSocket = socket.into();
        std_sock.set_nonblocking(true)?;
        Self::from_std(std_sock)
    }

    /// Adopt an already bound socket.
    pub fn from_std(socket: std::net::UdpSocket) -> std::io::Result<Self> {
        socket.set_nonblocking(true)?;
        let local = socket.local_addr()?;
        let socket = UdpSocket::from_std(socket)?;
        Ok(Self {
            socket: Arc::new(socket),
            local,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    pub async fn send_to(&self, buf: &[u8], dst: SocketAddr) -> std::io::Result<usize> {
        self.socket.send_to(buf, dst).await
    }
}
