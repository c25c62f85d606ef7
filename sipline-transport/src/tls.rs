use std::fmt;
use std::sync::Arc;

use tokio_rustls::rustls::{ClientConfig, ServerConfig};

/// Opaque TLS material for a leg. Certificate policy lives with the
/// caller; this layer only hands the configs to the connector/acceptor
/// and uses the destination's retained hostname for SNI.
#[derive(Clone)]
pub struct TlsConfig {
    pub client: Arc<ClientConfig>,
    pub server: Option<Arc<ServerConfig>>,
}

impl TlsConfig {
    /// Outbound-only configuration; inbound TLS connections are refused.
    pub fn client_only(client: Arc<ClientConfig>) -> Self {
        Self {
            client,
            server: None,
        }
    }

    pub fn new(client: Arc<ClientConfig>, server: Arc<ServerConfig>) -> Self {
        Self {
            client,
            server: Some(server),
        }
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("accepts_inbound", &self.server.is_some())
            .finish()
    }
}
