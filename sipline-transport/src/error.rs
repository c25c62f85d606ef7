use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("message: {0}")]
    Message(#[from] sipline_core::Error),
    #[error("tls: {0}")]
    Tls(String),
    #[error("message exceeds {0} bytes")]
    Oversized(usize),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("leg has no TLS configuration")]
    NoTlsConfig,
    #[error("leg is not attached to a dispatcher")]
    Detached,
}

impl Error {
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// The underlying OS error kind, when this wraps one.
    pub fn io_kind(&self) -> Option<std::io::ErrorKind> {
        match self {
            Error::Io(e) => Some(e.kind()),
            _ => None,
        }
    }
}
