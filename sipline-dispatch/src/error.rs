use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// No destination with a usable leg could be derived.
    #[error("host unreachable")]
    HostUnreachable,
    /// Every scheduled transmission passed without acknowledgement.
    #[error("delivery timed out")]
    Timeout,
    /// The leg carrying the delivery was removed.
    #[error("network down")]
    NetworkDown,
    #[error("dns: {0}")]
    Dns(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport: {0}")]
    Transport(#[from] sipline_transport::Error),
    #[error("message: {0}")]
    Message(#[from] sipline_core::Error),
    #[error("config: {0}")]
    Config(String),
}

impl Error {
    pub fn dns(msg: impl Into<String>) -> Self {
        Self::Dns(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Write errors that end an unreliable delivery instead of letting it
    /// keep retransmitting.
    pub fn is_fatal_write(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::InvalidInput
            ),
            Error::Transport(t) => matches!(
                t.io_kind(),
                Some(std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::InvalidInput)
            ),
            _ => false,
        }
    }
}
