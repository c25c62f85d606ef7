use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors produced while parsing or assembling SIP messages.
#[derive(Debug, Error)]
pub enum Error {
    #[error("parse: {0}")]
    Parse(String),
    #[error("uri: {0}")]
    Uri(String),
    #[error("header: {0}")]
    Header(String),
    #[error("address: {0}")]
    Addr(String),
}

impl Error {
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn uri(msg: impl Into<String>) -> Self {
        Self::Uri(msg.into())
    }

    pub fn header(msg: impl Into<String>) -> Self {
        Self::Header(msg.into())
    }

    pub fn addr(msg: impl Into<String>) -> Self {
        Self::Addr(msg.into())
    }
}
