#![forbid(unsafe_code)]

//! SIP message primitives for the sipline stack.
//!
//! * `Packet` / `Request` / `Response` value types with an ordered,
//!   case-insensitive header list and `bytes::Bytes` bodies.
//! * Parser and serializer for RFC 3261 message framing (compact header
//!   names expanded, folded lines unfolded, Content-Length enforced).
//! * `Address` / `TransportProto` socket-level addressing.
//! * Domain pattern matching shared by routing tables and whitelists.

pub mod addr;
pub mod domain;
pub mod error;
pub mod headers;
pub mod message;
pub mod parser;
pub mod uri;

pub use addr::{Address, TransportProto};
pub use domain::DomainMap;
pub use error::{Error, Result};
pub use headers::{Header, Headers, Via};
pub use message::{CSeq, Method, Packet, Request, Response};
pub use uri::{NameAddr, Params, Scheme, SipUri};
