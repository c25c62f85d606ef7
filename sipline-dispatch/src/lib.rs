#![forbid(unsafe_code)]

//! SIP dispatcher for the sipline stack.
//!
//! * Timer service with opaque ids, repeating timers and a cached
//!   per-dispatch clock.
//! * Partial RFC 3263 resolution (SRV + host records, proxy routing
//!   tables) over a pluggable DNS backend.
//! * Delivery queue implementing RFC 3261 retransmission: T1 backoff
//!   capped at T2, 64·T1 transaction lifetime.
//! * The [`Dispatcher`] itself: outbound `deliver`, inbound `receive`
//!   demultiplexing, and leg management.

pub mod config;
pub mod dispatcher;
pub mod dns;
pub mod error;
pub mod resolver;
pub mod timer;

mod queue;

pub use config::{DispatchConfig, DomainProxy};
pub use dispatcher::{DeliverOpts, DispatchStats, Dispatcher, Receiver};
pub use dns::{DnsBackend, SrvRecord, StaticDns, SystemDns};
pub use error::{Error, Result};
pub use queue::DeliveryCallback;
pub use resolver::Resolver;
pub use timer::{TimerId, Timers};
