#![forbid(unsafe_code)]

//! Minimal SIP registrar: REGISTER handling with expiry bookkeeping,
//! driven entirely through the dispatcher it is attached to.
//!
//! The registrar is a [`Receiver`]; packets other than REGISTER (and
//! REGISTERs for domains outside the whitelist) are left for another
//! receiver by returning `None`.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use sipline_core::{Address, DomainMap, Method, NameAddr, Packet, Request, Response};
use sipline_dispatch::{DeliverOpts, Dispatcher, Receiver, TimerId};
use sipline_transport::Leg;

pub mod store;

pub use store::{ContactStore, MemoryStore};

type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("message: {0}")]
    Message(#[from] sipline_core::Error),
    #[error("dispatch: {0}")]
    Dispatch(#[from] sipline_dispatch::Error),
    #[error("missing {0} header")]
    MissingHeader(&'static str),
}

/// Registrar configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrarConfig {
    /// Registrations shorter than this (but nonzero) are rejected with
    /// 423 Interval Too Brief.
    pub min_expires_s: u64,
    /// Upper bound; requested expiries are capped here. Also the default
    /// when the request names none.
    pub max_expires_s: u64,
    /// Served domains: exact, `*.suffix` or `*`. Empty means serve
    /// everything.
    pub domains: Vec<String>,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            min_expires_s: 60,
            max_expires_s: 3_600,
            domains: Vec::new(),
        }
    }
}

struct Inner {
    dispatcher: Dispatcher,
    store: Arc<dyn ContactStore>,
    config: RegistrarConfig,
    domains: Option<DomainMap<()>>,
    /// Earliest pending sweep and its timer, if one is armed.
    sweep: Mutex<Option<(SystemTime, TimerId)>>,
}

/// The registrar. Cheap to clone; attach with
/// `dispatcher.set_receiver(Arc::new(registrar.clone()))` or use it as a
/// building block of a composite receiver.
#[derive(Clone)]
pub struct Registrar {
    inner: Arc<Inner>,
}

impl Registrar {
    pub fn new(dispatcher: Dispatcher, config: RegistrarConfig) -> Registrar {
        Self::with_store(dispatcher, config, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(
        dispatcher: Dispatcher,
        config: RegistrarConfig,
        store: Arc<dyn ContactStore>,
    ) -> Registrar {
        let domains = if config.domains.is_empty() {
            None
        } else {
            let mut map = DomainMap::new();
            for domain in &config.domains {
                map.insert(domain, ());
            }
            Some(map)
        };
        Registrar {
            inner: Arc::new(Inner {
                dispatcher,
                store,
                config,
                domains,
                sweep: Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn ContactStore> {
        &self.inner.store
    }

    fn sweep_slot(&self) -> MutexGuard<'_, Option<(SystemTime, TimerId)>> {
        self.inner.sweep.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drop expired bindings and re-arm the sweep timer at the earliest
    /// remaining expiry, unless an earlier sweep is already pending.
    pub fn expire(&self) {
        let now = SystemTime::now();
        match self.inner.store.sweep(now) {
            Some(earliest) => self.arm_sweep(earliest, now),
            None => {
                // Nothing left to expire; an already-armed sweep will
                // simply find an empty store.
            }
        }
    }

    fn arm_sweep(&self, at: SystemTime, now: SystemTime) {
        let mut pending = self.sweep_slot();
        if let Some((deadline, _)) = *pending {
            if deadline <= at {
                return;
            }
        }
        if let Some((_, old)) = pending.take() {
            self.inner.dispatcher.cancel_timer(old);
        }
        // Small slack so the sweep lands past the expiry boundary.
        let delay = at
            .duration_since(now)
            .unwrap_or(Duration::ZERO)
            .saturating_add(Duration::from_millis(10));
        let weak = Arc::downgrade(&self.inner);
        let id = self.inner.dispatcher.add_timer(delay, move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            {
                let mut slot = inner.sweep.lock().unwrap_or_else(|e| e.into_inner());
                *slot = None;
            }
            Registrar { inner }.expire();
        });
        *pending = Some((at, id));
    }

    async fn process(&self, req: &Request, leg: &Leg, from: &Address) -> Result<Option<u16>> {
        let from_value = req
            .headers
            .get("From")
            .ok_or(Error::MissingHeader("From"))?;
        let from_addr = NameAddr::parse(from_value)?;
        let aor = from_addr.uri.aor();

        if let Some(domains) = &self.inner.domains {
            if domains.lookup(&from_addr.uri.host).is_none() {
                debug!(aor, "domain not served here, leaving request alone");
                return Ok(None);
            }
        }

        let now = SystemTime::now();
        let header_expires: Option<u64> = req
            .headers
            .get("Expires")
            .and_then(|v| v.trim().parse().ok());
        let contacts = req.headers.values("Contact");

        if contacts.iter().any(|c| c.trim() == "*") {
            // Wildcard deregistration must stand alone with Expires: 0.
            if contacts.len() != 1 || header_expires != Some(0) {
                self.respond(req, leg, from, Response::for_request(req, 400, "Bad Request"))?;
                return Ok(Some(400));
            }
            self.inner.store.remove_all(&aor);
            debug!(aor, "wildcard deregistration");
        } else if !contacts.is_empty() {
            // Validate everything before touching the store so a 423
            // leaves it unchanged.
            let mut bindings: Vec<(String, u64)> = Vec::with_capacity(contacts.len());
            for value in &contacts {
                let contact = NameAddr::parse(value)?;
                let expires = contact
                    .expires()
                    .or(header_expires)
                    .unwrap_or(self.inner.config.max_expires_s)
                    .min(self.inner.config.max_expires_s);
                if expires != 0 && expires < self.inner.config.min_expires_s {
                    let mut resp = Response::for_request(req, 423, "Interval Too Brief");
                    resp.headers
                        .set("Min-Expires", self.inner.config.min_expires_s.to_string());
                    self.respond(req, leg, from, resp)?;
                    return Ok(Some(423));
                }
                bindings.push((contact.uri.to_string(), expires));
            }
            for (contact, expires) in bindings {
                if expires == 0 {
                    self.inner.store.remove(&aor, &contact);
                } else {
                    self.inner
                        .store
                        .put(&aor, &contact, now + Duration::from_secs(expires));
                }
            }
        }
        // No Contact at all is a query; fall through to the summary.

        self.expire();
        let resp = self.ok_response(req, &aor, now);
        self.respond(req, leg, from, resp)?;
        Ok(Some(200))
    }

    fn ok_response(&self, req: &Request, aor: &str, now: SystemTime) -> Response {
        let mut resp = Response::for_request(req, 200, "OK");
        for (contact, expires_at) in self.inner.store.contacts(aor) {
            if let Ok(remaining) = expires_at.duration_since(now) {
                let secs = remaining.as_secs_f64().round() as u64;
                resp.headers
                    .push("Contact", format!("<{contact}>;expires={secs}"));
            }
        }
        resp
    }

    fn respond(&self, _req: &Request, leg: &Leg, from: &Address, resp: Response) -> Result<()> {
        self.inner.dispatcher.deliver(
            Packet::Response(resp),
            DeliverOpts {
                leg: Some(leg.clone()),
                dst: Some(from.clone()),
                do_retransmits: Some(false),
                ..Default::default()
            },
        )?;
        Ok(())
    }
}

#[async_trait]
impl Receiver for Registrar {
    async fn receive(&self, packet: Packet, leg: Leg, from: Address) -> Option<u16> {
        let Packet::Request(req) = &packet else {
            return None;
        };
        if req.method != Method::Register {
            return None;
        }
        match self.process(req, &leg, &from).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "failed to process REGISTER");
                None
            }
        }
    }
}
