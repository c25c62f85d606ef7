//! The leg: one socket-bound SIP transport endpoint.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use sipline_core::message::short_digest;
use sipline_core::{Address, NameAddr, Packet, Scheme, SipUri, TransportProto, Via};

use crate::error::{Error, Result};
use crate::stream::StreamPool;
use crate::tls::TlsConfig;
use crate::udp::UdpTransport;
use crate::PacketSink;

/// RFC 3261 Via branch magic cookie.
pub const MAGIC_COOKIE: &str = "z9hG4bK";

// Per-process sequence keeping branch tags unique for the process
// lifetime; the random half distinguishes restarts.
static LEG_SEQ: AtomicU64 = AtomicU64::new(0);

fn new_branch_tag() -> String {
    let seq = LEG_SEQ.fetch_add(1, Ordering::Relaxed);
    let salt: u32 = rand::random();
    format!("{seq:x}x{salt:08x}")
}

/// Per-leg traffic counters.
#[derive(Debug, Default)]
pub struct LegStats {
    pub tx_packets: AtomicU64,
    pub rx_packets: AtomicU64,
    pub parse_errors: AtomicU64,
}

/// Optional construction knobs for [`Leg::bind`].
#[derive(Debug, Default)]
pub struct LegOptions {
    /// Contact URI advertised in Via and Record-Route headers. Defaults
    /// to `sip:<ip>:<port>` (`sips:` for TLS legs).
    pub contact: Option<SipUri>,
    /// Send everything to this destination regardless of the requested
    /// one (outbound-proxy style legs).
    pub fixed_dst: Option<Address>,
    /// TLS material; required for TLS legs.
    pub tls: Option<TlsConfig>,
}

enum LegKind {
    Udp(UdpTransport),
    Stream(Arc<StreamPool>),
}

struct LegInner {
    local: Address,
    contact: SipUri,
    branch: String,
    fixed_dst: Option<Address>,
    kind: LegKind,
    // Non-owning: the sink (the dispatcher) owns the legs, not the other
    // way around. Refreshed on every start so a re-registered leg keeps
    // working.
    sink: Mutex<Option<Weak<dyn PacketSink>>>,
    stats: LegStats,
}

/// One transport endpoint. Cheap to clone; all clones share the socket,
/// branch tag and counters.
#[derive(Clone)]
pub struct Leg(Arc<LegInner>);

impl fmt::Debug for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Leg")
            .field("local", &self.0.local)
            .field("branch", &self.0.branch)
            .finish_non_exhaustive()
    }
}

fn default_contact(proto: TransportProto, addr: IpAddr, port: u16) -> SipUri {
    let scheme = if proto == TransportProto::Tls {
        Scheme::Sips
    } else {
        Scheme::Sip
    };
    let host = match addr {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    };
    SipUri::new(scheme, host, Some(port))
}

impl Leg {
    /// Bind a new leg on `addr:port`. Port 0 picks an ephemeral port;
    /// the effective one is reflected in `local()`.
    pub async fn bind(
        proto: TransportProto,
        addr: IpAddr,
        port: u16,
        opts: LegOptions,
    ) -> Result<Leg> {
        let requested = SocketAddr::new(addr, port);
        let (kind, bound) = match proto {
            TransportProto::Udp => {
                let udp = UdpTransport::bind(requested).await?;
                let bound = udp.local_addr();
                (LegKind::Udp(udp), bound)
            }
            TransportProto::Tcp | TransportProto::Tls => {
                let pool = StreamPool::bind(proto, requested, opts.tls.clone()).await?;
                let bound = pool.local();
                (LegKind::Stream(pool), bound)
            }
        };
        Ok(Self::assemble(proto, bound, kind, opts))
    }

    /// Adopt an already bound UDP socket.
    pub fn from_udp_socket(socket: std::net::UdpSocket, opts: LegOptions) -> Result<Leg> {
        let udp = UdpTransport::from_std(socket)?;
        let bound = udp.local_addr();
        Ok(Self::assemble(TransportProto::Udp, bound, LegKind::Udp(udp), opts))
    }

    fn assemble(
        proto: TransportProto,
        bound: SocketAddr,
        kind: LegKind,
        opts: LegOptions,
    ) -> Leg {
        let contact = opts
            .contact
            .unwrap_or_else(|| default_contact(proto, bound.ip(), bound.port()));
        let leg = Leg(Arc::new(LegInner {
            local: Address::from_socket_addr(proto, bound),
            contact,
            branch: new_branch_tag(),
            fixed_dst: opts.fixed_dst,
            kind,
            sink: Mutex::new(None),
            stats: LegStats::default(),
        }));
        debug!(leg = %leg.0.local, branch = %leg.0.branch, "leg created");
        leg
    }

    pub fn local(&self) -> &Address {
        &self.0.local
    }

    pub fn proto(&self) -> TransportProto {
        self.0.local.proto
    }

    pub fn contact(&self) -> &SipUri {
        &self.0.contact
    }

    pub fn branch_tag(&self) -> &str {
        &self.0.branch
    }

    pub fn stats(&self) -> &LegStats {
        &self.0.stats
    }

    /// Two handles to the same underlying leg.
    pub fn same(&self, other: &Leg) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn note_received(&self) {
        self.0.stats.rx_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_parse_error(&self) {
        self.0.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Start the receive loop, feeding `sink`. Called by the registry.
    pub(crate) fn start(&self, sink: Arc<dyn PacketSink>) -> JoinHandle<()> {
        *self.0.sink.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::downgrade(&sink));
        match &self.0.kind {
            LegKind::Udp(udp) => {
                let socket = udp.socket();
                let leg = self.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 65535];
                    loop {
                        match socket.recv_from(&mut buf).await {
                            Ok((n, peer)) => leg.on_datagram(&buf[..n], peer, &sink).await,
                            Err(e) => {
                                warn!(leg = %leg.0.local, error = %e, "udp receive failed");
                                break;
                            }
                        }
                    }
                })
            }
            LegKind::Stream(pool) => pool.start(self.clone(), sink),
        }
    }

    async fn on_datagram(&self, data: &[u8], peer: SocketAddr, sink: &Arc<dyn PacketSink>) {
        // RFC 5626 style keep-alive: double CRLF ping, single CRLF pong.
        if data == b"\r\n\r\n" {
            if let LegKind::Udp(udp) = &self.0.kind {
                let _ = udp.send_to(b"\r\n", peer).await;
            }
            return;
        }
        if data.is_empty() || data == b"\r\n" {
            return;
        }
        match Packet::parse(data) {
            Ok(packet) => {
                self.note_received();
                let from = Address::from_socket_addr(self.proto(), peer);
                sink.incoming(packet, self.clone(), from).await;
            }
            Err(e) => {
                self.note_parse_error();
                debug!(leg = %self.0.local, %peer, error = %e, "dropping unparseable datagram");
            }
        }
    }

    /// Stop background work owned by the leg itself (stream connections).
    /// The registry aborts the main receive task.
    pub(crate) fn shutdown(&self) {
        if let LegKind::Stream(pool) = &self.0.kind {
            pool.shutdown();
        }
    }

    /// Serialize and send one packet. Requests get this leg's Via stamped
    /// on top; the branch nonce is derived from the transaction key so a
    /// retransmitted packet produces the identical Via.
    ///
    /// For stream transports the future resolves on write completion; for
    /// UDP it resolves when the datagram is handed to the socket.
    pub async fn deliver(&self, packet: &Packet, dst: &Address) -> Result<()> {
        let dst = self.0.fixed_dst.as_ref().unwrap_or(dst);
        let wire = match packet {
            Packet::Request(_) => {
                let mut stamped = packet.clone();
                self.stamp_via(&mut stamped);
                stamped.to_bytes()
            }
            Packet::Response(_) => packet.to_bytes(),
        };
        self.0.stats.tx_packets.fetch_add(1, Ordering::Relaxed);
        match &self.0.kind {
            LegKind::Udp(udp) => {
                udp.send_to(&wire, dst.socket_addr()).await?;
                Ok(())
            }
            LegKind::Stream(pool) => {
                let sink = self
                    .0
                    .sink
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .as_ref()
                    .and_then(Weak::upgrade)
                    .ok_or(Error::Detached)?;
                pool.send(dst, wire, self, &sink).await
            }
        }
    }

    fn stamp_via(&self, packet: &mut Packet) {
        let nonce = match packet.tid() {
            Some(tid) => short_digest(tid.as_bytes()),
            None => format!("{:016x}", rand::random::<u64>()),
        };
        let branch = format!("{MAGIC_COOKIE}{}.{nonce}", self.0.branch);
        let via = Via::new(
            self.proto().via_token(),
            self.0.contact.host.clone(),
            Some(self.0.contact.port_or_default(self.proto())),
            &branch,
        );
        packet.headers_mut().insert_top("Via", via.to_string());
    }

    /// True iff the topmost Via was stamped by this leg.
    pub fn check_via(&self, packet: &Packet) -> bool {
        let Some(via) = packet.top_via() else {
            return false;
        };
        let Some(branch) = via.branch() else {
            return false;
        };
        match branch.strip_prefix(MAGIC_COOKIE) {
            Some(rest) => rest.starts_with(&format!("{}.", self.0.branch)),
            None => false,
        }
    }

    /// Does this URI name this leg (its contact or its bound address)?
    fn uri_is_local(&self, uri: &SipUri) -> bool {
        let port_matches = uri.port_or_default(self.proto()) == self.0.local.port;
        if !port_matches {
            return false;
        }
        if uri.host.eq_ignore_ascii_case(&self.0.contact.host) {
            return true;
        }
        uri.host_ip() == Some(self.0.local.addr)
    }

    /// Prepare an inbound packet that will be passed further up or
    /// forwarded.
    ///
    /// Responses lose the topmost Via, which must have been ours.
    /// Requests get `received=`/`rport=` annotations on the topmost Via
    /// and their Route set normalized: strict-router damage is repaired
    /// first, then a leading Route naming this leg is consumed.
    pub fn forward_incoming(&self, packet: &mut Packet, from: &Address) -> Result<()> {
        match packet {
            Packet::Response(resp) => {
                resp.headers
                    .pop_value("Via")
                    .ok_or_else(|| sipline_core::Error::header("response without Via"))
                    .map_err(Error::from)?;
                Ok(())
            }
            Packet::Request(req) => {
                if let Some(top) = req.headers.top_value("Via") {
                    let mut via: Via = top.parse().map_err(Error::from)?;
                    let sent_by = via.host.trim_start_matches('[').trim_end_matches(']');
                    if sent_by.parse::<IpAddr>().ok() != Some(from.addr) {
                        via.set_received(from.addr);
                    }
                    if via.wants_rport() {
                        via.set_rport(from.port);
                    }
                    req.headers.pop_value("Via");
                    req.headers.insert_top("Via", via.to_string());
                }

                // Strict-router repair (RFC 3261 §16.4): the previous hop
                // put the next target in the request-URI and pushed the
                // real target to the end of the Route set.
                let mut routes = req.headers.values("Route");
                if !routes.is_empty() && self.uri_is_local(&req.uri) {
                    if let Some(last) = routes.pop() {
                        let target = NameAddr::parse(&last).map_err(Error::from)?;
                        req.uri = target.uri;
                        req.headers.remove_all("Route");
                        for r in &routes {
                            req.headers.push("Route", r.clone());
                        }
                    }
                }

                // Loose routing: consume a leading Route naming this leg.
                if let Some(top) = req.headers.top_value("Route") {
                    if let Ok(route) = NameAddr::parse(&top) {
                        if self.uri_is_local(&route.uri) {
                            req.headers.pop_value("Route");
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Prepare a request about to be forwarded out through this leg:
    /// drop a leading Route naming this leg, and record-route so
    /// subsequent in-dialog requests traverse us symmetrically. A
    /// hairpin (same leg in and out) records a single contact.
    pub fn forward_outgoing(&self, packet: &mut Packet, incoming_leg: &Leg) {
        let Packet::Request(req) = packet else {
            return;
        };
        if let Some(top) = req.headers.top_value("Route") {
            if let Ok(route) = NameAddr::parse(&top) {
                if self.uri_is_local(&route.uri) {
                    req.headers.pop_value("Route");
                }
            }
        }
        if self.same(incoming_leg) {
            return;
        }
        let mut contact = self.0.contact.clone();
        contact.params.set("lr", None);
        let rr = format!("<{contact}>");
        if req.headers.top_value("Record-Route").as_deref() != Some(rr.as_str()) {
            req.headers.insert_top("Record-Route", rr);
        }
    }

    /// Whether this leg can reach `dst`. There is no OS routing
    /// introspection at this layer: the protocol and the address family
    /// gate, reachability itself is assumed affirmative.
    pub fn can_deliver_to(&self, dst: &Address) -> bool {
        self.proto() == dst.proto && self.0.local.same_family(dst)
    }

    /// Conjunctive match against a leg specification.
    pub fn matches(&self, spec: &LegMatch) -> bool {
        if let Some(addr) = spec.addr {
            if self.0.local.addr != addr {
                return false;
            }
        }
        if let Some(port) = spec.port {
            if self.0.local.port != port {
                return false;
            }
        }
        if let Some(proto) = spec.proto {
            if self.proto() != proto {
                return false;
            }
        }
        if let Some(pred) = &spec.pred {
            if !pred(self) {
                return false;
            }
        }
        true
    }
}

/// Leg selection criteria; unset fields match anything.
#[derive(Clone, Default)]
pub struct LegMatch {
    pub addr: Option<IpAddr>,
    pub port: Option<u16>,
    pub proto: Option<TransportProto>,
    pub pred: Option<Arc<dyn Fn(&Leg) -> bool + Send + Sync>>,
}

impl LegMatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn addr(mut self, addr: IpAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn proto(mut self, proto: TransportProto) -> Self {
        self.proto = Some(proto);
        self
    }

    pub fn predicate(mut self, pred: impl Fn(&Leg) -> bool + Send + Sync + 'static) -> Self {
        self.pred = Some(Arc::new(pred));
        self
    }
}

impl fmt::Debug for LegMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LegMatch")
            .field("addr", &self.addr)
            .field("port", &self.port)
            .field("proto", &self.proto)
            .field("pred", &self.pred.is_some())
            .finish()
    }
}
