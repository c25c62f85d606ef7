//! The dispatcher: routes SIP packets between legs and upper-layer
//! consumers, resolving destinations and driving retransmission.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use sipline_core::{Address, Packet, Scheme, SipUri, TransportProto};
use sipline_transport::{Leg, LegMatch, LegOptions, LegRegistry, PacketSink};

use crate::config::DispatchConfig;
use crate::dns::{DnsBackend, SystemDns};
use crate::error::{Error, Result};
use crate::queue::{retransmit_schedule, DeliveryCallback, DeliveryQueue, QueueEntry, TimerAction};
use crate::resolver::Resolver;
use crate::timer::{TimerId, Timers};

/// Period of the defensive delivery-queue sweep.
const QUEUE_SWEEP_PERIOD: Duration = Duration::from_secs(1);

/// Upper-layer consumer of demultiplexed packets (endpoint, registrar,
/// proxy core). A `Some` return means the packet was handled.
#[async_trait]
pub trait Receiver: Send + Sync + 'static {
    async fn receive(&self, packet: Packet, leg: Leg, from: Address) -> Option<u16>;
}

/// Per-delivery options for [`Dispatcher::deliver`].
#[derive(Default)]
pub struct DeliverOpts {
    /// Queue id; defaults to the packet's transaction key.
    pub id: Option<String>,
    /// Call-ID for group cancellation; defaults to the packet's.
    pub callid: Option<String>,
    /// Outcome callback; see [`DeliveryCallback`].
    pub callback: Option<DeliveryCallback>,
    /// Send through this leg, skipping leg selection.
    pub leg: Option<Leg>,
    /// Send to this destination, skipping resolution when `leg` is also
    /// given.
    pub dst: Option<Address>,
    /// Override the dispatcher-wide retransmit default.
    pub do_retransmits: Option<bool>,
}

impl std::fmt::Debug for DeliverOpts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliverOpts")
            .field("id", &self.id)
            .field("callid", &self.callid)
            .field("callback", &self.callback.is_some())
            .field("leg", &self.leg)
            .field("dst", &self.dst)
            .field("do_retransmits", &self.do_retransmits)
            .finish()
    }
}

/// Dispatcher counters.
#[derive(Debug, Default)]
pub struct DispatchStats {
    /// Responses dropped because no leg's branch matched their Via.
    pub via_rejected: AtomicU64,
    /// Deliveries acknowledged by a matching response.
    pub acked_deliveries: AtomicU64,
    /// Packets dropped because no receiver was configured.
    pub dropped_no_receiver: AtomicU64,
}

struct Inner {
    config: DispatchConfig,
    legs: LegRegistry,
    timers: Timers,
    queue: DeliveryQueue,
    resolver: Resolver,
    receiver: RwLock<Option<Arc<dyn Receiver>>>,
    stats: DispatchStats,
}

/// Cheap to clone; all clones share one dispatcher.
///
/// Must be constructed inside a tokio runtime: the timer service and the
/// leg receive loops are spawned onto it.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Dispatcher with the hickory-resolver DNS backend.
    pub fn new(config: DispatchConfig) -> Dispatcher {
        Self::with_dns(config, Arc::new(SystemDns::new()))
    }

    /// Dispatcher with a caller-supplied DNS backend (tests, embedded
    /// record sets).
    pub fn with_dns(config: DispatchConfig, dns: Arc<dyn DnsBackend>) -> Dispatcher {
        let resolver = Resolver::new(dns, config.domain_map(), config.outgoing_proxy.clone());
        let timers = Timers::spawn();
        let inner = Arc::new(Inner {
            config,
            legs: LegRegistry::new(),
            timers,
            queue: DeliveryQueue::new(),
            resolver,
            receiver: RwLock::new(None),
            stats: DispatchStats::default(),
        });
        let weak = Arc::downgrade(&inner);
        inner
            .timers
            .add_repeating(QUEUE_SWEEP_PERIOD, QUEUE_SWEEP_PERIOD, move || {
                if let Some(inner) = weak.upgrade() {
                    Dispatcher { inner }.sweep_queue();
                }
            });
        Dispatcher { inner }
    }

    /// Install the consumer for inbound packets.
    pub fn set_receiver(&self, receiver: Arc<dyn Receiver>) {
        *self
            .inner
            .receiver
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(receiver);
    }

    /// Register a leg and start its receive loop.
    pub fn add_leg(&self, leg: Leg) {
        let sink: Arc<dyn PacketSink> = Arc::new(self.clone());
        self.inner.legs.add(leg, sink);
    }

    /// Bind and register a leg in one step.
    pub async fn bind_leg(
        &self,
        proto: TransportProto,
        addr: std::net::IpAddr,
        port: u16,
        opts: LegOptions,
    ) -> Result<Leg> {
        let leg = Leg::bind(proto, addr, port, opts).await?;
        self.add_leg(leg.clone());
        Ok(leg)
    }

    /// Remove a leg. In-flight deliveries bound to it fail with
    /// [`Error::NetworkDown`].
    pub fn remove_leg(&self, leg: &Leg) -> bool {
        if !self.inner.legs.remove(leg) {
            return false;
        }
        for mut entry in self.inner.queue.remove_by_leg(leg) {
            if let Some(t) = entry.timer {
                self.inner.timers.cancel_timer(t);
            }
            if let Some(mut cb) = entry.callback.take() {
                cb(Err(Error::NetworkDown));
            }
        }
        true
    }

    pub fn get_legs(&self, spec: &LegMatch) -> Vec<Leg> {
        self.inner.legs.get(spec)
    }

    pub fn legs(&self) -> Vec<Leg> {
        self.inner.legs.all()
    }

    /// One-shot timer passthrough to the event loop.
    pub fn add_timer(&self, delay: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.inner.timers.add_timer(delay, cb)
    }

    pub fn cancel_timer(&self, id: TimerId) {
        self.inner.timers.cancel_timer(id);
    }

    /// Shared handle to the timer service.
    pub fn timers(&self) -> Timers {
        self.inner.timers.clone()
    }

    /// Cached per-dispatch clock; see [`Timers::looptime`].
    pub fn looptime(&self) -> Instant {
        self.inner.timers.looptime()
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.inner.stats
    }

    /// Entries currently awaiting transmission, retransmission or
    /// acknowledgement.
    pub fn pending_deliveries(&self) -> usize {
        self.inner.queue.len()
    }

    /// Queue a packet for delivery and return its queue id.
    ///
    /// Never blocks: when resolution is needed it completes on the
    /// runtime and failures surface through the options callback. The
    /// only immediate error is a packet with no derivable queue id.
    pub fn deliver(&self, packet: Packet, opts: DeliverOpts) -> Result<String> {
        let DeliverOpts {
            id,
            callid,
            mut callback,
            leg,
            dst,
            do_retransmits,
        } = opts;
        let Some(id) = id.or_else(|| packet.tid()) else {
            return Err(Error::Message(sipline_core::Error::header(
                "packet has no Call-ID/CSeq and no explicit delivery id",
            )));
        };
        let callid = callid
            .or_else(|| packet.callid().map(str::to_owned))
            .unwrap_or_default();
        let do_retransmits = do_retransmits.unwrap_or(self.inner.config.do_retransmits);

        match (leg, dst) {
            (Some(leg), Some(dst)) => {
                self.enqueue(id.clone(), callid, packet, leg, dst, callback, do_retransmits);
            }
            (leg, dst) => {
                let d = self.clone();
                let entry_id = id.clone();
                tokio::spawn(async move {
                    let allowed: Option<Vec<Leg>> = leg.map(|l| vec![l]);
                    let resolved = match dst {
                        Some(dst) => match d.inner.legs.find_for(&dst, allowed.as_deref()) {
                            Some(leg) => Ok(vec![(dst, leg)]),
                            None => Err(Error::HostUnreachable),
                        },
                        None => d.resolve_for(&packet, allowed.as_deref()).await,
                    };
                    match resolved {
                        Ok(mut candidates) => {
                            let (dst, leg) = candidates.remove(0);
                            d.enqueue(entry_id, callid, packet, leg, dst, callback, do_retransmits);
                        }
                        Err(e) => {
                            warn!(id = %entry_id, error = %e, "delivery target resolution failed");
                            if let Some(cb) = callback.as_mut() {
                                cb(Err(e));
                            }
                        }
                    }
                });
            }
        }
        Ok(id)
    }

    /// Cancel one delivery by queue id; its callback is not invoked.
    pub fn cancel_delivery(&self, id: &str) -> bool {
        match self.inner.queue.remove(id) {
            Some(entry) => {
                if let Some(t) = entry.timer {
                    self.inner.timers.cancel_timer(t);
                }
                debug!(id, "delivery cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every delivery belonging to one Call-ID.
    pub fn cancel_call(&self, callid: &str) -> bool {
        let removed = self.inner.queue.remove_by_callid(callid);
        for entry in &removed {
            if let Some(t) = entry.timer {
                self.inner.timers.cancel_timer(t);
            }
        }
        !removed.is_empty()
    }

    /// Demultiplex one inbound packet. Called by leg receive loops, or
    /// directly by tests.
    pub async fn receive(&self, packet: Packet, leg: Leg, from: Address) {
        if packet.is_response() {
            if !leg.check_via(&packet) {
                self.inner.stats.via_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(leg = %leg.local(), %from, "response Via does not match leg branch, dropped");
                return;
            }
            if let Some(tid) = packet.tid() {
                if let Some(entry) = self.inner.queue.remove(&tid) {
                    if let Some(t) = entry.timer {
                        self.inner.timers.cancel_timer(t);
                    }
                    self.inner
                        .stats
                        .acked_deliveries
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(tid, "delivery acknowledged by response");
                }
            }
        }
        self.hand_to_receiver(packet, leg, from).await;
    }

    async fn hand_to_receiver(&self, packet: Packet, leg: Leg, from: Address) {
        let receiver = self
            .inner
            .receiver
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match receiver {
            Some(r) => {
                if r.receive(packet, leg, from).await.is_none() {
                    trace!("receiver ignored packet");
                }
            }
            None => {
                self.inner
                    .stats
                    .dropped_no_receiver
                    .fetch_add(1, Ordering::Relaxed);
                warn!("no receiver configured, inbound packet dropped");
            }
        }
    }

    /// Stop timers and leg receive loops. Pending deliveries are left to
    /// be dropped with the dispatcher.
    pub fn shutdown(&self) {
        self.inner.legs.shutdown();
        self.inner.timers.shutdown();
    }

    async fn resolve_for(
        &self,
        packet: &Packet,
        allowed: Option<&[Leg]>,
    ) -> Result<Vec<(Address, Leg)>> {
        match packet {
            Packet::Request(req) => {
                self.inner
                    .resolver
                    .resolve_uri(&req.uri, None, &self.inner.legs, allowed)
                    .await
            }
            Packet::Response(_) => {
                // Responses route back along the topmost Via (RFC 3261
                // §18.2.2): received/rport when present, sent-by
                // otherwise.
                let via = packet.top_via().ok_or_else(|| {
                    Error::Message(sipline_core::Error::header("response without Via"))
                })?;
                let proto: TransportProto = via.transport.parse().map_err(Error::from)?;
                let host = via
                    .params
                    .value("received")
                    .map(str::to_owned)
                    .unwrap_or_else(|| via.host.clone());
                let port = via
                    .params
                    .value("rport")
                    .and_then(|p| p.parse().ok())
                    .or(via.port);
                let scheme = if proto == TransportProto::Tls {
                    Scheme::Sips
                } else {
                    Scheme::Sip
                };
                let uri = SipUri::new(scheme, host, port);
                self.inner
                    .resolver
                    .resolve_uri(&uri, Some(&[proto]), &self.inner.legs, allowed)
                    .await
            }
        }
    }

    fn enqueue(
        &self,
        id: String,
        callid: String,
        packet: Packet,
        leg: Leg,
        dst: Address,
        callback: Option<DeliveryCallback>,
        do_retransmits: bool,
    ) {
        let now = Instant::now();
        let reliable = dst.proto.is_reliable();
        let (sends, deadline) = if reliable || !do_retransmits {
            (vec![now], now + self.inner.config.transaction_lifetime())
        } else {
            retransmit_schedule(now, self.inner.config.t1(), self.inner.config.t2())
        };
        debug!(id = %id, dst = %dst, attempts = sends.len(), "delivery queued");
        let entry = QueueEntry {
            id: id.clone(),
            callid,
            packet,
            dst,
            leg,
            sends,
            next_send: 0,
            deadline,
            timer: None,
            callback,
            do_retransmits,
        };
        if let Some(old) = self.inner.queue.insert(entry) {
            if let Some(t) = old.timer {
                self.inner.timers.cancel_timer(t);
            }
        }
        self.arm_at(&id, now);
    }

    fn arm_at(&self, id: &str, at: Instant) {
        let weak = Arc::downgrade(&self.inner);
        let entry_id = id.to_owned();
        let timer = self.inner.timers.add_timer_at(at, move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let d = Dispatcher { inner };
            let id = entry_id.clone();
            tokio::spawn(async move { d.on_delivery_timer(&id).await });
        });
        if !self.inner.queue.arm(id, timer) {
            // Entry vanished between insert and arm; never fire.
            self.inner.timers.cancel_timer(timer);
        }
    }

    fn arm_next(&self, id: &str) {
        if let Some(next) = self.inner.queue.next_deadline(id) {
            self.arm_at(id, next);
        }
    }

    async fn on_delivery_timer(&self, id: &str) {
        // A cancelled or acknowledged entry makes this fire a no-op.
        let Some(action) = self.inner.queue.on_timer(id) else {
            return;
        };
        match action {
            TimerAction::Timeout(mut entry) => {
                warn!(id, dst = %entry.dst, "delivery timed out");
                if let Some(mut cb) = entry.callback.take() {
                    cb(Err(Error::Timeout));
                }
            }
            TimerAction::Transmit {
                packet,
                leg,
                dst,
                reliable,
                single_shot,
                attempt,
            } => {
                trace!(id, %dst, attempt, "transmitting");
                match leg.deliver(&packet, &dst).await {
                    Ok(()) if reliable || single_shot => {
                        if let Some(mut entry) = self.inner.queue.remove(id) {
                            if let Some(mut cb) = entry.callback.take() {
                                cb(Ok(()));
                            }
                        }
                    }
                    Ok(()) => self.arm_next(id),
                    Err(e) => {
                        let err = Error::from(e);
                        if reliable || err.is_fatal_write() {
                            warn!(id, error = %err, "delivery failed");
                            if let Some(mut entry) = self.inner.queue.remove(id) {
                                if let Some(mut cb) = entry.callback.take() {
                                    cb(Err(err));
                                }
                            }
                        } else {
                            // Report, then keep retransmitting.
                            debug!(id, error = %err, "transient write error");
                            if let Some(mut cb) = self.inner.queue.take_callback(id) {
                                cb(Err(err));
                                let _ = self.inner.queue.restore_callback(id, cb);
                            }
                            self.arm_next(id);
                        }
                    }
                }
            }
        }
    }

    fn sweep_queue(&self) {
        let now = Instant::now();
        let (expired, unarmed) = self.inner.queue.sweep(now);
        for mut entry in expired {
            if let Some(t) = entry.timer {
                self.inner.timers.cancel_timer(t);
            }
            warn!(id = %entry.id, "delivery expired in sweep");
            if let Some(mut cb) = entry.callback.take() {
                cb(Err(Error::Timeout));
            }
        }
        for id in unarmed {
            debug!(id, "re-arming initial transmission");
            self.arm_next(&id);
        }
    }
}

#[async_trait]
impl PacketSink for Dispatcher {
    async fn incoming(&self, packet: Packet, leg: Leg, from: Address) {
        self.receive(packet, leg, from).await;
    }
}
