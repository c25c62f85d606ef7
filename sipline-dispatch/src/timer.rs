//! Timer service: absolute and repeating timers with opaque ids and a
//! per-dispatch cached clock.
//!
//! A single service task owns the timer heap. Deadlines fire in
//! non-decreasing order with ties broken by insertion order; commands are
//! drained before each dispatch so a cancellation is always observed
//! before the timer it targets can fire again. Callbacks run to
//! completion on the service task.

use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::trace;

/// Opaque timer handle; cancelling a fired or unknown id is a no-op.
pub type TimerId = u64;

type TimerCallback = Box<dyn FnMut() + Send>;

enum Cmd {
    Add(TimerEntry),
    Cancel(TimerId),
    Shutdown,
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    id: TimerId,
    repeat: Option<Duration>,
    cb: TimerCallback,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed so the BinaryHeap surfaces the earliest deadline, with the
    // lowest insertion sequence first on ties.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

/// Monotonic clock snapshot shared with callers, updated once per
/// dispatch batch so cooperating callbacks see one consistent "now".
#[derive(Clone)]
struct LoopClock {
    start: Instant,
    offset_micros: Arc<AtomicU64>,
}

impl LoopClock {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            offset_micros: Arc::new(AtomicU64::new(0)),
        }
    }

    fn update(&self, now: Instant) {
        let micros = now.duration_since(self.start).as_micros() as u64;
        self.offset_micros.store(micros, Ordering::Relaxed);
    }

    fn now(&self) -> Instant {
        self.start + Duration::from_micros(self.offset_micros.load(Ordering::Relaxed))
    }
}

/// Handle to the timer service. Clones share the service task.
#[derive(Clone)]
pub struct Timers {
    tx: mpsc::UnboundedSender<Cmd>,
    next_id: Arc<AtomicU64>,
    clock: LoopClock,
}

impl Timers {
    /// Start the service task. Must be called inside a tokio runtime.
    pub fn spawn() -> Timers {
        let (tx, rx) = mpsc::unbounded_channel();
        let clock = LoopClock::new();
        let service = Service {
            rx,
            heap: BinaryHeap::new(),
            live: HashSet::new(),
            cancelled: HashSet::new(),
            seq: 0,
            clock: clock.clone(),
        };
        tokio::spawn(service.run());
        Timers {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
            clock,
        }
    }

    /// One-shot timer after `delay`. `Duration::ZERO` fires on the next
    /// service iteration.
    pub fn add_timer(&self, delay: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.add_inner(Instant::now() + delay, None, Box::new(cb))
    }

    /// One-shot timer at an absolute deadline.
    pub fn add_timer_at(&self, deadline: Instant, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.add_inner(deadline, None, Box::new(cb))
    }

    /// First fire after `delay`, then every `period`.
    pub fn add_repeating(
        &self,
        delay: Duration,
        period: Duration,
        cb: impl FnMut() + Send + 'static,
    ) -> TimerId {
        self.add_inner(Instant::now() + delay, Some(period), Box::new(cb))
    }

    fn add_inner(&self, deadline: Instant, repeat: Option<Duration>, cb: TimerCallback) -> TimerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(Cmd::Add(TimerEntry {
            deadline,
            seq: 0, // assigned by the service for tie-breaking
            id,
            repeat,
            cb,
        }));
        id
    }

    /// Disarm a timer. Safe to call for a timer that already fired.
    pub fn cancel_timer(&self, id: TimerId) {
        let _ = self.tx.send(Cmd::Cancel(id));
    }

    /// The clock as of the current dispatch batch. Callers reuse this to
    /// avoid skew between callbacks of one batch.
    pub fn looptime(&self) -> Instant {
        self.clock.now()
    }

    /// Stop the service task; pending timers never fire.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Cmd::Shutdown);
    }
}

struct Service {
    rx: mpsc::UnboundedReceiver<Cmd>,
    heap: BinaryHeap<TimerEntry>,
    /// Ids currently scheduled; keeps the cancelled set from growing on
    /// cancels that target already-fired timers.
    live: HashSet<TimerId>,
    cancelled: HashSet<TimerId>,
    seq: u64,
    clock: LoopClock,
}

impl Service {
    async fn run(mut self) {
        loop {
            let next = self.heap.peek().map(|e| e.deadline);
            tokio::select! {
                biased;
                cmd = self.rx.recv() => match cmd {
                    Some(Cmd::Add(mut entry)) => {
                        entry.seq = self.seq;
                        self.seq += 1;
                        self.live.insert(entry.id);
                        self.heap.push(entry);
                    }
                    Some(Cmd::Cancel(id)) => {
                        if self.live.remove(&id) {
                            self.cancelled.insert(id);
                        }
                    }
                    Some(Cmd::Shutdown) | None => break,
                },
                _ = sleep_until_opt(next), if next.is_some() => self.fire_due(),
            }
        }
        trace!("timer service stopped");
    }

    fn fire_due(&mut self) {
        let now = Instant::now();
        self.clock.update(now);
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            let Some(mut entry) = self.heap.pop() else {
                break;
            };
            if self.cancelled.remove(&entry.id) {
                continue;
            }
            (entry.cb)();
            match entry.repeat {
                Some(period) => {
                    let mut next = entry.deadline + period;
                    if next <= now {
                        next = now + period;
                    }
                    entry.deadline = next;
                    entry.seq = self.seq;
                    self.seq += 1;
                    self.heap.push(entry);
                }
                None => {
                    self.live.remove(&entry.id);
                }
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
