//! Delivery queue: per-packet retransmission state.
//!
//! Each entry carries its precomputed schedule of absolute send
//! instants plus the final deadline at 64·T1. The dispatcher arms one
//! timer per entry; every fire either transmits the next attempt or,
//! once the schedule is exhausted, times the entry out.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use sipline_core::{Address, Packet};
use sipline_transport::Leg;

use crate::error::Error;
use crate::timer::TimerId;

/// Invoked with every reportable outcome of a delivery: write errors as
/// they happen, then a terminal success or failure. Never invoked after
/// cancellation.
pub type DeliveryCallback = Box<dyn FnMut(Result<(), Error>) + Send>;

/// RFC 3261 retransmission schedule: sends at 0, T1, 3·T1, 7·T1, ...
/// with the gap doubling up to T2, ending at the 64·T1 deadline.
pub(crate) fn retransmit_schedule(
    now: Instant,
    t1: Duration,
    t2: Duration,
) -> (Vec<Instant>, Instant) {
    let lifetime = t1 * 64;
    let deadline = now + lifetime;
    let mut sends = vec![now];
    let mut elapsed = Duration::ZERO;
    let mut gap = t1;
    loop {
        elapsed += gap;
        if elapsed >= lifetime {
            break;
        }
        sends.push(now + elapsed);
        gap = (gap * 2).min(t2);
    }
    (sends, deadline)
}

pub(crate) struct QueueEntry {
    pub id: String,
    pub callid: String,
    pub packet: Packet,
    pub dst: Address,
    pub leg: Leg,
    /// Absolute send instants; `sends[0]` is the initial transmission.
    pub sends: Vec<Instant>,
    pub next_send: usize,
    pub deadline: Instant,
    pub timer: Option<TimerId>,
    pub callback: Option<DeliveryCallback>,
    pub do_retransmits: bool,
}

/// What the dispatcher must do when an entry's timer fires.
pub(crate) enum TimerAction {
    Transmit {
        packet: Packet,
        leg: Leg,
        dst: Address,
        reliable: bool,
        single_shot: bool,
        attempt: usize,
    },
    /// Schedule exhausted; the entry has been removed.
    Timeout(QueueEntry),
}

#[derive(Default)]
pub(crate) struct DeliveryQueue {
    entries: Mutex<HashMap<String, QueueEntry>>,
}

impl DeliveryQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, QueueEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Register an entry; an existing entry under the same id is replaced
    /// and returned so its timer can be disarmed.
    pub(crate) fn insert(&self, entry: QueueEntry) -> Option<QueueEntry> {
        self.lock().insert(entry.id.clone(), entry)
    }

    pub(crate) fn remove(&self, id: &str) -> Option<QueueEntry> {
        self.lock().remove(id)
    }

    pub(crate) fn remove_by_callid(&self, callid: &str) -> Vec<QueueEntry> {
        let mut map = self.lock();
        let ids: Vec<String> = map
            .iter()
            .filter(|(_, e)| e.callid == callid)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter().filter_map(|id| map.remove(&id)).collect()
    }

    /// Drop every entry bound to `leg` (the leg went away).
    pub(crate) fn remove_by_leg(&self, leg: &Leg) -> Vec<QueueEntry> {
        let mut map = self.lock();
        let ids: Vec<String> = map
            .iter()
            .filter(|(_, e)| e.leg.same(leg))
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter().filter_map(|id| map.remove(&id)).collect()
    }

    /// Advance the entry when its timer fires. `None` means the entry is
    /// gone (cancelled or acknowledged) and the fire is a no-op.
    pub(crate) fn on_timer(&self, id: &str) -> Option<TimerAction> {
        let mut map = self.lock();
        let entry = map.get_mut(id)?;
        entry.timer = None;
        if entry.next_send < entry.sends.len() {
            entry.next_send += 1;
            Some(TimerAction::Transmit {
                packet: entry.packet.clone(),
                leg: entry.leg.clone(),
                dst: entry.dst.clone(),
                reliable: entry.dst.proto.is_reliable(),
                single_shot: !entry.do_retransmits,
                attempt: entry.next_send,
            })
        } else {
            map.remove(id).map(TimerAction::Timeout)
        }
    }

    /// The instant the entry's timer should fire next: the next scheduled
    /// send, or the final deadline once sends are exhausted.
    pub(crate) fn next_deadline(&self, id: &str) -> Option<Instant> {
        let map = self.lock();
        let entry = map.get(id)?;
        Some(
            entry
                .sends
                .get(entry.next_send)
                .copied()
                .unwrap_or(entry.deadline),
        )
    }

    /// Attach a fresh timer id; false when the entry vanished meanwhile
    /// (the caller then cancels the timer).
    pub(crate) fn arm(&self, id: &str, timer: TimerId) -> bool {
        let mut map = self.lock();
        match map.get_mut(id) {
            Some(entry) => {
                entry.timer = Some(timer);
                true
            }
            None => false,
        }
    }

    pub(crate) fn take_callback(&self, id: &str) -> Option<DeliveryCallback> {
        self.lock().get_mut(id)?.callback.take()
    }

    /// Hand a callback back after a non-terminal report. Returns it to
    /// the caller when the entry disappeared in between.
    pub(crate) fn restore_callback(
        &self,
        id: &str,
        cb: DeliveryCallback,
    ) -> Option<DeliveryCallback> {
        let mut map = self.lock();
        match map.get_mut(id) {
            Some(entry) => {
                entry.callback = Some(cb);
                None
            }
            None => Some(cb),
        }
    }

    /// Defensive once-per-second pass: expired entries are removed and
    /// returned; entries whose initial transmission never got armed are
    /// returned for re-arming.
    pub(crate) fn sweep(&self, now: Instant) -> (Vec<QueueEntry>, Vec<String>) {
        let mut map = self.lock();
        let expired_ids: Vec<String> = map
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        let expired = expired_ids
            .into_iter()
            .filter_map(|id| map.remove(&id))
            .collect();
        let unarmed = map
            .values()
            .filter(|e| e.timer.is_none() && e.next_send == 0)
            .map(|e| e.id.clone())
            .collect();
        (expired, unarmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T1: Duration = Duration::from_millis(500);
    const T2: Duration = Duration::from_secs(4);

    #[test]
    fn schedule_matches_rfc3261_backoff() {
        let now = Instant::now();
        let (sends, deadline) = retransmit_schedule(now, T1, T2);
        let offsets: Vec<f64> = sends
            .iter()
            .map(|t| t.duration_since(now).as_secs_f64())
            .collect();
        assert_eq!(
            offsets,
            vec![0.0, 0.5, 1.5, 3.5, 7.5, 11.5, 15.5, 19.5, 23.5, 27.5, 31.5]
        );
        assert_eq!(deadline.duration_since(now), Duration::from_secs(32));
    }

    #[test]
    fn schedule_gaps_never_exceed_t2() {
        let now = Instant::now();
        let (sends, deadline) = retransmit_schedule(now, T1, T2);
        for pair in sends.windows(2) {
            assert!(pair[1] - pair[0] <= T2);
        }
        assert!(deadline.duration_since(now) <= T1 * 64);
    }

    #[test]
    fn schedule_scales_with_t1() {
        let now = Instant::now();
        let (sends, deadline) = retransmit_schedule(now, Duration::from_millis(20), T2);
        assert_eq!(sends[1] - sends[0], Duration::from_millis(20));
        assert_eq!(deadline - now, Duration::from_millis(20 * 64));
    }
}
