//! The set of active legs and their receive tasks.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tracing::debug;

use sipline_core::Address;

use crate::leg::{Leg, LegMatch};
use crate::PacketSink;

struct Entry {
    leg: Leg,
    task: JoinHandle<()>,
}

/// Registry of active legs. Adding a leg starts its receive loop bound
/// to the given sink; removing it aborts that loop and tears down any
/// pooled connections.
#[derive(Default)]
pub struct LegRegistry {
    entries: Mutex<Vec<Entry>>,
}

fn lock(m: &Mutex<Vec<Entry>>) -> MutexGuard<'_, Vec<Entry>> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl LegRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, leg: Leg, sink: Arc<dyn PacketSink>) {
        let task = leg.start(sink);
        debug!(leg = %leg.local(), "leg registered");
        lock(&self.entries).push(Entry { leg, task });
    }

    /// Remove one specific leg. Returns false when it was not registered.
    pub fn remove(&self, leg: &Leg) -> bool {
        let mut entries = lock(&self.entries);
        let Some(idx) = entries.iter().position(|e| e.leg.same(leg)) else {
            return false;
        };
        let entry = entries.remove(idx);
        drop(entries);
        entry.task.abort();
        entry.leg.shutdown();
        debug!(leg = %entry.leg.local(), "leg removed");
        true
    }

    /// Remove every leg matching the specification, returning them.
    pub fn remove_matching(&self, spec: &LegMatch) -> Vec<Leg> {
        let mut removed = Vec::new();
        let mut entries = lock(&self.entries);
        let mut i = 0;
        while i < entries.len() {
            if entries[i].leg.matches(spec) {
                let entry = entries.remove(i);
                entry.task.abort();
                entry.leg.shutdown();
                removed.push(entry.leg);
            } else {
                i += 1;
            }
        }
        removed
    }

    pub fn get(&self, spec: &LegMatch) -> Vec<Leg> {
        lock(&self.entries)
            .iter()
            .filter(|e| e.leg.matches(spec))
            .map(|e| e.leg.clone())
            .collect()
    }

    pub fn all(&self) -> Vec<Leg> {
        lock(&self.entries).iter().map(|e| e.leg.clone()).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// First registered leg that accepts `dst`, optionally restricted to
    /// an allowed subset.
    pub fn find_for(&self, dst: &Address, allowed: Option<&[Leg]>) -> Option<Leg> {
        let entries = lock(&self.entries);
        entries
            .iter()
            .map(|e| &e.leg)
            .filter(|leg| match allowed {
                Some(set) => set.iter().any(|a| a.same(leg)),
                None => true,
            })
            .find(|leg| leg.can_deliver_to(dst))
            .cloned()
    }

    /// Abort every receive loop. Used on dispatcher shutdown.
    pub fn shutdown(&self) {
        for entry in lock(&self.entries).drain(..) {
            entry.task.abort();
            entry.leg.shutdown();
        }
    }
}

impl Drop for LegRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
