//! Contact bindings, behind a small trait so an external store can be
//! plugged in. The in-memory map is the default.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

/// Storage for registrations: AOR → contact URI → absolute expiry.
pub trait ContactStore: Send + Sync + 'static {
    /// Insert or refresh one binding.
    fn put(&self, aor: &str, contact: &str, expires: SystemTime);

    /// Remove one binding.
    fn remove(&self, aor: &str, contact: &str);

    /// Remove every binding of an AOR (wildcard deregistration).
    fn remove_all(&self, aor: &str);

    /// Current bindings of an AOR, expired ones included.
    fn contacts(&self, aor: &str) -> Vec<(String, SystemTime)>;

    /// Drop every binding expiring at or before `now` (and AORs left
    /// empty); returns the earliest expiry still stored.
    fn sweep(&self, now: SystemTime) -> Option<SystemTime>;
}

/// Default in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    bindings: Mutex<HashMap<String, HashMap<String, SystemTime>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HashMap<String, SystemTime>>> {
        self.bindings.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().values().all(HashMap::is_empty)
    }
}

impl ContactStore for MemoryStore {
    fn put(&self, aor: &str, contact: &str, expires: SystemTime) {
        self.lock()
            .entry(aor.to_owned())
            .or_default()
            .insert(contact.to_owned(), expires);
    }

    fn remove(&self, aor: &str, contact: &str) {
        let mut map = self.lock();
        if let Some(contacts) = map.get_mut(aor) {
            contacts.remove(contact);
            if contacts.is_empty() {
                map.remove(aor);
            }
        }
    }

    fn remove_all(&self, aor: &str) {
        self.lock().remove(aor);
    }

    fn contacts(&self, aor: &str) -> Vec<(String, SystemTime)> {
        self.lock()
            .get(aor)
            .map(|contacts| {
                let mut list: Vec<_> = contacts
                    .iter()
                    .map(|(uri, exp)| (uri.clone(), *exp))
                    .collect();
                list.sort();
                list
            })
            .unwrap_or_default()
    }

    fn sweep(&self, now: SystemTime) -> Option<SystemTime> {
        let mut map = self.lock();
        let mut earliest: Option<SystemTime> = None;
        map.retain(|_, contacts| {
            contacts.retain(|_, expires| *expires > now);
            for expires in contacts.values() {
                earliest = Some(match earliest {
                    Some(e) => e.min(*expires),
                    None => *expires,
                });
            }
            !contacts.is_empty()
        });
        earliest
    }
}
