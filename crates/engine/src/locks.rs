use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use tandem_core::SettingId;

/// Slots beyond this count trigger a sweep of idle entries.
const PRUNE_THRESHOLD: usize = 1024;

pub type KeyGuard = ArcMutexGuard<RawMutex, ()>;

/// Per-setting mutual exclusion for the read-resolve-write sequence.
///
/// Writers of different settings never wait on each other. Multi-key
/// acquisition always takes locks in `SettingId` order.
#[derive(Default)]
pub struct KeyLocks {
    slots: Mutex<HashMap<SettingId, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, id: &SettingId) -> KeyGuard {
        self.slot(id).lock_arc()
    }

    /// Lock every id in ascending order. Duplicates are locked once.
    pub fn lock_many<'a>(&self, ids: impl IntoIterator<Item = &'a SettingId>) -> Vec<KeyGuard> {
        let mut ids: Vec<&SettingId> = ids.into_iter().collect();
        ids.sort();
        ids.dedup();
        ids.into_iter().map(|id| self.lock(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    fn slot(&self, id: &SettingId) -> Arc<Mutex<()>> {
        let mut slots = self.slots.lock();
        if slots.len() >= PRUNE_THRESHOLD {
            // Only the table holds an idle slot.
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        }
        slots.entry(id.clone()).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn id(s: &str) -> SettingId {
        SettingId::new(s).unwrap()
    }

    #[test]
    fn same_key_is_exclusive() {
        let locks = Arc::new(KeyLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    for _ in 0..100 {
                        let _guard = locks.lock(&id("color"));
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn distinct_keys_do_not_block() {
        let locks = KeyLocks::new();
        let _a = locks.lock(&id("a"));
        let b = locks.slot(&id("b"));
        assert!(b.try_lock().is_some());
    }

    #[test]
    fn lock_many_dedups() {
        let locks = KeyLocks::new();
        let guards = locks.lock_many([&id("b"), &id("a"), &id("b")]);
        assert_eq!(guards.len(), 2);
    }

    #[test]
    fn idle_slots_are_pruned() {
        let locks = KeyLocks::new();
        for i in 0..PRUNE_THRESHOLD {
            drop(locks.lock(&id(&format!("k{i}"))));
        }
        let held = locks.lock(&id("held"));
        assert!(locks.len() < PRUNE_THRESHOLD);
        drop(held);
    }
}
