//! In-memory per-key mutual exclusion.
//!
//! The teacher's only lock (`shipper::lock::LockFile`) is a single,
//! process-wide advisory file lock: one slot, written to disk, released
//! idempotently on `Drop`. This crate keeps that acquire/release-handle
//! shape — including idempotent release — but re-bases the storage medium
//! on an in-memory `Condvar`-guarded map so an arbitrary number of keys can
//! each hold their own 1-capacity semaphore, lazily created and never
//! removed, exactly as the design requires.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

struct KeySlot {
    held: Mutex<bool>,
    cv: Condvar,
}

impl KeySlot {
    fn new() -> Self {
        Self {
            held: Mutex::new(false),
            cv: Condvar::new(),
        }
    }
}

/// A map of lazily-created, never-removed per-key binary semaphores.
///
/// Cloning a `PerKeyLock` shares the underlying map (it is an `Arc`
/// internally-equivalent handle), so dispatcher workers each hold a cheap
/// clone rather than a reference with a lifetime.
#[derive(Clone, Default)]
pub struct PerKeyLock {
    slots: Arc<Mutex<HashMap<String, Arc<KeySlot>>>>,
}

/// Holds a key's slot locked until dropped or [`release`](ReleaseHandle::release)
/// is called. Calling `release` (or dropping) more than once is a no-op, not
/// a panic — the underlying flag only ever transitions held → free.
pub struct ReleaseHandle {
    slot: Arc<KeySlot>,
    released: bool,
}

impl ReleaseHandle {
    /// Releases the lock. Idempotent: a second call observes nothing to do.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        let mut held = self.slot.held.lock().expect("lock slot poisoned");
        *held = false;
        self.released = true;
        drop(held);
        self.slot.cv.notify_one();
    }
}

impl Drop for ReleaseHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl PerKeyLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot_for(&self, key: &str) -> Arc<KeySlot> {
        let mut slots = self.slots.lock().expect("lock map poisoned");
        Arc::clone(
            slots
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(KeySlot::new())),
        )
    }

    /// Non-blocking attempt to acquire `key`. Returns `None` if it is
    /// already held.
    pub fn try_acquire(&self, key: &str) -> Option<ReleaseHandle> {
        let slot = self.slot_for(key);
        let mut held = slot.held.lock().expect("lock slot poisoned");
        if *held {
            return None;
        }
        *held = true;
        drop(held);
        Some(ReleaseHandle {
            slot,
            released: false,
        })
    }

    /// Blocks until `key` is available, then acquires it.
    pub fn acquire(&self, key: &str) -> ReleaseHandle {
        let slot = self.slot_for(key);
        let mut held = slot.held.lock().expect("lock slot poisoned");
        while *held {
            held = slot.cv.wait(held).expect("lock slot poisoned");
        }
        *held = true;
        drop(held);
        ReleaseHandle {
            slot,
            released: false,
        }
    }

    /// Blocks until `key` is available or `timeout` elapses, whichever
    /// comes first. Used by the dispatcher so a worker can notice a
    /// shutdown signal instead of blocking forever on a contested key.
    pub fn acquire_timeout(&self, key: &str, timeout: Duration) -> Option<ReleaseHandle> {
        let slot = self.slot_for(key);
        let deadline = Instant::now() + timeout;
        let mut held = slot.held.lock().expect("lock slot poisoned");
        while *held {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, result) = slot
                .cv
                .wait_timeout(held, remaining)
                .expect("lock slot poisoned");
            held = guard;
            if result.timed_out() && *held {
                return None;
            }
        }
        *held = true;
        drop(held);
        Some(ReleaseHandle {
            slot,
            released: false,
        })
    }

    /// Whether `key` is currently held. Racy by nature — useful only for
    /// diagnostics/tests, never for synchronization decisions.
    pub fn is_locked(&self, key: &str) -> bool {
        let slot = self.slot_for(key);
        *slot.held.lock().expect("lock slot poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn try_acquire_succeeds_when_free() {
        let locks = PerKeyLock::new();
        let handle = locks.try_acquire("a/b#1");
        assert!(handle.is_some());
        assert!(locks.is_locked("a/b#1"));
    }

    #[test]
    fn try_acquire_fails_when_held() {
        let locks = PerKeyLock::new();
        let _first = locks.try_acquire("a/b#1").unwrap();
        assert!(locks.try_acquire("a/b#1").is_none());
    }

    #[test]
    fn release_frees_the_key() {
        let locks = PerKeyLock::new();
        let handle = locks.try_acquire("a/b#1").unwrap();
        drop(handle);
        assert!(!locks.is_locked("a/b#1"));
        assert!(locks.try_acquire("a/b#1").is_some());
    }

    #[test]
    fn double_release_is_a_no_op() {
        let locks = PerKeyLock::new();
        let mut handle = locks.try_acquire("a/b#1").unwrap();
        handle.release();
        handle.release();
        assert!(!locks.is_locked("a/b#1"));
    }

    #[test]
    fn different_keys_do_not_contend() {
        let locks = PerKeyLock::new();
        let _a = locks.try_acquire("a/b#1").unwrap();
        let _b = locks.try_acquire("a/b#2").unwrap();
        assert!(locks.is_locked("a/b#1"));
        assert!(locks.is_locked("a/b#2"));
    }

    #[test]
    fn acquire_blocks_until_released() {
        let locks = PerKeyLock::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let first = locks.try_acquire("a/b#1").unwrap();

        let locks2 = locks.clone();
        let counter2 = counter.clone();
        let handle = thread::spawn(move || {
            let _guard = locks2.acquire("a/b#1");
            counter2.fetch_add(1, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        drop(first);
        handle.join().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn acquire_timeout_returns_none_when_still_held() {
        let locks = PerKeyLock::new();
        let _holder = locks.try_acquire("a/b#1").unwrap();
        let result = locks.acquire_timeout("a/b#1", Duration::from_millis(50));
        assert!(result.is_none());
    }

    #[test]
    fn acquire_timeout_succeeds_once_released() {
        let locks = PerKeyLock::new();
        let holder = locks.try_acquire("a/b#1").unwrap();
        let locks2 = locks.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(holder);
        });
        let result = locks2.acquire_timeout("a/b#1", Duration::from_secs(2));
        assert!(result.is_some());
    }

    #[test]
    fn mutual_exclusion_holds_under_contention() {
        let locks = PerKeyLock::new();
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let active = active.clone();
                let max_active = max_active.clone();
                thread::spawn(move || {
                    let _guard = locks.acquire("shared-key");
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }
}
