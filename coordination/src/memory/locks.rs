//! Per-user write locks.
//!
//! One `tokio::sync::Mutex` per user id, created on first use. The map is
//! guarded by a `std::sync::RwLock` that is never held across an `.await`:
//! the fast path takes the read lock, a miss re-checks under the write lock
//! before inserting. The registry is bounded; when full, the least recently
//! used lock that nobody holds or waits on is evicted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::Mutex;
use tracing::debug;

struct Entry {
    lock: Arc<Mutex<()>>,
    last_used: AtomicU64,
}

/// LRU-bounded map of user id to write lock.
pub struct UserLockRegistry {
    entries: RwLock<HashMap<String, Entry>>,
    capacity: usize,
    clock: AtomicU64,
}

impl UserLockRegistry {
    pub const DEFAULT_CAPACITY: usize = 10_000;

    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// The write lock for `user_id`. Always the same `Arc` while any caller
    /// still holds it.
    pub fn lock_for(&self, user_id: &str) -> Arc<Mutex<()>> {
        let now = self.tick();
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = entries.get(user_id) {
                entry.last_used.store(now, Ordering::Relaxed);
                return Arc::clone(&entry.lock);
            }
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have inserted while we waited for the write lock.
        if let Some(entry) = entries.get(user_id) {
            entry.last_used.store(now, Ordering::Relaxed);
            return Arc::clone(&entry.lock);
        }
        if entries.len() >= self.capacity {
            evict_idle(&mut entries);
        }
        let lock = Arc::new(Mutex::new(()));
        entries.insert(
            user_id.to_string(),
            Entry {
                lock: Arc::clone(&lock),
                last_used: AtomicU64::new(now),
            },
        );
        lock
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for UserLockRegistry {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

/// Drop the least recently used lock that only the registry references.
///
/// If every lock is in use the map grows past capacity; evicting a held lock
/// would let a second writer in for the same user.
fn evict_idle(entries: &mut HashMap<String, Entry>) {
    let victim = entries
        .iter()
        .filter(|(_, e)| Arc::strong_count(&e.lock) == 1)
        .min_by_key(|(_, e)| e.last_used.load(Ordering::Relaxed))
        .map(|(k, _)| k.clone());
    if let Some(user_id) = victim {
        entries.remove(&user_id);
        debug!(user_id = %user_id, "evicted idle user lock");
    }
}
