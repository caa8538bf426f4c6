//! Per-key coordination primitives for the AI pipelines.
//!
//! Three independent registries, each keyed by an opaque entity id:
//!
//! - [`KeyedMutex`] — one exclusive, try-only lock per key. A failed acquire
//!   is the caller's signal to reject the request outright; there is no
//!   queue, so background work can never pile up behind one key.
//! - [`KeyedRwLock`] — one fair async reader-writer lock per key, guarding a
//!   shared folder. Callers wait their turn and release by dropping the
//!   returned guard.
//! - [`ProgressTracker`] — an advisory presence flag per key, used only to
//!   answer status polling. The mutex stays authoritative for exclusion.
//!
//! Entries are created lazily on first use and kept for the process
//! lifetime; cardinality is bounded by the number of live entities.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Registry of one exclusive, non-blocking lock per key.
#[derive(Clone, Debug, Default)]
pub struct KeyedMutex<K> {
    held: Arc<Mutex<HashSet<K>>>,
}

impl<K> KeyedMutex<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            held: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Returns `true` and holds the key iff it was free. Never waits.
    pub fn try_acquire(&self, key: &K) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone())
    }

    /// Frees the key. Releasing a free or unknown key is a no-op.
    pub fn release(&self, key: &K) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    pub fn is_held(&self, key: &K) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }
}

/// Registry of one async reader-writer lock per key.
///
/// Unlike [`KeyedMutex`] both acquisitions wait: file operations are
/// expected to complete, not be rejected. The returned owned guards release
/// on drop, on every exit path of the caller's critical section.
#[derive(Clone, Debug, Default)]
pub struct KeyedRwLock<K> {
    locks: Arc<Mutex<HashMap<K, Arc<RwLock<()>>>>>,
}

impl<K> KeyedRwLock<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn entry(&self, key: &K) -> Arc<RwLock<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Waits until no writer holds the key. Readers stack.
    pub async fn read(&self, key: &K) -> OwnedRwLockReadGuard<()> {
        self.entry(key).read_owned().await
    }

    /// Waits until the key has no readers and no writer.
    pub async fn write(&self, key: &K) -> OwnedRwLockWriteGuard<()> {
        self.entry(key).write_owned().await
    }
}

/// Advisory in-progress flag per key, decoupled from the lock registries so
/// polling endpoints never need access to lock internals.
#[derive(Clone, Debug, Default)]
pub struct ProgressTracker<K> {
    active: Arc<Mutex<HashSet<K>>>,
}

impl<K> ProgressTracker<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Marks the key active. Always succeeds; repeated starts are idempotent.
    pub fn start(&self, key: &K) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());
    }

    /// Clears the key. Idempotent under repeated completes.
    pub fn complete(&self, key: &K) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    pub fn is_active(&self, key: &K) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }
}
