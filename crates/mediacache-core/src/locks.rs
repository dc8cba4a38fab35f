use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock as KeyLock};
use tokio::time::Instant;

use crate::stats::{Stats, Tally};

/// Entries untouched for longer than this are reaped by the sweep.
pub const IDLE_THRESHOLD: Duration = Duration::from_secs(10 * 60);

/// Per-key shared/exclusive lock plus its usage counters and stats.
#[derive(Debug)]
pub struct LockEntry {
    key: String,
    lock: Arc<KeyLock<()>>,
    readers: AtomicUsize,
    writers: AtomicUsize,
    touched: Mutex<Instant>,
    pub stats: Arc<Stats>,
}

impl LockEntry {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            lock: Arc::new(KeyLock::new(())),
            readers: AtomicUsize::new(0),
            writers: AtomicUsize::new(0),
            touched: Mutex::new(Instant::now()),
            stats: Arc::new(Stats::new(key)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn readers(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }

    pub fn writers(&self) -> usize {
        self.writers.load(Ordering::Acquire)
    }

    pub fn idle_for(&self) -> Duration {
        self.touched.lock().elapsed()
    }

    fn touch(&self) {
        *self.touched.lock() = Instant::now();
    }

    /// Waits for any writer to finish, then holds the key for reading until the guard drops.
    pub async fn acquire_shared(self: &Arc<Self>) -> SharedGuard {
        let guard = Arc::clone(&self.lock).read_owned().await;
        self.readers.fetch_add(1, Ordering::AcqRel);
        self.touch();
        SharedGuard {
            entry: Arc::clone(self),
            _guard: guard,
        }
    }

    /// Waits for all readers and writers, then holds the key exclusively.
    ///
    /// Never call this while holding a [`SharedGuard`] for the same entry; release
    /// it first and re-check the cache once the exclusive guard is granted.
    pub async fn acquire_exclusive(self: &Arc<Self>) -> ExclusiveGuard {
        let guard = Arc::clone(&self.lock).write_owned().await;
        self.writers.fetch_add(1, Ordering::AcqRel);
        self.touch();
        ExclusiveGuard {
            entry: Arc::clone(self),
            _guard: guard,
        }
    }
}

/// Read access to one key. Releases on drop.
#[derive(Debug)]
pub struct SharedGuard {
    entry: Arc<LockEntry>,
    _guard: OwnedRwLockReadGuard<()>,
}

impl SharedGuard {
    pub fn entry(&self) -> &Arc<LockEntry> {
        &self.entry
    }

    pub fn release(self) {}
}

impl Drop for SharedGuard {
    fn drop(&mut self) {
        self.entry.readers.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Write access to one key. Releases on drop.
#[derive(Debug)]
pub struct ExclusiveGuard {
    entry: Arc<LockEntry>,
    _guard: OwnedRwLockWriteGuard<()>,
}

impl ExclusiveGuard {
    pub fn entry(&self) -> &Arc<LockEntry> {
        &self.entry
    }

    pub fn release(self) {}
}

impl Drop for ExclusiveGuard {
    fn drop(&mut self) {
        self.entry.writers.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One entry visited by [`LockRegistry::sweep_idle`].
#[derive(Debug, Clone)]
pub struct SweptEntry {
    pub entry: Arc<LockEntry>,
    pub expired: bool,
}

/// Maps cache keys to their lock entries.
///
/// The map lock is held only for the map operation itself, never across a
/// per-key lock wait or any I/O.
#[derive(Debug)]
pub struct LockRegistry {
    entries: RwLock<HashMap<String, Arc<LockEntry>>>,
    totals: Arc<Stats>,
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LockRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            totals: Arc::new(Stats::new("TOTALS")),
        }
    }

    pub fn totals(&self) -> &Arc<Stats> {
        &self.totals
    }

    /// Looks up the entry for `key`, creating it on first use.
    pub fn entry(&self, key: &str) -> Arc<LockEntry> {
        if let Some(entry) = self.entries.read().get(key) {
            return Arc::clone(entry);
        }
        let mut map = self.entries.write();
        let entry = map
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(LockEntry::new(key)));
        Arc::clone(entry)
    }

    /// Stats recorder feeding both the entry's stats and the process totals.
    pub fn tally(&self, entry: &LockEntry) -> Tally {
        Tally::new(Arc::clone(&entry.stats), Arc::clone(&self.totals))
    }

    pub async fn acquire_shared(&self, key: &str) -> SharedGuard {
        self.entry(key).acquire_shared().await
    }

    pub async fn acquire_exclusive(&self, key: &str) -> ExclusiveGuard {
        self.entry(key).acquire_exclusive().await
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Removes entries that nobody holds or waits on and that were last touched
    /// more than `threshold` ago. Returns every visited entry, flagging removals.
    pub fn sweep_idle(&self, threshold: Duration) -> Vec<SweptEntry> {
        let mut visited = Vec::new();
        let mut map = self.entries.write();
        map.retain(|_, entry| {
            // The map owns the only reference unless a request is holding or
            // waiting on this entry; the write lock stops new lookups meanwhile.
            let unreferenced = Arc::strong_count(entry) == 1;
            let expired = unreferenced
                && entry.readers() == 0
                && entry.writers() == 0
                && entry.idle_for() > threshold;
            visited.push(SweptEntry {
                entry: Arc::clone(entry),
                expired,
            });
            !expired
        });
        visited
    }
}
