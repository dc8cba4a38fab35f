use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const MIB: f64 = 1024.0 * 1024.0;

/// Process-lifetime request counters for one key (or for the whole process).
#[derive(Debug)]
pub struct Stats {
    name: String,
    requests: AtomicU64,
    completed: AtomicU64,
    disconnects: AtomicU64,
    sent_bytes: AtomicU64,
    received_bytes: AtomicU64,
    hits: AtomicU64,
    hit_bytes: AtomicU64,
    misses: AtomicU64,
    miss_bytes: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub completed: u64,
    pub disconnects: u64,
    pub sent_bytes: u64,
    pub received_bytes: u64,
    pub hits: u64,
    pub hit_bytes: u64,
    pub misses: u64,
    pub miss_bytes: u64,
    pub errors: u64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl Stats {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requests: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
            sent_bytes: AtomicU64::new(0),
            received_bytes: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            hit_bytes: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            miss_bytes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn requested(&self) {
        bump(&self.requests, 1);
    }

    pub fn completed(&self) {
        bump(&self.completed, 1);
    }

    pub fn hit(&self, bytes: u64) {
        bump(&self.hits, 1);
        bump(&self.hit_bytes, bytes);
        bump(&self.sent_bytes, bytes);
    }

    pub fn miss(&self, bytes: u64) {
        bump(&self.misses, 1);
        bump(&self.miss_bytes, bytes);
        bump(&self.sent_bytes, bytes);
    }

    pub fn error(&self, bytes: u64) {
        bump(&self.errors, 1);
        bump(&self.sent_bytes, bytes);
    }

    /// The client went away mid-body. Bytes are accounted by the hit/miss event.
    pub fn disconnect(&self) {
        bump(&self.disconnects, 1);
    }

    pub fn received(&self, bytes: u64) {
        bump(&self.received_bytes, bytes);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            received_bytes: self.received_bytes.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            hit_bytes: self.hit_bytes.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            miss_bytes: self.miss_bytes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    /// Three-line human readable summary; `extra` is appended to the name.
    pub fn report(&self, extra: &str) -> String {
        let s = self.snapshot();
        let hit_rate = if s.misses == 0 {
            "∞".to_string()
        } else {
            format!("{:3.1}×", s.hits as f64 / s.misses as f64)
        };
        let sent_mb = s.sent_bytes as f64 / MIB;
        let received_mb = s.received_bytes as f64 / MIB;
        let transfer_rate = if s.received_bytes == 0 {
            "∞".to_string()
        } else {
            format!("{:3.1}×", sent_mb / received_mb)
        };
        format!(
            "{}{}\nreq: {:6}/{:<6}  {:3} dc  hit {:6}:{:<6} {:<6}  err: {}\nsent: {:8.1}MB  recv: {:8.1}MB {}",
            self.name,
            extra,
            s.completed,
            s.requests,
            s.disconnects,
            s.hits,
            s.misses,
            hit_rate,
            s.errors,
            sent_mb,
            received_mb,
            transfer_rate,
        )
    }
}

/// Records every event on a per-key record and the process totals at once.
#[derive(Debug, Clone)]
pub struct Tally {
    local: Arc<Stats>,
    totals: Arc<Stats>,
}

impl Tally {
    pub fn new(local: Arc<Stats>, totals: Arc<Stats>) -> Self {
        Self { local, totals }
    }

    pub fn requested(&self) {
        self.local.requested();
        self.totals.requested();
    }

    pub fn completed(&self) {
        self.local.completed();
        self.totals.completed();
    }

    pub fn hit(&self, bytes: u64) {
        self.local.hit(bytes);
        self.totals.hit(bytes);
    }

    pub fn miss(&self, bytes: u64) {
        self.local.miss(bytes);
        self.totals.miss(bytes);
    }

    pub fn error(&self, bytes: u64) {
        self.local.error(bytes);
        self.totals.error(bytes);
    }

    pub fn disconnect(&self) {
        self.local.disconnect();
        self.totals.disconnect();
    }

    pub fn received(&self, bytes: u64) {
        self.local.received(bytes);
        self.totals.received(bytes);
    }
}
