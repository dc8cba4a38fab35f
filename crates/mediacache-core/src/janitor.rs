//! Background upkeep of the cache directory and the lock registry.
//!
//! A clean pass walks the flat cache directory once:
//! orphans (a content file without its sidecar, or the reverse) are removed,
//! entries older than the max age are expired, and the rest are scored by
//! `size_mb * age_hours * used_hours`. When the directory exceeds its file or
//! size budget the highest scores are evicted until both budgets hold.
//! Eviction does not take per-key locks; readers keep their open handles.

use std::ffi::OsStr;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use metrics::{counter, gauge};
use tokio::task::spawn_blocking;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::locks::{LockRegistry, SweptEntry, IDLE_THRESHOLD};
use crate::store::META_SUFFIX;

pub const TICK: Duration = Duration::from_secs(60);
pub const SWEEP_EVERY: u64 = 10;
pub const CLEAN_EVERY: u64 = 60;

/// Half pairs younger than this may still be in the middle of a fetch.
pub const ORPHAN_GRACE: Duration = Duration::from_secs(5 * 60);

const METRIC_EXPIRED: &str = "mediacache_clean_expired_total";
const METRIC_EVICTED: &str = "mediacache_clean_evicted_total";
const METRIC_ORPHANS: &str = "mediacache_clean_orphans_total";
const METRIC_SIZE_MB: &str = "mediacache_cache_size_mb";
const METRIC_FILES: &str = "mediacache_cache_files";
const METRIC_LOCKS_SWEPT: &str = "mediacache_locks_swept_total";

const MIB: f64 = 1024.0 * 1024.0;
const HOUR: f64 = 3600.0;

/// Budgets for a clean pass. Zero budgets are unlimited.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanPolicy {
    pub max_files: u64,
    pub max_size_mb: f64,
    pub max_age: Option<Duration>,
    pub dry_run: bool,
}

impl Default for CleanPolicy {
    fn default() -> Self {
        Self {
            max_files: 10_000,
            max_size_mb: 1000.0,
            max_age: Some(Duration::from_secs(3 * 3600)),
            dry_run: false,
        }
    }
}

impl CleanPolicy {
    fn within_budget(&self, files: u64, size_mb: f64) -> bool {
        (self.max_files == 0 || files <= self.max_files)
            && (self.max_size_mb <= 0.0 || size_mb <= self.max_size_mb)
    }
}

/// Outcome of one clean pass. In dry-run mode `removed` lists what would go.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanReport {
    pub scanned: usize,
    pub kept: usize,
    pub expired: usize,
    pub evicted: usize,
    pub orphans: usize,
    /// Size of the surviving entries.
    pub total_size_mb: f64,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Candidate {
    pub name: String,
    pub size_mb: f64,
    pub age_hours: f64,
    pub used_hours: f64,
    pub score: f64,
}

impl Candidate {
    fn new(name: String, size_bytes: u64, age: Duration, used: Duration) -> Self {
        let size_mb = size_bytes as f64 / MIB;
        let age_hours = age.as_secs_f64() / HOUR;
        let used_hours = used.as_secs_f64() / HOUR;
        Self {
            name,
            size_mb,
            age_hours,
            used_hours,
            // big old files without recent reads score higher
            score: size_mb * age_hours * used_hours,
        }
    }
}

/// Splits scored candidates into (kept, evicted).
///
/// Candidates are ranked by ascending score. Nothing is evicted while the
/// whole set fits both budgets; otherwise the ranked list is walked with
/// running totals and every entry past either budget goes.
pub(crate) fn plan_evictions(
    mut candidates: Vec<Candidate>,
    policy: &CleanPolicy,
) -> (Vec<Candidate>, Vec<Candidate>) {
    let total_files = candidates.len() as u64;
    let total_size: f64 = candidates.iter().map(|c| c.size_mb).sum();
    if policy.within_budget(total_files, total_size) {
        return (candidates, Vec::new());
    }

    candidates.sort_by(|a, b| a.score.total_cmp(&b.score));
    let mut kept = Vec::new();
    let mut evicted = Vec::new();
    let mut running_files = 0u64;
    let mut running_size = 0.0;
    for candidate in candidates {
        running_files += 1;
        running_size += candidate.size_mb;
        if policy.within_budget(running_files, running_size) {
            kept.push(candidate);
        } else {
            evicted.push(candidate);
        }
    }
    (kept, evicted)
}

fn age_of(now: SystemTime, mtime: SystemTime) -> Duration {
    now.duration_since(mtime).unwrap_or_default()
}

/// Removes the content file and its sidecar; missing halves are fine.
fn remove_pair(dir: &Path, name: &OsStr) {
    let mut meta = name.to_os_string();
    meta.push(META_SUFFIX);
    for path in [dir.join(&meta), dir.join(name)] {
        if let Err(err) = std::fs::remove_file(&path) {
            if err.kind() != ErrorKind::NotFound {
                tracing::warn!(
                    target: "mediacache::janitor",
                    path = %path.display(),
                    error = %err,
                    "failed to remove cache file"
                );
            }
        }
    }
}

/// One synchronous clean pass over `dir`.
pub fn clean_cache(dir: &Path, policy: &CleanPolicy, now: SystemTime) -> Result<CleanReport> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("read cache dir {}", dir.display()))?;
    let mut report = CleanReport::default();
    let mut candidates = Vec::new();
    let verb = if policy.dry_run { "would remove" } else { "removing" };

    let drop_entry = |report: &mut CleanReport, name: &OsStr| {
        report.removed.push(name.to_string_lossy().into_owned());
        if !policy.dry_run {
            remove_pair(dir, name);
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(target: "mediacache::janitor", error = %err, "error reading cache dir entry");
                continue;
            }
        };
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy().into_owned();
        let info = match entry.metadata() {
            Ok(info) => info,
            Err(err) => {
                tracing::warn!(target: "mediacache::janitor", file = %name, error = %err, "error reading file info");
                continue;
            }
        };
        if info.is_dir() {
            continue;
        }
        let mtime = info.modified().unwrap_or(now);

        if let Some(content) = name.strip_suffix(META_SUFFIX) {
            // sidecar: only interesting when its content file is gone
            if !dir.join(content).exists() && age_of(now, mtime) > ORPHAN_GRACE {
                tracing::info!(target: "mediacache::janitor", file = %name, "{verb} orphaned metadata");
                report.orphans += 1;
                report.removed.push(name.clone());
                if !policy.dry_run {
                    if let Err(err) = std::fs::remove_file(entry.path()) {
                        if err.kind() != ErrorKind::NotFound {
                            tracing::warn!(target: "mediacache::janitor", file = %name, error = %err, "failed to remove cache file");
                        }
                    }
                }
            }
            continue;
        }

        report.scanned += 1;
        let age = age_of(now, mtime);
        let mut meta_name = file_name.clone();
        meta_name.push(META_SUFFIX);
        let meta_info = match std::fs::metadata(dir.join(&meta_name)) {
            Ok(meta_info) => meta_info,
            Err(err) => {
                if age > ORPHAN_GRACE {
                    tracing::info!(target: "mediacache::janitor", file = %name, error = %err, "{verb} entry without metadata");
                    report.orphans += 1;
                    drop_entry(&mut report, &file_name);
                }
                continue;
            }
        };

        if let Some(max_age) = policy.max_age.filter(|a| !a.is_zero()) {
            if age > max_age {
                tracing::info!(
                    target: "mediacache::janitor",
                    file = %name,
                    age_h = age.as_secs_f64() / HOUR,
                    max_age_h = max_age.as_secs_f64() / HOUR,
                    "{verb} expired entry"
                );
                report.expired += 1;
                drop_entry(&mut report, &file_name);
                continue;
            }
        }

        let used = age_of(now, meta_info.modified().unwrap_or(now));
        candidates.push(Candidate::new(name, info.len(), age, used));
    }

    let total_files = candidates.len();
    let total_size: f64 = candidates.iter().map(|c| c.size_mb).sum();
    tracing::info!(
        target: "mediacache::janitor",
        size_mb = total_size,
        max_size_mb = policy.max_size_mb,
        files = total_files,
        max_files = policy.max_files,
        "cache size"
    );

    let (kept, evicted) = plan_evictions(candidates, policy);
    for candidate in &evicted {
        tracing::info!(
            target: "mediacache::janitor",
            file = %candidate.name,
            age_h = candidate.age_hours,
            size_mb = candidate.size_mb,
            used_h = candidate.used_hours,
            score = candidate.score,
            "{verb} over budget"
        );
        drop_entry(&mut report, OsStr::new(&candidate.name));
    }
    report.evicted = evicted.len();
    report.kept = kept.len();
    report.total_size_mb = kept.iter().map(|c| c.size_mb).sum();
    Ok(report)
}

/// What a given tick of the maintenance loop does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickActions {
    pub report: bool,
    pub sweep: bool,
    pub clean: bool,
}

/// Actions for the `tick`-th tick (1-based).
pub fn tick_actions(tick: u64) -> TickActions {
    TickActions {
        report: true,
        sweep: tick % SWEEP_EVERY == 0,
        clean: tick % CLEAN_EVERY == 0,
    }
}

/// Periodic upkeep: stats reports, idle lock sweeps and clean passes.
#[derive(Debug, Clone)]
pub struct Janitor {
    registry: Arc<LockRegistry>,
    cache_dir: PathBuf,
    policy: CleanPolicy,
    clean_enabled: bool,
    print_stats: bool,
}

impl Janitor {
    pub fn new(
        registry: Arc<LockRegistry>,
        cache_dir: impl Into<PathBuf>,
        policy: CleanPolicy,
        clean_enabled: bool,
        print_stats: bool,
    ) -> Self {
        Self {
            registry,
            cache_dir: cache_dir.into(),
            policy,
            clean_enabled,
            print_stats,
        }
    }

    /// Runs a clean pass on the blocking pool and exports its counters.
    pub async fn clean_once(&self) -> Result<CleanReport> {
        tracing::info!(target: "mediacache::janitor", dir = %self.cache_dir.display(), dry_run = self.policy.dry_run, "cleaning cache");
        let dir = self.cache_dir.clone();
        let policy = self.policy.clone();
        let report = spawn_blocking(move || clean_cache(&dir, &policy, SystemTime::now()))
            .await
            .context("clean pass panicked")??;

        if !self.policy.dry_run {
            counter!(METRIC_EXPIRED).increment(report.expired as u64);
            counter!(METRIC_EVICTED).increment(report.evicted as u64);
            counter!(METRIC_ORPHANS).increment(report.orphans as u64);
            gauge!(METRIC_SIZE_MB).set(report.total_size_mb);
            gauge!(METRIC_FILES).set(report.kept as f64);
        }
        tracing::info!(
            target: "mediacache::janitor",
            scanned = report.scanned,
            kept = report.kept,
            expired = report.expired,
            evicted = report.evicted,
            orphans = report.orphans,
            size_mb = report.total_size_mb,
            dry_run = self.policy.dry_run,
            "clean pass finished"
        );
        Ok(report)
    }

    /// Reaps idle lock entries, printing a report for each visited key.
    pub fn sweep_once(&self) -> Vec<SweptEntry> {
        let visited = self.registry.sweep_idle(IDLE_THRESHOLD);
        let swept = visited.iter().filter(|v| v.expired).count();
        counter!(METRIC_LOCKS_SWEPT).increment(swept as u64);
        if self.print_stats {
            for v in &visited {
                let extra = if v.expired { " (expired)" } else { "" };
                tracing::info!(target: "mediacache::stats", "{}", v.entry.stats.report(extra));
            }
        }
        visited
    }

    pub fn report_totals(&self) {
        if self.print_stats {
            tracing::info!(target: "mediacache::stats", "{}", self.registry.totals().report(""));
        }
    }

    async fn clean_logged(&self) {
        if let Err(err) = self.clean_once().await {
            tracing::warn!(target: "mediacache::janitor", error = %err, "clean pass failed");
        }
    }

    /// Runs for the lifetime of the process.
    pub async fn run(self) {
        if self.clean_enabled {
            self.clean_logged().await;
        }
        let mut ticker = interval_at(Instant::now() + TICK, TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut tick = 0u64;
        loop {
            ticker.tick().await;
            tick += 1;
            let actions = tick_actions(tick);
            if actions.sweep {
                self.sweep_once();
            }
            if actions.clean && self.clean_enabled {
                self.clean_logged().await;
            }
            if actions.report {
                self.report_totals();
            }
        }
    }
}
