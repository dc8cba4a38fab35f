//! Cache core for the MediaCache disk-backed caching proxy.
//!
//! The pieces here are independent of the HTTP listener: key derivation,
//! the per-key lock registry, the on-disk store, the origin fetcher and the
//! janitor that keeps the cache directory inside its budgets.

pub mod config;
pub mod error;
pub mod fetcher;
pub mod janitor;
pub mod key;
pub mod locks;
pub mod stats;
pub mod store;

pub use config::{CacheConfig, CannedReplies, ConfigError};
pub use error::{CacheError, Result};
pub use fetcher::{FetchOutcome, Fetcher};
pub use janitor::{clean_cache, tick_actions, CleanPolicy, CleanReport, Janitor, TickActions};
pub use key::{CacheKey, KeyError, KeyMode, KeyRules};
pub use locks::{ExclusiveGuard, LockEntry, LockRegistry, SharedGuard, SweptEntry, IDLE_THRESHOLD};
pub use stats::{Stats, StatsSnapshot, Tally};
pub use store::{CacheStore, EntryMeta, StoredEntry};

pub const SOFTWARE: &str = "MediaCache";
pub const VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"));
pub const REPOSITORY_URL: &str = "https://github.com/ShittyKopper/mediacache";
