use std::sync::Arc;
use std::time::Duration;

use mediacache_core::{
    CacheConfig, CacheStore, Fetcher, Janitor, KeyRules, LockRegistry, Result,
};

use crate::responder::Responder;

/// Shared request-handling state. Cheap to clone.
#[derive(Clone)]
pub(crate) struct AppState {
    inner: Arc<Inner>,
}

struct Inner {
    rules: KeyRules,
    registry: Arc<LockRegistry>,
    store: CacheStore,
    fetcher: Fetcher,
    responder: Responder,
    max_age: Option<Duration>,
}

impl AppState {
    pub(crate) fn new(config: &CacheConfig) -> Result<Self> {
        let store = CacheStore::new(&config.cache_dir);
        let fetcher = Fetcher::new(config.upstreams.clone(), config.fetch_timeout, store.clone())?;
        Ok(Self {
            inner: Arc::new(Inner {
                rules: config.key_rules(),
                registry: Arc::new(LockRegistry::new()),
                store,
                fetcher,
                responder: Responder::new(config.replies.clone()),
                max_age: config.max_age,
            }),
        })
    }

    pub(crate) fn rules(&self) -> &KeyRules {
        &self.inner.rules
    }

    pub(crate) fn registry(&self) -> &Arc<LockRegistry> {
        &self.inner.registry
    }

    pub(crate) fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    pub(crate) fn fetcher(&self) -> &Fetcher {
        &self.inner.fetcher
    }

    pub(crate) fn responder(&self) -> &Responder {
        &self.inner.responder
    }

    pub(crate) fn max_age(&self) -> Option<Duration> {
        self.inner.max_age
    }

    /// Janitor sharing this state's registry and cache directory.
    pub(crate) fn janitor(&self, config: &CacheConfig) -> Janitor {
        Janitor::new(
            Arc::clone(self.registry()),
            self.store().dir(),
            config.clean_policy(),
            config.clean,
            config.print_stats,
        )
    }
}
