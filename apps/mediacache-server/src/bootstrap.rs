use anyhow::{Context, Result};
use axum::Router;

use mediacache_core::CacheConfig;

use crate::{app_state::AppState, maintenance, router, tasks::TaskManager};

pub(crate) struct BootstrapOutput {
    pub router: Router,
    pub background_tasks: TaskManager,
}

/// Prepares the cache directory, the request state and the janitor.
pub(crate) async fn build(config: &CacheConfig) -> Result<BootstrapOutput> {
    let state = AppState::new(config).context("initialise cache state")?;
    state
        .store()
        .ensure_dir()
        .await
        .context("prepare cache directory")?;

    let mut background_tasks = TaskManager::new();
    background_tasks.push(maintenance::start(state.janitor(config)));

    Ok(BootstrapOutput {
        router: router::build_router(state),
        background_tasks,
    })
}

pub(crate) fn attach_http_layers(router: Router, concurrency_limit: usize) -> Router {
    use tower::limit::ConcurrencyLimitLayer;
    use tower_http::trace::TraceLayer;

    router
        .layer(TraceLayer::new_for_http())
        .layer(ConcurrencyLimitLayer::new(concurrency_limit.max(1)))
}
