use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::get;
use axum::Router;

use crate::app_state::AppState;
use crate::proxy::{self, plain};

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .fallback(proxy::handle_cache)
        .with_state(state)
}

async fn root() -> Response {
    let banner = format!(
        "{} {}\n{}\n",
        mediacache_core::SOFTWARE,
        mediacache_core::VERSION,
        mediacache_core::REPOSITORY_URL
    );
    plain(StatusCode::OK, &banner)
}

async fn healthz() -> Response {
    plain(StatusCode::OK, "OK")
}
