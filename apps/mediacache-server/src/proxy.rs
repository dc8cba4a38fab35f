//! The cache request pipeline.
//!
//! Shared lock and fast-path read; on a miss the shared guard is dropped, the
//! exclusive guard is taken and the entry re-checked before fetching, then a
//! fresh shared guard is taken to serve. Guards are never upgraded in place.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use tokio_util::io::ReaderStream;

use mediacache_core::{CacheError, CacheKey, CacheStore, SharedGuard, Tally};

use crate::app_state::AppState;
use crate::delivery::{Delivery, MeteredStream};
use crate::responder::{CacheStatus, Conditions, Reply, ReplyBody, ReplyKind};

const INVALID_PATH: &str = "invalid path";
const FETCH_FAILED: &str = "error fetching file";
const SERVE_FAILED: &str = "error serving file";

pub(crate) async fn handle_cache(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let key = match state.rules().derive(uri.path(), uri.query()) {
        Ok(key) => key,
        Err(err) => {
            tracing::warn!(target: "mediacache::proxy", path = %uri.path(), error = %err, "rejecting request");
            state.registry().totals().error(0);
            return plain(StatusCode::BAD_REQUEST, INVALID_PATH);
        }
    };

    let entry = state.registry().entry(key.as_str());
    let tally = state.registry().tally(&entry);
    tally.requested();

    let conditions = match Conditions::from_request(&method, &headers) {
        Ok(conditions) => conditions,
        Err(err) => {
            tracing::warn!(target: "mediacache::proxy", key = %key, error = %err, "bad conditional header");
            return fail(tally, &key, StatusCode::BAD_REQUEST, &err.to_string());
        }
    };

    let shared = entry.acquire_shared().await;
    match state.store().read(&key).await {
        Ok(stored) if !stored.meta.is_stale(state.max_age()) => {
            match state.responder().serve(stored, &conditions, CacheStatus::Hit).await {
                Ok(reply) => return deliver(&state, &key, tally, reply, shared, CacheStatus::Hit).await,
                Err(err) => {
                    tracing::warn!(target: "mediacache::proxy", key = %key, error = %err, "cached entry unusable");
                }
            }
        }
        Ok(_) => tracing::debug!(target: "mediacache::proxy", key = %key, "entry expired"),
        Err(err) if err.is_not_found() => {}
        Err(err) => {
            tracing::warn!(target: "mediacache::proxy", key = %key, error = %err, "reading cached entry failed");
        }
    }
    drop(shared);

    let exclusive = entry.acquire_exclusive().await;
    let populated = populate(&state, &key, &tally).await;
    exclusive.release();
    if let Err(err) = populated {
        tracing::error!(target: "mediacache::proxy", key = %key, error = %err, "error fetching file");
        return fail(tally, &key, StatusCode::INTERNAL_SERVER_ERROR, FETCH_FAILED);
    }

    let shared = entry.acquire_shared().await;
    let served = match state.store().read(&key).await {
        Ok(stored) => state.responder().serve(stored, &conditions, CacheStatus::Miss).await,
        Err(err) => Err(err),
    };
    match served {
        Ok(reply) => deliver(&state, &key, tally, reply, shared, CacheStatus::Miss).await,
        Err(err) => {
            tracing::error!(target: "mediacache::proxy", key = %key, error = %err, "error serving file");
            fail(tally, &key, StatusCode::INTERNAL_SERVER_ERROR, SERVE_FAILED)
        }
    }
}

/// Makes sure a fresh, servable entry exists. Must run under the exclusive
/// guard; the entry is re-read since an earlier holder may have replaced it.
async fn populate(state: &AppState, key: &CacheKey, tally: &Tally) -> Result<(), CacheError> {
    let store = state.store();
    match store.read(key).await {
        Ok(stored) => match stored.meta.status_code() {
            // another request populated the entry while we waited
            Ok(_) if !stored.meta.is_stale(state.max_age()) => return Ok(()),
            Ok(_) => {
                tracing::info!(target: "mediacache::proxy", key = %key, retrieved = %stored.meta.retrieved, "removing expired entry");
            }
            Err(err) => {
                tracing::warn!(target: "mediacache::proxy", key = %key, error = %err, "replacing unusable entry");
            }
        },
        Err(err) if err.is_not_found() => {}
        Err(err) => {
            tracing::warn!(target: "mediacache::proxy", key = %key, error = %err, "replacing unreadable entry");
        }
    }
    // clears half pairs too
    store.remove(key).await;

    let outcome = state.fetcher().fetch(key).await?;
    tally.received(outcome.bytes);
    tracing::info!(
        target: "mediacache::proxy",
        key = %key,
        url = %outcome.url,
        status = outcome.status,
        bytes = outcome.bytes,
        "fetched"
    );
    Ok(())
}

async fn deliver(
    state: &AppState,
    key: &CacheKey,
    tally: Tally,
    reply: Reply,
    guard: SharedGuard,
    cache: CacheStatus,
) -> Response {
    let Reply {
        status,
        headers,
        body,
        kind,
    } = reply;
    let delivery = Delivery::new(tally, key.as_str(), cache, status.as_u16());
    let body = match body {
        ReplyBody::File { reader, len } => {
            let delivery = delivery.expect(len).hold(guard);
            let (store, key) = (state.store().clone(), key.clone());
            let stream = MeteredStream::new(ReaderStream::new(reader), delivery)
                .on_finish(async move { touch(&store, &key).await });
            Body::from_stream(stream)
        }
        ReplyBody::Text(text) => {
            if kind == ReplyKind::Served {
                touch(state.store(), key).await;
            }
            settle(delivery, kind, text.len() as u64);
            Body::from(text)
        }
        ReplyBody::Empty => {
            if kind == ReplyKind::Served {
                touch(state.store(), key).await;
            }
            settle(delivery, kind, 0);
            Body::empty()
        }
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Marks the entry as used for the janitor's eviction score.
async fn touch(store: &CacheStore, key: &CacheKey) {
    if let Err(err) = store.touch(key).await {
        tracing::warn!(target: "mediacache::proxy", key = %key, error = %err, "failed to touch entry");
    }
}

fn settle(mut delivery: Delivery, kind: ReplyKind, bytes: u64) {
    match kind {
        ReplyKind::BadRange => delivery.reject(bytes),
        ReplyKind::Served | ReplyKind::NotModified => delivery.finish(bytes),
    }
}

/// Error reply for a counted request.
fn fail(tally: Tally, key: &CacheKey, status: StatusCode, text: &str) -> Response {
    let mut delivery = Delivery::new(tally, key.as_str(), CacheStatus::Miss, status.as_u16());
    delivery.reject(text.len() as u64);
    plain(status, text)
}

pub(crate) fn plain(status: StatusCode, text: &str) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        text.to_string(),
    )
        .into_response()
}
