//! Accounting for a response body as it reaches the client.
//!
//! A [`Delivery`] travels with the response. It owns the shared guard for
//! the key, so the entry stays locked until the body has been fully sent or
//! dropped, and it records exactly one outcome in the stats when it goes away.

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, Stream};
use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Instant;

use mediacache_core::{SharedGuard, Tally};
use mediacache_otel::ACCESS_TARGET;

use crate::responder::CacheStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Streaming,
    Finished,
    /// Reading the body failed mid-stream.
    Failed,
    /// The request was answered with an error reply.
    Rejected,
}

#[derive(Debug)]
pub struct Delivery {
    tally: Tally,
    key: String,
    cache: CacheStatus,
    status: u16,
    expected: u64,
    sent: u64,
    state: DeliveryState,
    started: Instant,
    _guard: Option<SharedGuard>,
}

impl Delivery {
    pub fn new(tally: Tally, key: impl Into<String>, cache: CacheStatus, status: u16) -> Self {
        Self {
            tally,
            key: key.into(),
            cache,
            status,
            expected: 0,
            sent: 0,
            state: DeliveryState::Streaming,
            started: Instant::now(),
            _guard: None,
        }
    }

    /// Keeps `guard` alive until the delivery is dropped.
    pub fn hold(mut self, guard: SharedGuard) -> Self {
        self._guard = Some(guard);
        self
    }

    pub fn expect(mut self, bytes: u64) -> Self {
        self.expected = bytes;
        self
    }

    /// Body handed over in one piece.
    pub fn finish(&mut self, bytes: u64) {
        self.sent += bytes;
        self.state = DeliveryState::Finished;
    }

    pub fn reject(&mut self, bytes: u64) {
        self.sent += bytes;
        self.state = DeliveryState::Rejected;
    }

    fn record_chunk(&mut self, bytes: u64) {
        self.sent += bytes;
        if self.sent >= self.expected {
            self.state = DeliveryState::Finished;
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        let counted = |tally: &Tally, sent| match self.cache {
            CacheStatus::Hit => tally.hit(sent),
            CacheStatus::Miss => tally.miss(sent),
        };
        match self.state {
            DeliveryState::Finished => counted(&self.tally, self.sent),
            DeliveryState::Streaming => {
                // client went away before the body ended
                self.tally.disconnect();
                counted(&self.tally, self.sent);
            }
            DeliveryState::Failed | DeliveryState::Rejected => self.tally.error(self.sent),
        }
        self.tally.completed();
        tracing::info!(
            target: ACCESS_TARGET,
            key = %self.key,
            cache = self.cache.as_str(),
            status = self.status,
            sent = self.sent,
            outcome = ?self.state,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "delivered"
        );
    }
}

/// Wraps a file body stream and feeds its progress into a [`Delivery`].
///
/// An `on_finish` hook runs after the inner stream ends cleanly and before the
/// body reports its end, so it completes while the delivery (and its guard) is
/// still alive. It never runs after a read error or an early drop.
pub struct MeteredStream<S> {
    inner: S,
    delivery: Delivery,
    on_finish: Option<BoxFuture<'static, ()>>,
    drained: bool,
}

impl<S> MeteredStream<S> {
    pub fn new(inner: S, delivery: Delivery) -> Self {
        Self {
            inner,
            delivery,
            on_finish: None,
            drained: false,
        }
    }

    pub fn on_finish(mut self, hook: impl Future<Output = ()> + Send + 'static) -> Self {
        self.on_finish = Some(hook.boxed());
        self
    }
}

impl<S> Stream for MeteredStream<S>
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin,
{
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if !this.drained {
            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(chunk)) => {
                    this.delivery.record_chunk(chunk.len() as u64);
                    return Poll::Ready(Some(Ok(chunk)));
                }
                Some(Err(err)) => {
                    tracing::warn!(
                        target: "mediacache::serve",
                        key = %this.delivery.key,
                        error = %err,
                        "error streaming cached file"
                    );
                    this.delivery.state = DeliveryState::Failed;
                    this.on_finish = None;
                    return Poll::Ready(Some(Err(err)));
                }
                None => this.drained = true,
            }
        }
        if let Some(hook) = this.on_finish.as_mut() {
            ready!(hook.as_mut().poll(cx));
            this.on_finish = None;
        }
        if this.delivery.state == DeliveryState::Streaming {
            this.delivery.state = DeliveryState::Finished;
        }
        Poll::Ready(None)
    }
}
