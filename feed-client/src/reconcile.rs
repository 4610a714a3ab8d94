//! Reconciliation of responses, broadcasts and reconnects.
//!
//! - [`Reconciler`] holds dedup tickets for locally applied responses.
//! - [`Hydrator`] runs batch hydration of own capabilities through the
//!   [`HydrationThrottle`] window, on tokio timers.
//! - [`resync`] re-reads every active entity after a reconnect and collects
//!   the outcome into one [`RecoveryReport`].

use feed_core::{DedupKey, DedupQueue, HydrationThrottle, RecoveryReport, ThrottleDecision};
use feed_types::Fid;
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::api::FeedsApi;
use crate::registry::ActiveRegistry;

/// Outstanding dedup tickets.
///
/// Tickets expire after the configured TTL, so an echo that never arrives
/// cannot suppress a later genuine change with the same key.
#[derive(Debug, Default)]
pub struct Reconciler {
    queue: Mutex<DedupQueue>,
}

impl Reconciler {
    /// Create a reconciler whose tickets expire after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            queue: Mutex::new(DedupQueue::new(ttl)),
        }
    }

    /// Record a ticket for a response about to be applied ahead of its echo.
    pub fn expect_echo(&self, key: DedupKey) {
        tracing::trace!("recording dedup ticket {}", key.as_str());
        self.queue.lock().push(key, Instant::now().into_std());
    }

    /// Withdraw a ticket whose response turned out to change nothing.
    pub fn cancel(&self, key: &DedupKey) {
        if self.queue.lock().cancel(key) {
            tracing::trace!("withdrew dedup ticket {}", key.as_str());
        }
    }

    /// Whether a broadcast echoes a change already applied.
    ///
    /// Consumes the matching ticket, so each ticket suppresses one event.
    pub fn is_echo(&self, key: &DedupKey) -> bool {
        let echo = self.queue.lock().consume(key, Instant::now().into_std());
        if echo {
            tracing::debug!("suppressing echo {}", key.as_str());
        }
        echo
    }

    /// Number of outstanding tickets, expired ones dropped.
    pub fn pending(&self) -> usize {
        let mut queue = self.queue.lock();
        queue.prune(Instant::now().into_std());
        queue.len()
    }

    /// Drop every ticket.
    pub fn clear(&self) {
        self.queue.lock().clear();
    }
}

struct HydratorInner {
    throttle: Mutex<HydrationThrottle<Fid>>,
    api: Arc<dyn FeedsApi>,
    registry: Arc<ActiveRegistry>,
}

/// Batch hydration of feed capabilities.
#[derive(Clone)]
pub struct Hydrator {
    inner: Arc<HydratorInner>,
}

impl std::fmt::Debug for Hydrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hydrator")
            .field("pending", &self.inner.throttle.lock().pending_len())
            .finish()
    }
}

impl Hydrator {
    /// Create a hydrator with the given coalescing window.
    pub fn new(api: Arc<dyn FeedsApi>, registry: Arc<ActiveRegistry>, window: Duration) -> Self {
        Self {
            inner: Arc::new(HydratorInner {
                throttle: Mutex::new(HydrationThrottle::new(window)),
                api,
                registry,
            }),
        }
    }

    /// Request capabilities for these feeds.
    ///
    /// The first batch goes out at once; later requests inside the window
    /// are flushed together when it closes.
    pub fn request(&self, fids: Vec<Fid>) {
        if fids.is_empty() {
            return;
        }
        let now = Instant::now().into_std();
        let decision = self.inner.throttle.lock().request(fids, now);
        match decision {
            ThrottleDecision::Fire(batch) => {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move { run_batch(&inner, batch).await });
            }
            ThrottleDecision::Schedule { at } => {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    tokio::time::sleep_until(Instant::from_std(at)).await;
                    let batch = inner.throttle.lock().flush(Instant::now().into_std());
                    if let Some(batch) = batch {
                        run_batch(&inner, batch).await;
                    }
                });
            }
            ThrottleDecision::Queued | ThrottleDecision::Nothing => {}
        }
    }
}

async fn run_batch(inner: &HydratorInner, batch: Vec<Fid>) {
    tracing::debug!("hydrating capabilities for {} feeds", batch.len());
    match inner.api.own_capabilities(&batch).await {
        Ok(capabilities) => {
            let mut updated = 0;
            for (fid, caps) in capabilities {
                if let Some(feed) = inner.registry.feed(&fid) {
                    if feed.apply_capabilities(caps) {
                        updated += 1;
                    }
                }
            }
            tracing::debug!("hydration updated {} of {} feeds", updated, batch.len());
        }
        Err(e) => {
            tracing::warn!("capability hydration failed for {} feeds: {}", batch.len(), e);
        }
    }
    inner.throttle.lock().forget(&batch);
}

/// Re-read every active entity.
///
/// Feeds in `watched` ask for live delivery on `connection_id` again, as do
/// feeds watched since the snapshot was taken. Each
/// entity is resynchronized independently; one failure never stops the
/// others.
pub async fn resync(
    api: &dyn FeedsApi,
    registry: &ActiveRegistry,
    connection_id: Option<String>,
    watched: &HashSet<Fid>,
) -> RecoveryReport {
    let feeds = registry.feeds().into_iter().map(|feed| {
        let watch = watched.contains(feed.fid()) || feed.is_watched();
        let connection_id = if watch { connection_id.clone() } else { None };
        async move {
            let result = api
                .get_or_create_feed(feed.fid(), watch, connection_id)
                .await
                .map(|response| {
                    feed.apply_response(response, watch);
                });
            (feed.fid().to_string(), result)
        }
    });
    let polls = registry.polls().into_iter().map(|poll| async move {
        let result = api.get_poll(poll.id()).await.map(|data| {
            poll.apply_response(data);
        });
        (poll.id().to_string(), result)
    });

    let (feeds, polls) = tokio::join!(join_all(feeds), join_all(polls));
    let report = RecoveryReport::collect(feeds.into_iter().chain(polls));
    tracing::info!(
        "resynchronized {} of {} entities",
        report.succeeded(),
        report.attempted
    );
    report
}
