//! Coalescing window for batch hydration requests.
//!
//! Derived per-entity fields that events do not carry inline are fetched in
//! batches. The first request fires immediately. Ids requested while the
//! window since the last batch is still open are accumulated and flushed as
//! one batch when it closes, so at most one batch goes out per window.
//!
//! The throttle is pure: callers pass the current [`Instant`] and run the
//! returned decision themselves.

use std::collections::{BTreeSet, HashSet};
use std::hash::Hash;
use std::time::{Duration, Instant};

/// What the caller should do after a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThrottleDecision<K> {
    /// Send a batch for these ids now.
    Fire(Vec<K>),
    /// Ids were queued; call [`HydrationThrottle::flush`] at this instant.
    Schedule {
        /// When the window closes.
        at: Instant,
    },
    /// Ids joined a batch whose flush is already scheduled.
    Queued,
    /// Every id was already requested.
    Nothing,
}

/// Per-window batch scheduler.
#[derive(Debug)]
pub struct HydrationThrottle<K> {
    window: Duration,
    last_fire: Option<Instant>,
    flush_scheduled: bool,
    pending: BTreeSet<K>,
    requested: HashSet<K>,
}

impl<K: Clone + Ord + Hash> HydrationThrottle<K> {
    /// Create a throttle with the given coalescing window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_fire: None,
            flush_scheduled: false,
            pending: BTreeSet::new(),
            requested: HashSet::new(),
        }
    }

    /// The coalescing window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Request hydration for `ids` at time `now`.
    ///
    /// Ids already requested (fired or pending) are skipped.
    pub fn request<I>(&mut self, ids: I, now: Instant) -> ThrottleDecision<K>
    where
        I: IntoIterator<Item = K>,
    {
        let fresh: Vec<K> = ids
            .into_iter()
            .filter(|id| self.requested.insert(id.clone()))
            .collect();
        if fresh.is_empty() {
            return ThrottleDecision::Nothing;
        }

        if !self.flush_scheduled && self.window_closed(now) {
            self.last_fire = Some(now);
            return ThrottleDecision::Fire(fresh);
        }

        self.pending.extend(fresh);
        if self.flush_scheduled {
            ThrottleDecision::Queued
        } else {
            self.flush_scheduled = true;
            ThrottleDecision::Schedule {
                at: self.last_fire.map_or(now, |t| t + self.window),
            }
        }
    }

    /// Take the accumulated batch once its window has closed.
    pub fn flush(&mut self, now: Instant) -> Option<Vec<K>> {
        self.flush_scheduled = false;
        if self.pending.is_empty() {
            return None;
        }
        self.last_fire = Some(now);
        Some(std::mem::take(&mut self.pending).into_iter().collect())
    }

    /// Allow ids to be requested again (after a failed batch or eviction).
    pub fn forget<'a, I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = &'a K>,
        K: 'a,
    {
        for id in ids {
            self.requested.remove(id);
            self.pending.remove(id);
        }
    }

    /// Number of ids waiting for the next flush.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn window_closed(&self, now: Instant) -> bool {
        self.last_fire
            .map_or(true, |t| now.saturating_duration_since(t) >= self.window)
    }
}
