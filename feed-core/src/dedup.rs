//! Deduplication of locally applied changes against their broadcast echo.
//!
//! When the client applies the response of its own state-changing request,
//! the server also broadcasts the same change. A ticket keyed by the
//! operation and the entities it touches is recorded for the response; the
//! first matching echo consumes the ticket and is skipped.
//!
//! Tickets are only recorded while the affected entity is watched, because
//! only then is an echo expected. Tickets are short-lived: one that is not
//! consumed within its TTL expires, and a missing or expired ticket means
//! the event is a genuine external change.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use feed_types::{ActivityId, Fid, PollId};

/// Deterministic key identifying one logical change.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey(String);

impl DedupKey {
    /// `follow:{source}-{target}`
    pub fn follow(source: &Fid, target: &Fid) -> Self {
        Self(format!("follow:{source}-{target}"))
    }

    /// `unfollow:{source}-{target}`
    pub fn unfollow(source: &Fid, target: &Fid) -> Self {
        Self(format!("unfollow:{source}-{target}"))
    }

    /// `activity:{fid}-{activity}`
    pub fn activity_added(fid: &Fid, activity: &ActivityId) -> Self {
        Self(format!("activity:{fid}-{activity}"))
    }

    /// `vote:{poll}-{vote}`
    pub fn vote_casted(poll: &PollId, vote_id: &str) -> Self {
        Self(format!("vote:{poll}-{vote_id}"))
    }

    /// The key as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// How long a ticket waits for its echo by default.
pub const DEFAULT_TICKET_TTL: Duration = Duration::from_secs(30);

/// Set of outstanding dedup tickets, each stamped with its insertion time.
#[derive(Debug)]
pub struct DedupQueue {
    tickets: HashMap<DedupKey, Instant>,
    ttl: Duration,
}

impl Default for DedupQueue {
    fn default() -> Self {
        Self::new(DEFAULT_TICKET_TTL)
    }
}

impl DedupQueue {
    /// Create an empty queue whose tickets expire after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            tickets: HashMap::new(),
            ttl,
        }
    }

    /// Ticket lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Record a ticket for a locally applied change.
    ///
    /// Expired tickets are pruned first. Returns `false` if an identical
    /// live ticket was already outstanding; its stamp is refreshed.
    pub fn push(&mut self, key: DedupKey, now: Instant) -> bool {
        self.prune(now);
        self.tickets.insert(key, now).is_none()
    }

    /// Consume the ticket matching a broadcast event.
    ///
    /// Returns `true` if the event echoes a change already applied and must
    /// be skipped. An expired ticket is dropped and does not match.
    pub fn consume(&mut self, key: &DedupKey, now: Instant) -> bool {
        match self.tickets.remove(key) {
            Some(at) => !self.is_expired(at, now),
            None => false,
        }
    }

    /// Drop a ticket without treating anything as an echo.
    pub fn cancel(&mut self, key: &DedupKey) -> bool {
        self.tickets.remove(key).is_some()
    }

    /// Whether a live ticket is outstanding.
    pub fn contains(&self, key: &DedupKey, now: Instant) -> bool {
        self.tickets
            .get(key)
            .is_some_and(|at| !self.is_expired(*at, now))
    }

    /// Drop every expired ticket. Returns how many were dropped.
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.tickets.len();
        let ttl = self.ttl;
        self.tickets
            .retain(|_, at| now.saturating_duration_since(*at) < ttl);
        before - self.tickets.len()
    }

    /// Number of stored tickets, expired ones included until pruned.
    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    /// Whether no tickets are stored.
    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }

    /// Drop every ticket.
    pub fn clear(&mut self) {
        self.tickets.clear();
    }

    fn is_expired(&self, at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(at) >= self.ttl
    }
}
