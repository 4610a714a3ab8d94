//! Active entity registry.
//!
//! Entities are created on first reference (a caller asking for them, or a
//! "created" event) and stay resident until an explicit deletion removes
//! them.

use dashmap::DashMap;
use feed_types::{Fid, PollId};

use crate::feed::Feed;
use crate::poll::Poll;

/// Live feeds and polls, keyed by id.
#[derive(Debug, Default)]
pub struct ActiveRegistry {
    feeds: DashMap<Fid, Feed>,
    polls: DashMap<PollId, Poll>,
}

impl ActiveRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The feed, created if absent.
    pub fn feed_or_create(&self, fid: &Fid) -> Feed {
        self.feeds
            .entry(fid.clone())
            .or_insert_with(|| Feed::new(fid.clone()))
            .clone()
    }

    /// The feed, if live.
    pub fn feed(&self, fid: &Fid) -> Option<Feed> {
        self.feeds.get(fid).map(|f| f.clone())
    }

    /// Remove a feed.
    pub fn remove_feed(&self, fid: &Fid) -> Option<Feed> {
        self.feeds.remove(fid).map(|(_, f)| f)
    }

    /// Every live feed.
    pub fn feeds(&self) -> Vec<Feed> {
        self.feeds.iter().map(|f| f.value().clone()).collect()
    }

    /// Fids of feeds currently watched.
    pub fn watched(&self) -> Vec<Fid> {
        self.feeds
            .iter()
            .filter(|f| f.is_watched())
            .map(|f| f.key().clone())
            .collect()
    }

    /// The poll, created if absent.
    pub fn poll_or_create(&self, id: &PollId) -> Poll {
        self.polls
            .entry(id.clone())
            .or_insert_with(|| Poll::new(id.clone()))
            .clone()
    }

    /// The poll, if live.
    pub fn poll(&self, id: &PollId) -> Option<Poll> {
        self.polls.get(id).map(|p| p.clone())
    }

    /// Remove a poll.
    pub fn remove_poll(&self, id: &PollId) -> Option<Poll> {
        self.polls.remove(id).map(|(_, p)| p)
    }

    /// Every live poll.
    pub fn polls(&self) -> Vec<Poll> {
        self.polls.iter().map(|p| p.value().clone()).collect()
    }

    /// Drop every entity.
    pub fn clear(&self) {
        self.feeds.clear();
        self.polls.clear();
    }
}
