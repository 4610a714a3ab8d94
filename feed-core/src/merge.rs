//! Snapshot merge rules.
//!
//! An incoming version replaces the current one only if its `updated_at` is
//! not older; equal timestamps are accepted so re-applying the same version
//! is harmless. Broadcast payloads never carry the requester's `own_*` view,
//! so those fields are carried over from the current version and only
//! change through responses or hydration.

use std::collections::BTreeSet;

use feed_types::{ActivityData, FeedData, FollowData, PollData};

/// Entities with a server-provided freshness timestamp.
pub trait Fresh {
    /// Milliseconds since the Unix epoch of the last server-side change.
    fn updated_at(&self) -> u64;
}

/// Entities with fields scoped to the requesting user.
pub trait OwnScoped {
    /// Copy every `own_*` field from `previous` into `self`.
    fn keep_own_fields(&mut self, previous: &Self);

    /// Drop every `own_*` field.
    fn clear_own_fields(&mut self);
}

impl Fresh for FeedData {
    fn updated_at(&self) -> u64 {
        self.updated_at
    }
}

impl Fresh for ActivityData {
    fn updated_at(&self) -> u64 {
        self.updated_at
    }
}

impl Fresh for PollData {
    fn updated_at(&self) -> u64 {
        self.updated_at
    }
}

impl Fresh for FollowData {
    fn updated_at(&self) -> u64 {
        self.updated_at
    }
}

impl OwnScoped for FeedData {
    fn keep_own_fields(&mut self, previous: &Self) {
        self.own_capabilities = previous.own_capabilities.clone();
        self.own_follows = previous.own_follows.clone();
    }

    fn clear_own_fields(&mut self) {
        self.own_capabilities = None;
        self.own_follows = None;
    }
}

impl OwnScoped for ActivityData {
    fn keep_own_fields(&mut self, previous: &Self) {
        self.own_reactions = previous.own_reactions.clone();
    }

    fn clear_own_fields(&mut self) {
        self.own_reactions.clear();
    }
}

impl OwnScoped for PollData {
    fn keep_own_fields(&mut self, previous: &Self) {
        self.own_votes = previous.own_votes.clone();
    }

    fn clear_own_fields(&mut self) {
        self.own_votes.clear();
    }
}

/// Whether `incoming` may replace `current`.
pub fn is_fresh<T: Fresh>(current: &T, incoming: &T) -> bool {
    incoming.updated_at() >= current.updated_at()
}

/// Merge a broadcast version into the current one.
///
/// Returns `None` if the broadcast is older than what is held.
pub fn merge_broadcast<T: Fresh + OwnScoped>(current: &T, mut incoming: T) -> Option<T> {
    if !is_fresh(current, &incoming) {
        return None;
    }
    incoming.keep_own_fields(current);
    Some(incoming)
}

/// First version of an entity seen through a broadcast.
///
/// Nothing is held yet to carry `own_*` fields over from, so they start
/// empty and are filled by hydration or a direct response.
pub fn adopt_broadcast<T: OwnScoped>(mut incoming: T) -> T {
    incoming.clear_own_fields();
    incoming
}

/// Merge a direct response into the current feed.
///
/// Responses are made on the requester's behalf, so their `own_*` fields
/// replace the current ones when present.
pub fn merge_feed_response(current: Option<&FeedData>, mut incoming: FeedData) -> Option<FeedData> {
    match current {
        None => Some(incoming),
        Some(current) if !is_fresh(current, &incoming) => None,
        Some(current) => {
            if incoming.own_capabilities.is_none() {
                incoming.own_capabilities = current.own_capabilities.clone();
            }
            if incoming.own_follows.is_none() {
                incoming.own_follows = current.own_follows.clone();
            }
            Some(incoming)
        }
    }
}

/// Order-insensitive membership comparison.
pub fn same_members(a: &[String], b: &[String]) -> bool {
    let a: BTreeSet<&str> = a.iter().map(String::as_str).collect();
    let b: BTreeSet<&str> = b.iter().map(String::as_str).collect();
    a == b
}

/// Whether hydrated capabilities differ from what the feed holds.
pub fn capabilities_changed(current: Option<&[String]>, hydrated: &[String]) -> bool {
    match current {
        None => true,
        Some(current) => !same_members(current, hydrated),
    }
}
