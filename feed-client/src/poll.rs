//! Poll entity.

use feed_core::{adopt_broadcast, merge_broadcast};
use feed_types::{PollData, PollId, PollVoteData, WsEvent};
use std::sync::Arc;

use crate::store::{StateStore, StoreSubscription};

/// Snapshot of one poll.
#[derive(Debug, Clone, PartialEq)]
pub struct PollState {
    /// The poll's id.
    pub id: PollId,
    /// Attributes and tallies, once read or received.
    pub poll: Option<PollData>,
}

/// Live handle to one poll's state.
#[derive(Debug, Clone)]
pub struct Poll {
    id: PollId,
    store: StateStore<PollState>,
}

impl Poll {
    pub(crate) fn new(id: PollId) -> Self {
        Self {
            store: StateStore::new(PollState {
                id: id.clone(),
                poll: None,
            }),
            id,
        }
    }

    /// The poll's id.
    pub fn id(&self) -> &PollId {
        &self.id
    }

    /// Latest snapshot.
    pub fn state(&self) -> Arc<PollState> {
        self.store.get()
    }

    /// Listen for every change.
    pub fn subscribe<F>(&self, listener: F) -> StoreSubscription<PollState>
    where
        F: Fn(&Arc<PollState>, &Arc<PollState>) + Send + Sync + 'static,
    {
        self.store.subscribe(listener)
    }

    /// Listen for changes to one projection of the snapshot.
    pub fn subscribe_with_selector<S, Sel, F>(
        &self,
        selector: Sel,
        handler: F,
    ) -> StoreSubscription<PollState>
    where
        S: PartialEq + Send + 'static,
        Sel: Fn(&PollState) -> S + Send + Sync + 'static,
        F: Fn(&S, &S) + Send + Sync + 'static,
    {
        self.store.subscribe_with_selector(selector, handler)
    }

    /// Apply a read response; its own votes replace what is held.
    pub(crate) fn apply_response(&self, poll: PollData) -> bool {
        self.store.update(|s| {
            let poll = match &s.poll {
                Some(current) if current.updated_at > poll.updated_at => return None,
                _ => poll,
            };
            (s.poll.as_ref() != Some(&poll)).then(|| PollState {
                id: s.id.clone(),
                poll: Some(poll),
            })
        })
    }

    /// Apply the response of the user's own vote.
    pub(crate) fn apply_vote(&self, poll: PollData, vote: &PollVoteData) -> bool {
        self.store.update(|s| {
            let mut next = match &s.poll {
                Some(current) if current.updated_at > poll.updated_at => current.clone(),
                _ => poll,
            };
            if !next.own_votes.iter().any(|v| v.id == vote.id) {
                next.own_votes.push(vote.clone());
            }
            (s.poll.as_ref() != Some(&next)).then(|| PollState {
                id: s.id.clone(),
                poll: Some(next),
            })
        })
    }

    /// Apply a broadcast event addressed to this poll.
    pub(crate) fn handle_event(&self, event: &WsEvent) -> bool {
        match event {
            WsEvent::PollUpdated { poll }
            | WsEvent::PollClosed { poll }
            | WsEvent::PollVoteCasted { poll, .. }
            | WsEvent::PollVoteRemoved { poll, .. } => {
                if poll.id != self.id {
                    return false;
                }
                self.store.update(|s| {
                    let merged = match &s.poll {
                        None => adopt_broadcast(poll.clone()),
                        Some(current) => merge_broadcast(current, poll.clone())?,
                    };
                    (s.poll.as_ref() != Some(&merged)).then(|| PollState {
                        id: s.id.clone(),
                        poll: Some(merged),
                    })
                })
            }
            WsEvent::PollDeleted { poll } => {
                if poll.id != self.id {
                    return false;
                }
                self.store.update(|s| {
                    s.poll.is_some().then(|| PollState {
                        id: s.id.clone(),
                        poll: None,
                    })
                })
            }
            WsEvent::FeedCreated { .. }
            | WsEvent::FeedUpdated { .. }
            | WsEvent::FeedDeleted { .. }
            | WsEvent::ActivityAdded { .. }
            | WsEvent::ActivityUpdated { .. }
            | WsEvent::ActivityDeleted { .. }
            | WsEvent::ReactionAdded { .. }
            | WsEvent::ReactionDeleted { .. }
            | WsEvent::FollowCreated { .. }
            | WsEvent::FollowDeleted { .. }
            | WsEvent::NotificationFeedUpdated { .. }
            | WsEvent::ConnectionOk(_)
            | WsEvent::ConnectionError(_)
            | WsEvent::HealthCheck(_)
            | WsEvent::Unknown => false,
        }
    }
}
