//! Feed entity.
//!
//! A [`Feed`] owns the snapshot of one feed: its attributes, activities,
//! follow lists, notification counters and watch flag. Every mutator returns
//! whether the snapshot changed; a mutation that changes nothing leaves the
//! store untouched and notifies no one.

use feed_core::{adopt_broadcast, capabilities_changed, merge_broadcast, merge_feed_response};
use feed_types::{
    ActivityData, ActivityId, FeedData, Fid, FollowData, NotificationStatus, WsEvent,
};
use std::sync::Arc;

use crate::api::FeedResponse;
use crate::store::{StateStore, StoreSubscription};

/// Snapshot of one feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedState {
    /// The feed's id.
    pub fid: Fid,
    /// Attributes, once read or received.
    pub feed: Option<FeedData>,
    /// Activities, newest first.
    pub activities: Vec<ActivityData>,
    /// Follows targeting this feed.
    pub followers: Vec<FollowData>,
    /// Follows originating from this feed.
    pub following: Vec<FollowData>,
    /// Counters, for notification feeds.
    pub notification_status: Option<NotificationStatus>,
    /// Live events are delivered for this feed.
    pub watch: bool,
}

impl FeedState {
    fn empty(fid: Fid) -> Self {
        Self {
            fid,
            feed: None,
            activities: Vec::new(),
            followers: Vec::new(),
            following: Vec::new(),
            notification_status: None,
            watch: false,
        }
    }

    /// Activity by id.
    pub fn activity(&self, id: &ActivityId) -> Option<&ActivityData> {
        self.activities.iter().find(|a| &a.id == id)
    }

    /// Whether own-scoped fields are missing and must be hydrated.
    pub fn needs_hydration(&self) -> bool {
        matches!(&self.feed, Some(feed) if feed.own_capabilities.is_none())
    }
}

/// Live handle to one feed's state.
#[derive(Debug, Clone)]
pub struct Feed {
    fid: Fid,
    store: StateStore<FeedState>,
}

impl Feed {
    pub(crate) fn new(fid: Fid) -> Self {
        Self {
            store: StateStore::new(FeedState::empty(fid.clone())),
            fid,
        }
    }

    /// The feed's id.
    pub fn fid(&self) -> &Fid {
        &self.fid
    }

    /// Latest snapshot.
    pub fn state(&self) -> Arc<FeedState> {
        self.store.get()
    }

    /// Whether live events are delivered for this feed.
    pub fn is_watched(&self) -> bool {
        self.store.get().watch
    }

    /// Listen for every change.
    pub fn subscribe<F>(&self, listener: F) -> StoreSubscription<FeedState>
    where
        F: Fn(&Arc<FeedState>, &Arc<FeedState>) + Send + Sync + 'static,
    {
        self.store.subscribe(listener)
    }

    /// Listen for changes to one projection of the snapshot.
    pub fn subscribe_with_selector<S, Sel, F>(
        &self,
        selector: Sel,
        handler: F,
    ) -> StoreSubscription<FeedState>
    where
        S: PartialEq + Send + 'static,
        Sel: Fn(&FeedState) -> S + Send + Sync + 'static,
        F: Fn(&S, &S) + Send + Sync + 'static,
    {
        self.store.subscribe_with_selector(selector, handler)
    }

    pub(crate) fn set_watch(&self, watch: bool) -> bool {
        self.store.update(|s| {
            (s.watch != watch).then(|| FeedState {
                watch,
                ..s.clone()
            })
        })
    }

    /// Apply a direct read of the feed.
    ///
    /// The lists in a response belong to the same version as its feed
    /// attributes, so a response older than the held snapshot changes
    /// nothing but the watch flag.
    pub(crate) fn apply_response(&self, response: FeedResponse, watch: bool) -> bool {
        self.store.update(|s| match merge_feed_response(s.feed.as_ref(), response.feed) {
            Some(feed) => Some(FeedState {
                fid: s.fid.clone(),
                feed: Some(feed),
                activities: response.activities,
                followers: response.followers,
                following: response.following,
                notification_status: response
                    .notification_status
                    .or_else(|| s.notification_status.clone()),
                watch,
            }),
            None => {
                tracing::debug!("ignoring stale read of {}", s.fid);
                Some(FeedState {
                    watch,
                    ..s.clone()
                })
            }
        })
    }

    /// Apply hydrated own capabilities.
    pub(crate) fn apply_capabilities(&self, capabilities: Vec<String>) -> bool {
        self.store.update(|s| {
            let feed = s.feed.as_ref()?;
            if !capabilities_changed(feed.own_capabilities.as_deref(), &capabilities) {
                return None;
            }
            let mut next = s.clone();
            if let Some(feed) = next.feed.as_mut() {
                feed.own_capabilities = Some(capabilities);
            }
            Some(next)
        })
    }

    /// Record a follow touching this feed.
    pub(crate) fn add_follow(&self, follow: &FollowData) -> bool {
        self.store.update(|s| {
            let mut next = s.clone();
            let mut changed = false;
            if follow.target_feed == s.fid {
                changed |= upsert_follow(&mut next.followers, follow);
            }
            if follow.source_feed == s.fid {
                changed |= upsert_follow(&mut next.following, follow);
            }
            changed.then_some(next)
        })
    }

    /// Drop a follow touching this feed.
    pub(crate) fn remove_follow(&self, follow: &FollowData) -> bool {
        self.store.update(|s| {
            let mut next = s.clone();
            next.followers.retain(|f| !f.same_edge(follow));
            next.following.retain(|f| !f.same_edge(follow));
            let changed =
                next.followers.len() != s.followers.len() || next.following.len() != s.following.len();
            changed.then_some(next)
        })
    }

    /// Insert an activity, or refresh it if already held.
    pub(crate) fn add_activity(&self, activity: &ActivityData) -> bool {
        self.store.update(|s| {
            let mut next = s.clone();
            match next.activities.iter().position(|a| a.id == activity.id) {
                Some(at) => {
                    let merged = merge_broadcast(&next.activities[at], activity.clone())?;
                    if merged == next.activities[at] {
                        return None;
                    }
                    next.activities[at] = merged;
                }
                None => next.activities.insert(0, activity.clone()),
            }
            Some(next)
        })
    }

    /// Apply a broadcast event addressed to this feed.
    ///
    /// Events for other feeds and event kinds a feed does not track are
    /// ignored.
    pub(crate) fn handle_event(&self, event: &WsEvent) -> bool {
        match event {
            WsEvent::FeedCreated { feed } | WsEvent::FeedUpdated { feed } => {
                if feed.fid != self.fid {
                    return false;
                }
                self.store.update(|s| {
                    let merged = match &s.feed {
                        None => adopt_broadcast(feed.clone()),
                        Some(current) => merge_broadcast(current, feed.clone())?,
                    };
                    (s.feed.as_ref() != Some(&merged)).then(|| FeedState {
                        feed: Some(merged),
                        ..s.clone()
                    })
                })
            }
            WsEvent::FeedDeleted { fid } => {
                if fid != &self.fid {
                    return false;
                }
                self.store.update(|s| {
                    s.feed.is_some().then(|| FeedState {
                        feed: None,
                        activities: Vec::new(),
                        watch: false,
                        ..s.clone()
                    })
                })
            }
            WsEvent::ActivityAdded { fid, activity } => {
                fid == &self.fid && self.add_activity(&adopt_broadcast(activity.clone()))
            }
            WsEvent::ActivityUpdated { fid, activity }
            | WsEvent::ReactionAdded { fid, activity, .. }
            | WsEvent::ReactionDeleted { fid, activity, .. } => {
                fid == &self.fid && self.update_activity(activity)
            }
            WsEvent::ActivityDeleted { fid, activity } => {
                if fid != &self.fid {
                    return false;
                }
                self.store.update(|s| {
                    let mut next = s.clone();
                    next.activities.retain(|a| a.id != activity.id);
                    (next.activities.len() != s.activities.len()).then_some(next)
                })
            }
            WsEvent::FollowCreated { follow } => self.add_follow(follow),
            WsEvent::FollowDeleted { follow } => self.remove_follow(follow),
            WsEvent::NotificationFeedUpdated {
                fid,
                notification_status,
            } => {
                if fid != &self.fid {
                    return false;
                }
                self.store.update(|s| {
                    (s.notification_status.as_ref() != Some(notification_status)).then(|| {
                        FeedState {
                            notification_status: Some(notification_status.clone()),
                            ..s.clone()
                        }
                    })
                })
            }
            WsEvent::PollUpdated { .. }
            | WsEvent::PollClosed { .. }
            | WsEvent::PollDeleted { .. }
            | WsEvent::PollVoteCasted { .. }
            | WsEvent::PollVoteRemoved { .. }
            | WsEvent::ConnectionOk(_)
            | WsEvent::ConnectionError(_)
            | WsEvent::HealthCheck(_)
            | WsEvent::Unknown => false,
        }
    }

    fn update_activity(&self, activity: &ActivityData) -> bool {
        self.store.update(|s| {
            let at = s.activities.iter().position(|a| a.id == activity.id)?;
            let merged = merge_broadcast(&s.activities[at], activity.clone())?;
            if merged == s.activities[at] {
                return None;
            }
            let mut next = s.clone();
            next.activities[at] = merged;
            Some(next)
        })
    }
}

fn upsert_follow(list: &mut Vec<FollowData>, follow: &FollowData) -> bool {
    match list.iter().position(|f| f.same_edge(follow)) {
        Some(at) if list[at] == *follow => false,
        Some(at) if list[at].updated_at > follow.updated_at => false,
        Some(at) => {
            list[at] = follow.clone();
            true
        }
        None => {
            list.push(follow.clone());
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fid() -> Fid {
        Fid::new("user", "alice")
    }

    fn activity(id: &str, updated_at: u64) -> ActivityData {
        ActivityData {
            id: ActivityId::new(id),
            feeds: vec![fid()],
            user_id: None,
            text: Some(format!("text {id}")),
            reaction_counts: Default::default(),
            poll_id: None,
            created_at: 1,
            updated_at,
            own_reactions: Vec::new(),
        }
    }

    fn counting(feed: &Feed) -> Arc<AtomicUsize> {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        feed.subscribe(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        calls
    }

    // ===========================================
    // Feed attributes
    // ===========================================

    #[test]
    fn stale_feed_update_is_ignored() {
        let feed = Feed::new(fid());
        let calls = counting(&feed);

        let mut newer = FeedData::new(fid(), 10);
        newer.follower_count = 4;
        assert!(feed.handle_event(&WsEvent::FeedUpdated { feed: newer }));

        let mut older = FeedData::new(fid(), 9);
        older.follower_count = 1;
        assert!(!feed.handle_event(&WsEvent::FeedUpdated { feed: older }));

        assert_eq!(feed.state().feed.as_ref().unwrap().follower_count, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn equal_timestamp_update_is_accepted() {
        let feed = Feed::new(fid());
        feed.handle_event(&WsEvent::FeedUpdated {
            feed: FeedData::new(fid(), 10),
        });
        let mut same_time = FeedData::new(fid(), 10);
        same_time.name = Some("Alice".into());
        assert!(feed.handle_event(&WsEvent::FeedUpdated { feed: same_time }));
        assert_eq!(feed.state().feed.as_ref().unwrap().name.as_deref(), Some("Alice"));
    }

    #[test]
    fn broadcast_does_not_touch_own_capabilities() {
        let feed = Feed::new(fid());
        let mut response = FeedResponse::new(FeedData::new(fid(), 1));
        response.feed.own_capabilities = Some(vec!["add-activity".into()]);
        feed.apply_response(response, true);

        feed.handle_event(&WsEvent::FeedUpdated {
            feed: FeedData::new(fid(), 2),
        });

        let state = feed.state();
        assert_eq!(
            state.feed.as_ref().unwrap().own_capabilities,
            Some(vec!["add-activity".to_string()])
        );
        assert!(state.watch);
    }

    #[test]
    fn events_for_other_feeds_are_ignored() {
        let feed = Feed::new(fid());
        assert!(!feed.handle_event(&WsEvent::FeedUpdated {
            feed: FeedData::new(Fid::new("user", "bob"), 1)
        }));
        assert!(!feed.handle_event(&WsEvent::Unknown));
    }

    #[test]
    fn capabilities_compare_ignoring_order() {
        let feed = Feed::new(fid());
        feed.handle_event(&WsEvent::FeedCreated {
            feed: FeedData::new(fid(), 1),
        });
        assert!(feed.state().needs_hydration());

        assert!(feed.apply_capabilities(vec!["a".into(), "b".into()]));
        assert!(!feed.apply_capabilities(vec!["b".into(), "a".into()]));
        assert!(!feed.state().needs_hydration());
    }

    #[test]
    fn first_broadcast_leaves_own_capabilities_to_hydration() {
        let feed = Feed::new(fid());
        let mut created = FeedData::new(fid(), 1);
        created.own_capabilities = Some(vec!["delete-feed".into()]);
        created.own_follows = Some(Vec::new());
        assert!(feed.handle_event(&WsEvent::FeedCreated { feed: created }));

        let state = feed.state();
        let held = state.feed.as_ref().unwrap();
        assert_eq!(held.own_capabilities, None);
        assert_eq!(held.own_follows, None);
        assert!(state.needs_hydration());
    }

    #[test]
    fn stale_read_keeps_newer_lists() {
        let feed = Feed::new(fid());
        let mut fresh = FeedResponse::new(FeedData::new(fid(), 10));
        fresh.activities = vec![activity("a2", 10), activity("a1", 5)];
        assert!(feed.apply_response(fresh, false));

        let mut stale = FeedResponse::new(FeedData::new(fid(), 4));
        stale.activities = vec![activity("a1", 5)];
        assert!(feed.apply_response(stale.clone(), true));

        let state = feed.state();
        assert_eq!(state.feed.as_ref().unwrap().updated_at, 10);
        assert_eq!(state.activities.len(), 2);
        assert!(state.watch);

        assert!(!feed.apply_response(stale, true));
    }

    // ===========================================
    // Activities
    // ===========================================

    #[test]
    fn activity_added_twice_changes_state_once() {
        let feed = Feed::new(fid());
        let calls = counting(&feed);
        let event = WsEvent::ActivityAdded {
            fid: fid(),
            activity: activity("a1", 1),
        };

        assert!(feed.handle_event(&event));
        assert!(!feed.handle_event(&event));
        assert_eq!(feed.state().activities.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn newest_activity_comes_first() {
        let feed = Feed::new(fid());
        feed.add_activity(&activity("a1", 1));
        feed.add_activity(&activity("a2", 2));
        let ids: Vec<_> = feed.state().activities.iter().map(|a| a.id.to_string()).collect();
        assert_eq!(ids, vec!["a2", "a1"]);
    }

    #[test]
    fn activity_update_and_delete() {
        let feed = Feed::new(fid());
        feed.add_activity(&activity("a1", 1));

        let mut edited = activity("a1", 2);
        edited.text = Some("edited".into());
        assert!(feed.handle_event(&WsEvent::ActivityUpdated {
            fid: fid(),
            activity: edited
        }));
        assert_eq!(
            feed.state().activity(&ActivityId::new("a1")).unwrap().text.as_deref(),
            Some("edited")
        );

        assert!(feed.handle_event(&WsEvent::ActivityDeleted {
            fid: fid(),
            activity: activity("a1", 3)
        }));
        assert!(feed.state().activities.is_empty());
    }

    // ===========================================
    // Follows
    // ===========================================

    #[test]
    fn follow_lands_on_the_right_list() {
        let feed = Feed::new(fid());
        let bob = Fid::new("timeline", "bob");

        assert!(feed.add_follow(&FollowData::new(bob.clone(), fid(), 1)));
        assert!(feed.add_follow(&FollowData::new(fid(), bob.clone(), 1)));
        assert!(!feed.add_follow(&FollowData::new(bob.clone(), fid(), 1)));

        let state = feed.state();
        assert_eq!(state.followers.len(), 1);
        assert_eq!(state.following.len(), 1);

        assert!(feed.remove_follow(&FollowData::new(bob.clone(), fid(), 2)));
        assert!(!feed.remove_follow(&FollowData::new(bob, fid(), 2)));
        assert!(feed.state().followers.is_empty());
    }

    #[test]
    fn selector_ignores_unrelated_changes() {
        let feed = Feed::new(fid());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        feed.subscribe_with_selector(
            |s: &FeedState| s.followers.len(),
            move |_: &usize, _: &usize| {
                c.fetch_add(1, Ordering::SeqCst);
            },
        );

        feed.add_activity(&activity("a1", 1));
        feed.set_watch(true);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        feed.add_follow(&FollowData::new(Fid::new("timeline", "bob"), fid(), 1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
