//! FeedsClient - the main interface of the feed runtime.
//!
//! [`FeedsClient`] composes the connection runtime, the token and
//! connection-id coordinators, the event dispatcher, the active entity
//! registry and the reconciliation layer.
//!
//! # Architecture
//!
//! ```text
//! Application → FeedsClient → FeedsApi (requests)
//!                   ↓
//!            connection runtime → Transport → Network
//!                   ↓ signals
//!               router task → entities, dispatcher
//! ```
//!
//! Every inbound event passes through one router task, in arrival order.
//! The router drops events from superseded sessions, consumes dedup tickets,
//! applies the event to the entities it addresses and then fans it out to
//! listeners.
//!
//! # Example
//!
//! ```ignore
//! use rtfeed_client::{ClientConfig, FeedsClient, TokenSource, WebSocketTransport};
//!
//! let client = FeedsClient::new(ClientConfig::new("api-key"), WebSocketTransport::new(Default::default()), api);
//! client.connect_user(UserData::new("alice"), Some(TokenSource::Static(token))).await?;
//!
//! let timeline = client.watch(&Fid::new("timeline", "alice")).await?;
//! timeline.subscribe(|next, _| println!("{} activities", next.activities.len()));
//! ```

use feed_core::DedupKey;
use feed_types::{
    ActivityData, ClientEvent, ConnectionOkEvent, Fid, FollowData, PollId, PollVoteData,
    UserData, WsEvent,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

use crate::api::FeedsApi;
use crate::client_state::ClientState;
use crate::config::ClientConfig;
use crate::connection::{ConnectionHandle, Signal};
use crate::connection_id::ConnectionIdSlot;
use crate::dispatcher::{EventDispatcher, Subscription};
use crate::error::ClientError;
use crate::feed::Feed;
use crate::poll::Poll;
use crate::reconcile::{resync, Hydrator, Reconciler};
use crate::registry::ActiveRegistry;
use crate::store::StateStore;
use crate::token::{TokenManager, TokenSource};
use crate::transport::Transport;

struct ClientInner {
    api: Arc<dyn FeedsApi>,
    tokens: Arc<TokenManager>,
    connection_id: Arc<ConnectionIdSlot>,
    connection: ConnectionHandle,
    dispatcher: EventDispatcher,
    registry: Arc<ActiveRegistry>,
    reconciler: Reconciler,
    hydrator: Hydrator,
    state: StateStore<ClientState>,
    watched_at_disconnect: Mutex<HashSet<Fid>>,
}

/// The feed client.
///
/// Cheap to clone; clones share one connection and one set of entities.
#[derive(Clone)]
pub struct FeedsClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for FeedsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedsClient")
            .field("state", &self.inner.state.get())
            .field("feeds", &self.inner.registry.feeds().len())
            .field("polls", &self.inner.registry.polls().len())
            .finish()
    }
}

impl FeedsClient {
    /// Create a client.
    ///
    /// Spawns the connection runtime and the event router, so it must be
    /// called from within a tokio runtime.
    pub fn new<T, A>(config: ClientConfig, transport: T, api: A) -> Self
    where
        T: Transport,
        A: FeedsApi,
    {
        let config = Arc::new(config);
        let api: Arc<dyn FeedsApi> = Arc::new(api);
        let tokens = Arc::new(TokenManager::new(&config.token));
        let connection_id = Arc::new(ConnectionIdSlot::new());
        let registry = Arc::new(ActiveRegistry::new());
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let connection = ConnectionHandle::spawn(
            Arc::clone(&config),
            Arc::new(transport),
            Arc::clone(&tokens),
            Arc::clone(&connection_id),
            signal_tx,
        );
        let hydrator = Hydrator::new(
            Arc::clone(&api),
            Arc::clone(&registry),
            config.hydration.window(),
        );

        let inner = Arc::new(ClientInner {
            api,
            tokens,
            connection_id,
            connection,
            dispatcher: EventDispatcher::new(),
            registry,
            reconciler: Reconciler::new(config.reconciliation.ticket_ttl()),
            hydrator,
            state: StateStore::new(ClientState::default()),
            watched_at_disconnect: Mutex::new(HashSet::new()),
        });
        tokio::spawn(route_signals(Arc::downgrade(&inner), signal_rx));

        Self { inner }
    }

    // ===========================================
    // Connection
    // ===========================================

    /// Connect as `user`.
    ///
    /// `token` is a fixed token or a provider; `None` connects anonymously.
    /// Resolves once the server confirms the connection.
    pub async fn connect_user(
        &self,
        user: UserData,
        token: Option<TokenSource>,
    ) -> Result<ConnectionOkEvent, ClientError> {
        let anonymous = token.is_none();
        match token {
            Some(source) => self.inner.tokens.set_source(source),
            None => self.inner.tokens.reset(),
        }
        let next_user = user.clone();
        self.inner.state.update(|s| {
            Some(ClientState {
                user: Some(next_user),
                ..s.clone()
            })
        });
        self.inner.connection.connect(user, anonymous).await
    }

    /// Disconnect and forget the user session.
    ///
    /// Closes the socket, drops the token, the connection id, every active
    /// entity and every outstanding dedup ticket.
    pub async fn disconnect_user(&self) {
        self.inner.connection.disconnect().await;
        self.inner.tokens.reset();
        self.inner.connection_id.clear();
        self.inner.registry.clear();
        self.inner.reconciler.clear();
        self.inner.watched_at_disconnect.lock().clear();
        self.inner.state.next(ClientState::default());
        tracing::info!("user disconnected");
    }

    /// Report a host network change.
    ///
    /// Going offline drops the connection at once; coming back online
    /// reconnects after a short delay unless already healthy.
    pub fn set_online(&self, online: bool) {
        self.inner.connection.set_online(online);
    }

    /// Whether the connection is healthy.
    pub fn is_healthy(&self) -> bool {
        self.inner.connection.is_healthy()
    }

    /// Id of the live connection, if healthy.
    pub fn connection_id(&self) -> Option<String> {
        self.inner.connection_id.current()
    }

    /// Latest client state.
    pub fn state(&self) -> Arc<ClientState> {
        self.inner.state.get()
    }

    /// The client state store, for subscriptions.
    pub fn client_state(&self) -> StateStore<ClientState> {
        self.inner.state.clone()
    }

    // ===========================================
    // Events
    // ===========================================

    /// Listen for one event type, or `*` for every event.
    pub fn on<F>(&self, event_type: &str, handler: F) -> Subscription
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.inner.dispatcher.on(event_type, handler)
    }

    /// Listen for every event.
    pub fn on_any<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.inner.dispatcher.on_any(handler)
    }

    /// Remove every listener for one event type.
    pub fn off(&self, event_type: &str) {
        self.inner.dispatcher.off(event_type);
    }

    // ===========================================
    // Entities
    // ===========================================

    /// The feed, created empty if not yet active.
    pub fn feed(&self, fid: &Fid) -> Feed {
        self.inner.registry.feed_or_create(fid)
    }

    /// The poll, created empty if not yet active.
    pub fn poll(&self, id: &PollId) -> Poll {
        self.inner.registry.poll_or_create(id)
    }

    /// Every active feed.
    pub fn active_feeds(&self) -> Vec<Feed> {
        self.inner.registry.feeds()
    }

    /// Read a feed, creating it on the server if needed.
    ///
    /// With `watch` set, live events for the feed are delivered on the
    /// current connection; this waits for a pending connect and fails if
    /// none was ever started.
    pub async fn get_or_create_feed(&self, fid: &Fid, watch: bool) -> Result<Feed, ClientError> {
        let connection_id = if watch {
            Some(self.inner.connection_id.get().await?)
        } else {
            None
        };
        let response = self
            .inner
            .api
            .get_or_create_feed(fid, watch, connection_id)
            .await?;

        let feed = self.inner.registry.feed_or_create(fid);
        let watch = watch || feed.is_watched();
        feed.apply_response(response, watch);
        Ok(feed)
    }

    /// Read a feed and watch it.
    pub async fn watch(&self, fid: &Fid) -> Result<Feed, ClientError> {
        self.get_or_create_feed(fid, true).await
    }

    /// Stop watching a feed.
    pub async fn unwatch(&self, fid: &Fid) -> Result<(), ClientError> {
        let Some(feed) = self.inner.registry.feed(fid) else {
            return Ok(());
        };
        if let Some(connection_id) = self.inner.connection_id.current() {
            self.inner.api.stop_watching_feed(fid, &connection_id).await?;
        }
        feed.set_watch(false);
        self.inner.watched_at_disconnect.lock().remove(fid);
        Ok(())
    }

    /// Read a poll.
    pub async fn get_poll(&self, id: &PollId) -> Result<Poll, ClientError> {
        let data = self.inner.api.get_poll(id).await?;
        let poll = self.inner.registry.poll_or_create(id);
        poll.apply_response(data);
        Ok(poll)
    }

    // ===========================================
    // Mutations
    // ===========================================

    /// Make `source` follow `target`.
    ///
    /// The response is applied to both feeds at once; its broadcast echo
    /// is then suppressed.
    pub async fn follow(&self, source: &Fid, target: &Fid) -> Result<FollowData, ClientError> {
        let follow = self.inner.api.follow(source, target).await?;
        self.apply_local(
            DedupKey::follow(source, target),
            self.inner.is_watched(&[source, target]),
            || self.apply_to_pair(source, target, |feed| feed.add_follow(&follow)),
        );
        Ok(follow)
    }

    /// Remove the follow from `source` to `target`.
    pub async fn unfollow(&self, source: &Fid, target: &Fid) -> Result<FollowData, ClientError> {
        let follow = self.inner.api.unfollow(source, target).await?;
        self.apply_local(
            DedupKey::unfollow(source, target),
            self.inner.is_watched(&[source, target]),
            || self.apply_to_pair(source, target, |feed| feed.remove_follow(&follow)),
        );
        Ok(follow)
    }

    /// Post a text activity to a feed.
    pub async fn add_activity(&self, fid: &Fid, text: &str) -> Result<ActivityData, ClientError> {
        let activity = self.inner.api.add_activity(fid, text).await?;
        self.apply_local(
            DedupKey::activity_added(fid, &activity.id),
            self.inner.is_watched(&[fid]),
            || {
                self.inner
                    .registry
                    .feed(fid)
                    .is_some_and(|feed| feed.add_activity(&activity))
            },
        );
        Ok(activity)
    }

    /// Vote for a poll option.
    ///
    /// The user's own votes only ever change through this response.
    pub async fn cast_vote(
        &self,
        poll_id: &PollId,
        option_id: &str,
    ) -> Result<PollVoteData, ClientError> {
        let response = self.inner.api.cast_vote(poll_id, option_id).await?;
        let poll = self.inner.registry.poll_or_create(poll_id);
        let vote = response.vote;
        self.apply_local(
            DedupKey::vote_casted(poll_id, &vote.id),
            !self.inner.registry.watched().is_empty(),
            || poll.apply_vote(response.poll, &vote),
        );
        Ok(vote)
    }

    /// Apply a local response, holding a dedup ticket while it lands.
    ///
    /// The ticket is recorded before the apply so an echo routed
    /// concurrently still finds it, and withdrawn if the apply changed
    /// nothing.
    fn apply_local<F>(&self, key: DedupKey, watched: bool, apply: F)
    where
        F: FnOnce() -> bool,
    {
        if watched {
            self.inner.reconciler.expect_echo(key.clone());
        }
        let changed = apply();
        if watched && !changed {
            self.inner.reconciler.cancel(&key);
        }
    }

    fn apply_to_pair<F>(&self, source: &Fid, target: &Fid, apply: F) -> bool
    where
        F: Fn(&Feed) -> bool,
    {
        let mut changed = false;
        for fid in [source, target] {
            if let Some(feed) = self.inner.registry.feed(fid) {
                changed |= apply(&feed);
            }
        }
        changed
    }
}

impl ClientInner {
    fn is_watched(&self, fids: &[&Fid]) -> bool {
        fids.iter()
            .any(|fid| self.registry.feed(fid).is_some_and(|f| f.is_watched()))
    }

    fn on_signal(self: &Arc<Self>, signal: Signal) {
        match signal {
            Signal::Event { epoch, event } => {
                if epoch != self.connection.epoch() {
                    tracing::debug!(
                        "dropping {} from stale session {}",
                        event.event_type(),
                        epoch
                    );
                    return;
                }
                self.route_event(&event);
                self.dispatcher.dispatch(&ClientEvent::Ws(event));
            }
            Signal::Health {
                healthy,
                connection_id,
                me,
            } => {
                self.state.update(|s| {
                    let user = if healthy {
                        me.or_else(|| s.user.clone())
                    } else {
                        s.user.clone()
                    };
                    Some(ClientState {
                        user,
                        connection_id,
                        is_healthy: healthy,
                    })
                });
                if !healthy {
                    self.unwatch_all();
                }
                self.dispatcher
                    .dispatch(&ClientEvent::ConnectionChanged { online: healthy });
            }
            Signal::Recover { connection_id } => {
                let watched = std::mem::take(&mut *self.watched_at_disconnect.lock());
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    tracing::info!(
                        "recovering {} feeds ({} watched) after reconnect",
                        inner.registry.feeds().len(),
                        watched.len()
                    );
                    let report =
                        resync(inner.api.as_ref(), &inner.registry, connection_id, &watched).await;
                    if let Some(event) = report.into_event() {
                        tracing::warn!(
                            "{} entities failed to resynchronize",
                            event.failures.len()
                        );
                        inner
                            .dispatcher
                            .dispatch(&ClientEvent::UnhandledError(event));
                    }
                    inner.dispatcher.dispatch(&ClientEvent::ConnectionRecovered);
                });
            }
        }
    }

    /// Clear every watch flag, remembering which feeds were watched.
    fn unwatch_all(&self) {
        let watched = self.registry.watched();
        if watched.is_empty() {
            return;
        }
        for fid in &watched {
            if let Some(feed) = self.registry.feed(fid) {
                feed.set_watch(false);
            }
        }
        tracing::debug!("connection lost, {} feeds no longer watched", watched.len());
        self.watched_at_disconnect.lock().extend(watched);
    }

    fn route_event(&self, event: &WsEvent) {
        let mut touched = Vec::new();
        match event {
            WsEvent::FeedCreated { feed } => {
                let entity = self.registry.feed_or_create(&feed.fid);
                if entity.handle_event(event) {
                    touched.push(entity);
                }
            }
            WsEvent::FeedDeleted { fid } => {
                if let Some(feed) = self.registry.remove_feed(fid) {
                    feed.handle_event(event);
                    tracing::debug!("feed {} deleted", fid);
                }
            }
            WsEvent::FeedUpdated { feed } => self.to_feed(&feed.fid, event, &mut touched),
            WsEvent::ActivityAdded { fid, activity } => {
                if self
                    .reconciler
                    .is_echo(&DedupKey::activity_added(fid, &activity.id))
                {
                    return;
                }
                self.to_feed(fid, event, &mut touched);
            }
            WsEvent::ActivityUpdated { fid, .. }
            | WsEvent::ActivityDeleted { fid, .. }
            | WsEvent::ReactionAdded { fid, .. }
            | WsEvent::ReactionDeleted { fid, .. }
            | WsEvent::NotificationFeedUpdated { fid, .. } => {
                self.to_feed(fid, event, &mut touched)
            }
            WsEvent::FollowCreated { follow } | WsEvent::FollowDeleted { follow } => {
                let key = match event {
                    WsEvent::FollowCreated { .. } => {
                        DedupKey::follow(&follow.source_feed, &follow.target_feed)
                    }
                    _ => DedupKey::unfollow(&follow.source_feed, &follow.target_feed),
                };
                if self.reconciler.is_echo(&key) {
                    return;
                }
                self.to_feed(&follow.source_feed, event, &mut touched);
                if follow.target_feed != follow.source_feed {
                    self.to_feed(&follow.target_feed, event, &mut touched);
                }
            }
            WsEvent::PollVoteCasted { poll, poll_vote } => {
                if self
                    .reconciler
                    .is_echo(&DedupKey::vote_casted(&poll.id, &poll_vote.id))
                {
                    return;
                }
                self.to_poll(&poll.id, event);
            }
            WsEvent::PollUpdated { poll }
            | WsEvent::PollClosed { poll }
            | WsEvent::PollVoteRemoved { poll, .. } => self.to_poll(&poll.id, event),
            WsEvent::PollDeleted { poll } => {
                if let Some(entity) = self.registry.remove_poll(&poll.id) {
                    entity.handle_event(event);
                    tracing::debug!("poll {} deleted", poll.id);
                }
            }
            WsEvent::ConnectionOk(_)
            | WsEvent::ConnectionError(_)
            | WsEvent::HealthCheck(_)
            | WsEvent::Unknown => {}
        }

        let missing: Vec<Fid> = touched
            .iter()
            .filter(|feed| feed.state().needs_hydration())
            .map(|feed| feed.fid().clone())
            .collect();
        self.hydrator.request(missing);
    }

    fn to_feed(&self, fid: &Fid, event: &WsEvent, touched: &mut Vec<Feed>) {
        if let Some(feed) = self.registry.feed(fid) {
            if feed.handle_event(event) {
                touched.push(feed);
            }
        }
    }

    fn to_poll(&self, id: &PollId, event: &WsEvent) {
        if let Some(poll) = self.registry.poll(id) {
            poll.handle_event(event);
        }
    }
}

async fn route_signals(inner: Weak<ClientInner>, mut signals: mpsc::UnboundedReceiver<Signal>) {
    while let Some(signal) = signals.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.on_signal(signal);
    }
    tracing::debug!("event router stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiCall, FeedResponse, MockFeedsApi};
    use crate::connection_id::ConnectionIdError;
    use crate::transport::MockTransport;
    use feed_types::{FeedData, PollData, UserId};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Harness {
        transport: MockTransport,
        api: MockFeedsApi,
        client: FeedsClient,
        events: Arc<Mutex<Vec<ClientEvent>>>,
        _sub: Subscription,
    }

    impl Harness {
        fn new() -> Self {
            let _ = tracing_subscriber::fmt()
                .with_env_filter("rtfeed_client=debug")
                .with_test_writer()
                .try_init();
            let transport = MockTransport::new();
            let api = MockFeedsApi::new();
            let client = FeedsClient::new(ClientConfig::new("key-123"), transport.clone(), api.clone());
            let events = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&events);
            let _sub = client.on_any(move |e| sink.lock().push(e.clone()));
            Self {
                transport,
                api,
                client,
                events,
                _sub,
            }
        }

        async fn connected() -> Self {
            let h = Self::new();
            h.client
                .connect_user(
                    UserData::new("alice"),
                    Some(TokenSource::Static("token".into())),
                )
                .await
                .unwrap();
            settle().await;
            h
        }

        /// Seed feeds so only mutations advance the mock clock.
        async fn watched(&self, ids: &[&str]) -> Vec<Feed> {
            let mut feeds = Vec::new();
            for id in ids {
                self.api
                    .insert_feed(FeedResponse::new(FeedData::new(fid(id), 0)));
                feeds.push(self.client.watch(&fid(id)).await.unwrap());
            }
            feeds
        }

        fn events_of(&self, event_type: &str) -> Vec<ClientEvent> {
            self.events
                .lock()
                .iter()
                .filter(|e| e.event_type() == event_type)
                .cloned()
                .collect()
        }
    }

    fn fid(id: &str) -> Fid {
        Fid::new("user", id)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn counter(feed: &Feed) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        feed.subscribe(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    fn poll_data(id: &str) -> PollData {
        PollData {
            id: PollId::new(id),
            name: "lunch?".into(),
            vote_counts_by_option: BTreeMap::new(),
            vote_count: 0,
            is_closed: false,
            updated_at: 0,
            own_votes: Vec::new(),
        }
    }

    // ===========================================
    // Connection state
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn connect_publishes_client_state() {
        let h = Harness::connected().await;

        let state = h.client.state();
        assert!(state.is_healthy);
        assert_eq!(state.connection_id.as_deref(), Some("mock-conn-1"));
        assert_eq!(state.user.as_ref().unwrap().id, UserId::new("alice"));
        assert_eq!(h.client.connection_id().as_deref(), Some("mock-conn-1"));
        assert_eq!(
            h.events_of("connection.changed"),
            vec![ClientEvent::ConnectionChanged { online: true }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn watch_requires_a_connect() {
        let h = Harness::new();
        let result = h.client.watch(&fid("a")).await;
        assert!(matches!(
            result,
            Err(ClientError::ConnectionId(ConnectionIdError::NotInitiated))
        ));
        assert!(h.api.feed_reads().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn watch_names_the_live_connection() {
        let h = Harness::connected().await;
        let feeds = h.watched(&["a"]).await;

        assert!(feeds[0].is_watched());
        assert_eq!(
            h.api.feed_reads(),
            vec![ApiCall::GetOrCreateFeed {
                fid: fid("a"),
                watch: true,
                connection_id: Some("mock-conn-1".into()),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unwatch_stops_live_delivery() {
        let h = Harness::connected().await;
        let feeds = h.watched(&["a"]).await;

        h.client.unwatch(&fid("a")).await.unwrap();
        assert!(!feeds[0].is_watched());
        assert!(h.api.calls().contains(&ApiCall::StopWatching(fid("a"))));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_user_forgets_the_session() {
        let h = Harness::connected().await;
        h.watched(&["a", "b"]).await;

        h.client.disconnect_user().await;
        settle().await;

        assert!(h.client.active_feeds().is_empty());
        assert_eq!(*h.client.state(), ClientState::default());
        assert_eq!(h.client.connection_id(), None);
        assert_eq!(h.transport.close_codes(), vec![1000]);
        assert!(h
            .events_of("connection.changed")
            .contains(&ClientEvent::ConnectionChanged { online: false }));
    }

    #[tokio::test(start_paused = true)]
    async fn watch_during_reconnect_backoff_uses_the_next_connection() {
        let h = Harness::connected().await;
        h.api.insert_feed(FeedResponse::new(FeedData::new(fid("a"), 0)));
        h.transport.drop_connection();
        settle().await;
        assert_eq!(h.client.connection_id(), None);

        let feed = tokio::time::timeout(Duration::from_secs(10), h.client.watch(&fid("a")))
            .await
            .expect("watch should resolve after the reconnect")
            .unwrap();

        assert!(feed.is_watched());
        let reads = h.api.feed_reads();
        assert!(reads.contains(&ApiCall::GetOrCreateFeed {
            fid: fid("a"),
            watch: true,
            connection_id: Some("mock-conn-2".into()),
        }));
        assert!(!reads.iter().any(|call| matches!(
            call,
            ApiCall::GetOrCreateFeed { connection_id: Some(id), .. } if id == "mock-conn-1"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn watch_while_offline_waits_for_the_network() {
        let h = Harness::connected().await;
        h.api.insert_feed(FeedResponse::new(FeedData::new(fid("a"), 0)));
        h.client.set_online(false);
        settle().await;

        let client = h.client.clone();
        let watching = tokio::spawn(async move { client.watch(&fid("a")).await });
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!watching.is_finished());
        assert!(h.api.feed_reads().is_empty());

        h.client.set_online(true);
        let feed = tokio::time::timeout(Duration::from_secs(10), watching)
            .await
            .expect("watch should resolve once back online")
            .unwrap()
            .unwrap();

        assert!(feed.is_watched());
        assert!(h.api.feed_reads().iter().all(|call| matches!(
            call,
            ApiCall::GetOrCreateFeed { watch: true, connection_id: Some(id), .. }
                if id == "mock-conn-2"
        )));
    }

    // ===========================================
    // Dedup convergence
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn follow_echo_after_response_is_suppressed() {
        let h = Harness::connected().await;
        let feeds = h.watched(&["a", "b"]).await;
        let notified = counter(&feeds[1]);

        let follow = h.client.follow(&fid("a"), &fid("b")).await.unwrap();
        h.transport
            .push_event(&WsEvent::FollowCreated { follow: follow.clone() });
        settle().await;

        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert_eq!(feeds[1].state().followers, vec![follow.clone()]);
        assert_eq!(feeds[0].state().following, vec![follow]);
        assert_eq!(h.client.inner.reconciler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn follow_echo_before_response_applies_once() {
        let h = Harness::connected().await;
        let feeds = h.watched(&["a", "b"]).await;
        let notified = counter(&feeds[1]);

        // The mock stamps the first mutation with 1.
        let echo = FollowData::new(fid("a"), fid("b"), 1);
        h.transport
            .push_event(&WsEvent::FollowCreated { follow: echo.clone() });
        settle().await;
        let follow = h.client.follow(&fid("a"), &fid("b")).await.unwrap();

        assert_eq!(follow, echo);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert_eq!(feeds[1].state().followers.len(), 1);
        assert_eq!(h.client.inner.reconciler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn follow_without_echo_applies_once() {
        let h = Harness::connected().await;
        let feeds = h.watched(&["a", "b"]).await;
        let notified = counter(&feeds[0]);

        h.client.follow(&fid("a"), &fid("b")).await.unwrap();
        settle().await;

        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert_eq!(feeds[0].state().following.len(), 1);
        assert_eq!(h.client.inner.reconciler.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_echo_does_not_swallow_a_later_change() {
        let h = Harness::connected().await;
        let feeds = h.watched(&["a", "b"]).await;
        let follow = h.client.follow(&fid("a"), &fid("b")).await.unwrap();
        assert_eq!(h.client.inner.reconciler.pending(), 1);
        let notified = counter(&feeds[1]);

        // The echo never arrives; the ticket outlives its TTL.
        tokio::time::sleep(Duration::from_secs(31)).await;

        let mut later = follow.clone();
        later.status = "pending".into();
        later.updated_at = follow.updated_at + 100;
        h.transport
            .push_event(&WsEvent::FollowCreated { follow: later.clone() });
        settle().await;

        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert_eq!(feeds[1].state().followers, vec![later]);
        assert_eq!(h.client.inner.reconciler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unwatched_feeds_record_no_ticket() {
        let h = Harness::connected().await;
        h.api.insert_feed(FeedResponse::new(FeedData::new(fid("a"), 0)));
        h.api.insert_feed(FeedResponse::new(FeedData::new(fid("b"), 0)));
        h.client.get_or_create_feed(&fid("a"), false).await.unwrap();
        let b = h.client.get_or_create_feed(&fid("b"), false).await.unwrap();
        let notified = counter(&b);

        let follow = h.client.follow(&fid("a"), &fid("b")).await.unwrap();
        assert_eq!(h.client.inner.reconciler.pending(), 0);

        h.transport.push_event(&WsEvent::FollowCreated { follow });
        settle().await;
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unfollow_echo_is_suppressed() {
        let h = Harness::connected().await;
        let feeds = h.watched(&["a", "b"]).await;
        h.client.follow(&fid("a"), &fid("b")).await.unwrap();
        let notified = counter(&feeds[0]);

        let follow = h.client.unfollow(&fid("a"), &fid("b")).await.unwrap();
        h.transport.push_event(&WsEvent::FollowDeleted { follow });
        settle().await;

        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert!(feeds[0].state().following.is_empty());
        assert!(feeds[1].state().followers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn added_activity_echo_is_suppressed() {
        let h = Harness::connected().await;
        let feeds = h.watched(&["a"]).await;
        let notified = counter(&feeds[0]);

        let mut activity = h.client.add_activity(&fid("a"), "hello").await.unwrap();
        activity.text = Some("hello (echo)".into());
        h.transport.push_event(&WsEvent::ActivityAdded {
            fid: fid("a"),
            activity: activity.clone(),
        });
        settle().await;

        assert_eq!(notified.load(Ordering::SeqCst), 1);
        let state = feeds[0].state();
        assert_eq!(state.activities.len(), 1);
        assert_eq!(state.activities[0].text.as_deref(), Some("hello"));
    }

    #[tokio::test(start_paused = true)]
    async fn own_votes_survive_broadcasts() {
        let h = Harness::connected().await;
        h.watched(&["a"]).await;
        h.api.insert_poll(poll_data("p1"));
        let poll = h.client.get_poll(&PollId::new("p1")).await.unwrap();

        let vote = h.client.cast_vote(&PollId::new("p1"), "pizza").await.unwrap();
        assert_eq!(poll.state().poll.as_ref().unwrap().own_votes, vec![vote.clone()]);

        // Echo of our own vote.
        let mut broadcast = poll.state().poll.clone().unwrap();
        broadcast.own_votes.clear();
        h.transport.push_event(&WsEvent::PollVoteCasted {
            poll: broadcast.clone(),
            poll_vote: vote.clone(),
        });
        // Someone else votes.
        let mut other = broadcast.clone();
        other.vote_count += 1;
        other.updated_at += 1;
        *other.vote_counts_by_option.entry("sushi".into()).or_default() += 1;
        h.transport.push_event(&WsEvent::PollVoteCasted {
            poll: other,
            poll_vote: PollVoteData {
                id: "vote-other".into(),
                poll_id: PollId::new("p1"),
                option_id: "sushi".into(),
                user_id: UserId::new("bob"),
            },
        });
        settle().await;

        let state = poll.state();
        let data = state.poll.as_ref().unwrap();
        assert_eq!(data.vote_count, 2);
        assert_eq!(data.own_votes, vec![vote]);
        assert_eq!(h.client.inner.reconciler.pending(), 0);
    }

    // ===========================================
    // Routing
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn created_feed_is_registered_and_hydrated() {
        let h = Harness::connected().await;
        h.api.set_capabilities(&fid("new"), &["read-feed", "post"]);

        h.transport.push_event(&WsEvent::FeedCreated {
            feed: FeedData::new(fid("new"), 5),
        });
        settle().await;

        let feed = h.client.inner.registry.feed(&fid("new")).unwrap();
        assert_eq!(
            feed.state().feed.as_ref().unwrap().own_capabilities,
            Some(vec!["read-feed".to_string(), "post".to_string()])
        );
        assert_eq!(h.api.capability_batches(), vec![vec![fid("new")]]);
        assert_eq!(h.events_of("feeds.feed.created").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn events_for_inactive_feeds_are_dropped() {
        let h = Harness::connected().await;

        h.transport.push_event(&WsEvent::FeedUpdated {
            feed: FeedData::new(fid("ghost"), 5),
        });
        settle().await;

        assert!(h.client.active_feeds().is_empty());
        // Listeners still see the event.
        assert_eq!(h.events_of("feeds.feed.updated").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_feed_leaves_the_registry() {
        let h = Harness::connected().await;
        let feeds = h.watched(&["a"]).await;

        h.transport
            .push_event(&WsEvent::FeedDeleted { fid: fid("a") });
        settle().await;

        assert!(h.client.inner.registry.feed(&fid("a")).is_none());
        assert!(feeds[0].state().feed.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_session_events_never_apply() {
        let h = Harness::connected().await;
        let feeds = h.watched(&["a"]).await;
        h.transport.drop_connection();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(h.transport.connect_count(), 2);
        let notified = counter(&feeds[0]);

        let mut stale = FeedData::new(fid("a"), 99);
        stale.name = Some("from old socket".into());
        h.transport
            .push_event_to(0, &WsEvent::FeedUpdated { feed: stale });
        settle().await;

        assert_eq!(notified.load(Ordering::SeqCst), 0);
        assert_eq!(feeds[0].state().feed.as_ref().unwrap().name, None);
    }

    // ===========================================
    // Reconnection recovery
    // ===========================================

    #[tokio::test(start_paused = true)]
    async fn losing_the_connection_clears_watch_flags() {
        let h = Harness::connected().await;
        let feeds = h.watched(&["a", "b"]).await;

        h.transport.drop_connection();
        settle().await;

        assert!(feeds.iter().all(|f| !f.is_watched()));
        assert!(!h.client.state().is_healthy);
        assert!(h
            .events_of("connection.changed")
            .contains(&ClientEvent::ConnectionChanged { online: false }));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_restores_watches_and_aggregates_failures() {
        let h = Harness::connected().await;
        let ids = ["a", "b", "c", "d", "e"];
        let feeds = h.watched(&ids).await;
        h.api.clear_calls();
        h.api.fail_entity("user:b", "server exploded");
        h.api.fail_entity("user:d", "timeout");

        h.transport.drop_connection();
        tokio::time::sleep(Duration::from_secs(3)).await;

        let errors = h.events_of("errors.unhandled");
        assert_eq!(errors.len(), 1);
        let ClientEvent::UnhandledError(error) = &errors[0] else {
            panic!("expected an unhandled error");
        };
        assert_eq!(error.error_type, "reconnection-reconciliation");
        let mut failed: Vec<_> = error.failures.iter().map(|f| f.entity_id.as_str()).collect();
        failed.sort();
        assert_eq!(failed, vec!["user:b", "user:d"]);
        assert_eq!(h.events_of("connection.recovered").len(), 1);

        let watched: Vec<_> = feeds
            .iter()
            .filter(|f| f.is_watched())
            .map(|f| f.fid().to_string())
            .collect();
        assert_eq!(watched.len(), 3);
        assert!(h.api.feed_reads().iter().all(|call| matches!(
            call,
            ApiCall::GetOrCreateFeed { watch: true, connection_id: Some(id), .. }
                if id == "mock-conn-2"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn clean_recovery_emits_no_error() {
        let h = Harness::connected().await;
        h.watched(&["a"]).await;

        h.transport.drop_connection();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(h.events_of("errors.unhandled").is_empty());
        assert_eq!(h.events_of("connection.recovered").len(), 1);
        assert!(h.client.feed(&fid("a")).is_watched());
    }

    #[tokio::test(start_paused = true)]
    async fn first_connect_is_not_a_recovery() {
        let h = Harness::connected().await;
        h.watched(&["a"]).await;
        settle().await;

        assert!(h.events_of("connection.recovered").is_empty());
        assert_eq!(h.api.feed_reads().len(), 1);
    }
}
