//! Mock request layer for testing.
//!
//! Serves seeded feeds and polls, scripts failures per entity, and records
//! every call for verification.

use super::{ApiError, CastVoteResponse, FeedResponse, FeedsApi};
use async_trait::async_trait;
use feed_types::{
    ActivityData, ActivityId, FeedData, Fid, FollowData, PollData, PollId, PollVoteData, UserId,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    /// `get_or_create_feed`
    GetOrCreateFeed {
        /// Requested feed.
        fid: Fid,
        /// Live delivery requested.
        watch: bool,
        /// Connection named in the request.
        connection_id: Option<String>,
    },
    /// `stop_watching_feed`
    StopWatching(Fid),
    /// `own_capabilities`
    OwnCapabilities(Vec<Fid>),
    /// `follow`
    Follow(Fid, Fid),
    /// `unfollow`
    Unfollow(Fid, Fid),
    /// `add_activity`
    AddActivity(Fid),
    /// `get_poll`
    GetPoll(PollId),
    /// `cast_vote`
    CastVote(PollId, String),
}

#[derive(Debug, Default)]
struct MockApiInner {
    user_id: String,
    clock: u64,
    feeds: HashMap<Fid, FeedResponse>,
    polls: HashMap<PollId, PollData>,
    capabilities: HashMap<Fid, Vec<String>>,
    failures: HashMap<String, String>,
    calls: Vec<ApiCall>,
}

impl MockApiInner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn check(&self, entity_id: &str) -> Result<(), ApiError> {
        match self.failures.get(entity_id) {
            Some(message) => Err(ApiError::Status {
                status: 500,
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Mock request layer for testing.
#[derive(Debug, Clone)]
pub struct MockFeedsApi {
    inner: Arc<Mutex<MockApiInner>>,
}

impl Default for MockFeedsApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFeedsApi {
    /// Create a mock acting for `mock-user`.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockApiInner {
                user_id: "mock-user".into(),
                ..Default::default()
            })),
        }
    }

    /// Serve this response for its feed.
    pub fn insert_feed(&self, response: FeedResponse) {
        let mut inner = self.inner.lock().unwrap();
        inner.feeds.insert(response.feed.fid.clone(), response);
    }

    /// Serve this poll.
    pub fn insert_poll(&self, poll: PollData) {
        let mut inner = self.inner.lock().unwrap();
        inner.polls.insert(poll.id.clone(), poll);
    }

    /// Capabilities returned for a feed by reads and hydration.
    pub fn set_capabilities(&self, fid: &Fid, capabilities: &[&str]) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .capabilities
            .insert(fid.clone(), capabilities.iter().map(|c| c.to_string()).collect());
    }

    /// Fail every call touching `entity_id` until cleared.
    pub fn fail_entity(&self, entity_id: &str, message: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.failures.insert(entity_id.to_string(), message.to_string());
    }

    /// Stop failing calls.
    pub fn clear_failures(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.failures.clear();
    }

    /// Every call made so far.
    pub fn calls(&self) -> Vec<ApiCall> {
        let inner = self.inner.lock().unwrap();
        inner.calls.clone()
    }

    /// Feed reads made so far.
    pub fn feed_reads(&self) -> Vec<ApiCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, ApiCall::GetOrCreateFeed { .. }))
            .collect()
    }

    /// Fid batches sent to `own_capabilities`.
    pub fn capability_batches(&self) -> Vec<Vec<Fid>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ApiCall::OwnCapabilities(fids) => Some(fids),
                _ => None,
            })
            .collect()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.clear();
    }

    fn record(&self, call: ApiCall) -> std::sync::MutexGuard<'_, MockApiInner> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(call);
        inner
    }
}

#[async_trait]
impl FeedsApi for MockFeedsApi {
    async fn get_or_create_feed(
        &self,
        fid: &Fid,
        watch: bool,
        connection_id: Option<String>,
    ) -> Result<FeedResponse, ApiError> {
        let mut inner = self.record(ApiCall::GetOrCreateFeed {
            fid: fid.clone(),
            watch,
            connection_id,
        });
        inner.check(&fid.to_string())?;
        let existing = inner.feeds.get(fid).cloned();
        let mut response = match existing {
            Some(response) => response,
            None => {
                let at = inner.tick();
                let response = FeedResponse::new(FeedData::new(fid.clone(), at));
                inner.feeds.insert(fid.clone(), response.clone());
                response
            }
        };
        response.feed.own_capabilities =
            Some(inner.capabilities.get(fid).cloned().unwrap_or_default());
        Ok(response)
    }

    async fn stop_watching_feed(&self, fid: &Fid, _connection_id: &str) -> Result<(), ApiError> {
        let inner = self.record(ApiCall::StopWatching(fid.clone()));
        inner.check(&fid.to_string())
    }

    async fn own_capabilities(&self, fids: &[Fid]) -> Result<HashMap<Fid, Vec<String>>, ApiError> {
        let inner = self.record(ApiCall::OwnCapabilities(fids.to_vec()));
        for fid in fids {
            inner.check(&fid.to_string())?;
        }
        Ok(fids
            .iter()
            .map(|fid| {
                let caps = inner.capabilities.get(fid).cloned().unwrap_or_default();
                (fid.clone(), caps)
            })
            .collect())
    }

    async fn follow(&self, source: &Fid, target: &Fid) -> Result<FollowData, ApiError> {
        let mut inner = self.record(ApiCall::Follow(source.clone(), target.clone()));
        inner.check(&target.to_string())?;
        let at = inner.tick();
        Ok(FollowData::new(source.clone(), target.clone(), at))
    }

    async fn unfollow(&self, source: &Fid, target: &Fid) -> Result<FollowData, ApiError> {
        let mut inner = self.record(ApiCall::Unfollow(source.clone(), target.clone()));
        inner.check(&target.to_string())?;
        let at = inner.tick();
        Ok(FollowData::new(source.clone(), target.clone(), at))
    }

    async fn add_activity(&self, fid: &Fid, text: &str) -> Result<ActivityData, ApiError> {
        let mut inner = self.record(ApiCall::AddActivity(fid.clone()));
        inner.check(&fid.to_string())?;
        let at = inner.tick();
        Ok(ActivityData {
            id: ActivityId::new(format!("activity-{at}")),
            feeds: vec![fid.clone()],
            user_id: Some(UserId::new(inner.user_id.clone())),
            text: Some(text.to_string()),
            reaction_counts: BTreeMap::new(),
            poll_id: None,
            created_at: at,
            updated_at: at,
            own_reactions: Vec::new(),
        })
    }

    async fn get_poll(&self, id: &PollId) -> Result<PollData, ApiError> {
        let inner = self.record(ApiCall::GetPoll(id.clone()));
        inner.check(id.as_str())?;
        inner.polls.get(id).cloned().ok_or_else(|| ApiError::Status {
            status: 404,
            message: format!("poll {id} not found"),
        })
    }

    async fn cast_vote(&self, poll: &PollId, option_id: &str) -> Result<CastVoteResponse, ApiError> {
        let mut inner = self.record(ApiCall::CastVote(poll.clone(), option_id.to_string()));
        inner.check(poll.as_str())?;
        let at = inner.tick();
        let user_id = UserId::new(inner.user_id.clone());
        let Some(current) = inner.polls.get_mut(poll) else {
            return Err(ApiError::Status {
                status: 404,
                message: format!("poll {poll} not found"),
            });
        };
        let vote = PollVoteData {
            id: format!("vote-{at}"),
            poll_id: poll.clone(),
            option_id: option_id.to_string(),
            user_id,
        };
        *current
            .vote_counts_by_option
            .entry(option_id.to_string())
            .or_default() += 1;
        current.vote_count += 1;
        current.updated_at = at;
        let mut response = current.clone();
        response.own_votes.push(vote.clone());
        Ok(CastVoteResponse {
            poll: response,
            vote,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fid(id: &str) -> Fid {
        Fid::new("user", id)
    }

    #[tokio::test]
    async fn unknown_feed_is_created() {
        let api = MockFeedsApi::new();
        api.set_capabilities(&fid("a"), &["read-feed"]);

        let response = api.get_or_create_feed(&fid("a"), true, Some("c1".into())).await.unwrap();
        assert_eq!(response.feed.fid, fid("a"));
        assert_eq!(response.feed.own_capabilities, Some(vec!["read-feed".to_string()]));
        assert_eq!(
            api.calls(),
            vec![ApiCall::GetOrCreateFeed {
                fid: fid("a"),
                watch: true,
                connection_id: Some("c1".into())
            }]
        );
    }

    #[tokio::test]
    async fn scripted_failure_is_per_entity() {
        let api = MockFeedsApi::new();
        api.fail_entity("user:b", "boom");

        assert!(api.get_or_create_feed(&fid("a"), false, None).await.is_ok());
        let err = api.get_or_create_feed(&fid("b"), false, None).await.unwrap_err();
        assert!(err.to_string().contains("boom"));

        api.clear_failures();
        assert!(api.get_or_create_feed(&fid("b"), false, None).await.is_ok());
    }

    #[tokio::test]
    async fn vote_updates_tallies() {
        let api = MockFeedsApi::new();
        api.insert_poll(PollData {
            id: PollId::new("p1"),
            name: "Lunch?".into(),
            vote_counts_by_option: BTreeMap::new(),
            vote_count: 0,
            is_closed: false,
            updated_at: 0,
            own_votes: Vec::new(),
        });

        let response = api.cast_vote(&PollId::new("p1"), "pizza").await.unwrap();
        assert_eq!(response.poll.vote_count, 1);
        assert_eq!(response.poll.vote_counts_by_option["pizza"], 1);
        assert_eq!(response.poll.own_votes, vec![response.vote.clone()]);
    }
}
