//! Entity payloads shared by responses and socket events.
//!
//! Timestamps are milliseconds since the Unix epoch. Fields prefixed with
//! `own_` describe the requesting user's view of an entity and are only
//! present on responses made on that user's behalf.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{ActivityId, Fid, PollId, UserId};

/// A user as described by the server (or by the client in the handshake).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserData {
    /// User id
    pub id: UserId,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Avatar URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Arbitrary application data
    #[serde(default)]
    pub custom: serde_json::Map<String, serde_json::Value>,
}

impl UserData {
    /// A user with only an id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: UserId::new(id),
            name: None,
            image: None,
            custom: serde_json::Map::new(),
        }
    }
}

/// Feed attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedData {
    /// Feed id
    pub fid: Fid,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    /// Description
    #[serde(default)]
    pub description: Option<String>,
    /// Number of feeds following this one
    #[serde(default)]
    pub follower_count: u32,
    /// Number of feeds this one follows
    #[serde(default)]
    pub following_count: u32,
    /// Arbitrary application data
    #[serde(default)]
    pub custom: serde_json::Map<String, serde_json::Value>,
    /// Freshness timestamp
    pub updated_at: u64,
    /// Capabilities the requesting user has on this feed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub own_capabilities: Option<Vec<String>>,
    /// Follows from the requesting user's feeds to this feed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub own_follows: Option<Vec<FollowData>>,
}

impl FeedData {
    /// Bare feed attributes with no counts and no ownership view.
    pub fn new(fid: Fid, updated_at: u64) -> Self {
        Self {
            fid,
            name: None,
            description: None,
            follower_count: 0,
            following_count: 0,
            custom: serde_json::Map::new(),
            updated_at,
            own_capabilities: None,
            own_follows: None,
        }
    }
}

/// A single activity posted to one or more feeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityData {
    /// Activity id
    pub id: ActivityId,
    /// Feeds the activity was posted to
    #[serde(default)]
    pub feeds: Vec<Fid>,
    /// Author
    #[serde(default)]
    pub user_id: Option<UserId>,
    /// Body text
    #[serde(default)]
    pub text: Option<String>,
    /// Reaction totals keyed by reaction type
    #[serde(default)]
    pub reaction_counts: BTreeMap<String, u32>,
    /// Attached poll, if any
    #[serde(default)]
    pub poll_id: Option<PollId>,
    /// Creation timestamp
    pub created_at: u64,
    /// Freshness timestamp
    pub updated_at: u64,
    /// Reactions left by the requesting user
    #[serde(default)]
    pub own_reactions: Vec<ReactionData>,
}

/// A reaction on an activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionData {
    /// Activity reacted to
    pub activity_id: ActivityId,
    /// Reaction type (e.g. `like`)
    #[serde(rename = "type")]
    pub kind: String,
    /// Reacting user
    pub user_id: UserId,
    /// Creation timestamp
    #[serde(default)]
    pub created_at: u64,
}

/// A follow relationship between two feeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowData {
    /// Following feed
    pub source_feed: Fid,
    /// Followed feed
    pub target_feed: Fid,
    /// Follow status (`accepted`, `pending`)
    #[serde(default = "default_follow_status")]
    pub status: String,
    /// Creation timestamp
    #[serde(default)]
    pub created_at: u64,
    /// Freshness timestamp
    #[serde(default)]
    pub updated_at: u64,
}

impl FollowData {
    /// An accepted follow from `source` to `target`.
    pub fn new(source_feed: Fid, target_feed: Fid, at: u64) -> Self {
        Self {
            source_feed,
            target_feed,
            status: default_follow_status(),
            created_at: at,
            updated_at: at,
        }
    }

    /// Whether this follow connects the same two feeds as `other`.
    pub fn same_edge(&self, other: &FollowData) -> bool {
        self.source_feed == other.source_feed && self.target_feed == other.target_feed
    }
}

fn default_follow_status() -> String {
    "accepted".to_string()
}

/// Unread/unseen counters of a notification feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationStatus {
    /// Unread activity count
    #[serde(default)]
    pub unread: u32,
    /// Unseen activity count
    #[serde(default)]
    pub unseen: u32,
    /// When the user last marked the feed seen
    #[serde(default)]
    pub last_seen_at: Option<u64>,
}

/// A poll and its vote tallies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollData {
    /// Poll id
    pub id: PollId,
    /// Question
    pub name: String,
    /// Vote totals keyed by option id
    #[serde(default)]
    pub vote_counts_by_option: BTreeMap<String, u32>,
    /// Total number of votes
    #[serde(default)]
    pub vote_count: u32,
    /// Whether voting has ended
    #[serde(default)]
    pub is_closed: bool,
    /// Freshness timestamp
    pub updated_at: u64,
    /// Votes cast by the requesting user
    #[serde(default)]
    pub own_votes: Vec<PollVoteData>,
}

/// A single vote on a poll option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollVoteData {
    /// Vote id
    pub id: String,
    /// Poll voted on
    pub poll_id: PollId,
    /// Chosen option
    pub option_id: String,
    /// Voting user
    pub user_id: UserId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_without_own_fields_decodes() {
        let json = r#"{"fid":"user:alice","updated_at":10}"#;
        let feed: FeedData = serde_json::from_str(json).unwrap();
        assert_eq!(feed.fid, Fid::new("user", "alice"));
        assert_eq!(feed.follower_count, 0);
        assert!(feed.own_capabilities.is_none());
    }

    #[test]
    fn reaction_kind_uses_type_field() {
        let json = r#"{"activity_id":"a1","type":"like","user_id":"u1"}"#;
        let reaction: ReactionData = serde_json::from_str(json).unwrap();
        assert_eq!(reaction.kind, "like");
    }

    #[test]
    fn follow_defaults_to_accepted() {
        let json = r#"{"source_feed":"timeline:a","target_feed":"user:b"}"#;
        let follow: FollowData = serde_json::from_str(json).unwrap();
        assert_eq!(follow.status, "accepted");
        assert!(follow.same_edge(&FollowData::new(
            Fid::new("timeline", "a"),
            Fid::new("user", "b"),
            99
        )));
    }
}
