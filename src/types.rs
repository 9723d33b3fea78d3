//! Core data model: monitored targets, snapshots, and change events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// One axis of change detection for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorKind {
    Profile,
    Following,
    Tweets,
}

impl MonitorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorKind::Profile => "profile",
            MonitorKind::Following => "following",
            MonitorKind::Tweets => "tweets",
        }
    }

    /// Fixed ordering used for message sequencing within one poll cycle:
    /// profile before following before tweets.
    pub fn rank(&self) -> u8 {
        match self {
            MonitorKind::Profile => 0,
            MonitorKind::Following => 1,
            MonitorKind::Tweets => 2,
        }
    }
}

impl fmt::Display for MonitorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A monitored account. Built from configuration at startup, immutable for the run.
#[derive(Debug, Clone)]
pub struct Target {
    pub username: String,
    pub kinds: BTreeSet<MonitorKind>,
    pub weight: u32,
    /// Destination chat for this target's change notifications.
    pub chat_id: i64,
}

impl Target {
    /// The profile kind is always enabled, regardless of configuration input.
    pub fn new(
        username: impl Into<String>,
        kinds: impl IntoIterator<Item = MonitorKind>,
        weight: u32,
        chat_id: i64,
    ) -> Self {
        let mut kinds: BTreeSet<MonitorKind> = kinds.into_iter().collect();
        kinds.insert(MonitorKind::Profile);
        Self {
            username: username.into(),
            kinds,
            weight,
            chat_id,
        }
    }

    pub fn pairs(&self) -> impl Iterator<Item = PairKey> + '_ {
        self.kinds.iter().map(|kind| PairKey {
            username: self.username.clone(),
            kind: *kind,
        })
    }
}

/// Identity of one (target, monitor kind) pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PairKey {
    pub username: String,
    pub kind: MonitorKind,
}

impl PairKey {
    pub fn new(username: impl Into<String>, kind: MonitorKind) -> Self {
        Self {
            username: username.into(),
            kind,
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.username, self.kind)
    }
}

/// Observable profile state for one target at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub user_id: String,
    pub display_name: String,
    pub bio: String,
    pub avatar_url: String,
    pub location: String,
}

/// Last-accepted follow-list state. `pending_removal` carries the debounce
/// markers for accounts that have gone missing from the upstream listing but
/// are not yet confirmed unfollowed; they remain part of `followed` until then.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FollowingSnapshot {
    pub followed: BTreeSet<String>,
    #[serde(default)]
    pub pending_removal: BTreeMap<String, u32>,
}

impl FollowingSnapshot {
    pub fn from_set(followed: BTreeSet<String>) -> Self {
        Self {
            followed,
            pending_removal: BTreeMap::new(),
        }
    }
}

/// One tweet as normalized by the fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TweetRecord {
    pub id: u64,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub photo_urls: Vec<String>,
    #[serde(default)]
    pub video_urls: Vec<String>,
    #[serde(default)]
    pub quoted: Option<QuotedTweet>,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotedTweet {
    pub username: String,
    pub text: String,
}

/// The most-recent tweet window, ordered newest-first.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TweetsSnapshot {
    pub tweets: Vec<TweetRecord>,
}

impl TweetsSnapshot {
    pub fn ids(&self) -> BTreeSet<u64> {
        self.tweets.iter().map(|t| t.id).collect()
    }

    /// Oldest id still covered by this window, if any.
    pub fn floor_id(&self) -> Option<u64> {
        self.tweets.iter().map(|t| t.id).min()
    }
}

/// Canonical representation of one monitor kind's state for one target.
/// Never mutated after creation; the diff engine produces a replacement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "state", rename_all = "lowercase")]
pub enum Snapshot {
    Profile(ProfileSnapshot),
    Following(FollowingSnapshot),
    Tweets(TweetsSnapshot),
}

impl Snapshot {
    pub fn kind(&self) -> MonitorKind {
        match self {
            Snapshot::Profile(_) => MonitorKind::Profile,
            Snapshot::Following(_) => MonitorKind::Following,
            Snapshot::Tweets(_) => MonitorKind::Tweets,
        }
    }
}

/// Direction of a detected change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

/// Kind-specific payload fragment for a change event. Serialized only for
/// logging; events are never read back, so there is no Deserialize.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ChangeDetail {
    ProfileField {
        field: &'static str,
        old: String,
        new: String,
    },
    Followed {
        account: String,
    },
    Unfollowed {
        account: String,
    },
    NewTweet {
        tweet: TweetRecord,
    },
    DeletedTweet {
        id: u64,
    },
}

/// One detected difference between two snapshots. Consumed once by the
/// notification dispatcher; not persisted beyond delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub username: String,
    pub monitor: MonitorKind,
    pub change: ChangeKind,
    pub detail: ChangeDetail,
    pub detected_at: DateTime<Utc>,
}
