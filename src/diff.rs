//! Diff engine: compares a freshly fetched snapshot against the last-accepted
//! one and produces a minimal, stable, correctly-ordered list of change
//! events, plus the snapshot the store should accept.
//!
//! Kind-specific policy:
//! - profile: field-by-field, one `Modified` event per changed field
//! - following: set difference, with removals debounced across consecutive
//!   polls because the upstream listing drops entries for large follow-lists
//! - tweets: window comparison, additions emitted oldest-to-newest

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::types::{
    ChangeDetail, ChangeEvent, ChangeKind, FollowingSnapshot, MonitorKind, PairKey,
    ProfileSnapshot, Snapshot, TweetsSnapshot,
};

#[derive(Debug, Clone)]
pub struct DiffConfig {
    /// Consecutive polls an account must be missing from the follow listing
    /// before an unfollow event is emitted.
    pub removal_confirmation_polls: u32,
    /// Tweets first seen more than this many seconds after creation are
    /// treated as backfill, not new activity.
    pub tweet_freshness_secs: i64,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            removal_confirmation_polls: 2,
            tweet_freshness_secs: 300,
        }
    }
}

/// Events plus the snapshot to persist as the new last-accepted state.
#[derive(Debug, Clone)]
pub struct DiffResult {
    pub events: Vec<ChangeEvent>,
    pub accepted: Snapshot,
}

#[derive(Debug, Clone)]
pub struct DiffEngine {
    config: DiffConfig,
}

impl DiffEngine {
    pub fn new(config: DiffConfig) -> Self {
        Self { config }
    }

    /// First poll (no previous snapshot) establishes a baseline and emits
    /// nothing. Diffing a snapshot against itself emits nothing.
    pub fn diff(
        &self,
        pair: &PairKey,
        previous: Option<&Snapshot>,
        fetched: &Snapshot,
        now: DateTime<Utc>,
    ) -> Result<DiffResult> {
        if fetched.kind() != pair.kind {
            bail!(
                "snapshot kind {} does not match pair {}",
                fetched.kind(),
                pair
            );
        }
        match (previous, fetched) {
            (None, _) => {
                debug!(pair = %pair, "baseline established");
                Ok(DiffResult {
                    events: Vec::new(),
                    accepted: fetched.clone(),
                })
            }
            (Some(Snapshot::Profile(old)), Snapshot::Profile(new)) => {
                Ok(self.diff_profile(pair, old, new, now))
            }
            (Some(Snapshot::Following(old)), Snapshot::Following(new)) => {
                Ok(self.diff_following(pair, old, new, now))
            }
            (Some(Snapshot::Tweets(old)), Snapshot::Tweets(new)) => {
                Ok(self.diff_tweets(pair, old, new, now))
            }
            (Some(old), new) => bail!(
                "stored snapshot kind {} does not match fetched kind {} for {}",
                old.kind(),
                new.kind(),
                pair
            ),
        }
    }

    fn diff_profile(
        &self,
        pair: &PairKey,
        old: &ProfileSnapshot,
        new: &ProfileSnapshot,
        now: DateTime<Utc>,
    ) -> DiffResult {
        let fields: [(&'static str, &str, &str); 4] = [
            ("display name", &old.display_name, &new.display_name),
            ("bio", &old.bio, &new.bio),
            ("avatar", &old.avatar_url, &new.avatar_url),
            ("location", &old.location, &new.location),
        ];

        let events = fields
            .into_iter()
            .filter(|(_, old_value, new_value)| old_value != new_value)
            .map(|(field, old_value, new_value)| ChangeEvent {
                username: pair.username.clone(),
                monitor: MonitorKind::Profile,
                change: ChangeKind::Modified,
                detail: ChangeDetail::ProfileField {
                    field,
                    old: old_value.to_string(),
                    new: new_value.to_string(),
                },
                detected_at: now,
            })
            .collect();

        DiffResult {
            events,
            accepted: Snapshot::Profile(new.clone()),
        }
    }

    fn diff_following(
        &self,
        pair: &PairKey,
        old: &FollowingSnapshot,
        new: &FollowingSnapshot,
        now: DateTime<Utc>,
    ) -> DiffResult {
        let fresh = &new.followed;
        let mut events = Vec::new();
        let mut accepted_set: BTreeSet<String> = fresh.clone();
        let mut pending: BTreeMap<String, u32> = BTreeMap::new();

        // Additions are not debounced: duplicate sightings are self-correcting
        // because the id is already in the accepted set.
        for account in fresh.difference(&old.followed) {
            events.push(ChangeEvent {
                username: pair.username.clone(),
                monitor: MonitorKind::Following,
                change: ChangeKind::Added,
                detail: ChangeDetail::Followed {
                    account: account.clone(),
                },
                detected_at: now,
            });
        }

        // Removals must survive the confirmation window; a one-off absence is
        // assumed to be an incomplete upstream page.
        for account in old.followed.difference(fresh) {
            let absences = old.pending_removal.get(account).copied().unwrap_or(0) + 1;
            if absences >= self.config.removal_confirmation_polls {
                events.push(ChangeEvent {
                    username: pair.username.clone(),
                    monitor: MonitorKind::Following,
                    change: ChangeKind::Removed,
                    detail: ChangeDetail::Unfollowed {
                        account: account.clone(),
                    },
                    detected_at: now,
                });
            } else {
                // Still within the window: keep the account in the accepted
                // set and carry the marker forward.
                accepted_set.insert(account.clone());
                pending.insert(account.clone(), absences);
            }
        }

        DiffResult {
            events,
            accepted: Snapshot::Following(FollowingSnapshot {
                followed: accepted_set,
                pending_removal: pending,
            }),
        }
    }

    fn diff_tweets(
        &self,
        pair: &PairKey,
        old: &TweetsSnapshot,
        new: &TweetsSnapshot,
        now: DateTime<Utc>,
    ) -> DiffResult {
        // An empty window against a non-empty one is indistinguishable from
        // an upstream hiccup: no removals, and the old window stays the
        // baseline so the next real page does not re-announce known tweets.
        if new.tweets.is_empty() && !old.tweets.is_empty() {
            debug!(pair = %pair, "empty tweet window; keeping previous baseline");
            return DiffResult {
                events: Vec::new(),
                accepted: Snapshot::Tweets(old.clone()),
            };
        }

        let old_ids = old.ids();
        let new_ids = new.ids();
        let freshness_cutoff = now - Duration::seconds(self.config.tweet_freshness_secs);
        let mut events = Vec::new();

        // New tweets: not in the previous window, not older than the window
        // floor (those are backfill scrolling into view), and recent enough.
        let old_floor = old.floor_id().unwrap_or(0);
        let mut added: Vec<_> = new
            .tweets
            .iter()
            .filter(|t| !old_ids.contains(&t.id) && t.id > old_floor)
            .filter(|t| t.created_at >= freshness_cutoff)
            .collect();
        // Oldest-to-newest, so notifications read chronologically.
        added.sort_by_key(|t| t.id);
        for tweet in added {
            events.push(ChangeEvent {
                username: pair.username.clone(),
                monitor: MonitorKind::Tweets,
                change: ChangeKind::Added,
                detail: ChangeDetail::NewTweet {
                    tweet: tweet.clone(),
                },
                detected_at: now,
            });
        }

        // Deletions are a reliable signal and are not debounced. Ids below
        // the new window floor have merely scrolled out of view.
        let new_floor = new.floor_id().unwrap_or(0);
        let mut removed: Vec<u64> = old_ids
            .iter()
            .filter(|id| !new_ids.contains(id) && **id >= new_floor)
            .copied()
            .collect();
        removed.sort_unstable();
        for id in removed {
            events.push(ChangeEvent {
                username: pair.username.clone(),
                monitor: MonitorKind::Tweets,
                change: ChangeKind::Removed,
                detail: ChangeDetail::DeletedTweet { id },
                detected_at: now,
            });
        }

        DiffResult {
            events,
            accepted: Snapshot::Tweets(new.clone()),
        }
    }
}
