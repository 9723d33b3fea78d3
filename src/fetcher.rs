//! Snapshot fetcher boundary and the GraphQL HTTP implementation against the
//! unofficial upstream API. Cookie-authenticated, rate limited, and normalizing
//! everything into canonical snapshots.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::credentials::{CredentialLease, CredentialOutcome};
use crate::types::{
    FollowingSnapshot, MonitorKind, ProfileSnapshot, QuotedTweet, Snapshot, Target, TweetRecord,
    TweetsSnapshot,
};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("authentication rejected by upstream")]
    AuthExpired,
    #[error("rate limited by upstream")]
    RateLimited,
    #[error("upstream unreachable: {0}")]
    Unreachable(String),
    #[error("malformed upstream response: {0}")]
    MalformedResponse(String),
}

impl FetchError {
    /// How this failure reflects on the credential that performed the fetch.
    pub fn credential_outcome(&self) -> CredentialOutcome {
        match self {
            FetchError::AuthExpired => CredentialOutcome::AuthRejected,
            FetchError::RateLimited | FetchError::Unreachable(_) => CredentialOutcome::Transient,
            // The session worked; the payload was the problem.
            FetchError::MalformedResponse(_) => CredentialOutcome::Success,
        }
    }
}

/// Boundary consumed by the scheduler's poll pipelines.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch(
        &self,
        target: &Target,
        kind: MonitorKind,
        lease: &CredentialLease,
    ) -> Result<Snapshot, FetchError>;
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Base URL of the upstream GraphQL gateway.
    pub base_url: String,
    /// Per-request timeout (seconds).
    pub timeout_secs: u64,
    /// Shared outbound budget across all credentials.
    pub rate_limit_per_minute: u32,
    /// How many recent tweets one timeline fetch asks for.
    pub tweet_window: u32,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.twitter.com/graphql".to_string(),
            timeout_secs: 20,
            rate_limit_per_minute: 30,
            tweet_window: 40,
        }
    }
}

/// Upstream user lookup payload.
#[derive(Debug, Deserialize)]
struct UserEnvelope {
    user: UserPayload,
}

#[derive(Debug, Deserialize)]
struct UserPayload {
    rest_id: String,
    legacy: UserLegacy,
}

#[derive(Debug, Deserialize)]
struct UserLegacy {
    name: Option<String>,
    description: Option<String>,
    profile_image_url_https: Option<String>,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FollowingEnvelope {
    users: Vec<FollowEntry>,
}

#[derive(Debug, Deserialize)]
struct FollowEntry {
    screen_name: String,
}

#[derive(Debug, Deserialize)]
struct TimelineEnvelope {
    tweets: Vec<TweetEntry>,
}

#[derive(Debug, Deserialize)]
struct TweetEntry {
    rest_id: String,
    screen_name: String,
    full_text: String,
    created_at: String,
    #[serde(default)]
    photo_urls: Vec<String>,
    #[serde(default)]
    video_urls: Vec<String>,
    #[serde(default)]
    quoted: Option<QuotedEntry>,
    #[serde(default)]
    source: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QuotedEntry {
    screen_name: String,
    full_text: String,
}

/// Production fetcher against the unofficial GraphQL endpoints.
pub struct GraphqlSnapshotFetcher {
    http_client: Client,
    config: FetcherConfig,
    rate_limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl GraphqlSnapshotFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let quota = Quota::per_minute(
            NonZeroU32::new(config.rate_limit_per_minute.max(1))
                .expect("rate limit is clamped to at least 1"),
        );
        Ok(Self {
            http_client,
            config,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }

    fn endpoint(&self, api_name: &str, username: &str) -> String {
        format!(
            "{}/{}?screen_name={}",
            self.config.base_url,
            api_name,
            urlencoding::encode(username)
        )
    }

    /// Issue one authenticated GET and map transport/status failures onto the
    /// fetch error taxonomy.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        lease: &CredentialLease,
    ) -> Result<T, FetchError> {
        self.rate_limiter.until_ready().await;

        let response = self
            .http_client
            .get(url)
            .header(
                "Cookie",
                format!("auth_token={}; ct0={}", lease.auth_token, lease.ct0),
            )
            .header("x-csrf-token", &lease.ct0)
            .send()
            .await
            .map_err(|e| FetchError::Unreachable(e.to_string()))?;

        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(FetchError::AuthExpired)
            }
            StatusCode::TOO_MANY_REQUESTS => return Err(FetchError::RateLimited),
            s if s.is_server_error() => {
                return Err(FetchError::Unreachable(format!("upstream status {}", s)))
            }
            s if !s.is_success() => {
                let body = response.text().await.unwrap_or_default();
                return Err(FetchError::MalformedResponse(format!(
                    "unexpected status {}: {}",
                    s, body
                )));
            }
            _ => {}
        }

        response
            .json::<T>()
            .await
            .map_err(|e| FetchError::MalformedResponse(e.to_string()))
    }

    async fn fetch_profile(
        &self,
        target: &Target,
        lease: &CredentialLease,
    ) -> Result<Snapshot, FetchError> {
        let url = self.endpoint("UserByScreenName", &target.username);
        let envelope: UserEnvelope = self.get_json(&url, lease).await?;
        let legacy = envelope.user.legacy;
        Ok(Snapshot::Profile(ProfileSnapshot {
            user_id: envelope.user.rest_id,
            display_name: legacy.name.unwrap_or_default(),
            bio: legacy.description.unwrap_or_default(),
            avatar_url: legacy.profile_image_url_https.unwrap_or_default(),
            location: legacy.location.unwrap_or_default(),
        }))
    }

    async fn fetch_following(
        &self,
        target: &Target,
        lease: &CredentialLease,
    ) -> Result<Snapshot, FetchError> {
        let url = self.endpoint("Following", &target.username);
        let envelope: FollowingEnvelope = self.get_json(&url, lease).await?;
        let followed: BTreeSet<String> = envelope
            .users
            .into_iter()
            .map(|entry| entry.screen_name)
            .collect();
        Ok(Snapshot::Following(FollowingSnapshot::from_set(followed)))
    }

    async fn fetch_tweets(
        &self,
        target: &Target,
        lease: &CredentialLease,
    ) -> Result<Snapshot, FetchError> {
        let url = format!(
            "{}&count={}",
            self.endpoint("UserTweets", &target.username),
            self.config.tweet_window
        );
        let envelope: TimelineEnvelope = self.get_json(&url, lease).await?;

        let mut tweets = Vec::with_capacity(envelope.tweets.len());
        for entry in envelope.tweets {
            // The listing endpoint mixes in retweeted/promoted authors; keep
            // only tweets actually authored by the target.
            if !entry.screen_name.eq_ignore_ascii_case(&target.username) {
                debug!(
                    target = %target.username,
                    author = %entry.screen_name,
                    "skipping tweet from foreign author"
                );
                continue;
            }
            tweets.push(normalize_tweet(entry)?);
        }
        // Newest-first is the canonical order.
        tweets.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(Snapshot::Tweets(TweetsSnapshot { tweets }))
    }
}

fn normalize_tweet(entry: TweetEntry) -> Result<TweetRecord, FetchError> {
    let id: u64 = entry
        .rest_id
        .parse()
        .map_err(|_| FetchError::MalformedResponse(format!("bad tweet id '{}'", entry.rest_id)))?;
    let created_at: DateTime<Utc> = entry
        .created_at
        .parse()
        .map_err(|_| {
            FetchError::MalformedResponse(format!("bad tweet timestamp '{}'", entry.created_at))
        })?;
    Ok(TweetRecord {
        id,
        text: entry.full_text,
        created_at,
        photo_urls: entry.photo_urls,
        video_urls: entry.video_urls,
        quoted: entry.quoted.map(|q| QuotedTweet {
            username: q.screen_name,
            text: q.full_text,
        }),
        source: entry.source,
    })
}

#[async_trait]
impl SnapshotFetcher for GraphqlSnapshotFetcher {
    #[instrument(skip(self, lease), fields(target = %target.username, kind = %kind))]
    async fn fetch(
        &self,
        target: &Target,
        kind: MonitorKind,
        lease: &CredentialLease,
    ) -> Result<Snapshot, FetchError> {
        let result = match kind {
            MonitorKind::Profile => self.fetch_profile(target, lease).await,
            MonitorKind::Following => self.fetch_following(target, lease).await,
            MonitorKind::Tweets => self.fetch_tweets(target, lease).await,
        };
        if let Err(e) = &result {
            warn!(credential = %lease.label, error = %e, "fetch failed");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, author: &str) -> TweetEntry {
        TweetEntry {
            rest_id: id.to_string(),
            screen_name: author.to_string(),
            full_text: "hello".to_string(),
            created_at: "2024-05-01T12:00:00Z".to_string(),
            photo_urls: vec![],
            video_urls: vec![],
            quoted: None,
            source: Some("Twitter Web App".to_string()),
        }
    }

    #[test]
    fn test_normalize_tweet() {
        let record = normalize_tweet(entry("123456", "alice")).unwrap();
        assert_eq!(record.id, 123456);
        assert_eq!(record.text, "hello");
        assert_eq!(record.source.as_deref(), Some("Twitter Web App"));
    }

    #[test]
    fn test_normalize_rejects_bad_id() {
        let err = normalize_tweet(entry("not-a-number", "alice")).unwrap_err();
        assert!(matches!(err, FetchError::MalformedResponse(_)));
    }

    #[test]
    fn test_normalize_rejects_bad_timestamp() {
        let mut bad = entry("1", "alice");
        bad.created_at = "yesterday".to_string();
        assert!(matches!(
            normalize_tweet(bad),
            Err(FetchError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_error_to_credential_outcome() {
        assert_eq!(
            FetchError::AuthExpired.credential_outcome(),
            CredentialOutcome::AuthRejected
        );
        assert_eq!(
            FetchError::RateLimited.credential_outcome(),
            CredentialOutcome::Transient
        );
        assert_eq!(
            FetchError::Unreachable("x".into()).credential_outcome(),
            CredentialOutcome::Transient
        );
        assert_eq!(
            FetchError::MalformedResponse("x".into()).credential_outcome(),
            CredentialOutcome::Success
        );
    }

    #[test]
    fn test_endpoint_encodes_username() {
        let fetcher = GraphqlSnapshotFetcher::new(FetcherConfig::default()).unwrap();
        let url = fetcher.endpoint("UserByScreenName", "weird name");
        assert!(url.contains("screen_name=weird%20name"));
    }
}
