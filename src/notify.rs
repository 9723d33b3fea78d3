//! Notification delivery over the Telegram Bot API, change-event rendering,
//! and the maintainer command listener used for startup acknowledgement and
//! remote shutdown.

use async_trait::async_trait;
use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::types::{ChangeDetail, ChangeEvent};
use crate::utils::with_retry;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("telegram api error: {0}")]
    Api(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Boundary consumed by the scheduler pipelines and the health monitor.
/// Delivery is best-effort: failures are logged upstream and never block a
/// poll cycle.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn deliver(&self, chat_id: i64, text: &str) -> Result<(), DeliveryError>;
}

/// Deliver with one immediate retry, then give up. Notification loss is
/// acceptable; state corruption is not.
pub async fn deliver_with_retry(
    dispatcher: &dyn NotificationDispatcher,
    chat_id: i64,
    text: &str,
) -> Result<(), DeliveryError> {
    with_retry(2, || dispatcher.deliver(chat_id, text)).await
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    description: Option<String>,
}

/// Telegram Bot API dispatcher.
pub struct TelegramDispatcher {
    http_client: Client,
    bot_token: String,
    rate_limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl TelegramDispatcher {
    pub fn new(bot_token: String, rate_limit_per_minute: u32) -> anyhow::Result<Self> {
        let quota = Quota::per_minute(
            NonZeroU32::new(rate_limit_per_minute.max(1)).expect("rate limit clamped to at least 1"),
        );
        Ok(Self {
            http_client: Client::builder()
                .timeout(Duration::from_secs(15))
                .build()?,
            bot_token,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }
}

#[async_trait]
impl NotificationDispatcher for TelegramDispatcher {
    async fn deliver(&self, chat_id: i64, text: &str) -> Result<(), DeliveryError> {
        self.rate_limiter.until_ready().await;

        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let response = self
            .http_client
            .post(&url)
            .json(&json!({
                "chat_id": chat_id,
                "text": text,
                "disable_web_page_preview": true,
            }))
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = response.status();
        let body: TelegramResponse = response
            .json()
            .await
            .map_err(|e| DeliveryError::Api(format!("unparseable response: {e}")))?;

        if !status.is_success() || !body.ok {
            return Err(DeliveryError::Api(format!(
                "status {}: {}",
                status,
                body.description.unwrap_or_default()
            )));
        }
        debug!(chat_id, "notification delivered");
        Ok(())
    }
}

/// Render one change event as chat text. Event order within a cycle (profile,
/// following, tweets) is the scheduler's concern; this only shapes the text.
pub fn render_event(event: &ChangeEvent) -> String {
    match &event.detail {
        ChangeDetail::ProfileField { field, old, new } => format!(
            "@{} changed {}:\n  old: {}\n  new: {}",
            event.username, field, old, new
        ),
        ChangeDetail::Followed { account } => {
            format!("@{} started following @{}", event.username, account)
        }
        ChangeDetail::Unfollowed { account } => {
            format!("@{} unfollowed @{}", event.username, account)
        }
        ChangeDetail::NewTweet { tweet } => {
            let mut text = format!("@{} tweeted:\n{}", event.username, tweet.text);
            if let Some(quoted) = &tweet.quoted {
                text.push_str(&format!("\n\nQuote @{}: {}", quoted.username, quoted.text));
            }
            for url in tweet.photo_urls.iter().chain(tweet.video_urls.iter()) {
                text.push_str(&format!("\n{url}"));
            }
            if let Some(source) = &tweet.source {
                text.push_str(&format!("\n\nSource: {source}"));
            }
            text
        }
        ChangeDetail::DeletedTweet { id } => {
            format!("@{} deleted tweet {}", event.username, id)
        }
    }
}

#[derive(Debug, Deserialize)]
struct GetUpdatesResponse {
    ok: bool,
    result: Option<Vec<Update>>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    chat: Chat,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

/// Polls the maintainer chat for control commands: the startup
/// acknowledgement token and the graceful-shutdown token.
pub struct TelegramCommander {
    http_client: Client,
    bot_token: String,
    maintainer_chat_id: i64,
    last_update_id: Mutex<Option<i64>>,
}

impl TelegramCommander {
    pub fn new(bot_token: String, maintainer_chat_id: i64) -> anyhow::Result<Self> {
        Ok(Self {
            http_client: Client::builder()
                .timeout(Duration::from_secs(40))
                .build()?,
            bot_token,
            maintainer_chat_id,
            last_update_id: Mutex::new(None),
        })
    }

    /// One getUpdates long-poll; returns command texts from the maintainer
    /// chat only.
    async fn poll_commands(&self) -> Result<Vec<String>, DeliveryError> {
        let offset = {
            let last_id = self.last_update_id.lock().await;
            last_id.map(|id| id + 1).unwrap_or(0)
        };
        let url = format!(
            "https://api.telegram.org/bot{}/getUpdates?offset={}&timeout=25",
            self.bot_token, offset
        );

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        let updates: GetUpdatesResponse = response
            .json()
            .await
            .map_err(|e| DeliveryError::Api(format!("unparseable response: {e}")))?;
        if !updates.ok {
            return Err(DeliveryError::Api("getUpdates returned ok=false".into()));
        }

        let updates = updates.result.unwrap_or_default();
        if let Some(last) = updates.last() {
            let mut last_id = self.last_update_id.lock().await;
            *last_id = Some(last.update_id);
        }

        Ok(updates
            .into_iter()
            .filter_map(|u| u.message)
            .filter(|m| m.chat.id == self.maintainer_chat_id)
            .filter_map(|m| m.text)
            .collect())
    }

    /// Block until the maintainer sends `token` (or cancellation). Returns
    /// whether the token arrived.
    pub async fn wait_for_token(&self, token: &str, cancel: &CancellationToken) -> bool {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                result = with_retry(2, || self.poll_commands()) => {
                    match result {
                        Ok(commands) => {
                            if commands.iter().any(|c| c.trim() == token) {
                                return true;
                            }
                        }
                        Err(e) => {
                            warn!("command poll failed: {}", e);
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
        }
    }

    /// Listen for the shutdown token and trip the cancellation token when it
    /// arrives.
    pub async fn run_exit_listener(self: Arc<Self>, token: String, cancel: CancellationToken) {
        info!("exit listener started; shutdown token is '{}'", token);
        if self.wait_for_token(&token, &cancel).await {
            info!("shutdown token received from maintainer; stopping");
            cancel.cancel();
        }
    }
}
