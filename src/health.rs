//! Health monitoring: aggregates failure/success records from the scheduler
//! and credential pool into counters, threshold alerts, and an optional daily
//! summary for the maintainer chat.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::notify::NotificationDispatcher;
use crate::types::PairKey;

/// Number of consecutive pool exhaustions that triggers a maintainer alert.
const POOL_EXHAUSTION_ALERT_THRESHOLD: u64 = 3;

/// One operational health record. Every failure path in the system produces
/// exactly one of these; none are silently swallowed.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthEvent {
    PairDeferredTooLong { pair: PairKey, ticks: u32 },
    CredentialDisabled { label: String },
    PoolExhausted,
    FetchFailure { pair: PairKey, error: String },
    CycleCompleted { dispatched: usize },
}

/// Cloneable sender handed to components that report health records.
/// Recording never blocks; if the monitor is saturated or gone the record
/// is dropped after a log line.
#[derive(Clone)]
pub struct HealthSink {
    tx: mpsc::Sender<HealthEvent>,
}

impl HealthSink {
    pub fn record(&self, event: HealthEvent) {
        if let Err(e) = self.tx.try_send(event) {
            debug!("health record dropped: {}", e);
        }
    }

    /// A sink with no receiver, for tests and dry runs.
    pub fn disconnected() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self { tx }
    }
}

/// Create the health channel shared by all reporting components.
pub fn health_channel(buffer: usize) -> (HealthSink, mpsc::Receiver<HealthEvent>) {
    let (tx, rx) = mpsc::channel(buffer);
    (HealthSink { tx }, rx)
}

/// Aggregate counters since startup (or since the last summary).
#[derive(Debug, Clone, Default)]
pub struct HealthStats {
    pub cycles: u64,
    pub polls_dispatched: u64,
    pub fetch_failures: u64,
    pub pool_exhaustions: u64,
    pub consecutive_pool_exhaustions: u64,
    pub credentials_disabled: u64,
    pub deferrals: u64,
}

/// Consumes health records and periodically reports to the maintainer chat.
pub struct HealthMonitor {
    dispatcher: Option<Arc<dyn NotificationDispatcher>>,
    maintainer_chat_id: i64,
    daily_summary: bool,
    stats: HealthStats,
    since: DateTime<Utc>,
}

impl HealthMonitor {
    pub fn new(
        dispatcher: Option<Arc<dyn NotificationDispatcher>>,
        maintainer_chat_id: i64,
        daily_summary: bool,
    ) -> Self {
        Self {
            dispatcher,
            maintainer_chat_id,
            daily_summary,
            stats: HealthStats::default(),
            since: Utc::now(),
        }
    }

    pub fn stats(&self) -> &HealthStats {
        &self.stats
    }

    /// Drive the monitor until cancellation. The daily summary fires on a
    /// fixed 24h interval when enabled.
    pub async fn run(mut self, mut rx: mpsc::Receiver<HealthEvent>, cancel: CancellationToken) {
        let mut summary_timer = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
        summary_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // interval fires immediately once; consume that so the first summary
        // lands a day in, not at startup.
        summary_timer.tick().await;

        info!("HealthMonitor started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe_event = rx.recv() => match maybe_event {
                    Some(event) => self.apply(event).await,
                    None => break,
                },
                _ = summary_timer.tick() => {
                    if self.daily_summary {
                        self.send_summary().await;
                    }
                }
            }
        }
        info!("HealthMonitor stopped");
    }

    pub async fn apply(&mut self, event: HealthEvent) {
        match event {
            HealthEvent::CycleCompleted { dispatched } => {
                self.stats.cycles += 1;
                self.stats.polls_dispatched += dispatched as u64;
                if dispatched > 0 {
                    self.stats.consecutive_pool_exhaustions = 0;
                }
            }
            HealthEvent::FetchFailure { pair, error } => {
                self.stats.fetch_failures += 1;
                debug!(pair = %pair, error = %error, "fetch failure recorded");
            }
            HealthEvent::PairDeferredTooLong { pair, ticks } => {
                self.stats.deferrals += 1;
                warn!(pair = %pair, ticks, "pair deferred past threshold");
            }
            HealthEvent::PoolExhausted => {
                self.stats.pool_exhaustions += 1;
                self.stats.consecutive_pool_exhaustions += 1;
                if self.stats.consecutive_pool_exhaustions == POOL_EXHAUSTION_ALERT_THRESHOLD {
                    self.alert("credential pool exhausted for several consecutive ticks; polling is stalled")
                        .await;
                }
            }
            HealthEvent::CredentialDisabled { label } => {
                self.stats.credentials_disabled += 1;
                self.alert(&format!(
                    "credential '{}' disabled after repeated auth rejections; operator action required",
                    label
                ))
                .await;
            }
        }
    }

    async fn alert(&self, text: &str) {
        warn!("health alert: {}", text);
        if let Some(dispatcher) = &self.dispatcher {
            if let Err(e) = dispatcher
                .deliver(self.maintainer_chat_id, &format!("⚠️ birdwatch: {}", text))
                .await
            {
                warn!("failed to deliver health alert: {}", e);
            }
        }
    }

    async fn send_summary(&mut self) {
        let text = self.summary_text();
        info!("daily summary: {}", text);
        if let Some(dispatcher) = &self.dispatcher {
            if let Err(e) = dispatcher.deliver(self.maintainer_chat_id, &text).await {
                warn!("failed to deliver daily summary: {}", e);
            }
        }
        self.stats = HealthStats::default();
        self.since = Utc::now();
    }

    fn summary_text(&self) -> String {
        format!(
            "birdwatch daily summary (since {}):\n\
             cycles: {}\npolls dispatched: {}\nfetch failures: {}\n\
             pool exhaustions: {}\ncredentials disabled: {}\ndeferral warnings: {}",
            self.since.format("%Y-%m-%d %H:%M UTC"),
            self.stats.cycles,
            self.stats.polls_dispatched,
            self.stats.fetch_failures,
            self.stats.pool_exhaustions,
            self.stats.credentials_disabled,
            self.stats.deferrals,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MonitorKind;

    #[tokio::test]
    async fn test_counters_accumulate() {
        let mut monitor = HealthMonitor::new(None, 0, false);
        monitor
            .apply(HealthEvent::CycleCompleted { dispatched: 3 })
            .await;
        monitor
            .apply(HealthEvent::FetchFailure {
                pair: PairKey::new("alice", MonitorKind::Profile),
                error: "timeout".into(),
            })
            .await;
        monitor.apply(HealthEvent::PoolExhausted).await;

        let stats = monitor.stats();
        assert_eq!(stats.cycles, 1);
        assert_eq!(stats.polls_dispatched, 3);
        assert_eq!(stats.fetch_failures, 1);
        assert_eq!(stats.pool_exhaustions, 1);
    }

    #[tokio::test]
    async fn test_dispatch_resets_exhaustion_streak() {
        let mut monitor = HealthMonitor::new(None, 0, false);
        monitor.apply(HealthEvent::PoolExhausted).await;
        monitor.apply(HealthEvent::PoolExhausted).await;
        assert_eq!(monitor.stats().consecutive_pool_exhaustions, 2);
        monitor
            .apply(HealthEvent::CycleCompleted { dispatched: 1 })
            .await;
        assert_eq!(monitor.stats().consecutive_pool_exhaustions, 0);
    }

    #[test]
    fn test_disconnected_sink_does_not_panic() {
        let sink = HealthSink::disconnected();
        sink.record(HealthEvent::PoolExhausted);
    }

    #[test]
    fn test_summary_mentions_counters() {
        let mut monitor = HealthMonitor::new(None, 0, true);
        monitor.stats.cycles = 12;
        monitor.stats.fetch_failures = 4;
        let text = monitor.summary_text();
        assert!(text.contains("cycles: 12"));
        assert!(text.contains("fetch failures: 4"));
    }
}
