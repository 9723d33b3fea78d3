//! birdwatch - change monitor for social media accounts
//!
//! Polls a configured set of accounts over rotated cookie credentials,
//! diffs each fetch against the last accepted snapshot, and pushes change
//! notifications to Telegram.

pub mod config;
pub mod credentials;
pub mod diff;
pub mod fetcher;
pub mod health;
pub mod notify;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod utils;

pub use config::{AppConfig, ConfigError};
pub use credentials::{CredentialPool, PoolError};
pub use diff::{DiffConfig, DiffEngine, DiffResult};
pub use fetcher::{FetchError, GraphqlSnapshotFetcher, SnapshotFetcher};
pub use health::{health_channel, HealthEvent, HealthMonitor, HealthSink};
pub use notify::{NotificationDispatcher, TelegramCommander, TelegramDispatcher};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use store::{MemoryStateStore, SqliteStateStore, StateStore};
pub use types::{ChangeEvent, MonitorKind, PairKey, Snapshot, Target};
