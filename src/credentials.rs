//! Credential pool: a fixed set of independently authenticated cookie
//! sessions, rotated least-recently-used, with a per-credential health state
//! machine (healthy → degraded → disabled, no way back from disabled).

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::health::{HealthEvent, HealthSink};

/// Transient-failure score at which a credential is marked degraded.
const DEGRADE_SCORE: f64 = 3.0;
/// Score below which a degraded credential recovers to healthy.
const RECOVER_SCORE: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialHealth {
    Healthy,
    Degraded,
    Disabled,
}

/// Opaque cookie material for one authenticated session.
#[derive(Debug, Clone)]
pub struct CredentialMaterial {
    pub label: String,
    pub auth_token: String,
    pub ct0: String,
}

/// Outcome of one fetch, as it affects the credential that performed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialOutcome {
    Success,
    /// Upstream rejected the session (disabling-class).
    AuthRejected,
    /// Timeout, rate limit, or upstream 5xx-equivalent.
    Transient,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no healthy credentials available")]
    Exhausted,
}

/// Lease for one in-flight fetch. Held for the pipeline's duration and
/// released by `CredentialPool::report`.
#[derive(Debug, Clone)]
pub struct CredentialLease {
    pub label: String,
    pub auth_token: String,
    pub ct0: String,
}

#[derive(Debug)]
struct Slot {
    material: CredentialMaterial,
    health: CredentialHealth,
    consecutive_auth_failures: u32,
    failure_score: f64,
    last_used: Option<DateTime<Utc>>,
    in_use: bool,
}

/// Single mutex-guarded registry; all health mutation is synchronized here.
pub struct CredentialPool {
    slots: Mutex<Vec<Slot>>,
    auth_failure_threshold: u32,
    health: HealthSink,
}

impl CredentialPool {
    pub fn new(
        credentials: Vec<CredentialMaterial>,
        auth_failure_threshold: u32,
        health: HealthSink,
    ) -> Self {
        let slots = credentials
            .into_iter()
            .map(|material| Slot {
                material,
                health: CredentialHealth::Healthy,
                consecutive_auth_failures: 0,
                failure_score: 0.0,
                last_used: None,
                in_use: false,
            })
            .collect();
        Self {
            slots: Mutex::new(slots),
            auth_failure_threshold: auth_failure_threshold.max(1),
            health,
        }
    }

    /// Least-recently-used non-disabled credential that is not already leased.
    /// Never-used credentials sort first.
    pub async fn acquire(&self) -> Result<CredentialLease, PoolError> {
        let mut slots = self.slots.lock().await;
        let candidate = slots
            .iter_mut()
            .filter(|s| s.health != CredentialHealth::Disabled && !s.in_use)
            .min_by_key(|s| s.last_used);

        match candidate {
            Some(slot) => {
                slot.in_use = true;
                debug!(credential = %slot.material.label, "credential acquired");
                Ok(CredentialLease {
                    label: slot.material.label.clone(),
                    auth_token: slot.material.auth_token.clone(),
                    ct0: slot.material.ct0.clone(),
                })
            }
            None => Err(PoolError::Exhausted),
        }
    }

    /// Release the lease and fold the fetch outcome into the credential's
    /// health. An unknown label is ignored (the pool never removes slots, so
    /// this only happens in tests wiring things up by hand).
    pub async fn report(&self, lease: &CredentialLease, outcome: CredentialOutcome) {
        let mut slots = self.slots.lock().await;
        let Some(slot) = slots.iter_mut().find(|s| s.material.label == lease.label) else {
            warn!(credential = %lease.label, "report for unknown credential");
            return;
        };

        slot.in_use = false;
        slot.last_used = Some(Utc::now());

        match outcome {
            CredentialOutcome::Success => {
                slot.consecutive_auth_failures = 0;
                slot.failure_score /= 2.0;
                if slot.health == CredentialHealth::Degraded && slot.failure_score < RECOVER_SCORE {
                    info!(credential = %slot.material.label, "credential recovered to healthy");
                    slot.health = CredentialHealth::Healthy;
                }
            }
            CredentialOutcome::AuthRejected => {
                slot.consecutive_auth_failures += 1;
                if slot.health == CredentialHealth::Disabled {
                    return;
                }
                if slot.consecutive_auth_failures >= self.auth_failure_threshold {
                    warn!(
                        credential = %slot.material.label,
                        failures = slot.consecutive_auth_failures,
                        "credential disabled after repeated auth rejections"
                    );
                    slot.health = CredentialHealth::Disabled;
                    self.health.record(HealthEvent::CredentialDisabled {
                        label: slot.material.label.clone(),
                    });
                } else if slot.health == CredentialHealth::Healthy {
                    slot.health = CredentialHealth::Degraded;
                }
            }
            CredentialOutcome::Transient => {
                slot.failure_score += 1.0;
                if slot.health == CredentialHealth::Healthy && slot.failure_score >= DEGRADE_SCORE {
                    warn!(credential = %slot.material.label, "credential degraded by transient failures");
                    slot.health = CredentialHealth::Degraded;
                }
            }
        }
    }

    /// Number of non-disabled credentials; this is the scheduler's dispatch
    /// budget denominator. Leased credentials still count (they bound
    /// concurrency separately).
    pub async fn available(&self) -> usize {
        let slots = self.slots.lock().await;
        slots
            .iter()
            .filter(|s| s.health != CredentialHealth::Disabled)
            .count()
    }

    pub async fn health_of(&self, label: &str) -> Option<CredentialHealth> {
        let slots = self.slots.lock().await;
        slots
            .iter()
            .find(|s| s.material.label == label)
            .map(|s| s.health)
    }
}
