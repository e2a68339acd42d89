//! Key pool state machine and cooldown-guarded rotation
//!
//! The pool holds an ordered, fixed list of API keys and a per-key status
//! (Healthy, QuotaExceeded, Failed). One key is active at a time. Rotation
//! advances to the next healthy key in declared order, but at most once per
//! cooldown window so a burst of concurrent failures cannot thrash through the
//! whole pool.
//!
//! All mutable state sits behind a single mutex; no lock is held across I/O.

use std::time::Duration;

use common::Secret;
use provider::ErrorClassification;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Runtime status of a pool key.
///
/// Transitions:
/// - Healthy → QuotaExceeded (quota error)
/// - Healthy → Failed (any other error)
/// - QuotaExceeded → Failed (later non-quota error)
/// - Failed is terminal for the process lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Healthy,
    QuotaExceeded,
    Failed,
}

impl KeyStatus {
    /// Status label for health/logging.
    pub fn label(&self) -> &'static str {
        match self {
            KeyStatus::Healthy => "healthy",
            KeyStatus::QuotaExceeded => "quota_exceeded",
            KeyStatus::Failed => "failed",
        }
    }

    fn is_healthy(&self) -> bool {
        matches!(self, KeyStatus::Healthy)
    }
}

/// How a key failed, as reported to `mark_failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Quota,
    Generic,
}

impl From<ErrorClassification> for Failure {
    fn from(classification: ErrorClassification) -> Self {
        if classification.is_quota() {
            Failure::Quota
        } else {
            Failure::Generic
        }
    }
}

/// Outcome of a rotation attempt. None of these is an error: callers decide
/// whether to carry on with the current key or give up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rotation {
    /// The active key moved to `label`.
    Rotated { label: String },
    /// The previous rotation was too recent.
    CoolingDown { remaining: Duration },
    /// No other healthy key exists; the active key is unchanged.
    Exhausted,
    /// The pool has no keys at all.
    Empty,
}

impl Rotation {
    pub fn is_rotated(&self) -> bool {
        matches!(self, Rotation::Rotated { .. })
    }

    /// Outcome label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Rotation::Rotated { .. } => "rotated",
            Rotation::CoolingDown { .. } => "cooling_down",
            Rotation::Exhausted => "exhausted",
            Rotation::Empty => "empty",
        }
    }
}

/// A key as loaded into the pool: a loggable label plus the secret.
#[derive(Debug, Clone)]
pub struct PoolKey {
    pub label: String,
    pub secret: Secret<String>,
}

impl PoolKey {
    pub fn new(label: impl Into<String>, secret: impl Into<Secret<String>>) -> Self {
        Self {
            label: label.into(),
            secret: secret.into(),
        }
    }
}

/// The active key handed to a caller for one attempt.
#[derive(Debug, Clone)]
pub struct SelectedKey {
    pub index: usize,
    pub label: String,
    pub secret: Secret<String>,
}

/// Point-in-time view of pool health, by key label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub current: Option<String>,
    pub failed: Vec<String>,
    pub quota_exceeded: Vec<String>,
    pub healthy: usize,
    pub total: usize,
}

struct PoolState {
    statuses: Vec<KeyStatus>,
    current: usize,
    last_rotation: Option<Instant>,
}

/// Pool of API keys with a single active key.
pub struct KeyPool {
    keys: Vec<PoolKey>,
    state: Mutex<PoolState>,
    rotation_cooldown: Duration,
}

impl KeyPool {
    /// Create a pool over `keys` in the given order. The first key is active.
    pub fn new(keys: Vec<PoolKey>, rotation_cooldown: Duration) -> Self {
        info!(
            keys = keys.len(),
            cooldown_secs = rotation_cooldown.as_secs_f64(),
            "key pool initialized"
        );
        let statuses = vec![KeyStatus::Healthy; keys.len()];
        Self {
            keys,
            state: Mutex::new(PoolState {
                statuses,
                current: 0,
                last_rotation: None,
            }),
            rotation_cooldown,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn rotation_cooldown(&self) -> Duration {
        self.rotation_cooldown
    }

    /// The active key, or `None` if the pool is empty.
    ///
    /// The active key may be unhealthy if its rotation was refused; callers
    /// still get it so the retry budget, not the pool, decides when to stop.
    pub async fn get_current(&self) -> Option<SelectedKey> {
        if self.keys.is_empty() {
            return None;
        }
        let state = self.state.lock().await;
        let key = &self.keys[state.current];
        Some(SelectedKey {
            index: state.current,
            label: key.label.clone(),
            secret: key.secret.clone(),
        })
    }

    /// Move the active key to the next healthy one in declared order.
    pub async fn rotate(&self) -> Rotation {
        let mut state = self.state.lock().await;
        self.rotate_locked(&mut state)
    }

    /// Record a failure for `key`. Every slot holding the same secret is
    /// marked. If the active key was among them, a rotation is attempted and
    /// its outcome returned.
    pub async fn mark_failed(&self, key: &SelectedKey, failure: Failure) -> Option<Rotation> {
        let mut state = self.state.lock().await;
        let mut hit_current = false;

        for (idx, slot) in self.keys.iter().enumerate() {
            if !slot.secret.same_as(&key.secret) {
                continue;
            }
            let next = match (failure, state.statuses[idx]) {
                (_, KeyStatus::Failed) | (Failure::Generic, _) => KeyStatus::Failed,
                (Failure::Quota, _) => KeyStatus::QuotaExceeded,
            };
            state.statuses[idx] = next;
            hit_current |= idx == state.current;
            warn!(key = %slot.label, status = next.label(), "key marked unhealthy");
        }

        let kind = match failure {
            Failure::Quota => "quota",
            Failure::Generic => "generic",
        };
        metrics::counter!("key_pool_failures_total", "kind" => kind).increment(1);

        if hit_current {
            Some(self.rotate_locked(&mut state))
        } else {
            debug!(key = %key.label, "marked key is not active, no rotation");
            None
        }
    }

    /// True when no key can be selected by rotation.
    pub async fn is_exhausted(&self) -> bool {
        let state = self.state.lock().await;
        !state.statuses.iter().any(KeyStatus::is_healthy)
    }

    /// Current status of every key, by label.
    pub async fn snapshot(&self) -> PoolSnapshot {
        let state = self.state.lock().await;
        let mut snapshot = PoolSnapshot {
            current: self.keys.get(state.current).map(|k| k.label.clone()),
            failed: Vec::new(),
            quota_exceeded: Vec::new(),
            healthy: 0,
            total: self.keys.len(),
        };
        for (key, status) in self.keys.iter().zip(&state.statuses) {
            match status {
                KeyStatus::Healthy => snapshot.healthy += 1,
                KeyStatus::QuotaExceeded => snapshot.quota_exceeded.push(key.label.clone()),
                KeyStatus::Failed => snapshot.failed.push(key.label.clone()),
            }
        }
        snapshot
    }

    /// Pool health summary for the health endpoint.
    ///
    /// Status mapping: all keys healthy → healthy, some healthy → degraded,
    /// none healthy (or no keys) → unhealthy. Only labels are reported.
    pub async fn health(&self) -> serde_json::Value {
        let state = self.state.lock().await;
        let healthy = state.statuses.iter().filter(|s| s.is_healthy()).count();
        let total = self.keys.len();

        let keys: Vec<serde_json::Value> = self
            .keys
            .iter()
            .zip(&state.statuses)
            .enumerate()
            .map(|(idx, (key, status))| {
                serde_json::json!({
                    "label": key.label,
                    "status": status.label(),
                    "active": idx == state.current,
                })
            })
            .collect();

        let pool_status = if healthy == total && total > 0 {
            "healthy"
        } else if healthy > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": pool_status,
            "keys_total": total,
            "keys_healthy": healthy,
            "keys_quota_exceeded": state.statuses.iter().filter(|s| **s == KeyStatus::QuotaExceeded).count(),
            "keys_failed": state.statuses.iter().filter(|s| **s == KeyStatus::Failed).count(),
            "keys": keys,
        })
    }

    fn rotate_locked(&self, state: &mut PoolState) -> Rotation {
        let outcome = self.scan(state);
        metrics::counter!("key_pool_rotations_total", "outcome" => outcome.label()).increment(1);
        match &outcome {
            Rotation::Rotated { label } => info!(key = %label, "rotated to next key"),
            Rotation::CoolingDown { remaining } => debug!(
                remaining_ms = remaining.as_millis() as u64,
                "rotation refused, cooldown active"
            ),
            Rotation::Exhausted => warn!(keys = self.keys.len(), "rotation failed, all keys unhealthy"),
            Rotation::Empty => warn!("rotation requested on empty pool"),
        }
        outcome
    }

    fn scan(&self, state: &mut PoolState) -> Rotation {
        let n = self.keys.len();
        if n == 0 {
            return Rotation::Empty;
        }

        if let Some(last) = state.last_rotation {
            let elapsed = last.elapsed();
            if elapsed < self.rotation_cooldown {
                return Rotation::CoolingDown {
                    remaining: self.rotation_cooldown - elapsed,
                };
            }
        }

        for offset in 1..n {
            let idx = (state.current + offset) % n;
            if state.statuses[idx].is_healthy() {
                state.current = idx;
                state.last_rotation = Some(Instant::now());
                return Rotation::Rotated {
                    label: self.keys[idx].label.clone(),
                };
            }
        }
        Rotation::Exhausted
    }
}
