//! Resilient execution of key-scoped operations
//!
//! `Resilient` runs an `Operation` against the pool's active key: probe the
//! key, run the real call, and on failure classify the error, report it to
//! the pool (which may rotate), and try again until the retry budget is spent.
//! The retry is a plain loop with a decrementing counter, so a budget of N
//! means at most N + 1 attempts.

use std::sync::Arc;

use common::Secret;
use provider::BoxFuture;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::pool::KeyPool;

/// Retry budget used by `Resilient::run`.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A call that needs an API key.
///
/// `probe` is a cheap liveness check run before `execute` on every attempt,
/// so quota and auth failures surface before the expensive request.
pub trait Operation: Send + Sync {
    type Output: Send;

    /// Name for logs, metrics and errors.
    fn name(&self) -> &'static str;

    fn probe<'a>(&'a self, key: &'a Secret<String>) -> BoxFuture<'a, provider::Result<()>>;

    fn execute<'a>(
        &'a self,
        key: &'a Secret<String>,
    ) -> BoxFuture<'a, provider::Result<Self::Output>>;
}

/// Retry/rotate wrapper around a shared `KeyPool`.
#[derive(Clone)]
pub struct Resilient {
    pool: Arc<KeyPool>,
    max_retries: u32,
}

impl Resilient {
    pub fn new(pool: Arc<KeyPool>, max_retries: u32) -> Self {
        Self { pool, max_retries }
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.pool
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Run `op` with the configured retry budget.
    pub async fn run<O: Operation>(&self, op: &O) -> Result<O::Output> {
        self.run_with_budget(op, self.max_retries).await
    }

    /// Run `op`, retrying at most `max_retries` times after the first failure.
    ///
    /// An empty pool fails immediately with `NoCredentialAvailable`; retrying
    /// cannot help without new keys. Every failed attempt updates pool health
    /// before the budget is checked.
    pub async fn run_with_budget<O: Operation>(
        &self,
        op: &O,
        max_retries: u32,
    ) -> Result<O::Output> {
        let operation = op.name();
        let mut remaining = max_retries;
        let mut attempts = 0u32;

        loop {
            let Some(key) = self.pool.get_current().await else {
                error!(operation, "no API keys configured");
                record_attempt(operation, "no_credential");
                return Err(Error::NoCredentialAvailable { operation });
            };
            attempts += 1;
            debug!(operation, key = %key.label, attempt = attempts, "starting attempt");

            let outcome = match op.probe(&key.secret).await {
                Ok(()) => op.execute(&key.secret).await,
                Err(e) => Err(e),
            };

            let err = match outcome {
                Ok(output) => {
                    record_attempt(operation, "success");
                    if attempts > 1 {
                        info!(operation, key = %key.label, attempts, "operation succeeded after retry");
                    }
                    return Ok(output);
                }
                Err(e) => e,
            };

            let classification = err.classification();
            record_attempt(operation, classification.label());
            warn!(
                operation,
                key = %key.label,
                attempt = attempts,
                classification = classification.label(),
                error = %err,
                "attempt failed"
            );

            if let Some(rotation) = self.pool.mark_failed(&key, classification.into()).await {
                debug!(operation, rotation = rotation.label(), "pool notified");
            }

            if remaining == 0 {
                error!(operation, attempts, "retry budget exhausted");
                return Err(Error::RetryBudgetExhausted {
                    operation,
                    attempts,
                    last: err,
                });
            }
            remaining -= 1;
        }
    }
}

fn record_attempt(operation: &'static str, outcome: &'static str) {
    metrics::counter!(
        "resilient_attempts_total",
        "operation" => operation,
        "outcome" => outcome
    )
    .increment(1);
}
