//! The fleet driver boundary and the retrying executor around it.
//!
//! [`FleetDriver`] is the only place side effects leave the controller.
//! Every call goes through a [`DriverExecutor`], which bounds it with a
//! timeout and retries transient failures with exponential backoff under
//! the same [`IdempotencyToken`].

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use fleetgrid_state::{FleetError, Version, WorkerId};

/// Errors reported by a fleet driver.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DriverError {
    /// Transient failure; the call may be retried.
    #[error("driver unavailable: {0}")]
    Unavailable(String),

    /// Permanent failure; retrying will not help.
    #[error("driver rejected request: {0}")]
    Rejected(String),

    #[error("driver call timed out after {0:?}")]
    Timeout(Duration),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<DriverError>,
    },
}

impl DriverError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

impl From<DriverError> for FleetError {
    fn from(err: DriverError) -> Self {
        let timed_out = match &err {
            DriverError::Timeout(_) => true,
            DriverError::Exhausted { last, .. } => matches!(**last, DriverError::Timeout(_)),
            _ => false,
        };
        if timed_out {
            FleetError::Timeout(err.to_string())
        } else {
            FleetError::Driver(err.to_string())
        }
    }
}

/// Key under which a driver deduplicates retries of one logical action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdempotencyToken(String);

impl IdempotencyToken {
    /// Token for action `seq` of tick `tick`.
    pub fn new(tick: u64, seq: usize) -> Self {
        Self(format!("t{tick}-a{seq}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Provisions and tears down workers and routes traffic between cohorts.
///
/// Implementations must be idempotent under retry with the same token.
#[async_trait]
pub trait FleetDriver: Send + Sync {
    /// Create a worker running `version` and return its id.
    async fn create(&self, version: &str, token: &IdempotencyToken) -> Result<WorkerId, DriverError>;

    /// Terminate a worker. Terminating an unknown worker succeeds.
    async fn terminate(&self, worker: &str, token: &IdempotencyToken) -> Result<(), DriverError>;

    /// Route traffic across cohorts. Weights sum to 100.
    async fn set_cohort_weights(
        &self,
        weights: &BTreeMap<Version, u8>,
        token: &IdempotencyToken,
    ) -> Result<(), DriverError>;
}

// ── Retry ─────────────────────────────────────────────────────────

/// Exponential backoff between retries.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            max: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Delay after the given (zero-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Runs driver calls with a timeout and bounded retries.
#[derive(Clone)]
pub struct DriverExecutor {
    driver: Arc<dyn FleetDriver>,
    timeout: Duration,
    max_attempts: u32,
    backoff: BackoffPolicy,
}

impl DriverExecutor {
    pub fn new(
        driver: Arc<dyn FleetDriver>,
        timeout: Duration,
        max_attempts: u32,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            driver,
            timeout,
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub async fn create(
        &self,
        version: &str,
        token: &IdempotencyToken,
    ) -> Result<WorkerId, DriverError> {
        self.call("create", token, || self.driver.create(version, token))
            .await
    }

    pub async fn terminate(&self, worker: &str, token: &IdempotencyToken) -> Result<(), DriverError> {
        self.call("terminate", token, || self.driver.terminate(worker, token))
            .await
    }

    pub async fn set_cohort_weights(
        &self,
        weights: &BTreeMap<Version, u8>,
        token: &IdempotencyToken,
    ) -> Result<(), DriverError> {
        self.call("set_cohort_weights", token, || {
            self.driver.set_cohort_weights(weights, token)
        })
        .await
    }

    async fn call<T, F, Fut>(
        &self,
        op: &'static str,
        token: &IdempotencyToken,
        mut f: F,
    ) -> Result<T, DriverError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DriverError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.timeout, f()).await {
                Ok(result) => result,
                Err(_) => Err(DriverError::Timeout(self.timeout)),
            };

            match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(op, %token, attempt, "driver call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff.delay(attempt - 1);
                    warn!(
                        op,
                        %token,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "driver call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if attempt > 1 => {
                    return Err(DriverError::Exhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}
