//! Poll-until-condition engine
//!
//! Synchronizes the test driver against eventually-consistent cluster state.
//! A [`Condition`] pairs a description with an async probe; [`wait_for`]
//! evaluates the probe under a [`PollPolicy`] until it reports
//! [`Probe::Ready`] or the policy's timeout elapses.
//!
//! Probe errors are never fatal here: a lookup that fails because the target
//! does not exist yet is just another "not ready" observation.
//!
//! # Example
//!
//! ```ignore
//! use kmc_common::poll::{wait_for, Condition, PollPolicy, Probe};
//!
//! let condition = Condition::new("deployment to exist", || async {
//!     Ok(if exists().await? { Probe::Ready } else { Probe::pending("absent") })
//! });
//! wait_for(condition, &PollPolicy::convergence()).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::Error;

/// Default interval between evaluations while waiting for cluster convergence
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default timeout for cluster convergence (nodes joining, workloads rolling out)
pub const DEFAULT_CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(600);

/// Result of a single condition evaluation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Probe {
    /// The condition holds
    Ready,
    /// The condition does not hold yet; carries the observed state
    Pending(String),
}

impl Probe {
    /// Shorthand for a pending probe
    pub fn pending(observed: impl Into<String>) -> Self {
        Self::Pending(observed.into())
    }

    /// Whether the probe reports the condition as satisfied
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// How often and for how long a condition is evaluated.
#[derive(Clone, Debug, PartialEq)]
pub struct PollPolicy {
    /// Delay between the first and second evaluation
    pub interval: Duration,
    /// Give up after this much time; `None` retries forever
    pub timeout: Option<Duration>,
    /// Growth factor applied to the interval after every evaluation (1.0 = fixed)
    pub backoff_multiplier: f64,
    /// Upper bound for the grown interval
    pub max_interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::convergence()
    }
}

impl PollPolicy {
    /// Evaluate every `interval` until `timeout` elapses
    pub fn fixed(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout: Some(timeout),
            backoff_multiplier: 1.0,
            max_interval: interval,
        }
    }

    /// Evaluate every `interval` with no deadline
    pub fn unbounded(interval: Duration) -> Self {
        Self {
            interval,
            timeout: None,
            backoff_multiplier: 1.0,
            max_interval: interval,
        }
    }

    /// Long-running policy for cluster convergence (5s interval, 10 minutes)
    pub fn convergence() -> Self {
        Self::fixed(DEFAULT_POLL_INTERVAL, DEFAULT_CONVERGENCE_TIMEOUT)
    }

    /// Grow the interval by `multiplier` after each evaluation, capped at `max_interval`
    pub fn with_backoff(mut self, multiplier: f64, max_interval: Duration) -> Self {
        self.backoff_multiplier = multiplier;
        self.max_interval = max_interval;
        self
    }

    /// Reject policies that cannot be executed
    pub fn validate(&self) -> Result<(), Error> {
        if self.interval.is_zero() {
            return Err(Error::invalid_policy("interval must be greater than zero"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::invalid_policy(format!(
                "backoff multiplier must be a finite value >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.max_interval < self.interval {
            return Err(Error::invalid_policy(format!(
                "max interval {:?} is shorter than interval {:?}",
                self.max_interval, self.interval
            )));
        }
        Ok(())
    }

    /// Whether a bounded policy times out before a second evaluation could happen
    pub fn is_degenerate(&self) -> bool {
        self.timeout
            .map(|timeout| timeout < self.interval)
            .unwrap_or(false)
    }

    fn next_interval(&self, current: Duration) -> Duration {
        if self.backoff_multiplier == 1.0 {
            return current;
        }
        Duration::from_secs_f64(
            (current.as_secs_f64() * self.backoff_multiplier).min(self.max_interval.as_secs_f64()),
        )
    }
}

/// A described predicate over remote state.
pub struct Condition<F> {
    description: String,
    probe: F,
}

impl<F, Fut> Condition<F>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Probe, Error>>,
{
    /// Create a condition from a description and an async probe
    pub fn new(description: impl Into<String>, probe: F) -> Self {
        Self {
            description: description.into(),
            probe,
        }
    }

    /// Human-readable description used in logs and timeout errors
    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Statistics of a successful wait
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollOutcome {
    /// Number of probe evaluations, including the successful one
    pub attempts: u32,
    /// Time from the first evaluation to the successful one
    pub elapsed: Duration,
}

/// Evaluate `condition` under `policy` until it is ready or the policy times out.
///
/// Returns on the first [`Probe::Ready`]. Probe errors are treated as
/// "not ready" and recorded as the last observed state. On timeout the error
/// carries the condition description, the last observation and the elapsed
/// time. An evaluation still running at the deadline is abandoned. A bounded
/// policy whose timeout is shorter than its interval fails without evaluating
/// the condition at all.
pub async fn wait_for<F, Fut>(
    mut condition: Condition<F>,
    policy: &PollPolicy,
) -> Result<PollOutcome, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Probe, Error>>,
{
    policy.validate()?;

    if policy.is_degenerate() {
        return Err(Error::timeout(
            condition.description,
            format!(
                "never evaluated: timeout {:?} is shorter than interval {:?}",
                policy.timeout.unwrap_or_default(),
                policy.interval
            ),
            Duration::ZERO,
        ));
    }

    let start = Instant::now();
    let mut interval = policy.interval;
    let mut attempts = 0u32;
    let mut last_observed: Option<String> = None;

    loop {
        attempts += 1;

        // A slow evaluation must not carry the wait past the deadline
        let evaluation = match policy.timeout {
            Some(timeout) => {
                let remaining = timeout.saturating_sub(start.elapsed());
                match tokio::time::timeout(remaining, (condition.probe)()).await {
                    Ok(result) => result,
                    Err(_) => {
                        return Err(Error::timeout(
                            condition.description,
                            last_observed
                                .unwrap_or_else(|| "evaluation did not complete".to_string()),
                            start.elapsed(),
                        ));
                    }
                }
            }
            None => (condition.probe)().await,
        };

        match evaluation {
            Ok(Probe::Ready) => {
                let elapsed = start.elapsed();
                debug!(
                    condition = %condition.description,
                    attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Condition satisfied"
                );
                return Ok(PollOutcome { attempts, elapsed });
            }
            Ok(Probe::Pending(observed)) => {
                if last_observed.as_deref() != Some(observed.as_str()) {
                    debug!(
                        condition = %condition.description,
                        observed = %observed,
                        "Condition not yet satisfied"
                    );
                }
                last_observed = Some(observed);
            }
            Err(e) => {
                // Expected while the target does not exist yet
                trace!(condition = %condition.description, error = %e, "Probe failed, retrying");
                last_observed = Some(format!("error: {}", e));
            }
        }

        let elapsed = start.elapsed();
        let delay = match policy.timeout {
            Some(timeout) if elapsed >= timeout => {
                return Err(Error::timeout(
                    condition.description,
                    last_observed.unwrap_or_else(|| "nothing".to_string()),
                    elapsed,
                ));
            }
            // Never sleep past the deadline; the last evaluation happens at it
            Some(timeout) => interval.min(timeout - elapsed),
            None => interval,
        };

        tokio::time::sleep(delay).await;
        interval = policy.next_interval(interval);
    }
}
