//! Bounded polling with fixed or exponential backoff.

use std::future::Future;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HypervisorError, Result};

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay before every attempt.
    #[default]
    Fixed,
    /// Delay multiplied by `factor` after each attempt, capped at `max_delay_ms`.
    Exponential { factor: u32, max_delay_ms: u64 },
}

/// A bounded retry budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of probes, including the first one.
    pub max_attempts: u32,
    /// Delay before the second probe.
    pub delay_ms: u64,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            delay_ms: 5_000,
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay_ms: delay.as_millis() as u64,
            backoff: Backoff::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, delay: Duration, factor: u32, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            delay_ms: delay.as_millis() as u64,
            backoff: Backoff::Exponential {
                factor,
                max_delay_ms: max_delay.as_millis() as u64,
            },
        }
    }

    /// Delay to wait after failed probe number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.delay_ms);
        match self.backoff {
            Backoff::Fixed => base,
            Backoff::Exponential { factor, max_delay_ms } => {
                let max = Duration::from_millis(max_delay_ms);
                let mut delay = base;
                for _ in 1..attempt {
                    delay = std::cmp::min(delay.saturating_mul(factor.max(1)), max);
                    if delay == max {
                        break;
                    }
                }
                std::cmp::min(delay, max)
            }
        }
    }

    /// Upper bound of the time spent sleeping between probes.
    pub fn total_delay(&self) -> Duration {
        (1..self.max_attempts).map(|n| self.delay_after(n)).sum()
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(HypervisorError::InvalidConfig(format!(
                "{}: max_attempts must be at least 1",
                name
            )));
        }
        if let Backoff::Exponential { factor, .. } = self.backoff {
            if factor < 2 {
                return Err(HypervisorError::InvalidConfig(format!(
                    "{}: exponential backoff factor must be at least 2",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Step-wise form of [`poll_until`] for probes that need `&mut` access to
/// a session.
///
/// ```ignore
/// let mut attempts = Attempts::new(&policy, "domain start");
/// while !virsh.is_running(name).await? {
///     attempts.wait().await?;
/// }
/// ```
#[derive(Debug)]
pub struct Attempts<'a> {
    policy: &'a RetryPolicy,
    stage: &'a str,
    attempt: u32,
    started: Instant,
}

impl<'a> Attempts<'a> {
    pub fn new(policy: &'a RetryPolicy, stage: &'a str) -> Self {
        Self {
            policy,
            stage,
            attempt: 1,
            started: Instant::now(),
        }
    }

    /// Number of the probe about to run, 1-based.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record a failed probe. Sleeps before the next one, or yields
    /// [`HypervisorError::Timeout`] once the budget is spent.
    pub async fn wait(&mut self) -> Result<()> {
        if self.attempt >= self.policy.max_attempts.max(1) {
            return Err(HypervisorError::timeout(self.stage, self.started.elapsed()));
        }
        let delay = self.policy.delay_after(self.attempt);
        debug!(
            stage = %self.stage,
            attempt = self.attempt,
            retry_in_ms = delay.as_millis() as u64,
            "Wait condition not met yet"
        );
        tokio::time::sleep(delay).await;
        self.attempt += 1;
        Ok(())
    }
}

/// Run `probe` until it reports success or the policy is exhausted.
///
/// The probe receives the 1-based attempt number. An `Err` from the probe
/// aborts immediately; running out of attempts yields
/// [`HypervisorError::Timeout`] for `stage`. Returns the attempt that
/// succeeded.
pub async fn poll_until<F, Fut>(policy: &RetryPolicy, stage: &str, mut probe: F) -> Result<u32>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let mut attempts = Attempts::new(policy, stage);
    loop {
        if probe(attempts.attempt()).await? {
            debug!(stage = %stage, attempt = attempts.attempt(), "Wait condition satisfied");
            return Ok(attempts.attempt());
        }
        attempts.wait().await?;
    }
}
