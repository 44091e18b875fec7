//! # PeriodicWorker Trait
//!
//! The contract every long-running program implements to be driven by a
//! [`WorkerActor`](crate::WorkerActor): how it is built, how it starts, what
//! one cycle does, and how cycles are spaced in time.
//!
//! The actor owns the worker exclusively, so a worker keeps its state in plain
//! fields (device lists, breaker state, timers) without locks.

use async_trait::async_trait;
use std::fmt::Debug;
use std::time::Duration;

/// How the next cycle is scheduled relative to the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// Cycles start `period` apart. A cycle that overruns is followed
    /// immediately by the next one.
    FixedRate(Duration),
    /// The next cycle starts `delay` after the previous one finished.
    FixedDelay(Duration),
}

impl Pacing {
    /// Time to wait before the next cycle, given how long the last one took.
    pub fn next_delay(&self, elapsed: Duration) -> Duration {
        match *self {
            Pacing::FixedRate(period) => period.saturating_sub(elapsed),
            Pacing::FixedDelay(delay) => delay,
        }
    }
}

/// Restart behaviour for a worker whose start fails or whose cycle panics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Consecutive failed starts tolerated before the worker is marked fatal.
    pub max_start_retries: u32,
    /// Delay before the first retry; doubled on every consecutive failure.
    pub backoff: Duration,
    /// Upper bound for the doubled delay.
    pub max_backoff: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_start_retries: 10,
            backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RestartPolicy {
    /// Backoff delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// Trait that any long-running program must implement to be managed by
/// [`WorkerActor`](crate::WorkerActor).
///
/// # Lifecycle
/// 1. [`from_params`](PeriodicWorker::from_params) builds a fresh instance.
///    It is called again after a cycle panicked, so `Params` must be `Clone`.
/// 2. [`on_start`](PeriodicWorker::on_start) runs once per instance, with the
///    injected context (load device lists, register maps, ...).
/// 3. [`run_cycle`](PeriodicWorker::run_cycle) runs repeatedly, spaced by
///    [`pacing`](PeriodicWorker::pacing).
///
/// # Async & Context
/// The `Context` is handed to [`run`](crate::WorkerActor::run), not to the
/// constructor, so shared dependencies (database pool, HTTP client) are wired
/// at spawn time.
#[async_trait]
pub trait PeriodicWorker: Send + 'static {
    /// Program name used in logs and status reports.
    const NAME: &'static str;

    /// Construction parameters, kept by the actor to rebuild the worker.
    type Params: Clone + Send + Sync + Debug + 'static;

    /// Shared dependencies injected into every hook.
    type Context: Send + Sync + 'static;

    /// What a single cycle produces (counts, samples, ...).
    type Report: Send + Debug + 'static;

    /// The error type for this worker.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Construct the worker from its parameters.
    fn from_params(params: Self::Params) -> Result<Self, Self::Error>
    where
        Self: Sized;

    /// Called once after construction, before the first cycle.
    async fn on_start(&mut self, _ctx: &Self::Context) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Perform one unit of work.
    async fn run_cycle(&mut self, ctx: &Self::Context) -> Result<Self::Report, Self::Error>;

    /// Spacing between cycles.
    fn pacing(&self) -> Pacing;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_rate_compensates_for_cycle_time() {
        let pacing = Pacing::FixedRate(Duration::from_secs(2));
        assert_eq!(
            pacing.next_delay(Duration::from_millis(500)),
            Duration::from_millis(1500)
        );
        assert_eq!(pacing.next_delay(Duration::from_secs(3)), Duration::ZERO);
    }

    #[test]
    fn fixed_delay_ignores_cycle_time() {
        let pacing = Pacing::FixedDelay(Duration::from_secs(30));
        assert_eq!(
            pacing.next_delay(Duration::from_secs(12)),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RestartPolicy {
            max_start_retries: 3,
            backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40), Duration::from_secs(5));
    }
}
