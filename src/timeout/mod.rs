//! Timeout configuration and deadline timers.
//!
//! This module holds every duration the coordinator and its channels work
//! with: the primary wait before falling back to CI polling, the absolute
//! outer deadline, poll cadences and retry backoff.

pub mod deadline;

use std::time::Duration;

// Re-export deadline types for convenient access
pub use deadline::{DeadlineTimers, TimerKind};

/// Configuration for timeout behavior during an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// How long to wait on push/backend channels before falling back to CI polling.
    /// Default: 120 seconds
    pub primary_wait: Duration,

    /// Absolute bound on a request, independent of the primary wait.
    /// Default: 900 seconds (15 minutes)
    pub outer_deadline: Duration,

    /// How long a finished request still recognises (and drops) late results.
    /// Default: 60 seconds
    pub result_grace: Duration,

    /// Bound on the backend health probe before dispatch.
    /// Default: 3 seconds
    pub probe_timeout: Duration,

    /// Interval between backend result queries.
    /// Default: 5 seconds
    pub backend_poll_interval: Duration,

    /// Attempts per backend query before the poll is reported as failed.
    /// Default: 3
    pub backend_retry_attempts: u32,

    /// Base backoff between backend query attempts (multiplied by attempt number).
    /// Default: 500 milliseconds
    pub backend_retry_backoff: Duration,

    /// First backoff between record store retries when a finishing request
    /// still has unwritten results; doubles up to 30 seconds.
    /// Default: 1 second
    pub store_retry_backoff: Duration,

    /// Interval between CI run-status queries.
    /// Default: 10 seconds
    pub ci_poll_interval: Duration,

    /// Consecutive CI API failures tolerated before the run is given up on.
    /// Default: 5
    pub ci_max_consecutive_errors: u32,

    /// Delay before the simulated generator reports results.
    /// Default: 2 seconds
    pub simulation_delay: Duration,

    /// Attempts to locate the CI run created by a dispatch.
    /// Default: 10
    pub run_lookup_attempts: u32,

    /// Interval between CI run lookups.
    /// Default: 2 seconds
    pub run_lookup_interval: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            primary_wait: Duration::from_secs(120),
            outer_deadline: Duration::from_secs(900),
            result_grace: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(3),
            backend_poll_interval: Duration::from_secs(5),
            backend_retry_attempts: 3,
            backend_retry_backoff: Duration::from_millis(500),
            store_retry_backoff: Duration::from_secs(1),
            ci_poll_interval: Duration::from_secs(10),
            ci_max_consecutive_errors: 5,
            simulation_delay: Duration::from_secs(2),
            run_lookup_attempts: 10,
            run_lookup_interval: Duration::from_secs(2),
        }
    }
}

impl TimeoutConfig {
    /// Creates a new TimeoutConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the primary wait before CI polling takes over.
    pub fn with_primary_wait(mut self, wait: Duration) -> Self {
        self.primary_wait = wait;
        self
    }

    /// Sets the absolute outer deadline.
    pub fn with_outer_deadline(mut self, deadline: Duration) -> Self {
        self.outer_deadline = deadline;
        self
    }

    /// Sets the grace period for late results.
    pub fn with_result_grace(mut self, grace: Duration) -> Self {
        self.result_grace = grace;
        self
    }

    /// Sets the backend probe timeout.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Sets the backend poll interval.
    pub fn with_backend_poll_interval(mut self, interval: Duration) -> Self {
        self.backend_poll_interval = interval;
        self
    }

    /// Sets the backend retry policy.
    pub fn with_backend_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.backend_retry_attempts = attempts;
        self.backend_retry_backoff = backoff;
        self
    }

    /// Sets the first record store retry backoff.
    pub fn with_store_retry_backoff(mut self, backoff: Duration) -> Self {
        self.store_retry_backoff = backoff;
        self
    }

    /// Sets the CI run-status poll interval.
    pub fn with_ci_poll_interval(mut self, interval: Duration) -> Self {
        self.ci_poll_interval = interval;
        self
    }

    /// Sets how many consecutive CI API failures are tolerated.
    pub fn with_ci_max_consecutive_errors(mut self, max: u32) -> Self {
        self.ci_max_consecutive_errors = max;
        self
    }

    /// Sets the simulated result delay.
    pub fn with_simulation_delay(mut self, delay: Duration) -> Self {
        self.simulation_delay = delay;
        self
    }

    /// Sets the CI run lookup policy used right after dispatch.
    pub fn with_run_lookup(mut self, attempts: u32, interval: Duration) -> Self {
        self.run_lookup_attempts = attempts;
        self.run_lookup_interval = interval;
        self
    }
}
