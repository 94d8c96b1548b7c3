use std::time::{Duration, Instant};

/// When to stop sending to an endpoint that keeps failing.
///
/// A `failure_threshold` of zero disables the breaker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CircuitBreakerPolicy {
    failure_threshold: usize,
    cooldown: Duration,
}

impl CircuitBreakerPolicy {
    pub const fn standard() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(10),
        }
    }

    pub const fn disabled() -> Self {
        Self {
            failure_threshold: 0,
            cooldown: Duration::ZERO,
        }
    }

    pub const fn failure_threshold(mut self, failure_threshold: usize) -> Self {
        self.failure_threshold = failure_threshold;
        self
    }

    pub const fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub const fn configured_failure_threshold(self) -> usize {
        self.failure_threshold
    }

    pub const fn configured_cooldown(self) -> Duration {
        self.cooldown
    }

    pub const fn is_enabled(self) -> bool {
        self.failure_threshold > 0
    }
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Observable breaker state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed { consecutive_failures: usize },
    Open { until: Instant },
    HalfOpen,
}

#[derive(Debug)]
pub(crate) struct CircuitBreaker {
    policy: CircuitBreakerPolicy,
    state: CircuitState,
}

impl CircuitBreaker {
    pub(crate) fn new(policy: CircuitBreakerPolicy) -> Self {
        Self {
            policy,
            state: CircuitState::Closed {
                consecutive_failures: 0,
            },
        }
    }

    pub(crate) const fn state(&self) -> CircuitState {
        self.state
    }

    pub(crate) const fn policy(&self) -> CircuitBreakerPolicy {
        self.policy
    }

    /// Admits a call, or returns how long the circuit stays open.
    ///
    /// An open circuit whose cooldown has elapsed turns half-open and admits
    /// the call as its single trial.
    pub(crate) fn check(&mut self) -> Result<(), Duration> {
        self.check_at(Instant::now())
    }

    fn check_at(&mut self, now: Instant) -> Result<(), Duration> {
        match self.state {
            CircuitState::Closed { .. } | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open { until } => {
                if now >= until {
                    self.state = CircuitState::HalfOpen;
                    Ok(())
                } else {
                    Err(until.saturating_duration_since(now))
                }
            }
        }
    }

    pub(crate) fn record_success(&mut self) {
        self.state = CircuitState::Closed {
            consecutive_failures: 0,
        };
    }

    /// Counts one failed attempt. Returns `true` when this failure opened the
    /// circuit.
    pub(crate) fn record_failure(&mut self) -> bool {
        self.record_failure_at(Instant::now())
    }

    fn record_failure_at(&mut self, now: Instant) -> bool {
        if !self.policy.is_enabled() {
            return false;
        }
        match &mut self.state {
            CircuitState::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures = consecutive_failures.saturating_add(1);
                if *consecutive_failures >= self.policy.failure_threshold {
                    self.open(now);
                    return true;
                }
                false
            }
            CircuitState::HalfOpen => {
                self.open(now);
                true
            }
            CircuitState::Open { .. } => false,
        }
    }

    /// Ends a half-open trial that never reached the endpoint. The circuit
    /// opens again for a full cooldown. Returns `true` when it reopened.
    pub(crate) fn abandon_trial(&mut self) -> bool {
        self.abandon_trial_at(Instant::now())
    }

    fn abandon_trial_at(&mut self, now: Instant) -> bool {
        if self.state != CircuitState::HalfOpen {
            return false;
        }
        self.open(now);
        true
    }

    /// Time left before an open circuit admits a trial.
    pub(crate) fn retry_after(&self) -> Duration {
        match self.state {
            CircuitState::Open { until } => until.saturating_duration_since(Instant::now()),
            _ => Duration::ZERO,
        }
    }

    fn open(&mut self, now: Instant) {
        let until = now
            .checked_add(self.policy.cooldown)
            .unwrap_or(now + Duration::from_secs(86_400 * 365));
        self.state = CircuitState::Open { until };
    }
}
