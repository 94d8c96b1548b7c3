use std::time::{Duration, Instant};

use crate::endpoint::Endpoint;
use crate::error::{Error, TimeoutPhase};

/// Absolute expiry for one operation.
///
/// Computed once from a timeout and then only read: retries and nested steps
/// share the same expiry instead of starting a fresh `now + timeout`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deadline {
    expires_at: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        let now = Instant::now();
        let expires_at = now.checked_add(budget).unwrap_or_else(|| far_future(now));
        Self { expires_at, budget }
    }

    pub const fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub const fn budget(&self) -> Duration {
        self.budget
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Remaining time as a `poll(2)` timeout in whole milliseconds.
    ///
    /// Rounded up so a wait never wakes before the expiry it was asked for.
    pub(crate) fn poll_timeout_ms(&self) -> libc::c_int {
        let remaining = self.remaining();
        let mut millis = remaining.as_millis();
        if remaining.subsec_nanos() % 1_000_000 != 0 {
            millis = millis.saturating_add(1);
        }
        millis.min(libc::c_int::MAX as u128) as libc::c_int
    }

    pub(crate) fn timeout_error(&self, phase: TimeoutPhase, endpoint: &Endpoint) -> Error {
        Error::Timeout {
            phase,
            timeout_ms: self.budget.as_millis(),
            endpoint: endpoint.authority(),
        }
    }
}

fn far_future(now: Instant) -> Instant {
    // Roughly 30 years; large enough to never expire in practice.
    now + Duration::from_secs(60 * 60 * 24 * 365 * 30)
}
