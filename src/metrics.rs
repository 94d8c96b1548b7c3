use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::Error;
use crate::util::lock_unpoisoned;

/// Point-in-time copy of a connection's counters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectionStats {
    pub requests_started: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    /// Every dial-or-write attempt, the first of each request included.
    pub attempts: u64,
    pub retries: u64,
    pub reconnects: u64,
    pub write_failures: u64,
    pub circuit_rejections: u64,
    pub circuit_trips: u64,
    pub latency_samples: u64,
    pub latency_total_ms: u64,
    pub latency_avg_ms: f64,
    /// Failures keyed by error code, with the phase appended for timeouts.
    pub error_counts: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct ConnectionMetrics {
    inner: Arc<ConnectionMetricsInner>,
}

#[derive(Debug, Default)]
struct ConnectionMetricsInner {
    requests_started: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    reconnects: AtomicU64,
    write_failures: AtomicU64,
    circuit_rejections: AtomicU64,
    circuit_trips: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

impl ConnectionMetrics {
    pub(crate) fn record_request_started(&self) {
        self.inner.requests_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_attempt(&self) {
        self.inner.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnect(&self) {
        self.inner.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_circuit_rejection(&self) {
        self.inner
            .circuit_rejections
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_circuit_trip(&self) {
        self.inner.circuit_trips.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a failed attempt by kind. Retries may still follow.
    pub(crate) fn record_attempt_failure(&self, error: &Error) {
        if matches!(error, Error::Write { .. }) {
            self.inner.write_failures.fetch_add(1, Ordering::Relaxed);
        }
        let key = match error.timeout_phase() {
            Some(phase) => format!("{}:{phase}", error.code().as_str()),
            None => error.code().as_str().to_owned(),
        };
        let mut error_counts = lock_unpoisoned(&self.inner.error_counts);
        *error_counts.entry(key).or_insert(0) += 1;
    }

    pub(crate) fn record_request_completed(&self, succeeded: bool, latency: Duration) {
        if succeeded {
            self.inner
                .requests_succeeded
                .fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.latency_samples.fetch_add(1, Ordering::Relaxed);
        self.inner.latency_total_ms.fetch_add(
            latency.as_millis().min(u64::MAX as u128) as u64,
            Ordering::Relaxed,
        );
    }

    pub(crate) fn snapshot(&self) -> ConnectionStats {
        let latency_samples = self.inner.latency_samples.load(Ordering::Relaxed);
        let latency_total_ms = self.inner.latency_total_ms.load(Ordering::Relaxed);
        let latency_avg_ms = if latency_samples == 0 {
            0.0
        } else {
            latency_total_ms as f64 / latency_samples as f64
        };

        ConnectionStats {
            requests_started: self.inner.requests_started.load(Ordering::Relaxed),
            requests_succeeded: self.inner.requests_succeeded.load(Ordering::Relaxed),
            requests_failed: self.inner.requests_failed.load(Ordering::Relaxed),
            attempts: self.inner.attempts.load(Ordering::Relaxed),
            retries: self.inner.retries.load(Ordering::Relaxed),
            reconnects: self.inner.reconnects.load(Ordering::Relaxed),
            write_failures: self.inner.write_failures.load(Ordering::Relaxed),
            circuit_rejections: self.inner.circuit_rejections.load(Ordering::Relaxed),
            circuit_trips: self.inner.circuit_trips.load(Ordering::Relaxed),
            latency_samples,
            latency_total_ms,
            latency_avg_ms,
            error_counts: lock_unpoisoned(&self.inner.error_counts).clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::ConnectionMetrics;
    use crate::error::{Error, TimeoutPhase};

    #[test]
    fn attempt_failures_are_keyed_by_code_and_phase() {
        let metrics = ConnectionMetrics::default();
        metrics.record_attempt_failure(&Error::Timeout {
            phase: TimeoutPhase::Connect,
            timeout_ms: 10,
            endpoint: "127.0.0.1:1".to_owned(),
        });
        metrics.record_attempt_failure(&Error::Write {
            endpoint: "127.0.0.1:1".to_owned(),
            source: std::io::ErrorKind::BrokenPipe.into(),
        });
        metrics.record_request_completed(false, Duration::from_millis(4));

        let stats = metrics.snapshot();
        assert_eq!(stats.write_failures, 1);
        assert_eq!(stats.requests_failed, 1);
        assert_eq!(stats.error_counts.get("timeout:connect"), Some(&1));
        assert_eq!(stats.error_counts.get("write"), Some(&1));
        assert_eq!(stats.latency_avg_ms, 4.0);
    }

    #[test]
    fn clones_share_counters() {
        let metrics = ConnectionMetrics::default();
        let observer = metrics.clone();
        metrics.record_request_started();
        metrics.record_attempt();
        metrics.record_retry();

        let stats = observer.snapshot();
        assert_eq!(stats.requests_started, 1);
        assert_eq!(stats.attempts, 1);
        assert_eq!(stats.retries, 1);
    }
}
