use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use quickwire::prelude::{
    CircuitBreakerPolicy, CircuitState, Connection, Dialer, Endpoint, ErrorCode, RequestSpec,
    TlsConfig, Transport,
};
use quickwire::{Deadline, PlainTransport, TcpDialer};

/// Hands out sockets whose write side is already shut, so every write fails
/// with a broken pipe. Flipping `healthy` switches to ordinary dialing.
struct FlakyDialer {
    dials: AtomicUsize,
    healthy: AtomicBool,
    delay: Duration,
}

impl FlakyDialer {
    fn broken() -> Arc<Self> {
        Self::broken_with_delay(Duration::ZERO)
    }

    fn broken_with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            dials: AtomicUsize::new(0),
            healthy: AtomicBool::new(false),
            delay,
        })
    }

    fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    fn heal(&self) {
        self.healthy.store(true, Ordering::SeqCst);
    }
}

impl Dialer for FlakyDialer {
    fn dial(
        &self,
        endpoint: &Endpoint,
        tls: Option<&TlsConfig>,
        deadline: &Deadline,
    ) -> quickwire::Result<Transport> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if self.healthy.load(Ordering::SeqCst) {
            return TcpDialer.dial(endpoint, tls, deadline);
        }

        let stream =
            TcpStream::connect((endpoint.host(), endpoint.port())).expect("connect test socket");
        stream
            .shutdown(Shutdown::Write)
            .expect("shut down write side");
        let plain = PlainTransport::from_stream(stream).expect("wrap test socket");
        Ok(Transport::from(plain))
    }
}

fn sink() -> (TcpListener, Endpoint) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind sink listener");
    let port = listener.local_addr().expect("read local address").port();
    (listener, Endpoint::http("127.0.0.1", port))
}

#[test]
fn write_failures_are_retried_then_surfaced() {
    let (_listener, endpoint) = sink();
    let dialer = FlakyDialer::broken();
    let mut connection = Connection::builder(endpoint)
        .timeout(Duration::from_secs(2))
        .retry_limit(3)
        .dialer(dialer.clone())
        .connect()
        .expect("construction dial succeeds");

    let error = connection
        .request(&RequestSpec::get("/"))
        .expect_err("every write fails");

    assert_eq!(error.code(), ErrorCode::Write);
    let stats = connection.stats();
    assert_eq!(stats.attempts, 4);
    assert_eq!(stats.write_failures, 4);
    assert_eq!(stats.retries, 3);
    assert_eq!(stats.reconnects, 3);
    assert_eq!(stats.requests_failed, 1);
    assert_eq!(stats.error_counts.get("write"), Some(&4));
    assert_eq!(dialer.dial_count(), 4, "construction plus three redials");
    assert!(connection.transport().is_none());
}

#[test]
fn zero_retry_limit_makes_a_single_attempt() {
    let (_listener, endpoint) = sink();
    let mut connection = Connection::builder(endpoint)
        .retry_limit(0)
        .dialer(FlakyDialer::broken())
        .connect()
        .expect("construction dial succeeds");

    let error = connection
        .request(&RequestSpec::get("/"))
        .expect_err("the write fails");

    assert_eq!(error.code(), ErrorCode::Write);
    assert_eq!(connection.stats().attempts, 1);
}

#[test]
fn retries_stop_when_the_request_deadline_is_spent() {
    let (_listener, endpoint) = sink();
    let dialer = FlakyDialer::broken_with_delay(Duration::from_millis(120));
    let mut connection = Connection::builder(endpoint)
        .timeout(Duration::from_millis(200))
        .retry_limit(50)
        .dialer(dialer)
        .connect()
        .expect("construction dial succeeds");

    let started = Instant::now();
    let error = connection
        .request(&RequestSpec::get("/"))
        .expect_err("every write fails");

    assert_eq!(error.code(), ErrorCode::Write);
    let attempts = connection.stats().attempts;
    assert!(
        (2..=3).contains(&attempts),
        "deadline should cut retries short, got {attempts} attempts"
    );
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn breaker_opens_at_threshold_and_admits_one_trial_after_cooldown() {
    let (_listener, endpoint) = sink();
    let dialer = FlakyDialer::broken();
    let mut connection = Connection::builder(endpoint)
        .retry_limit(0)
        .circuit_breaker_policy(
            CircuitBreakerPolicy::standard()
                .failure_threshold(3)
                .cooldown(Duration::from_millis(200)),
        )
        .dialer(dialer.clone())
        .connect()
        .expect("construction dial succeeds");
    let request = RequestSpec::get("/");

    for expected in 1..=2 {
        let error = connection.request(&request).expect_err("write fails");
        assert_eq!(error.code(), ErrorCode::Write);
        assert_eq!(
            connection.circuit_state(),
            CircuitState::Closed {
                consecutive_failures: expected
            }
        );
    }

    let error = connection.request(&request).expect_err("third failure trips");
    assert_eq!(error.code(), ErrorCode::CircuitOpen);
    assert!(matches!(connection.circuit_state(), CircuitState::Open { .. }));

    let dials_before = dialer.dial_count();
    let attempts_before = connection.stats().attempts;
    let error = connection
        .request(&request)
        .expect_err("open breaker rejects");
    assert_eq!(error.code(), ErrorCode::CircuitOpen);
    assert_eq!(dialer.dial_count(), dials_before, "no i/o while open");
    assert_eq!(connection.stats().attempts, attempts_before);

    thread::sleep(Duration::from_millis(250));
    let error = connection
        .request(&request)
        .expect_err("trial fails and reopens");
    assert_eq!(error.code(), ErrorCode::CircuitOpen);
    assert_eq!(connection.stats().attempts, attempts_before + 1);
    assert_eq!(dialer.dial_count(), dials_before + 1);

    let stats = connection.stats();
    assert_eq!(stats.circuit_trips, 2);
    assert_eq!(stats.circuit_rejections, 1);
}

#[test]
fn breaker_trip_does_not_consume_remaining_retries() {
    let (_listener, endpoint) = sink();
    let mut connection = Connection::builder(endpoint)
        .retry_limit(5)
        .circuit_breaker_policy(
            CircuitBreakerPolicy::standard()
                .failure_threshold(2)
                .cooldown(Duration::from_secs(30)),
        )
        .dialer(FlakyDialer::broken())
        .connect()
        .expect("construction dial succeeds");

    let error = connection
        .request(&RequestSpec::get("/"))
        .expect_err("breaker trips mid-request");

    assert_eq!(error.code(), ErrorCode::CircuitOpen);
    assert_eq!(connection.stats().attempts, 2);
    assert!(error.to_string().contains("retry after"));
}

#[test]
fn breaker_recovers_after_cooldown_when_endpoint_heals() {
    let (_listener, endpoint) = sink();
    let dialer = FlakyDialer::broken();
    let mut connection = Connection::builder(endpoint)
        .retry_limit(1)
        .circuit_breaker_policy(
            CircuitBreakerPolicy::standard()
                .failure_threshold(2)
                .cooldown(Duration::from_millis(300)),
        )
        .dialer(dialer.clone())
        .connect()
        .expect("construction dial succeeds");
    let request = RequestSpec::get("/health");

    let error = connection
        .request(&request)
        .expect_err("call 1 exhausts into the breaker");
    assert_eq!(error.code(), ErrorCode::CircuitOpen);
    assert_eq!(connection.stats().attempts, 2);

    let dials_before = dialer.dial_count();
    let error = connection
        .request(&request)
        .expect_err("call 2 is rejected without i/o");
    assert_eq!(error.code(), ErrorCode::CircuitOpen);
    assert_eq!(dialer.dial_count(), dials_before);
    assert_eq!(connection.stats().attempts, 2);

    dialer.heal();
    thread::sleep(Duration::from_millis(350));
    connection
        .request(&request)
        .expect("call 3 is the trial and succeeds");
    assert_eq!(connection.stats().attempts, 3);
    assert_eq!(
        connection.circuit_state(),
        CircuitState::Closed {
            consecutive_failures: 0
        }
    );

    connection
        .request(&request)
        .expect("calls after recovery behave normally");
    assert_eq!(connection.stats().requests_succeeded, 2);
}
