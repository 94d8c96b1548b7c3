use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::connect::{Dialer, TcpDialer};
use crate::deadline::Deadline;
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::metrics::{ConnectionMetrics, ConnectionStats};
use crate::readiness::Liveness;
use crate::request::{RequestDefaults, RequestSpec, encode_request, write_request};
use crate::resilience::{CircuitBreaker, CircuitBreakerPolicy, CircuitState};
use crate::tls::TlsConfig;
use crate::transport::Transport;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_RETRY_LIMIT: usize = 1;

/// Configures and opens a [`Connection`].
pub struct ConnectionBuilder {
    endpoint: Endpoint,
    timeout: Duration,
    tls_config: Option<TlsConfig>,
    retry_limit: usize,
    circuit_breaker_policy: Option<CircuitBreakerPolicy>,
    defaults: Arc<RequestDefaults>,
    dialer: Arc<dyn Dialer>,
}

impl ConnectionBuilder {
    fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            timeout: DEFAULT_TIMEOUT,
            tls_config: None,
            retry_limit: DEFAULT_RETRY_LIMIT,
            circuit_breaker_policy: None,
            defaults: Arc::new(RequestDefaults::persistent()),
            dialer: Arc::new(TcpDialer),
        }
    }

    /// Budget for the initial connect and for each `request` call, retries
    /// included.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.max(Duration::from_millis(1));
        self
    }

    pub fn tls_config(mut self, tls_config: TlsConfig) -> Self {
        self.tls_config = Some(tls_config);
        self
    }

    /// Extra attempts a single `request` may make after the first one fails.
    pub const fn retry_limit(mut self, retry_limit: usize) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub const fn circuit_breaker_policy(mut self, policy: CircuitBreakerPolicy) -> Self {
        self.circuit_breaker_policy = Some(policy);
        self
    }

    pub fn defaults(mut self, defaults: Arc<RequestDefaults>) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    /// Connects (and upgrades, for TLS endpoints) once. Failures are returned
    /// as they are; nothing here is retried.
    pub fn connect(self) -> crate::Result<Connection> {
        let deadline = Deadline::after(self.timeout);
        self.connect_within(&deadline)
    }

    /// Connects under a deadline the caller already started, so the dial
    /// shares it with whatever follows.
    pub(crate) fn connect_within(self, deadline: &Deadline) -> crate::Result<Connection> {
        let transport = self
            .dialer
            .dial(&self.endpoint, self.tls_config.as_ref(), deadline)?;
        debug!(
            endpoint = %self.endpoint,
            transport_id = %transport.id(),
            kind = transport.kind().as_str(),
            "connection opened"
        );

        Ok(Connection {
            endpoint: self.endpoint,
            timeout: self.timeout,
            tls_config: self.tls_config,
            retry_limit: self.retry_limit,
            breaker: CircuitBreaker::new(
                self.circuit_breaker_policy
                    .unwrap_or(CircuitBreakerPolicy::disabled()),
            ),
            defaults: self.defaults,
            dialer: self.dialer,
            metrics: ConnectionMetrics::default(),
            transport: Some(transport),
        })
    }
}

impl fmt::Debug for ConnectionBuilder {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("ConnectionBuilder")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .field("retry_limit", &self.retry_limit)
            .field("circuit_breaker_policy", &self.circuit_breaker_policy)
            .finish_non_exhaustive()
    }
}

/// A reusable connection to one endpoint.
///
/// Holds at most one transport. `request` checks it before every write and
/// replaces it when the peer has gone away; failed attempts are retried
/// within the call's deadline and counted by the circuit breaker.
pub struct Connection {
    endpoint: Endpoint,
    timeout: Duration,
    tls_config: Option<TlsConfig>,
    retry_limit: usize,
    breaker: CircuitBreaker,
    defaults: Arc<RequestDefaults>,
    dialer: Arc<dyn Dialer>,
    metrics: ConnectionMetrics,
    transport: Option<Transport>,
}

impl Connection {
    pub fn builder(endpoint: Endpoint) -> ConnectionBuilder {
        ConnectionBuilder::new(endpoint)
    }

    /// Opens a connection with default settings.
    pub fn open(endpoint: Endpoint) -> crate::Result<Self> {
        Self::builder(endpoint).connect()
    }

    /// Writes `spec` and returns the transport it went out on, ready for the
    /// caller to read the response.
    pub fn request(&mut self, spec: &RequestSpec) -> crate::Result<&mut Transport> {
        let transport = self.send(spec)?;
        Ok(self.transport.insert(transport))
    }

    pub(crate) fn send(&mut self, spec: &RequestSpec) -> crate::Result<Transport> {
        let deadline = Deadline::after(self.timeout);
        self.send_within(spec, &deadline)
    }

    /// Every attempt of this call, redials included, draws on `deadline`.
    pub(crate) fn send_within(
        &mut self,
        spec: &RequestSpec,
        deadline: &Deadline,
    ) -> crate::Result<Transport> {
        let wire = encode_request(spec, &self.endpoint, &self.defaults)?;
        let started = Instant::now();
        self.metrics.record_request_started();

        if let Err(retry_after) = self.breaker.check() {
            self.metrics.record_circuit_rejection();
            self.metrics
                .record_request_completed(false, started.elapsed());
            debug!(
                endpoint = %self.endpoint,
                retry_after_ms = retry_after.as_millis() as u64,
                "circuit open; request rejected"
            );
            return Err(self.circuit_open_error(retry_after));
        }

        let mut attempt = 0_usize;
        loop {
            attempt += 1;
            self.metrics.record_attempt();
            debug!(
                endpoint = %self.endpoint,
                method = %spec.method(),
                target = spec.target(),
                attempt,
                "sending request"
            );

            let error = match self.attempt(&wire, deadline) {
                Ok(transport) => {
                    self.breaker.record_success();
                    self.metrics
                        .record_request_completed(true, started.elapsed());
                    debug!(
                        endpoint = %self.endpoint,
                        transport_id = %transport.id(),
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "request written"
                    );
                    return Ok(transport);
                }
                Err(error) => error,
            };

            self.metrics.record_attempt_failure(&error);
            if !error.is_attempt_failure() {
                // Local configuration problems say nothing about the endpoint,
                // but a half-open trial is still spent.
                if self.breaker.abandon_trial() {
                    self.metrics.record_circuit_trip();
                }
                self.metrics
                    .record_request_completed(false, started.elapsed());
                return Err(error);
            }
            if self.breaker.record_failure() {
                self.metrics.record_circuit_trip();
                self.metrics
                    .record_request_completed(false, started.elapsed());
                let retry_after = self.breaker.retry_after();
                warn!(
                    endpoint = %self.endpoint,
                    attempt,
                    error = %error,
                    cooldown_ms = retry_after.as_millis() as u64,
                    "circuit breaker opened"
                );
                return Err(self.circuit_open_error(retry_after));
            }

            if attempt > self.retry_limit || deadline.is_expired() {
                self.metrics
                    .record_request_completed(false, started.elapsed());
                return Err(error);
            }

            warn!(
                endpoint = %self.endpoint,
                attempt,
                remaining_ms = deadline.remaining().as_millis() as u64,
                error = %error,
                "retrying request after attempt failure"
            );
            self.metrics.record_retry();
        }
    }

    /// One try: make sure a live transport is held, then write to it. A
    /// transport that fails the write is closed before the error returns.
    fn attempt(&mut self, wire: &[u8], deadline: &Deadline) -> crate::Result<Transport> {
        let mut transport = match self.transport.take() {
            // Unread input is a previous response or a FIN queued behind it;
            // either way the socket cannot carry a fresh exchange.
            Some(transport) if transport.liveness() == Liveness::Idle => transport,
            Some(mut stale) => {
                debug!(
                    endpoint = %self.endpoint,
                    transport_id = %stale.id(),
                    "held transport is no longer usable; reconnecting"
                );
                stale.close();
                self.redial(deadline)?
            }
            None => self.redial(deadline)?,
        };

        if let Err(error) = write_request(&mut transport, wire, &self.endpoint, deadline) {
            transport.close();
            return Err(error);
        }
        Ok(transport)
    }

    fn redial(&self, deadline: &Deadline) -> crate::Result<Transport> {
        self.metrics.record_reconnect();
        self.dialer
            .dial(&self.endpoint, self.tls_config.as_ref(), deadline)
    }

    fn circuit_open_error(&self, retry_after: Duration) -> Error {
        Error::CircuitOpen {
            endpoint: self.endpoint.authority(),
            retry_after_ms: retry_after.as_millis(),
        }
    }

    /// Closes the held transport, if any. The next `request` reconnects.
    pub fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            debug!(
                endpoint = %self.endpoint,
                transport_id = %transport.id(),
                "connection closed"
            );
            transport.close();
        }
    }

    /// Gives up the held transport without closing it.
    pub fn into_transport(mut self) -> Option<Transport> {
        self.transport.take()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    pub const fn retry_limit(&self) -> usize {
        self.retry_limit
    }

    pub fn transport(&self) -> Option<&Transport> {
        self.transport.as_ref()
    }

    pub fn transport_mut(&mut self) -> Option<&mut Transport> {
        self.transport.as_mut()
    }

    pub fn circuit_breaker_policy(&self) -> CircuitBreakerPolicy {
        self.breaker.policy()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.metrics.snapshot()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .field("retry_limit", &self.retry_limit)
            .field("circuit_state", &self.breaker.state())
            .field("transport", &self.transport.as_ref().map(Transport::id))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Read};
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::{Connection, DEFAULT_RETRY_LIMIT, DEFAULT_TIMEOUT};
    use crate::connect::{Dialer, TcpDialer};
    use crate::deadline::Deadline;
    use crate::endpoint::Endpoint;
    use crate::error::{Error, ErrorCode};
    use crate::request::RequestSpec;
    use crate::resilience::{CircuitBreakerPolicy, CircuitState};
    use crate::tls::TlsConfig;
    use crate::transport::Transport;

    struct CountingDialer {
        dials: AtomicUsize,
    }

    impl Dialer for CountingDialer {
        fn dial(
            &self,
            endpoint: &Endpoint,
            tls: Option<&TlsConfig>,
            deadline: &Deadline,
        ) -> crate::Result<Transport> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            TcpDialer.dial(endpoint, tls, deadline)
        }
    }

    fn sink_listener() -> (TcpListener, Endpoint) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
        let port = listener.local_addr().expect("listener address").port();
        (listener, Endpoint::http("127.0.0.1", port))
    }

    #[test]
    fn builder_defaults_are_applied() {
        let (_listener, endpoint) = sink_listener();
        let connection = Connection::open(endpoint.clone()).expect("open connection");

        assert_eq!(connection.endpoint(), &endpoint);
        assert_eq!(connection.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(connection.retry_limit(), DEFAULT_RETRY_LIMIT);
        assert!(!connection.circuit_breaker_policy().is_enabled());
        assert!(connection.transport().is_some());
    }

    #[test]
    fn construction_failure_is_not_retried() {
        let (listener, endpoint) = sink_listener();
        drop(listener);
        let dialer = Arc::new(CountingDialer {
            dials: AtomicUsize::new(0),
        });

        let error = Connection::builder(endpoint)
            .retry_limit(3)
            .dialer(dialer.clone())
            .connect()
            .expect_err("nothing listens on the port");

        assert_eq!(error.code(), ErrorCode::Connect);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn healthy_transport_is_reused_across_requests() {
        let (listener, endpoint) = sink_listener();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept connection");
            let mut received = Vec::new();
            let _ = stream.read_to_end(&mut received);
            received
        });
        let dialer = Arc::new(CountingDialer {
            dials: AtomicUsize::new(0),
        });

        let mut connection = Connection::builder(endpoint)
            .dialer(dialer.clone())
            .connect()
            .expect("open connection");
        let first = connection
            .request(&RequestSpec::get("/one"))
            .expect("first request")
            .id();
        let second = connection
            .request(&RequestSpec::get("/two"))
            .expect("second request")
            .id();
        connection.close();
        connection.close();

        let received = String::from_utf8(server.join().expect("server thread"))
            .expect("request bytes are utf-8");
        assert_eq!(first, second);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
        assert!(received.starts_with("GET /one HTTP/1.0\r\n"));
        assert!(received.contains("GET /two HTTP/1.0\r\n"));
        assert!(connection.transport().is_none());

        let stats = connection.stats();
        assert_eq!(stats.requests_succeeded, 2);
        assert_eq!(stats.attempts, 2);
        assert_eq!(stats.reconnects, 0);
    }

    #[test]
    fn invalid_target_fails_before_any_attempt() {
        let (_listener, endpoint) = sink_listener();
        let mut connection = Connection::builder(endpoint)
            .circuit_breaker_policy(CircuitBreakerPolicy::standard().failure_threshold(1))
            .connect()
            .expect("open connection");

        let error = connection
            .request(&RequestSpec::get("/has space"))
            .expect_err("whitespace in the target is rejected");

        assert_eq!(error.code(), ErrorCode::InvalidUri);
        assert_eq!(connection.stats().attempts, 0);
        assert!(matches!(
            connection.circuit_state(),
            CircuitState::Closed {
                consecutive_failures: 0
            }
        ));
    }

    const PASS_THROUGH: usize = 0;
    const REFUSE: usize = 1;
    const MISCONFIGURED: usize = 2;

    struct ScriptedDialer {
        mode: AtomicUsize,
        dials: AtomicUsize,
    }

    impl Dialer for ScriptedDialer {
        fn dial(
            &self,
            endpoint: &Endpoint,
            tls: Option<&TlsConfig>,
            deadline: &Deadline,
        ) -> crate::Result<Transport> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            match self.mode.load(Ordering::SeqCst) {
                REFUSE => Err(Error::Connect {
                    endpoint: endpoint.authority(),
                    source: io::ErrorKind::ConnectionRefused.into(),
                }),
                MISCONFIGURED => Err(Error::TlsConfig {
                    message: "no usable root certificates".to_owned(),
                }),
                _ => TcpDialer.dial(endpoint, tls, deadline),
            }
        }
    }

    #[test]
    fn configuration_error_during_trial_reopens_circuit() {
        let (_listener, endpoint) = sink_listener();
        let dialer = Arc::new(ScriptedDialer {
            mode: AtomicUsize::new(PASS_THROUGH),
            dials: AtomicUsize::new(0),
        });
        let mut connection = Connection::builder(endpoint)
            .retry_limit(0)
            .circuit_breaker_policy(
                CircuitBreakerPolicy::standard()
                    .failure_threshold(1)
                    .cooldown(Duration::from_millis(50)),
            )
            .dialer(dialer.clone())
            .connect()
            .expect("open connection");
        connection.close();

        dialer.mode.store(REFUSE, Ordering::SeqCst);
        let error = connection
            .request(&RequestSpec::get("/"))
            .expect_err("refused redial trips the breaker");
        assert_eq!(error.code(), ErrorCode::CircuitOpen);

        thread::sleep(Duration::from_millis(80));
        dialer.mode.store(MISCONFIGURED, Ordering::SeqCst);
        let error = connection
            .request(&RequestSpec::get("/"))
            .expect_err("trial fails on local configuration");
        assert_eq!(error.code(), ErrorCode::TlsConfig);
        assert!(matches!(
            connection.circuit_state(),
            CircuitState::Open { .. }
        ));

        let dials = dialer.dials.load(Ordering::SeqCst);
        let error = connection
            .request(&RequestSpec::get("/"))
            .expect_err("no second trial inside the cooldown");
        assert_eq!(error.code(), ErrorCode::CircuitOpen);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), dials);
        assert_eq!(connection.stats().circuit_trips, 2);
    }

    #[test]
    fn request_timeout_is_clamped_above_zero() {
        let (_listener, endpoint) = sink_listener();
        let connection = Connection::builder(endpoint)
            .timeout(Duration::ZERO)
            .timeout(Duration::from_secs(1))
            .connect()
            .expect("open connection");
        assert_eq!(connection.timeout(), Duration::from_secs(1));

        let builder = Connection::builder(Endpoint::http("127.0.0.1", 1)).timeout(Duration::ZERO);
        assert!(format!("{builder:?}").contains("1ms"));
    }
}
