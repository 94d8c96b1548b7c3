//! Single requests on a socket that is used once.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! let mut transport = quickwire::oneshot::get("http://127.0.0.1:8080/health")
//!     .timeout(Duration::from_millis(500))
//!     .send()?;
//! let mut response = [0_u8; 4096];
//! let read = transport.read_within(&mut response, Duration::from_millis(500))?;
//! println!("{}", String::from_utf8_lossy(&response[..read]));
//! transport.close();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::Method;
use http::header::{HeaderName, HeaderValue};

use crate::connect::{Dialer, TcpDialer};
use crate::connection::{Connection, DEFAULT_TIMEOUT};
use crate::deadline::Deadline;
use crate::endpoint::Target;
use crate::error::Error;
use crate::request::{HeaderList, RequestDefaults, RequestSpec};
use crate::tls::TlsConfig;
use crate::transport::Transport;

/// Starts a single request to an absolute `http` or `https` uri.
pub fn request(method: Method, uri: impl Into<String>) -> OneShot {
    OneShot {
        method,
        uri: uri.into(),
        headers: HeaderList::new(),
        body: None,
        timeout: DEFAULT_TIMEOUT,
        tls_config: None,
        defaults: Arc::new(RequestDefaults::single_shot()),
        dialer: Arc::new(TcpDialer),
    }
}

pub fn get(uri: impl Into<String>) -> OneShot {
    request(Method::GET, uri)
}

/// Builder for one request. Nothing is retried and no circuit breaker is
/// involved.
#[must_use = "a one-shot request does nothing until `send` is called"]
pub struct OneShot {
    method: Method,
    uri: String,
    headers: HeaderList,
    body: Option<Bytes>,
    timeout: Duration,
    tls_config: Option<TlsConfig>,
    defaults: Arc<RequestDefaults>,
    dialer: Arc<dyn Dialer>,
}

impl OneShot {
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(mut self, name: &str, value: &str) -> crate::Result<Self> {
        self.headers.try_insert(name, value)?;
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.max(Duration::from_millis(1));
        self
    }

    pub fn tls_config(mut self, tls_config: TlsConfig) -> Self {
        self.tls_config = Some(tls_config);
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

    /// Connects, writes the request, and hands over the transport. The caller
    /// owns it from here, closing included. Connecting and writing share one
    /// `timeout`.
    pub fn send(self) -> crate::Result<Transport> {
        let deadline = Deadline::after(self.timeout);
        let target = Target::parse(&self.uri)?;
        let mut spec =
            RequestSpec::new(self.method, target.path_and_query()).headers(self.headers);
        if let Some(body) = self.body {
            spec = spec.body(body);
        }

        let mut builder = Connection::builder(target.endpoint())
            .timeout(self.timeout)
            .retry_limit(0)
            .defaults(self.defaults)
            .dialer(self.dialer);
        if let Some(tls_config) = self.tls_config {
            builder = builder.tls_config(tls_config);
        }

        let mut connection = builder.connect_within(&deadline)?;
        connection.send_within(&spec, &deadline)
    }

    /// Like [`OneShot::send`], but lends the transport to `handler` and closes
    /// it afterwards whatever the handler returns.
    pub fn send_with<F, T, E>(self, handler: F) -> Result<T, E>
    where
        F: FnOnce(&mut Transport) -> Result<T, E>,
        E: From<Error>,
    {
        let mut transport = self.send()?;
        let result = handler(&mut transport);
        transport.close();
        result
    }
}
