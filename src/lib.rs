//! `quickwire` writes HTTP/1.0 requests over non-blocking sockets with hard
//! deadlines.
//!
//! A [`Connection`] keeps one transport to an endpoint (plain TCP or TLS),
//! checks it before every request and reconnects when the peer has gone away.
//! Failed attempts are retried inside the request's deadline, and an optional
//! circuit breaker stops sending to an endpoint that keeps failing. Responses
//! are not parsed: `request` hands back the transport the bytes went out on.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use quickwire::prelude::{CircuitBreakerPolicy, Connection, Endpoint, RequestSpec};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut connection = Connection::builder(Endpoint::parse("https://api.example.com")?)
//!         .timeout(Duration::from_millis(800))
//!         .retry_limit(2)
//!         .circuit_breaker_policy(
//!             CircuitBreakerPolicy::standard()
//!                 .failure_threshold(3)
//!                 .cooldown(Duration::from_secs(5)),
//!         )
//!         .connect()?;
//!
//!     let request = RequestSpec::post("/v1/events")
//!         .try_header("Content-Type", "application/json")?
//!         .body(r#"{"kind":"ping"}"#);
//!     let transport = connection.request(&request)?;
//!
//!     let mut response = [0_u8; 8192];
//!     let read = transport.read_within(&mut response, Duration::from_secs(1))?;
//!     println!("{}", String::from_utf8_lossy(&response[..read]));
//!     Ok(())
//! }
//! ```
//!
//! # Recommended Defaults
//!
//! - Share one `Arc<RequestDefaults>` between connections to the same service.
//! - Keep the timeout short; it bounds connect, handshake and every retry.
//! - Enable the circuit breaker for endpoints on the hot path.

#[cfg(not(unix))]
compile_error!("quickwire drives sockets through poll(2) and only supports unix targets");

mod connect;
mod connection;
mod deadline;
mod endpoint;
mod error;
mod metrics;
pub mod oneshot;
mod readiness;
mod request;
mod resilience;
mod tls;
mod transport;
mod util;

pub use crate::connect::{Dialer, TcpDialer, connect};
pub use crate::connection::{Connection, ConnectionBuilder, DEFAULT_RETRY_LIMIT, DEFAULT_TIMEOUT};
pub use crate::deadline::Deadline;
pub use crate::endpoint::{Endpoint, Scheme, Target};
pub use crate::error::{Error, ErrorCode, TimeoutPhase};
pub use crate::metrics::ConnectionStats;
pub use crate::request::{
    HeaderList, RequestDefaults, RequestSpec, USER_AGENT, encode_request, write_request,
};
pub use crate::resilience::{CircuitBreakerPolicy, CircuitState};
pub use crate::tls::TlsConfig;
pub use crate::transport::{PlainTransport, SecureTransport, Transport, TransportId, TransportKind};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        CircuitBreakerPolicy, CircuitState, Connection, ConnectionBuilder, ConnectionStats,
        Dialer, Endpoint, Error, ErrorCode, HeaderList, RequestDefaults, RequestSpec, Result,
        Target, TimeoutPhase, TlsConfig, Transport, TransportKind,
    };
}
