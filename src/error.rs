use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeoutPhase {
    Connect,
    Handshake,
    Write,
    Read,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Connect => "connect",
            Self::Handshake => "handshake",
            Self::Write => "write",
            Self::Read => "read",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUri,
    InvalidHeaderName,
    InvalidHeaderValue,
    Resolve,
    Timeout,
    Connect,
    Tls,
    TlsConfig,
    Write,
    CircuitOpen,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUri => "invalid_uri",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::Resolve => "resolve",
            Self::Timeout => "timeout",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::TlsConfig => "tls_config",
            Self::Write => "write",
            Self::CircuitOpen => "circuit_open",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("failed to resolve an ipv4 address for {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{phase} timed out after {timeout_ms}ms for {endpoint}")]
    Timeout {
        phase: TimeoutPhase,
        timeout_ms: u128,
        endpoint: String,
    },
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    #[error("tls handshake with {endpoint} failed: {source}")]
    Tls {
        endpoint: String,
        #[source]
        source: BoxError,
    },
    #[error("invalid tls configuration: {message}")]
    TlsConfig { message: String },
    #[error("failed to write request to {endpoint}: {source}")]
    Write {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    #[error("circuit breaker is open for {endpoint}; retry after {retry_after_ms}ms")]
    CircuitOpen {
        endpoint: String,
        retry_after_ms: u128,
    },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::Resolve { .. } => ErrorCode::Resolve,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Connect { .. } => ErrorCode::Connect,
            Self::Tls { .. } => ErrorCode::Tls,
            Self::TlsConfig { .. } => ErrorCode::TlsConfig,
            Self::Write { .. } => ErrorCode::Write,
            Self::CircuitOpen { .. } => ErrorCode::CircuitOpen,
        }
    }

    pub const fn timeout_phase(&self) -> Option<TimeoutPhase> {
        match self {
            Self::Timeout { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Failures of one attempt against the endpoint. These feed retry and
    /// circuit accounting; caller mistakes and policy rejections do not.
    pub(crate) const fn is_attempt_failure(&self) -> bool {
        matches!(
            self,
            Self::Resolve { .. }
                | Self::Timeout { .. }
                | Self::Connect { .. }
                | Self::Tls { .. }
                | Self::Write { .. }
        )
    }
}
