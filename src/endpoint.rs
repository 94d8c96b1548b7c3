use std::fmt;
use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};

use crate::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    pub const fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }

    const fn uses_tls(self) -> bool {
        matches!(self, Self::Https)
    }
}

/// Where a connection goes. Fixed for the lifetime of a [`Connection`].
///
/// [`Connection`]: crate::Connection
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
    tls: bool,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
        }
    }

    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self::new(host, port, false)
    }

    pub fn https(host: impl Into<String>, port: u16) -> Self {
        Self::new(host, port, true)
    }

    /// Parses the scheme, host and port out of an absolute uri; any path is
    /// ignored.
    pub fn parse(uri: &str) -> crate::Result<Self> {
        Target::parse(uri).map(|target| target.endpoint())
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    pub const fn uses_tls(&self) -> bool {
        self.tls
    }

    pub const fn scheme(&self) -> Scheme {
        if self.tls { Scheme::Https } else { Scheme::Http }
    }

    /// `host:port`, used in logs and error messages.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Value of the `Host` header: the port is left out when it is the
    /// scheme default.
    pub fn host_header(&self) -> String {
        if self.port == self.scheme().default_port() {
            self.host.clone()
        } else {
            self.authority()
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}://{}", self.scheme().as_str(), self.authority())
    }
}

/// An absolute request uri split into the pieces the wire format needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    scheme: Scheme,
    host: String,
    port: u16,
    path_and_query: String,
}

impl Target {
    pub fn parse(uri: &str) -> crate::Result<Self> {
        let invalid = || Error::InvalidUri {
            uri: uri.to_owned(),
        };
        let parsed = url::Url::parse(uri).map_err(|_| invalid())?;
        let scheme = match parsed.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            _ => return Err(invalid()),
        };
        let host = match parsed.host() {
            Some(url::Host::Domain(domain)) => domain.to_owned(),
            Some(url::Host::Ipv4(address)) => address.to_string(),
            // The connector only speaks IPv4.
            Some(url::Host::Ipv6(_)) | None => return Err(invalid()),
        };
        let port = parsed.port().unwrap_or_else(|| scheme.default_port());

        let mut path_and_query = parsed.path().to_owned();
        if path_and_query.is_empty() {
            path_and_query.push('/');
        }
        if let Some(query) = parsed.query() {
            path_and_query.push('?');
            path_and_query.push_str(query);
        }

        Ok(Self {
            scheme,
            host,
            port,
            path_and_query,
        })
    }

    pub const fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    pub fn path_and_query(&self) -> &str {
        &self.path_and_query
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port, self.scheme.uses_tls())
    }
}

/// Resolves `host` to the first IPv4 address the system resolver returns.
///
/// Later candidates are never tried.
pub(crate) fn resolve_ipv4(host: &str, port: u16) -> crate::Result<SocketAddrV4> {
    let resolve_error = |source: std::io::Error| Error::Resolve {
        host: host.to_owned(),
        source,
    };
    let candidates = (host, port).to_socket_addrs().map_err(resolve_error)?;
    candidates
        .filter_map(|address| match address {
            SocketAddr::V4(address) => Some(address),
            SocketAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| {
            resolve_error(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no ipv4 address found",
            ))
        })
}
