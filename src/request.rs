use std::io::{self, Write};

use bytes::{BufMut, Bytes, BytesMut};
use http::Method;
use http::header::{HeaderName, HeaderValue};

use crate::deadline::Deadline;
use crate::endpoint::Endpoint;
use crate::error::{Error, TimeoutPhase};
use crate::readiness::{Interest, Readiness};
use crate::transport::Transport;
use crate::util::{parse_header_name, parse_header_value};

pub const USER_AGENT: &str = concat!("quickwire/", env!("CARGO_PKG_VERSION"));

const HOST: &str = "Host";
const CONTENT_LENGTH: &str = "Content-Length";

/// Ordered header list. Names keep the caller's spelling on the wire and
/// compare case-insensitively. Values are kept as validated bytes and go out
/// unchanged.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderList {
    entries: Vec<(String, HeaderValue)>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: HeaderName, value: HeaderValue) {
        self.set(name.as_str(), value);
    }

    /// Sets `name` to `value`. An existing entry with the same name keeps its
    /// position but takes the new spelling and value.
    pub fn try_insert(&mut self, name: &str, value: &str) -> crate::Result<()> {
        let header_name = parse_header_name(name)?;
        let header_value = parse_header_value(header_name.as_str(), value)?;
        self.set(name, header_value);
        Ok(())
    }

    pub fn try_with(mut self, name: &str, value: &str) -> crate::Result<Self> {
        self.try_insert(name, value)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.entries
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<HeaderValue> {
        let position = self
            .entries
            .iter()
            .position(|(existing, _)| existing.eq_ignore_ascii_case(name))?;
        Some(self.entries.remove(position).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn set(&mut self, name: &str, value: HeaderValue) {
        match self
            .entries
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
        {
            Some(entry) => {
                entry.0 = name.to_owned();
                entry.1 = value;
            }
            None => self.entries.push((name.to_owned(), value)),
        }
    }

    fn merge(&mut self, overrides: &HeaderList) {
        for (name, value) in overrides.iter() {
            self.set(name, value.clone());
        }
    }
}

/// Headers placed under every request's own headers.
///
/// Build one and share it; connections keep it behind an `Arc`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestDefaults {
    headers: HeaderList,
}

impl RequestDefaults {
    /// Identifying user agent, accept-anything, and keep-alive.
    pub fn persistent() -> Self {
        let mut defaults = Self::single_shot();
        defaults
            .headers
            .set("Connection", HeaderValue::from_static("keep-alive"));
        defaults
    }

    /// Like [`RequestDefaults::persistent`] but without the `Connection`
    /// header, for sockets used once.
    pub fn single_shot() -> Self {
        let mut headers = HeaderList::new();
        headers.set("User-Agent", HeaderValue::from_static(USER_AGENT));
        headers.set("Accept", HeaderValue::from_static("*/*"));
        Self { headers }
    }

    pub fn from_headers(headers: HeaderList) -> Self {
        Self { headers }
    }

    pub fn try_with_header(mut self, name: &str, value: &str) -> crate::Result<Self> {
        self.headers.try_insert(name, value)?;
        Ok(self)
    }

    pub fn headers(&self) -> &HeaderList {
        &self.headers
    }
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self::persistent()
    }
}

/// What to send: method, path and query, headers, and an optional body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestSpec {
    method: Method,
    target: String,
    headers: HeaderList,
    body: Option<Bytes>,
}

impl RequestSpec {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        let mut target = target.into();
        if target.is_empty() {
            target.push('/');
        }
        Self {
            method,
            target,
            headers: HeaderList::new(),
            body: None,
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new(Method::GET, target)
    }

    pub fn post(target: impl Into<String>) -> Self {
        Self::new(Method::POST, target)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(mut self, name: &str, value: &str) -> crate::Result<Self> {
        self.headers.try_insert(name, value)?;
        Ok(self)
    }

    pub fn headers(mut self, headers: HeaderList) -> Self {
        self.headers = headers;
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn header_list(&self) -> &HeaderList {
        &self.headers
    }

    pub fn body_bytes(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }
}

/// Serializes `spec` as an HTTP/1.0 request for `endpoint`.
///
/// Header order is defaults, then the request's own headers, then `Host` and
/// `Content-Length`, which are always derived here and replace any value the
/// caller supplied.
pub fn encode_request(
    spec: &RequestSpec,
    endpoint: &Endpoint,
    defaults: &RequestDefaults,
) -> crate::Result<Bytes> {
    if spec.target.bytes().any(|byte| byte.is_ascii_whitespace() || byte.is_ascii_control()) {
        return Err(Error::InvalidUri {
            uri: spec.target.clone(),
        });
    }

    let body_len = spec.body.as_ref().map_or(0, Bytes::len);
    let mut headers = defaults.headers.clone();
    headers.merge(&spec.headers);
    headers.remove(HOST);
    headers.remove(CONTENT_LENGTH);
    headers.set(HOST, parse_header_value(HOST, &endpoint.host_header())?);
    headers.set(CONTENT_LENGTH, HeaderValue::from(body_len));

    let header_bytes: usize = headers
        .iter()
        .map(|(name, value)| name.len() + value.len() + 4)
        .sum();
    let mut wire = BytesMut::with_capacity(
        spec.method.as_str().len() + spec.target.len() + 16 + header_bytes + body_len,
    );

    wire.put_slice(spec.method.as_str().as_bytes());
    wire.put_u8(b' ');
    wire.put_slice(spec.target.as_bytes());
    wire.put_slice(b" HTTP/1.0\r\n");
    for (name, value) in headers.iter() {
        wire.put_slice(name.as_bytes());
        wire.put_slice(b": ");
        wire.put_slice(value.as_bytes());
        wire.put_slice(b"\r\n");
    }
    wire.put_slice(b"\r\n");
    if let Some(body) = &spec.body {
        wire.put_slice(body);
    }

    Ok(wire.freeze())
}

/// Writes an encoded request in full, waiting for writability whenever the
/// socket pushes back. Secure transports are flushed down to the socket.
pub fn write_request(
    transport: &mut Transport,
    wire: &[u8],
    endpoint: &Endpoint,
    deadline: &Deadline,
) -> crate::Result<()> {
    let write_error = |source: io::Error| Error::Write {
        endpoint: endpoint.authority(),
        source,
    };

    let mut written = 0;
    while written < wire.len() {
        match transport.write(&wire[written..]) {
            Ok(0) => return Err(write_error(io::ErrorKind::WriteZero.into())),
            Ok(count) => written += count,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                wait_writable(transport, endpoint, deadline)?;
            }
            Err(error) => return Err(write_error(error)),
        }
    }

    while transport.has_pending_output() {
        match transport.flush() {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                wait_writable(transport, endpoint, deadline)?;
            }
            Err(error) => return Err(write_error(error)),
        }
    }
    Ok(())
}

fn wait_writable(
    transport: &Transport,
    endpoint: &Endpoint,
    deadline: &Deadline,
) -> crate::Result<()> {
    match transport.wait_ready(Interest::Writable, deadline) {
        // A failed socket surfaces its error on the next write.
        Ok(Readiness::Ready | Readiness::Failed) => Ok(()),
        Ok(Readiness::TimedOut) => Err(deadline.timeout_error(TimeoutPhase::Write, endpoint)),
        Err(source) => Err(Error::Write {
            endpoint: endpoint.authority(),
            source,
        }),
    }
}
