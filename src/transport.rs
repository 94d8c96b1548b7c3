use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::deadline::Deadline;
use crate::readiness::{self, Interest, Liveness, Readiness};

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a transport.
///
/// A secure transport gets its own id, distinct from the plain socket it owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransportId(u64);

impl TransportId {
    fn next() -> Self {
        Self(NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TransportId {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    Plain,
    Secure,
}

impl TransportKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Secure => "secure",
        }
    }
}

/// A connected, non-blocking TCP socket.
#[derive(Debug)]
pub struct PlainTransport {
    id: TransportId,
    stream: Option<TcpStream>,
}

impl PlainTransport {
    /// Wraps an already connected stream and switches it to non-blocking mode.
    pub fn from_stream(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            id: TransportId::next(),
            stream: Some(stream),
        })
    }

    pub const fn id(&self) -> TransportId {
        self.id
    }

    pub const fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream()?.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream()?.local_addr()
    }

    pub(crate) fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.stream.as_ref().map(AsFd::as_fd)
    }

    fn stream(&self) -> io::Result<&TcpStream> {
        self.stream.as_ref().ok_or_else(closed_error)
    }

    fn stream_mut(&mut self) -> io::Result<&mut TcpStream> {
        self.stream.as_mut().ok_or_else(closed_error)
    }
}

impl Read for PlainTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream_mut()?.read(buf)
    }
}

impl Write for PlainTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream_mut()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream_mut()?.flush()
    }
}

/// A TLS session that exclusively owns the plain socket underneath it.
#[derive(Debug)]
pub struct SecureTransport {
    id: TransportId,
    session: rustls::ClientConnection,
    inner: PlainTransport,
}

impl SecureTransport {
    pub(crate) fn new(session: rustls::ClientConnection, inner: PlainTransport) -> Self {
        Self {
            id: TransportId::next(),
            session,
            inner,
        }
    }

    pub const fn id(&self) -> TransportId {
        self.id
    }

    pub const fn raw(&self) -> &PlainTransport {
        &self.inner
    }

    pub fn session(&self) -> &rustls::ClientConnection {
        &self.session
    }

    pub const fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Sends `close_notify` if the socket will take it, then closes the socket.
    pub fn close(&mut self) {
        if self.inner.is_closed() {
            return;
        }
        self.session.send_close_notify();
        let _ = self.write_pending();
        self.inner.close();
    }

    /// Pushes queued TLS records to the socket until done or it would block.
    pub(crate) fn write_pending(&mut self) -> io::Result<()> {
        let stream = self.inner.stream_mut()?;
        while self.session.wants_write() {
            if self.session.write_tls(stream)? == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
        }
        Ok(())
    }

    pub(crate) fn read_tls_records(&mut self) -> io::Result<usize> {
        let stream = self.inner.stream_mut()?;
        self.session.read_tls(stream)
    }

    pub(crate) fn process_records(&mut self) -> Result<(), rustls::Error> {
        self.session.process_new_packets().map(|_| ())
    }
}

impl Read for SecureTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.session.reader().read(buf) {
                Ok(read) => return Ok(read),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {}
                Err(error) => return Err(error),
            }

            if self.read_tls_records()? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            self.process_records()
                .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
        }
    }
}

impl Write for SecureTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.inner.is_closed() {
            return Err(closed_error());
        }
        let accepted = self.session.writer().write(buf)?;
        match self.write_pending() {
            Ok(()) => {}
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {}
            Err(error) => return Err(error),
        }
        if accepted == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        Ok(accepted)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.session.writer().flush()?;
        self.write_pending()
    }
}

/// The duplex byte stream handed back to callers: a raw socket or a TLS
/// session layered on one.
///
/// All I/O is non-blocking. `read`/`write` return `WouldBlock` when the
/// socket is not ready; [`Transport::read_within`] waits instead.
#[derive(Debug)]
pub enum Transport {
    Plain(PlainTransport),
    Secure(Box<SecureTransport>),
}

impl Transport {
    pub fn id(&self) -> TransportId {
        match self {
            Self::Plain(plain) => plain.id(),
            Self::Secure(secure) => secure.id(),
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Plain(_) => TransportKind::Plain,
            Self::Secure(_) => TransportKind::Secure,
        }
    }

    /// The socket underneath. For a plain transport that is the transport
    /// itself.
    pub fn raw(&self) -> &PlainTransport {
        match self {
            Self::Plain(plain) => plain,
            Self::Secure(secure) => secure.raw(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Self::Plain(plain) => plain.is_closed(),
            Self::Secure(secure) => secure.is_closed(),
        }
    }

    /// Closes the transport; a secure transport also closes its socket.
    /// Closing twice is a no-op.
    pub fn close(&mut self) {
        match self {
            Self::Plain(plain) => plain.close(),
            Self::Secure(secure) => secure.close(),
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.raw().peer_addr()
    }

    /// Reads whatever is available, waiting up to `timeout` for the socket to
    /// become readable.
    pub fn read_within(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let deadline = Deadline::after(timeout);
        loop {
            match self.read(buf) {
                Ok(read) => return Ok(read),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {}
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(error),
            }
            match self.wait_ready(Interest::Readable, &deadline)? {
                Readiness::Ready | Readiness::Failed => {}
                Readiness::TimedOut => return Err(io::ErrorKind::TimedOut.into()),
            }
        }
    }

    /// Waits on the underlying socket; secure transports delegate to it.
    pub(crate) fn wait_ready(
        &self,
        interest: Interest,
        deadline: &Deadline,
    ) -> io::Result<Readiness> {
        let fd = self.raw().fd().ok_or_else(closed_error)?;
        readiness::wait(fd, interest, deadline)
    }

    pub(crate) fn liveness(&self) -> Liveness {
        match self.raw().fd() {
            Some(fd) => readiness::probe(fd),
            None => Liveness::Dead,
        }
    }

    pub(crate) fn has_pending_output(&self) -> bool {
        match self {
            Self::Plain(_) => false,
            Self::Secure(secure) => secure.session.wants_write(),
        }
    }
}

impl From<PlainTransport> for Transport {
    fn from(plain: PlainTransport) -> Self {
        Self::Plain(plain)
    }
}

impl From<SecureTransport> for Transport {
    fn from(secure: SecureTransport) -> Self {
        Self::Secure(Box::new(secure))
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(plain) => plain.read(buf),
            Self::Secure(secure) => secure.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(plain) => plain.write(buf),
            Self::Secure(secure) => secure.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(plain) => plain.flush(),
            Self::Secure(secure) => secure.flush(),
        }
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport is closed")
}
