use std::io;
use std::mem;
use std::net::{SocketAddrV4, TcpStream};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};

use tracing::debug;

use crate::deadline::Deadline;
use crate::endpoint::{Endpoint, resolve_ipv4};
use crate::error::{Error, TimeoutPhase};
use crate::readiness::{self, Interest, Readiness};
use crate::tls::{self, TlsConfig};
use crate::transport::{PlainTransport, Transport};

/// Produces a fresh transport for an endpoint. Every connect and reconnect a
/// [`Connection`] makes goes through its dialer.
///
/// [`Connection`]: crate::Connection
pub trait Dialer: Send + Sync {
    fn dial(
        &self,
        endpoint: &Endpoint,
        tls: Option<&TlsConfig>,
        deadline: &Deadline,
    ) -> crate::Result<Transport>;
}

/// TCP connect, then a TLS handshake when the endpoint asks for one.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    fn dial(
        &self,
        endpoint: &Endpoint,
        tls: Option<&TlsConfig>,
        deadline: &Deadline,
    ) -> crate::Result<Transport> {
        let plain = connect(endpoint, deadline)?;
        if !endpoint.uses_tls() {
            return Ok(Transport::from(plain));
        }
        match tls {
            Some(config) => tls::upgrade(plain, endpoint.host(), config, deadline, endpoint),
            None => {
                let config = TlsConfig::webpki_roots()?;
                tls::upgrade(plain, endpoint.host(), &config, deadline, endpoint)
            }
        }
    }
}

/// Opens a TCP connection to `endpoint` within `deadline`.
///
/// Name resolution is charged to the same deadline as the connect itself.
pub fn connect(endpoint: &Endpoint, deadline: &Deadline) -> crate::Result<PlainTransport> {
    let address = resolve_ipv4(endpoint.host(), endpoint.port())?;
    if deadline.is_expired() {
        return Err(deadline.timeout_error(TimeoutPhase::Connect, endpoint));
    }

    let connect_error = |source: io::Error| Error::Connect {
        endpoint: endpoint.authority(),
        source,
    };
    let socket = open_socket().map_err(connect_error)?;
    let raw_address = sockaddr_v4(address);

    loop {
        match connect_once(&socket, &raw_address) {
            Ok(()) => break,
            Err(error) if error.raw_os_error() == Some(libc::EISCONN) => break,
            Err(error) if connect_in_progress(&error) => {}
            Err(error) => return Err(connect_error(error)),
        }

        match readiness::wait(socket.as_fd(), Interest::Writable, deadline) {
            Ok(Readiness::Ready | Readiness::Failed) => {}
            Ok(Readiness::TimedOut) => {
                return Err(deadline.timeout_error(TimeoutPhase::Connect, endpoint));
            }
            Err(error) => return Err(connect_error(error)),
        }
        if deadline.is_expired() {
            return Err(deadline.timeout_error(TimeoutPhase::Connect, endpoint));
        }
        if let Some(error) = take_socket_error(&socket).map_err(connect_error)? {
            return Err(connect_error(error));
        }
    }

    let plain = PlainTransport::from_stream(TcpStream::from(socket)).map_err(connect_error)?;
    debug!(
        endpoint = %endpoint,
        address = %address,
        transport_id = %plain.id(),
        "tcp connection established"
    );
    Ok(plain)
}

fn connect_in_progress(error: &io::Error) -> bool {
    matches!(
        error.raw_os_error(),
        Some(libc::EINPROGRESS | libc::EALREADY | libc::EINTR)
    ) || error.kind() == io::ErrorKind::WouldBlock
}

/// Creates a non-blocking IPv4 stream socket with Nagle disabled.
///
/// The descriptor is owned before any option is set, so an error closes it.
fn open_socket() -> io::Result<OwnedFd> {
    // SAFETY: plain socket(2) call; the result is checked before use.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` was just returned by socket(2) and is owned by nobody else.
    let socket = unsafe { OwnedFd::from_raw_fd(fd) };

    set_flag(&socket, libc::F_GETFD, libc::F_SETFD, libc::FD_CLOEXEC)?;
    set_flag(&socket, libc::F_GETFL, libc::F_SETFL, libc::O_NONBLOCK)?;
    set_int_option(&socket, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)?;
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    set_int_option(&socket, libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1)?;

    Ok(socket)
}

fn set_flag(
    socket: &OwnedFd,
    get: libc::c_int,
    set: libc::c_int,
    flag: libc::c_int,
) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own.
    let current = unsafe { libc::fcntl(socket.as_raw_fd(), get) };
    if current < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(socket.as_raw_fd(), set, current | flag) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_int_option(
    socket: &OwnedFd,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    // SAFETY: `value` lives for the call and the length matches its type.
    let result = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            (&value as *const libc::c_int).cast::<libc::c_void>(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn sockaddr_v4(address: SocketAddrV4) -> libc::sockaddr_in {
    // SAFETY: sockaddr_in is plain old data; all-zero is a valid value.
    let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    {
        raw.sin_len = mem::size_of::<libc::sockaddr_in>() as u8;
    }
    raw.sin_family = libc::AF_INET as libc::sa_family_t;
    raw.sin_port = address.port().to_be();
    raw.sin_addr = libc::in_addr {
        s_addr: u32::from(*address.ip()).to_be(),
    };
    raw
}

/// Issues connect(2). Calling it again on an in-progress socket is how
/// completion is confirmed (`EISCONN`).
fn connect_once(socket: &OwnedFd, address: &libc::sockaddr_in) -> io::Result<()> {
    // SAFETY: `address` is a fully initialised sockaddr_in and the length
    // passed matches it.
    let result = unsafe {
        libc::connect(
            socket.as_raw_fd(),
            (address as *const libc::sockaddr_in).cast::<libc::sockaddr>(),
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn take_socket_error(socket: &OwnedFd) -> io::Result<Option<io::Error>> {
    let mut value: libc::c_int = 0;
    let mut length = mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: `value` and `length` are valid for writes and sized correctly.
    let result = unsafe {
        libc::getsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&mut value as *mut libc::c_int).cast::<libc::c_void>(),
            &mut length,
        )
    };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    if value == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(value)))
    }
}
