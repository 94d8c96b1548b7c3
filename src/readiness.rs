use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};

use crate::deadline::Deadline;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Interest {
    Readable,
    Writable,
}

impl Interest {
    const fn events(self) -> libc::c_short {
        match self {
            Self::Readable => libc::POLLIN,
            Self::Writable => libc::POLLOUT,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Readiness {
    Ready,
    /// The descriptor reported an error or hang-up instead of plain readiness.
    Failed,
    TimedOut,
}

/// Waits until `fd` is ready for `interest`, bounded by `deadline`.
///
/// An interrupted wait is restarted with whatever time is left.
pub(crate) fn wait(
    fd: BorrowedFd<'_>,
    interest: Interest,
    deadline: &Deadline,
) -> io::Result<Readiness> {
    loop {
        if deadline.is_expired() {
            return Ok(Readiness::TimedOut);
        }
        match poll_once(fd, interest.events(), deadline.poll_timeout_ms()) {
            Ok(0) => {
                if deadline.is_expired() {
                    return Ok(Readiness::TimedOut);
                }
            }
            Ok(revents) => return Ok(classify(revents, interest)),
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Liveness {
    Idle,
    PendingInput,
    Dead,
}

/// Zero-timeout check of a held socket. `PendingInput` may hide a FIN behind
/// the queued bytes, so only `Idle` proves the peer is still listening.
pub(crate) fn probe(fd: BorrowedFd<'_>) -> Liveness {
    let revents = loop {
        match poll_once(fd, libc::POLLIN, 0) {
            Ok(revents) => break revents,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => return Liveness::Dead,
        }
    };
    if revents == 0 {
        return Liveness::Idle;
    }
    if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        return Liveness::Dead;
    }

    let mut byte = [0_u8; 1];
    // SAFETY: `fd` is a live socket for the duration of the borrow and `byte`
    // is a valid one-byte buffer.
    let peeked = unsafe {
        libc::recv(
            fd.as_raw_fd(),
            byte.as_mut_ptr().cast::<libc::c_void>(),
            byte.len(),
            libc::MSG_PEEK | libc::MSG_DONTWAIT,
        )
    };
    match peeked {
        0 => Liveness::Dead,
        n if n > 0 => Liveness::PendingInput,
        _ => match io::Error::last_os_error().kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Liveness::Idle,
            _ => Liveness::Dead,
        },
    }
}

fn poll_once(
    fd: BorrowedFd<'_>,
    events: libc::c_short,
    timeout_ms: libc::c_int,
) -> io::Result<libc::c_short> {
    let mut pollfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events,
        revents: 0,
    };
    // SAFETY: one valid pollfd entry, and the descriptor outlives the call.
    let ready = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
    if ready < 0 {
        return Err(io::Error::last_os_error());
    }
    if ready == 0 {
        return Ok(0);
    }
    Ok(pollfd.revents)
}

fn classify(revents: libc::c_short, interest: Interest) -> Readiness {
    if revents & interest.events() != 0 {
        return Readiness::Ready;
    }
    if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        return Readiness::Failed;
    }
    Readiness::Ready
}
