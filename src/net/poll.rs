//! poll(2) wrappers and wakeup pipes
//!
//! Every blocking wait in the engine goes through these helpers so it can
//! be cancelled by a byte written into a pipe: the termination channel
//! that stops the workers, and the interrupt channel fed by the SIGINT
//! handler.

use std::io;
use std::os::unix::io::RawFd;

/// Outcome of a bounded readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// At least one of the watched descriptors is ready.
    Readable,
    /// The cancel descriptor became readable first.
    Cancelled,
    TimedOut,
}

fn poll_ms(timeout_us: u64) -> libc::c_int {
    if timeout_us == u64::MAX {
        return -1;
    }
    let ms = (timeout_us + 999) / 1000;
    ms.min(i32::MAX as u64) as libc::c_int
}

fn do_poll(fds: &mut [libc::pollfd], timeout_us: u64) -> io::Result<libc::c_int> {
    loop {
        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, poll_ms(timeout_us)) };
        if n >= 0 {
            return Ok(n);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Wait until any of `fds` is readable, `cancel` is readable, or the
/// timeout expires. `u64::MAX` means no timeout.
pub fn wait_readable(fds: &[RawFd], cancel: Option<RawFd>, timeout_us: u64) -> io::Result<Wait> {
    let mut pollfds: Vec<libc::pollfd> = Vec::with_capacity(fds.len() + 1);
    if let Some(fd) = cancel {
        pollfds.push(libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        });
    }
    for &fd in fds {
        pollfds.push(libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        });
    }

    if do_poll(&mut pollfds, timeout_us)? == 0 {
        return Ok(Wait::TimedOut);
    }
    if cancel.is_some() && pollfds[0].revents != 0 {
        return Ok(Wait::Cancelled);
    }
    Ok(Wait::Readable)
}

/// Wait until `fd` is writable, `cancel` is readable, or the timeout
/// expires.
pub fn wait_writable(fd: RawFd, cancel: Option<RawFd>, timeout_us: u64) -> io::Result<Wait> {
    let mut pollfds = [
        libc::pollfd {
            fd: cancel.unwrap_or(-1),
            events: libc::POLLIN,
            revents: 0,
        },
        libc::pollfd {
            fd,
            events: libc::POLLOUT,
            revents: 0,
        },
    ];

    if do_poll(&mut pollfds, timeout_us)? == 0 {
        return Ok(Wait::TimedOut);
    }
    if pollfds[0].revents != 0 {
        return Ok(Wait::Cancelled);
    }
    Ok(Wait::Readable)
}

/// A byte pipe used as a one-shot broadcast channel.
///
/// `wake()` leaves the byte unread, so every thread polling the read end
/// sees it readable from then on.
#[derive(Debug)]
pub struct Pipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl Pipe {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Pipe {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    /// Write one byte. A full pipe already wakes every poller, so the
    /// result is ignored.
    pub fn wake(&self) {
        let byte = [0u8; 1];
        unsafe {
            libc::write(self.write_fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// True once `wake()` has been called.
    pub fn is_woken(&self) -> bool {
        matches!(
            wait_readable(&[self.read_fd], None, 0),
            Ok(Wait::Readable)
        )
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}
