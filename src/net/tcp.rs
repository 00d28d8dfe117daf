//! TCP client transport
//!
//! DNS over TCP prefixes every message with a 16-bit length. Sends go out
//! as one framed write; receives are reassembled in a per-socket buffer
//! until a complete message is available, so the engine's non-blocking
//! `recv` contract holds across segmented replies.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;

use tracing::warn;

use super::poll::{wait_writable, Wait};
use super::{open_stream, read_fd, so_error, write_fd, Readiness, Transport};

pub struct TcpTransport {
    fd: AtomicI32,
    server: SocketAddr,
    local: Option<SocketAddr>,
    bufsize_kb: u32,
    state: Mutex<State>,
}

struct State {
    connected: bool,
    rbuf: Vec<u8>,
}

impl TcpTransport {
    pub fn open(
        server: SocketAddr,
        local: Option<SocketAddr>,
        bufsize_kb: u32,
    ) -> io::Result<Self> {
        let (fd, connected) = open_stream(server, local, bufsize_kb)?;
        Ok(TcpTransport {
            fd: AtomicI32::new(fd),
            server,
            local,
            bufsize_kb,
            state: Mutex::new(State {
                connected,
                rbuf: Vec::new(),
            }),
        })
    }

    /// Drop the connection and start a fresh non-blocking connect.
    fn reconnect(&self, state: &mut State) -> io::Result<()> {
        let old = self.fd.load(Ordering::Relaxed);
        unsafe { libc::close(old) };
        let (fd, connected) = open_stream(self.server, self.local, self.bufsize_kb)?;
        self.fd.store(fd, Ordering::Relaxed);
        state.connected = connected;
        state.rbuf.clear();
        Ok(())
    }
}

impl Transport for TcpTransport {
    fn probe(&self, cancel: RawFd, timeout_us: u64) -> io::Result<Readiness> {
        let mut state = self.state.lock().unwrap();
        if state.connected {
            return Ok(Readiness::Ready);
        }
        let fd = self.fd.load(Ordering::Relaxed);
        match wait_writable(fd, Some(cancel), timeout_us)? {
            Wait::Cancelled => Ok(Readiness::Cancelled),
            Wait::TimedOut => Ok(Readiness::InProgress),
            Wait::Readable => {
                let err = so_error(fd)?;
                if err == 0 {
                    state.connected = true;
                    Ok(Readiness::Ready)
                } else {
                    warn!(
                        "TCP connect to {} failed: {}, reconnecting",
                        self.server,
                        io::Error::from_raw_os_error(err)
                    );
                    self.reconnect(&mut state)?;
                    Ok(Readiness::InProgress)
                }
            }
        }
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let state = self.state.lock().unwrap();
        if !state.connected {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        let fd = self.fd.load(Ordering::Relaxed);
        let mut framed = Vec::with_capacity(buf.len() + 2);
        framed.extend_from_slice(&(buf.len() as u16).to_be_bytes());
        framed.extend_from_slice(buf);
        let n = write_fd(fd, &framed)?;
        Ok(n.saturating_sub(2))
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        let fd = self.fd.load(Ordering::Relaxed);
        loop {
            if let Some(n) = take_message(&mut state.rbuf, buf) {
                return Ok(n);
            }
            let mut chunk = [0u8; 4096];
            match read_fd(fd, &mut chunk) {
                Ok(0) => {
                    warn!("TCP connection to {} closed by peer, reconnecting", self.server);
                    self.reconnect(&mut state)?;
                    return Err(io::Error::from(io::ErrorKind::WouldBlock));
                }
                Ok(n) => state.rbuf.extend_from_slice(&chunk[..n]),
                Err(e) => return Err(e),
            }
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.fd.load(Ordering::Relaxed)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd.load(Ordering::Relaxed)) };
    }
}

/// Pop one length-prefixed message out of `rbuf` into `out`. Oversized
/// messages are truncated to `out`; the header bytes an oversized reply
/// carries are enough for correlation.
pub(super) fn take_message(rbuf: &mut Vec<u8>, out: &mut [u8]) -> Option<usize> {
    if rbuf.len() < 2 {
        return None;
    }
    let msg_len = u16::from_be_bytes([rbuf[0], rbuf[1]]) as usize;
    if rbuf.len() < 2 + msg_len {
        return None;
    }
    let n = msg_len.min(out.len());
    out[..n].copy_from_slice(&rbuf[2..2 + n]);
    rbuf.drain(..2 + msg_len);
    Some(n)
}
