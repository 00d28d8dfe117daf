//! UDP client transport

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};

use super::{set_buffer_sizes, Readiness, Transport};

/// A connected, non-blocking UDP socket. Datagram sockets are always
/// ready to send, so `probe` never blocks.
pub struct UdpTransport {
    sock: UdpSocket,
}

impl UdpTransport {
    pub fn open(
        server: SocketAddr,
        local: Option<SocketAddr>,
        bufsize_kb: u32,
    ) -> io::Result<Self> {
        let bind_to = local.unwrap_or_else(|| match server {
            SocketAddr::V4(_) => "0.0.0.0:0".parse().unwrap(),
            SocketAddr::V6(_) => "[::]:0".parse().unwrap(),
        });
        let sock = UdpSocket::bind(bind_to)?;
        set_buffer_sizes(sock.as_raw_fd(), bufsize_kb);
        sock.connect(server)?;
        sock.set_nonblocking(true)?;
        Ok(UdpTransport { sock })
    }
}

impl Transport for UdpTransport {
    fn probe(&self, _cancel: RawFd, _timeout_us: u64) -> io::Result<Readiness> {
        Ok(Readiness::Ready)
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.sock.send(buf)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.sock.recv(buf)
    }

    fn raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}
