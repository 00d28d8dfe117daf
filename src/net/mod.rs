//! Client transports for DNS over UDP, TCP and TLS
//!
//! Every transport is a non-blocking client socket behind the
//! [`Transport`] trait. The engine never blocks inside `send`/`recv`;
//! readiness is established through `probe` and the poll helpers in
//! [`poll`]. Stream transports carry the 2-byte DNS length framing and
//! reassemble replies across reads.

pub mod poll;
mod tcp;
mod tls;
mod udp;

pub use tcp::TcpTransport;
pub use tls::TlsTransport;
pub use udp::UdpTransport;

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::config::Family;

/// Transport mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Udp,
    Tcp,
    Tls,
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "udp" => Ok(Mode::Udp),
            "tcp" => Ok(Mode::Tcp),
            "tls" => Ok(Mode::Tls),
            _ => Err(format!("invalid mode '{}' (expected udp, tcp or tls)", s)),
        }
    }
}

/// Result of a socket readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The socket can take a send now.
    Ready,
    /// Not writable; try another socket.
    NotReady,
    /// TCP connect or TLS handshake still in flight. The caller must not
    /// retry this socket synchronously, but must drain in-progress
    /// sockets before declaring itself done sending.
    InProgress,
    /// The termination channel became readable during the probe.
    Cancelled,
}

/// A non-blocking DNS client socket.
pub trait Transport: Send + Sync {
    /// Check whether the socket is ready for a send, waiting at most
    /// `timeout_us` while a connect or handshake is in flight. `cancel`
    /// is the termination channel's read descriptor.
    fn probe(&self, cancel: RawFd, timeout_us: u64) -> io::Result<Readiness>;

    /// Send one DNS message. Returns the number of payload bytes
    /// accepted; a short count means the message was not fully sent.
    fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Receive one DNS message into `buf`, without blocking. Returns
    /// `WouldBlock` when no complete message is available.
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Descriptor for readiness polling.
    fn raw_fd(&self) -> RawFd;
}

/// Socket-opening parameters shared by every client of a run.
#[derive(Debug, Clone)]
pub struct SocketOpts {
    pub server_addr: SocketAddr,
    /// Server name as given on the command line, for TLS SNI.
    pub server_name: String,
    pub local_addr: Option<IpAddr>,
    /// Base local port; client k of the run binds `local_port + k` when
    /// non-zero.
    pub local_port: u16,
    /// Socket buffer sizes in kilobytes (0 = OS default).
    pub bufsize_kb: u32,
}

/// Resolve the server name to an address, honoring the family
/// restriction.
pub fn resolve_server(family: Family, name: &str, port: u16) -> io::Result<SocketAddr> {
    let addrs = (name, port).to_socket_addrs()?;
    for addr in addrs {
        match (family, addr) {
            (Family::Any, a) => return Ok(a),
            (Family::Inet, a @ SocketAddr::V4(_)) => return Ok(a),
            (Family::Inet6, a @ SocketAddr::V6(_)) => return Ok(a),
            _ => continue,
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AddrNotAvailable,
        format!("no address of the requested family for '{}'", name),
    ))
}

/// Open `count` client sockets for one worker; `offset` is the index of
/// the worker's first socket in the run-wide numbering.
pub fn open_sockets(
    mode: Mode,
    opts: &SocketOpts,
    offset: u32,
    count: u32,
) -> io::Result<Vec<Box<dyn Transport>>> {
    let tls_config = match mode {
        Mode::Tls => Some(tls::client_config()),
        _ => None,
    };
    let mut socks: Vec<Box<dyn Transport>> = Vec::with_capacity(count as usize);
    for k in 0..count {
        let local = local_bind_addr(opts, offset + k);
        let sock: Box<dyn Transport> = match mode {
            Mode::Udp => Box::new(UdpTransport::open(opts.server_addr, local, opts.bufsize_kb)?),
            Mode::Tcp => Box::new(TcpTransport::open(opts.server_addr, local, opts.bufsize_kb)?),
            Mode::Tls => Box::new(TlsTransport::open(
                opts.server_addr,
                local,
                opts.bufsize_kb,
                Arc::clone(tls_config.as_ref().unwrap()),
                &opts.server_name,
            )?),
        };
        socks.push(sock);
    }
    Ok(socks)
}

fn local_bind_addr(opts: &SocketOpts, index: u32) -> Option<SocketAddr> {
    let port = if opts.local_port != 0 {
        opts.local_port.wrapping_add(index as u16)
    } else {
        0
    };
    let ip = match opts.local_addr {
        Some(ip) => ip,
        None if port == 0 => return None,
        None => match opts.server_addr {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        },
    };
    Some(SocketAddr::new(ip, port))
}

// ---------------------------------------------------------------------
// Raw socket helpers shared by the stream transports.
// ---------------------------------------------------------------------

pub(crate) fn to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in;
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = a.port().to_be();
                (*sin).sin_addr.s_addr = u32::from_ne_bytes(a.ip().octets());
            }
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = a.port().to_be();
                (*sin6).sin6_addr.s6_addr = a.ip().octets();
                (*sin6).sin6_scope_id = a.scope_id();
            }
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// Open a non-blocking TCP socket and start connecting. Returns the
/// descriptor and whether the connect completed immediately.
pub(crate) fn open_stream(
    server: SocketAddr,
    local: Option<SocketAddr>,
    bufsize_kb: u32,
) -> io::Result<(RawFd, bool)> {
    let domain = match server {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let close_on_err = |fd: RawFd, err: io::Error| -> io::Error {
        unsafe { libc::close(fd) };
        err
    };

    set_buffer_sizes(fd, bufsize_kb);

    if let Some(local) = local {
        let (storage, len) = to_sockaddr(&local);
        let ret = unsafe {
            libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len)
        };
        if ret != 0 {
            return Err(close_on_err(fd, io::Error::last_os_error()));
        }
    }

    let (storage, len) = to_sockaddr(&server);
    let ret = unsafe {
        libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len)
    };
    if ret == 0 {
        return Ok((fd, true));
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        return Ok((fd, false));
    }
    Err(close_on_err(fd, err))
}

pub(crate) fn set_buffer_sizes(fd: RawFd, bufsize_kb: u32) {
    if bufsize_kb == 0 {
        return;
    }
    let bytes: libc::c_int = (bufsize_kb as libc::c_int).saturating_mul(1024);
    for opt in [libc::SO_SNDBUF, libc::SO_RCVBUF] {
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                opt,
                &bytes as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            tracing::warn!(
                "setting socket buffer size failed: {}",
                io::Error::last_os_error()
            );
        }
    }
}

/// Pending socket error after a non-blocking connect.
pub(crate) fn so_error(fd: RawFd) -> io::Result<i32> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(err)
}

/// read(2) on a raw descriptor, mapped to `io::Result`.
pub(crate) fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// write(2) on a raw descriptor, mapped to `io::Result`.
pub(crate) fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("udp".parse::<Mode>().unwrap(), Mode::Udp);
        assert_eq!("tls".parse::<Mode>().unwrap(), Mode::Tls);
        assert!("doh".parse::<Mode>().is_err());
    }

    #[test]
    fn test_resolve_family_filter() {
        let addr = resolve_server(Family::Inet, "127.0.0.1", 53).unwrap();
        assert!(addr.is_ipv4());
        assert_eq!(addr.port(), 53);
        assert!(resolve_server(Family::Inet6, "127.0.0.1", 53).is_err());
    }

    #[test]
    fn test_local_bind_port_numbering() {
        let opts = SocketOpts {
            server_addr: "192.0.2.1:53".parse().unwrap(),
            server_name: "192.0.2.1".to_string(),
            local_addr: None,
            local_port: 5300,
            bufsize_kb: 0,
        };
        let addr = local_bind_addr(&opts, 7).unwrap();
        assert_eq!(addr.port(), 5307);
        assert!(addr.ip().is_unspecified());

        let unbound = SocketOpts {
            local_port: 0,
            ..opts
        };
        assert!(local_bind_addr(&unbound, 0).is_none());
    }
}
