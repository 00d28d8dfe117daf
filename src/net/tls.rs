//! TLS client transport (DNS over TLS)
//!
//! A rustls `ClientConnection` layered over the non-blocking TCP socket.
//! The handshake is driven incrementally from `probe`; until it finishes
//! the socket reports `InProgress`. Certificate verification is disabled:
//! this is a load generator, the server under test is the operator's own.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, ClientConnection, ServerName};
use tracing::warn;

use super::poll::{wait_writable, Wait};
use super::tcp::take_message;
use super::{open_stream, read_fd, so_error, write_fd, Readiness, Transport};

struct NoVerify;

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// Shared client configuration for every TLS socket of a run.
pub(super) fn client_config() -> Arc<ClientConfig> {
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(NoVerify))
        .with_no_client_auth();
    Arc::new(config)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Handshaking,
    Ready,
}

pub struct TlsTransport {
    fd: AtomicI32,
    server: SocketAddr,
    local: Option<SocketAddr>,
    bufsize_kb: u32,
    config: Arc<ClientConfig>,
    sni: ServerName,
    state: Mutex<State>,
}

struct State {
    phase: Phase,
    conn: ClientConnection,
    rbuf: Vec<u8>,
}

struct FdIo(RawFd);

impl Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        read_fd(self.0, buf)
    }
}

impl Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        write_fd(self.0, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl TlsTransport {
    pub fn open(
        server: SocketAddr,
        local: Option<SocketAddr>,
        bufsize_kb: u32,
        config: Arc<ClientConfig>,
        server_name: &str,
    ) -> io::Result<Self> {
        let sni = ServerName::try_from(server_name).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid TLS server name '{}'", server_name),
            )
        })?;
        let (fd, connected) = open_stream(server, local, bufsize_kb)?;
        let conn = ClientConnection::new(Arc::clone(&config), sni.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        Ok(TlsTransport {
            fd: AtomicI32::new(fd),
            server,
            local,
            bufsize_kb,
            config,
            sni,
            state: Mutex::new(State {
                phase: if connected {
                    Phase::Handshaking
                } else {
                    Phase::Connecting
                },
                conn,
                rbuf: Vec::new(),
            }),
        })
    }

    fn reconnect(&self, state: &mut State) -> io::Result<()> {
        let old = self.fd.load(Ordering::Relaxed);
        unsafe { libc::close(old) };
        let (fd, connected) = open_stream(self.server, self.local, self.bufsize_kb)?;
        self.fd.store(fd, Ordering::Relaxed);
        state.phase = if connected {
            Phase::Handshaking
        } else {
            Phase::Connecting
        };
        state.conn = ClientConnection::new(Arc::clone(&self.config), self.sni.clone())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        state.rbuf.clear();
        Ok(())
    }

    /// Push the handshake as far as the socket allows right now.
    fn drive_handshake(&self, state: &mut State) -> io::Result<Readiness> {
        let fd = self.fd.load(Ordering::Relaxed);
        loop {
            if !state.conn.is_handshaking() {
                state.phase = Phase::Ready;
                return Ok(Readiness::Ready);
            }
            if state.conn.wants_write() {
                match state.conn.write_tls(&mut FdIo(fd)) {
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(Readiness::InProgress)
                    }
                    Err(e) => return Err(e),
                }
            }
            match state.conn.read_tls(&mut FdIo(fd)) {
                Ok(0) => {
                    warn!("TLS peer {} closed during handshake, reconnecting", self.server);
                    self.reconnect(state)?;
                    return Ok(Readiness::InProgress);
                }
                Ok(_) => {
                    state
                        .conn
                        .process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(Readiness::InProgress)
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Transport for TlsTransport {
    fn probe(&self, cancel: RawFd, timeout_us: u64) -> io::Result<Readiness> {
        let mut state = self.state.lock().unwrap();
        if state.phase == Phase::Ready {
            return Ok(Readiness::Ready);
        }
        if state.phase == Phase::Connecting {
            let fd = self.fd.load(Ordering::Relaxed);
            match wait_writable(fd, Some(cancel), timeout_us)? {
                Wait::Cancelled => return Ok(Readiness::Cancelled),
                Wait::TimedOut => return Ok(Readiness::InProgress),
                Wait::Readable => {
                    let err = so_error(fd)?;
                    if err != 0 {
                        warn!(
                            "TLS connect to {} failed: {}, reconnecting",
                            self.server,
                            io::Error::from_raw_os_error(err)
                        );
                        self.reconnect(&mut state)?;
                        return Ok(Readiness::InProgress);
                    }
                    state.phase = Phase::Handshaking;
                }
            }
        }
        self.drive_handshake(&mut state)
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.phase != Phase::Ready {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        let fd = self.fd.load(Ordering::Relaxed);
        let mut framed = Vec::with_capacity(buf.len() + 2);
        framed.extend_from_slice(&(buf.len() as u16).to_be_bytes());
        framed.extend_from_slice(buf);
        // Plaintext lands in the rustls buffer in full; flush as much of
        // the record as the socket takes now.
        state.conn.writer().write_all(&framed)?;
        while state.conn.wants_write() {
            match state.conn.write_tls(&mut FdIo(fd)) {
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(buf.len())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        let fd = self.fd.load(Ordering::Relaxed);
        loop {
            if let Some(n) = take_message(&mut state.rbuf, buf) {
                return Ok(n);
            }
            match state.conn.read_tls(&mut FdIo(fd)) {
                Ok(0) => {
                    warn!("TLS connection to {} closed by peer, reconnecting", self.server);
                    self.reconnect(&mut state)?;
                    return Err(io::Error::from(io::ErrorKind::WouldBlock));
                }
                Ok(_) => {
                    state
                        .conn
                        .process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    let mut chunk = [0u8; 4096];
                    loop {
                        match state.conn.reader().read(&mut chunk) {
                            Ok(0) => break,
                            Ok(n) => state.rbuf.extend_from_slice(&chunk[..n]),
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                            Err(e) => return Err(e),
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.fd.load(Ordering::Relaxed)
    }
}

impl Drop for TlsTransport {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd.load(Ordering::Relaxed)) };
    }
}
