//! Per-worker socket bank
//!
//! The bank owns the worker's transport handles and a round-robin
//! cursor. The sender probes up to `2 * len()` successive sockets per
//! attempt to find one that is ready; the receiver scans the bank with a
//! fair rotation of its own.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::net::{Readiness, Transport};

pub struct SocketBank {
    socks: Vec<Box<dyn Transport>>,
    cursor: AtomicUsize,
}

impl SocketBank {
    pub fn new(socks: Vec<Box<dyn Transport>>) -> Self {
        SocketBank {
            socks,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.socks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.socks.is_empty()
    }

    /// Next socket index under round-robin rotation.
    pub fn pick(&self) -> u32 {
        (self.cursor.fetch_add(1, Ordering::Relaxed) % self.socks.len()) as u32
    }

    pub fn get(&self, idx: u32) -> &dyn Transport {
        &*self.socks[idx as usize]
    }

    pub fn probe(&self, idx: u32, cancel: RawFd, timeout_us: u64) -> io::Result<Readiness> {
        self.socks[idx as usize].probe(cancel, timeout_us)
    }

    /// Descriptors for any-readable waits. Collected per wait because
    /// stream transports may reconnect.
    pub fn raw_fds(&self) -> Vec<RawFd> {
        self.socks.iter().map(|s| s.raw_fd()).collect()
    }
}
