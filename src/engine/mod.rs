//! The multi-threaded send/receive engine
//!
//! Each worker owns a [`query_table::QueryTable`] (one slot per DNS
//! transaction id), a [`sockets::SocketBank`], and a pair of threads: the
//! [`sender`] paces and emits requests, the [`receiver`] correlates
//! replies and expires timeouts. The [`coordinator`] splits the global
//! limits across workers, opens the start barrier, waits for the
//! deadline, completion or an interrupt, and aggregates the per-worker
//! statistics.

pub mod coordinator;
pub mod query_table;
pub mod receiver;
pub mod sender;
pub mod sockets;
pub mod worker;

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use crate::net::poll::Pipe;

/// Query slots per worker; the slot index doubles as the 16-bit DNS
/// transaction id, so this is also the per-worker outstanding cap.
pub const NQIDS: usize = 65_536;

/// Packets drained from the socket bank before the receiver takes the
/// worker lock, to amortize locking cost.
pub const RECV_BATCH_SIZE: usize = 16;

/// Upper bound on every blocking wait in the loops, in microseconds, so
/// termination is never observed late.
pub const TIMEOUT_CHECK_TIME: u64 = 100_000;

/// Start and stop times of a run, fixed when the coordinator opens the
/// start barrier.
#[derive(Debug, Clone, Copy)]
pub struct RunTimes {
    pub start_time: u64,
    /// Deadline, or `u64::MAX` when the run is time-unbounded.
    pub stop_time: u64,
}

/// One-shot barrier all loop threads block on until the coordinator has
/// finished construction.
#[derive(Debug, Default)]
pub struct StartBarrier {
    times: Mutex<Option<RunTimes>>,
    cond: Condvar,
}

impl StartBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, times: RunTimes) {
        let mut slot = self.times.lock().unwrap();
        *slot = Some(times);
        self.cond.notify_all();
    }

    pub fn wait(&self) -> RunTimes {
        let mut slot = self.times.lock().unwrap();
        loop {
            if let Some(times) = *slot {
                return times;
            }
            slot = self.cond.wait(slot).unwrap();
        }
    }
}

/// One-shot termination broadcast.
///
/// The flag answers "should I stop" without a syscall; the pipe wakes
/// every wait that selects on it (the byte is never consumed).
#[derive(Debug)]
pub struct Termination {
    pipe: Pipe,
    flag: AtomicBool,
}

impl Termination {
    pub fn new() -> io::Result<Self> {
        Ok(Termination {
            pipe: Pipe::new()?,
            flag: AtomicBool::new(false),
        })
    }

    pub fn signal(&self) {
        self.flag.store(true, Ordering::Release);
        self.pipe.wake();
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn read_fd(&self) -> RawFd {
        self.pipe.read_fd()
    }
}

/// Completion tracking for the coordinator's main wait: senders wake the
/// main channel when done sending, and the last receiver to drain its
/// outstanding set wakes it for the final time.
#[derive(Debug)]
pub struct DrainLatch {
    receivers_left: AtomicUsize,
    main_pipe: Pipe,
}

impl DrainLatch {
    pub fn new(receivers: usize) -> io::Result<Self> {
        Ok(DrainLatch {
            receivers_left: AtomicUsize::new(receivers),
            main_pipe: Pipe::new()?,
        })
    }

    pub fn sender_done(&self) {
        self.main_pipe.wake();
    }

    pub fn receiver_done(&self) {
        if self.receivers_left.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.main_pipe.wake();
        }
    }

    pub fn all_drained(&self) -> bool {
        self.receivers_left.load(Ordering::Acquire) == 0
    }

    pub fn read_fd(&self) -> RawFd {
        self.main_pipe.read_fd()
    }

    /// Consume queued wakeups so the coordinator can poll again.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.main_pipe.read_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}
