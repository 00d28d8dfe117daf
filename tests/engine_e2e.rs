//! End-to-end engine scenarios against an in-process stub transport
//!
//! The stub implements `net::Transport`: sends are inspected for their
//! transaction id and replies are produced after a configurable delay
//! (echoed, swallowed, truncated or mislabeled depending on the
//! scenario). A pipe per stub gives the receiver's readable-wait a real
//! descriptor to poll.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Write as _};
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dnsbench::config::Config;
use dnsbench::engine::coordinator::{self, RunOutcome};
use dnsbench::input::QueryInput;
use dnsbench::net::poll::Pipe;
use dnsbench::net::{Mode, Readiness, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    /// Reply to every query.
    Echo,
    /// Swallow every second query (odd send sequence numbers).
    SwallowOdd,
    /// Reply with a 3-byte packet.
    Short,
    /// Reply with a transaction id that was never sent.
    WrongId,
    /// Never reply.
    Never,
}

/// Write end of the stub's pipe, kept alive by every pending reply
/// thread so a late reply never writes into a recycled descriptor.
struct WriteEnd(RawFd);

impl Drop for WriteEnd {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

struct StubTransport {
    read_fd: RawFd,
    write_end: Arc<WriteEnd>,
    replies: Arc<Mutex<VecDeque<Vec<u8>>>>,
    behavior: Behavior,
    delay: Duration,
    seq: AtomicU64,
}

impl StubTransport {
    fn new(behavior: Behavior, delay: Duration) -> Self {
        let mut fds = [0 as libc::c_int; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        assert_eq!(ret, 0, "pipe2 failed");
        StubTransport {
            read_fd: fds[0],
            write_end: Arc::new(WriteEnd(fds[1])),
            replies: Arc::new(Mutex::new(VecDeque::new())),
            behavior,
            delay,
            seq: AtomicU64::new(0),
        }
    }

    fn schedule_reply(&self, reply: Vec<u8>) {
        let replies = Arc::clone(&self.replies);
        let write_end = Arc::clone(&self.write_end);
        let delay = self.delay;
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            replies.lock().unwrap().push_back(reply);
            let byte = [0u8; 1];
            unsafe { libc::write(write_end.0, byte.as_ptr() as *const libc::c_void, 1) };
        });
    }
}

fn make_reply(qid: u16) -> Vec<u8> {
    let mut reply = Vec::with_capacity(32);
    reply.extend_from_slice(&qid.to_be_bytes());
    reply.extend_from_slice(&[0x81, 0x80]); // QR+RD+RA, rcode NOERROR
    reply.extend_from_slice(&[0, 1, 0, 1, 0, 0, 0, 0]);
    reply.resize(32, 0);
    reply
}

impl Transport for StubTransport {
    fn probe(&self, _cancel: RawFd, _timeout_us: u64) -> io::Result<Readiness> {
        Ok(Readiness::Ready)
    }

    fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let qid = u16::from_be_bytes([buf[0], buf[1]]);
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        match self.behavior {
            Behavior::Echo => self.schedule_reply(make_reply(qid)),
            Behavior::SwallowOdd => {
                if seq % 2 == 0 {
                    self.schedule_reply(make_reply(qid));
                }
            }
            Behavior::Short => self.schedule_reply(vec![0x00, 0x01, 0x02]),
            Behavior::WrongId => self.schedule_reply(make_reply(qid.wrapping_add(1))),
            Behavior::Never => {}
        }
        Ok(buf.len())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(reply) => {
                let mut byte = [0u8; 1];
                unsafe { libc::read(self.read_fd, byte.as_mut_ptr() as *mut libc::c_void, 1) };
                let n = reply.len().min(buf.len());
                buf[..n].copy_from_slice(&reply[..n]);
                Ok(n)
            }
            None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.read_fd
    }
}

impl Drop for StubTransport {
    fn drop(&mut self) {
        unsafe { libc::close(self.read_fd) };
    }
}

fn base_config() -> Config {
    Config {
        mode: Mode::Udp,
        server_addr: "127.0.0.1:53".parse().unwrap(),
        server_name: "127.0.0.1".to_string(),
        local_addr: None,
        local_port: 0,
        clients: 1,
        threads: 1,
        max_passes: 1,
        time_limit_us: 0,
        timeout_us: 5_000_000,
        bufsize_kb: 0,
        edns: false,
        dnssec: false,
        tsig: None,
        edns_option: None,
        max_outstanding: 100,
        max_qps: 0,
        stats_interval_us: 0,
        verbose: false,
    }
}

fn write_input(lines: usize) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "dnsbench-e2e-{}-{}.txt",
        std::process::id(),
        lines
    ));
    let mut f = File::create(&path).unwrap();
    for i in 0..lines {
        writeln!(f, "q{}.example.com A", i).unwrap();
    }
    path
}

/// Run the engine with one stub per client socket.
fn run_engine(
    config: Config,
    input_path: &PathBuf,
    behavior: Behavior,
    delay: Duration,
    interrupt_after: Option<Duration>,
) -> RunOutcome {
    let config = Arc::new(config);
    let input = Arc::new(QueryInput::open(Some(input_path)).unwrap());
    input.set_max_passes(config.max_passes);

    let mut banks: Vec<Vec<Box<dyn Transport>>> = Vec::new();
    for i in 0..config.threads {
        let limits = config.worker_limits(i);
        let bank: Vec<Box<dyn Transport>> = (0..limits.nsocks)
            .map(|_| Box::new(StubTransport::new(behavior, delay)) as Box<dyn Transport>)
            .collect();
        banks.push(bank);
    }

    let interrupt = Arc::new(Pipe::new().unwrap());
    if let Some(after) = interrupt_after {
        let pipe = Arc::clone(&interrupt);
        std::thread::spawn(move || {
            std::thread::sleep(after);
            pipe.wake();
        });
    }

    coordinator::run(config, input, banks, interrupt).unwrap()
}

fn assert_conservation(outcome: &RunOutcome) {
    let s = &outcome.summary;
    assert!(
        s.num_completed + s.num_timedout + s.num_interrupted <= s.num_sent,
        "completed {} + lost {} + interrupted {} exceeds sent {}",
        s.num_completed,
        s.num_timedout,
        s.num_interrupted,
        s.num_sent
    );
}

#[test]
fn echo_loopback_completes_every_query() {
    let mut config = base_config();
    config.max_outstanding = 1;
    config.max_qps = 10;
    let input = write_input(10);

    let outcome = run_engine(config, &input, Behavior::Echo, Duration::from_millis(5), None);

    assert!(!outcome.interrupted);
    assert_eq!(outcome.summary.num_sent, 10);
    assert_eq!(outcome.summary.num_completed, 10);
    assert_eq!(outcome.summary.num_timedout, 0);
    assert!(outcome.summary.latency_min >= 5_000, "min latency {}us", outcome.summary.latency_min);
    assert!(outcome.summary.latency_max < 500_000, "max latency {}us", outcome.summary.latency_max);
    assert_eq!(outcome.summary.rcodecounts[0], 10);
    assert_eq!(outcome.reports[0].receiver.samples.len(), 10);
    assert_conservation(&outcome);
    std::fs::remove_file(input).ok();
}

#[test]
fn qps_ceiling_bounds_send_rate() {
    let mut config = base_config();
    config.threads = 2;
    config.clients = 2;
    config.max_qps = 100;
    config.max_passes = 0;
    config.time_limit_us = 1_000_000;
    let input = write_input(4);

    let outcome = run_engine(config, &input, Behavior::Echo, Duration::from_millis(1), None);

    let sent = outcome.summary.num_sent;
    assert!((80..=120).contains(&sent), "sent {} queries in 1s at 100 qps", sent);
    // Roughly even split across the two workers.
    for report in &outcome.reports {
        assert!(
            (30..=70).contains(&report.num_sent),
            "worker sent {} of {}",
            report.num_sent,
            sent
        );
    }
    assert_conservation(&outcome);
    std::fs::remove_file(input).ok();
}

#[test]
fn swallowed_replies_become_timeouts() {
    let mut config = base_config();
    config.timeout_us = 100_000;
    let input = write_input(100);

    let outcome = run_engine(
        config,
        &input,
        Behavior::SwallowOdd,
        Duration::from_millis(2),
        None,
    );

    assert_eq!(outcome.summary.num_sent, 100);
    assert_eq!(outcome.summary.num_completed, 50);
    assert_eq!(outcome.summary.num_timedout, 50);
    assert_eq!(
        outcome.summary.num_completed + outcome.summary.num_timedout,
        outcome.summary.num_sent
    );
    assert_conservation(&outcome);
    std::fs::remove_file(input).ok();
}

#[test]
fn short_reply_is_discarded_then_times_out() {
    let mut config = base_config();
    config.timeout_us = 100_000;
    let input = write_input(1);

    let outcome = run_engine(config, &input, Behavior::Short, Duration::from_millis(2), None);

    assert_eq!(outcome.summary.num_sent, 1);
    assert_eq!(outcome.summary.num_completed, 0);
    assert_eq!(outcome.summary.num_timedout, 1);
    assert_conservation(&outcome);
    std::fs::remove_file(input).ok();
}

#[test]
fn unexpected_id_never_decrements_outstanding() {
    let mut config = base_config();
    config.timeout_us = 100_000;
    let input = write_input(1);

    let outcome = run_engine(config, &input, Behavior::WrongId, Duration::from_millis(2), None);

    // The mislabeled reply matches a free-list slot; the real query
    // still expires on its own.
    assert_eq!(outcome.summary.num_sent, 1);
    assert_eq!(outcome.summary.num_completed, 0);
    assert_eq!(outcome.summary.num_timedout, 1);
    assert_conservation(&outcome);
    std::fs::remove_file(input).ok();
}

#[test]
fn interrupt_reclassifies_outstanding_queries() {
    let mut config = base_config();
    config.max_passes = 0; // unbounded input
    config.max_outstanding = 50;
    config.timeout_us = 10_000_000;
    let input = write_input(4);

    let started = Instant::now();
    let outcome = run_engine(
        config,
        &input,
        Behavior::Never,
        Duration::ZERO,
        Some(Duration::from_millis(300)),
    );
    let elapsed = started.elapsed();

    assert!(outcome.interrupted);
    assert!(elapsed < Duration::from_secs(2), "join took {:?}", elapsed);
    assert_eq!(outcome.summary.num_completed, 0);
    assert_eq!(outcome.summary.num_timedout, 0);
    // Everything in flight at the interrupt is reclassified.
    assert_eq!(outcome.summary.num_interrupted, outcome.summary.num_sent);
    assert_eq!(outcome.summary.num_sent, 50);
    assert_conservation(&outcome);
    std::fs::remove_file(input).ok();
}
