//! Worker: one sender/receiver thread pair over shared state
//!
//! The shared state is one mutex-guarded query table, the condition
//! variable the concurrency gate sleeps on, and the live counters. The
//! worker owns both join handles; after the pair has joined, the table
//! is exclusively the coordinator's again, which is when interrupted
//! outstanding queries are reclassified.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::error;

use crate::config::{Config, WorkerLimits};
use crate::dns::Builder;
use crate::input::QueryInput;
use crate::net::Transport;
use crate::stats::{LiveCounters, ReceiverStats, SenderStats, WorkerReport};

use super::query_table::{QueryTable, ReleaseTo, UNSENT};
use super::sockets::SocketBank;
use super::{receiver, sender, DrainLatch, StartBarrier, Termination};

/// State shared by the sender, the receiver and (read-only) the
/// coordinator.
pub struct WorkerShared {
    pub table: Mutex<QueryTable>,
    /// Signaled by the receiver whenever slots may have been freed.
    pub slot_freed: Condvar,
    pub counters: LiveCounters,
    pub done_sending: AtomicBool,
    pub done_send_time: AtomicU64,
}

impl WorkerShared {
    pub fn new() -> Self {
        WorkerShared {
            table: Mutex::new(QueryTable::new()),
            slot_freed: Condvar::new(),
            counters: LiveCounters::new(),
            done_sending: AtomicBool::new(false),
            done_send_time: AtomicU64::new(0),
        }
    }
}

impl Default for WorkerShared {
    fn default() -> Self {
        Self::new()
    }
}

/// Run-wide context handed to every worker.
pub struct WorkerEnv {
    pub config: Arc<Config>,
    pub input: Arc<QueryInput>,
    pub builder: Arc<Builder>,
    pub barrier: Arc<StartBarrier>,
    pub term: Arc<Termination>,
    pub latch: Arc<DrainLatch>,
}

pub struct Worker {
    pub index: u32,
    pub shared: Arc<WorkerShared>,
    sender: JoinHandle<SenderStats>,
    receiver: JoinHandle<ReceiverStats>,
}

impl Worker {
    pub fn spawn(
        index: u32,
        env: &WorkerEnv,
        limits: WorkerLimits,
        socks: Vec<Box<dyn Transport>>,
    ) -> io::Result<Worker> {
        let shared = Arc::new(WorkerShared::new());
        let bank = Arc::new(SocketBank::new(socks));

        let receiver_ctx = receiver::ReceiverCtx {
            shared: Arc::clone(&shared),
            bank: Arc::clone(&bank),
            barrier: Arc::clone(&env.barrier),
            term: Arc::clone(&env.term),
            latch: Arc::clone(&env.latch),
            timeout_us: env.config.timeout_us,
            sample_capacity: env.config.latency_sample_capacity(),
        };
        let receiver = std::thread::Builder::new()
            .name(format!("receiver-{}", index))
            .spawn(move || receiver::run(receiver_ctx))?;

        let sender_ctx = sender::SenderCtx {
            shared: Arc::clone(&shared),
            bank: Arc::clone(&bank),
            input: Arc::clone(&env.input),
            builder: Arc::clone(&env.builder),
            limits,
            barrier: Arc::clone(&env.barrier),
            term: Arc::clone(&env.term),
            latch: Arc::clone(&env.latch),
            verbose: env.config.verbose,
        };
        let sender = std::thread::Builder::new()
            .name(format!("sender-{}", index))
            .spawn(move || sender::run(sender_ctx))?;

        Ok(Worker {
            index,
            shared,
            sender,
            receiver,
        })
    }

    /// Wake a sender blocked on the concurrency gate. Called after the
    /// termination channel has been signaled.
    pub fn stop(&self) {
        let _table = self.shared.table.lock().unwrap();
        self.shared.slot_freed.notify_all();
    }

    /// Join both threads and assemble this worker's report. When the run
    /// was interrupted, queries still outstanding are reclassified and
    /// their descriptions reported.
    pub fn finish(self, interrupted: bool) -> WorkerReport {
        let sender_stats = match self.sender.join() {
            Ok(stats) => stats,
            Err(_) => {
                error!("sender thread {} panicked", self.index);
                SenderStats::default()
            }
        };
        let receiver_stats = match self.receiver.join() {
            Ok(stats) => stats,
            Err(_) => {
                error!("receiver thread {} panicked", self.index);
                ReceiverStats::new(0)
            }
        };

        use std::sync::atomic::Ordering;
        let mut report = WorkerReport {
            num_sent: self.shared.counters.num_sent.load(Ordering::Relaxed),
            num_completed: self.shared.counters.num_completed.load(Ordering::Relaxed),
            num_timedout: self.shared.counters.num_timedout.load(Ordering::Relaxed),
            num_interrupted: 0,
            sender: sender_stats,
            receiver: receiver_stats,
        };

        if interrupted {
            let mut table = self.shared.table.lock().unwrap();
            while let Some(qid) = table.oldest() {
                let ts = table.timestamp(qid);
                let desc = table.release(qid, ReleaseTo::FreeBack);
                if ts == UNSENT {
                    continue;
                }
                report.num_interrupted += 1;
                if let Some(d) = desc {
                    println!("> I {}", d);
                }
            }
        }

        report
    }
}
