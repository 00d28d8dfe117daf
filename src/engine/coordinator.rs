//! Run coordinator
//!
//! Spawns the workers, opens the start barrier, then waits for whichever
//! comes first: the deadline, every receiver reporting its outstanding
//! set drained, or the interrupt channel (fed by the SIGINT handler).
//! It then broadcasts termination, joins the worker pairs, reclassifies
//! interrupted queries and sums the per-worker statistics.

use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::info;

use crate::clock::{now_us, split_secs, MICROS_PER_SEC};
use crate::config::Config;
use crate::dns::Builder;
use crate::input::QueryInput;
use crate::net::poll::{wait_readable, Pipe, Wait};
use crate::net::Transport;
use crate::stats::{Summary, WorkerReport};

use super::worker::{Worker, WorkerEnv, WorkerShared};
use super::{DrainLatch, RunTimes, StartBarrier, Termination};

/// Everything a finished run produced.
pub struct RunOutcome {
    pub summary: Summary,
    pub reports: Vec<WorkerReport>,
    pub start_time: u64,
    /// Latest of: the moment the main wait returned, and the last reply
    /// arrival seen by any worker.
    pub end_time: u64,
    pub interrupted: bool,
}

/// Run the engine to completion.
///
/// `banks` holds each worker's transport handles (index-aligned with the
/// worker split); `interrupt` is the channel the SIGINT handler writes
/// into.
pub fn run(
    config: Arc<Config>,
    input: Arc<QueryInput>,
    banks: Vec<Vec<Box<dyn Transport>>>,
    interrupt: Arc<Pipe>,
) -> io::Result<RunOutcome> {
    assert_eq!(banks.len() as u32, config.threads);

    let term = Arc::new(Termination::new()?);
    let barrier = Arc::new(StartBarrier::new());
    let latch = Arc::new(DrainLatch::new(banks.len())?);
    let builder = Arc::new(Builder::new(
        config.edns,
        config.dnssec,
        config.tsig.clone(),
        config.edns_option.clone(),
    ));

    // Blocking stdin reads must notice termination.
    input.set_interrupt_fd(term.read_fd());

    let env = WorkerEnv {
        config: Arc::clone(&config),
        input: Arc::clone(&input),
        builder,
        barrier: Arc::clone(&barrier),
        term: Arc::clone(&term),
        latch: Arc::clone(&latch),
    };

    let mut workers = Vec::with_capacity(banks.len());
    for (index, socks) in banks.into_iter().enumerate() {
        let limits = config.worker_limits(index as u32);
        workers.push(Worker::spawn(index as u32, &env, limits, socks)?);
    }

    let interval_thread = if config.stats_interval_us > 0 {
        let shareds: Vec<Arc<WorkerShared>> =
            workers.iter().map(|w| Arc::clone(&w.shared)).collect();
        let term = Arc::clone(&term);
        let barrier = Arc::clone(&barrier);
        let interval_us = config.stats_interval_us;
        Some(
            std::thread::Builder::new()
                .name("interval-stats".to_string())
                .spawn(move || run_interval_stats(shareds, term, barrier, interval_us))?,
        )
    } else {
        None
    };

    let start_time = now_us();
    let stop_time = if config.time_limit_us > 0 {
        start_time + config.time_limit_us
    } else {
        u64::MAX
    };
    barrier.open(RunTimes {
        start_time,
        stop_time,
    });

    let mut interrupted = false;
    loop {
        let timeout = if stop_time == u64::MAX {
            u64::MAX
        } else {
            stop_time.saturating_sub(now_us())
        };
        match wait_readable(&[latch.read_fd()], Some(interrupt.read_fd()), timeout)? {
            Wait::Cancelled => {
                interrupted = true;
                break;
            }
            Wait::TimedOut => break,
            Wait::Readable => {
                latch.drain();
                if latch.all_drained() {
                    break;
                }
            }
        }
    }

    let mut end_time = now_us();
    if interrupted {
        info!("interrupted, stopping workers");
    }

    term.signal();
    for worker in &workers {
        worker.stop();
    }

    let reports: Vec<WorkerReport> = workers
        .into_iter()
        .map(|w| w.finish(interrupted))
        .collect();

    if let Some(handle) = interval_thread {
        let _ = handle.join();
    }

    for report in &reports {
        if report.receiver.last_recv > end_time {
            end_time = report.receiver.last_recv;
        }
    }

    let mut summary = Summary::default();
    for report in &reports {
        summary.accumulate(report);
    }

    Ok(RunOutcome {
        summary,
        reports,
        start_time,
        end_time,
        interrupted,
    })
}

/// Optional extra thread publishing completion QPS once per interval,
/// as `<sec>.<usec>: <qps>` lines.
fn run_interval_stats(
    shareds: Vec<Arc<WorkerShared>>,
    term: Arc<Termination>,
    barrier: Arc<StartBarrier>,
    interval_us: u64,
) {
    use std::sync::atomic::Ordering;

    let times = barrier.wait();
    let mut last_time = times.start_time;
    let mut last_completed = 0u64;

    while matches!(
        wait_readable(&[term.read_fd()], None, interval_us),
        Ok(Wait::TimedOut)
    ) {
        let now = now_us();
        let completed: u64 = shareds
            .iter()
            .map(|s| s.counters.num_completed.load(Ordering::Relaxed))
            .sum();
        let interval = now - last_time;
        let qps = if interval == 0 {
            0.0
        } else {
            (completed - last_completed) as f64 / (interval as f64 / MICROS_PER_SEC as f64)
        };
        let (sec, usec) = split_secs(now);
        println!("{}.{:06}: {:.6}", sec, usec, qps);
        last_time = now;
        last_completed = completed;
    }
}
