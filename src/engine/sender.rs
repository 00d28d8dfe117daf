//! Sender loop
//!
//! Paces and emits requests for one worker: anti-flood jitter over the
//! initial burst, the QPS gate, the concurrency gate on the worker
//! condition variable, slot allocation and rollback, socket selection
//! and the in-progress drain before `done_sending` is raised.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{error, warn};

use crate::clock::{now_us, MICROS_PER_SEC};
use crate::config::WorkerLimits;
use crate::dns::Builder;
use crate::input::{InputError, QueryInput};
use crate::net::Readiness;
use crate::stats::SenderStats;

use super::query_table::ReleaseTo;
use super::sockets::SocketBank;
use super::worker::WorkerShared;
use super::{DrainLatch, StartBarrier, Termination, TIMEOUT_CHECK_TIME};

pub struct SenderCtx {
    pub shared: Arc<WorkerShared>,
    pub bank: Arc<SocketBank>,
    pub input: Arc<QueryInput>,
    pub builder: Arc<Builder>,
    pub limits: WorkerLimits,
    pub barrier: Arc<StartBarrier>,
    pub term: Arc<Termination>,
    pub latch: Arc<DrainLatch>,
    pub verbose: bool,
}

pub fn run(ctx: SenderCtx) -> SenderStats {
    let mut stats = SenderStats::default();
    let counters = &ctx.shared.counters;
    let max_outstanding = ctx.limits.max_outstanding as u64;
    let max_qps = ctx.limits.max_qps as u64;

    let mut line = String::new();
    let mut msg: Vec<u8> = Vec::with_capacity(crate::dns::MAX_EDNS_PACKET);
    let mut any_in_progress = false;

    let times = ctx.barrier.wait();
    let mut now = now_us();

    while !ctx.term.is_set() && now < times.stop_time {
        let num_sent = counters.num_sent.load(Ordering::Relaxed);

        // Smooth the initial burst so the receiver can register before
        // the send queue saturates.
        if num_sent < max_outstanding && num_sent % 2 == 1 {
            if counters.num_completed.load(Ordering::Relaxed) == 0 {
                thread::sleep(Duration::from_millis(1));
            } else {
                thread::yield_now();
            }
            now = now_us();
        }

        // QPS gate.
        if max_qps > 0 {
            let run_time = now - times.start_time;
            let req_time = (MICROS_PER_SEC * num_sent) / max_qps;
            if req_time > run_time {
                thread::sleep(Duration::from_micros(req_time - run_time));
                now = now_us();
                continue;
            }
        }

        let mut table = ctx.shared.table.lock().unwrap();
        if ctx.term.is_set() {
            break;
        }

        // Concurrency gate.
        if counters.outstanding() >= max_outstanding {
            let wait_us = times.stop_time.saturating_sub(now).min(TIMEOUT_CHECK_TIME);
            let (t, _) = ctx
                .shared
                .slot_freed
                .wait_timeout(table, Duration::from_micros(wait_us))
                .unwrap();
            drop(t);
            now = now_us();
            continue;
        }

        let qid = match table.allocate() {
            Ok(qid) => qid,
            Err(_) => {
                drop(table);
                now = now_us();
                continue;
            }
        };

        // Probe up to 2N sockets; pick the first ready one.
        let mut chosen = None;
        for _ in 0..ctx.bank.len() * 2 {
            let idx = ctx.bank.pick();
            match ctx.bank.probe(idx, ctx.term.read_fd(), TIMEOUT_CHECK_TIME) {
                Ok(Readiness::Ready) => {
                    chosen = Some(idx);
                    break;
                }
                Ok(Readiness::NotReady) => {
                    if ctx.verbose {
                        warn!("socket {} not ready", idx);
                    }
                }
                Ok(Readiness::InProgress) => any_in_progress = true,
                Ok(Readiness::Cancelled) => break,
                Err(e) => warn!("socket {} readiness check failed: {}", idx, e),
            }
        }

        let sock_idx = match chosen {
            Some(idx) => idx,
            None => {
                table.release(qid, ReleaseTo::FreeFront);
                drop(table);
                now = now_us();
                continue;
            }
        };
        table.set_socket(qid, sock_idx);
        drop(table);

        line.clear();
        match ctx.input.next(&mut line) {
            Ok(()) => {}
            Err(InputError::InvalidFile) => {
                error!("input file contains no data");
                std::process::exit(1);
            }
            Err(InputError::EndOfInput) | Err(InputError::Cancelled) => {
                rollback(&ctx, qid);
                break;
            }
            Err(e) => {
                error!("reading input failed: {}", e);
                rollback(&ctx, qid);
                break;
            }
        }

        if let Err(e) = ctx.builder.build(&line, qid, &mut msg) {
            warn!("building query for '{}' failed: {}", line, e);
            rollback(&ctx, qid);
            now = now_us();
            continue;
        }

        now = now_us();
        {
            let mut table = ctx.shared.table.lock().unwrap();
            if ctx.verbose {
                table.set_desc(qid, &line);
            }
            table.commit(qid, now);
        }

        match ctx.bank.get(sock_idx).send(&msg) {
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {
                if ctx.verbose {
                    warn!("network congested, packet sending in progress");
                }
                any_in_progress = true;
                counters.num_sent.fetch_add(1, Ordering::Relaxed);
                stats.total_request_size += msg.len() as u64;
            }
            Err(e) => {
                warn!("failed to send packet: {}", e);
                rollback(&ctx, qid);
                continue;
            }
            Ok(n) if n != msg.len() => {
                warn!("failed to send full packet: only sent {} of {}", n, msg.len());
                rollback(&ctx, qid);
                continue;
            }
            Ok(_) => {
                counters.num_sent.fetch_add(1, Ordering::Relaxed);
                stats.total_request_size += msg.len() as u64;
            }
        }
    }

    // A socket that reported in-progress may still hold queued data;
    // drain them before declaring the send side done.
    while any_in_progress {
        any_in_progress = false;
        for idx in 0..ctx.bank.len() as u32 {
            if matches!(
                ctx.bank.probe(idx, ctx.term.read_fd(), TIMEOUT_CHECK_TIME),
                Ok(Readiness::InProgress)
            ) {
                any_in_progress = true;
            }
        }
    }

    ctx.shared.done_send_time.store(now_us(), Ordering::Release);
    ctx.shared.done_sending.store(true, Ordering::Release);
    ctx.latch.sender_done();
    stats
}

fn rollback(ctx: &SenderCtx, qid: u16) {
    let mut table = ctx.shared.table.lock().unwrap();
    table.release(qid, ReleaseTo::FreeFront);
}
