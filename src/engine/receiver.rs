//! Receiver loop
//!
//! Expires timeouts from the tail of the outstanding list, drains up to
//! [`RECV_BATCH_SIZE`](super::RECV_BATCH_SIZE) packets from the socket
//! bank under fair rotation, correlates them by transaction id under the
//! worker lock, and does all latency accounting unlocked.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{error, warn};

use crate::clock::{now_us, split_secs};
use crate::dns::{reply_qid, reply_rcode, MAX_EDNS_PACKET, RCODE_STRINGS};
use crate::net::poll::wait_readable;
use crate::stats::ReceiverStats;

use super::query_table::{Membership, ReleaseTo, UNSENT};
use super::sockets::SocketBank;
use super::worker::WorkerShared;
use super::{DrainLatch, StartBarrier, Termination, RECV_BATCH_SIZE, TIMEOUT_CHECK_TIME};

pub struct ReceiverCtx {
    pub shared: Arc<WorkerShared>,
    pub bank: Arc<SocketBank>,
    pub barrier: Arc<StartBarrier>,
    pub term: Arc<Termination>,
    pub latch: Arc<DrainLatch>,
    pub timeout_us: u64,
    pub sample_capacity: usize,
}

/// One reply staged between the batch receive and the correlation pass.
struct Staged {
    sock: u32,
    qid: u16,
    rcode: u8,
    size: usize,
    when: u64,
    sent: u64,
    unexpected: bool,
    short: bool,
    desc: Option<Box<str>>,
}

pub fn run(ctx: ReceiverCtx) -> ReceiverStats {
    let mut stats = ReceiverStats::new(ctx.sample_capacity);
    let nsocks = ctx.bank.len();
    let mut pktbuf = vec![0u8; MAX_EDNS_PACKET];
    let mut batch: Vec<Staged> = Vec::with_capacity(RECV_BATCH_SIZE);
    let mut drained = vec![false; nsocks];
    let mut last_socket: usize = 0;

    ctx.barrier.wait();
    let mut now = now_us();

    while !ctx.term.is_set() {
        prune_timeouts(&ctx, now);

        if ctx.shared.done_sending.load(Ordering::Acquire) && ctx.shared.counters.outstanding() == 0
        {
            break;
        }

        // Batch receive with fair rotation across the bank.
        batch.clear();
        drained.fill(false);
        let mut saved: Option<io::Error> = None;
        'batch: while batch.len() < RECV_BATCH_SIZE {
            let mut received = false;
            for j in 0..nsocks {
                let cur = (j + last_socket) % nsocks;
                if drained[cur] {
                    continue;
                }
                match ctx.bank.get(cur as u32).recv(&mut pktbuf) {
                    Ok(n) => {
                        now = now_us();
                        let short = n < 4;
                        batch.push(Staged {
                            sock: cur as u32,
                            qid: if short { 0 } else { reply_qid(&pktbuf) },
                            rcode: if short { 0 } else { reply_rcode(&pktbuf) },
                            size: n,
                            when: now,
                            sent: 0,
                            unexpected: false,
                            short,
                            desc: None,
                        });
                        last_socket = cur + 1;
                        received = true;
                        break;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        drained[cur] = true;
                        saved = Some(e);
                    }
                    Err(e) => {
                        drained[cur] = true;
                        saved = Some(e);
                        break 'batch;
                    }
                }
            }
            if !received {
                break;
            }
        }
        let nrecvd = batch.len();
        if let Some(last) = batch.last() {
            stats.last_recv = last.when;
        }

        // Correlation under the lock.
        {
            let mut table = ctx.shared.table.lock().unwrap();
            for record in batch.iter_mut() {
                if record.short {
                    continue;
                }
                if table.membership(record.qid) != Membership::Outstanding
                    || table.timestamp(record.qid) == UNSENT
                    || table.socket(record.qid) != record.sock
                {
                    record.unexpected = true;
                    continue;
                }
                record.sent = table.timestamp(record.qid);
                record.desc = table.release(record.qid, ReleaseTo::FreeBack);
            }
            // Unblock a sender waiting on the concurrency gate.
            ctx.shared.slot_freed.notify_one();
        }

        // The rest of the processing runs unlocked.
        for record in batch.drain(..) {
            if record.short {
                warn!("received short response");
                continue;
            }
            if record.unexpected {
                warn!(
                    "received a response with an unexpected (maybe timed out) id: {}",
                    record.qid
                );
                continue;
            }
            let latency = record.when.saturating_sub(record.sent);
            if let Some(desc) = &record.desc {
                let (sec, usec) = split_secs(latency);
                println!(
                    "> {} {} {}.{:06}",
                    RCODE_STRINGS[record.rcode as usize], desc, sec, usec
                );
            }
            ctx.shared.counters.num_completed.fetch_add(1, Ordering::Relaxed);
            stats.record(latency, record.size as u64, record.rcode);
        }

        if nrecvd < RECV_BATCH_SIZE {
            match &saved {
                Some(e) if e.kind() == io::ErrorKind::Interrupted => {
                    now = now_us();
                }
                Some(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let fds = ctx.bank.raw_fds();
                    let _ = wait_readable(&fds, Some(ctx.term.read_fd()), TIMEOUT_CHECK_TIME);
                    now = now_us();
                }
                Some(e) => {
                    error!("failed to receive packet: {}", e);
                    std::process::exit(1);
                }
                None => {
                    now = now_us();
                }
            }
        }
    }

    // Resolve whatever is already due before handing the table back.
    prune_timeouts(&ctx, now_us());
    ctx.latch.receiver_done();
    stats
}

/// Expire outstanding queries older than the timeout, walking from the
/// tail (oldest) until the first young slot.
fn prune_timeouts(ctx: &ReceiverCtx, now: u64) {
    if ctx.shared.counters.outstanding() == 0 {
        return;
    }
    let mut table = ctx.shared.table.lock().unwrap();
    while let Some(qid) = table.oldest() {
        let ts = table.timestamp(qid);
        if ts > now || now - ts < ctx.timeout_us {
            break;
        }
        let desc = table.release(qid, ReleaseTo::FreeBack);
        ctx.shared.counters.num_timedout.fetch_add(1, Ordering::Relaxed);
        match desc {
            Some(d) => println!("> T {}", d),
            None => println!("[Timeout] Query timed out: msg id {}", qid),
        }
    }
}
