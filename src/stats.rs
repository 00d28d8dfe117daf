//! Per-worker statistics and the final report
//!
//! Counters consulted across threads while the run is live (`num_sent`,
//! `num_completed`, `num_timedout`) are relaxed atomics; everything else
//! is owned by exactly one loop and merged once, after the worker threads
//! have joined.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::clock::{split_secs, MICROS_PER_SEC};
use crate::dns::RCODE_STRINGS;

/// Counters shared between the sender, the receiver and the optional
/// interval-stats thread of a worker.
#[derive(Debug, Default)]
pub struct LiveCounters {
    pub num_sent: AtomicU64,
    pub num_completed: AtomicU64,
    pub num_timedout: AtomicU64,
}

impl LiveCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queries sent but neither completed nor expired.
    pub fn outstanding(&self) -> u64 {
        let sent = self.num_sent.load(Ordering::Relaxed);
        let completed = self.num_completed.load(Ordering::Relaxed);
        let timedout = self.num_timedout.load(Ordering::Relaxed);
        sent.saturating_sub(completed).saturating_sub(timedout)
    }
}

/// Stats owned by the sender loop.
#[derive(Debug, Default)]
pub struct SenderStats {
    pub total_request_size: u64,
}

/// Stats owned by the receiver loop, including the latency sample
/// buffer. The buffer is reserved once; samples past `capacity` are
/// silently dropped.
#[derive(Debug)]
pub struct ReceiverStats {
    pub rcodecounts: [u64; 16],
    pub total_response_size: u64,
    pub latency_sum: u64,
    pub latency_sum_squares: u64,
    pub latency_min: u64,
    pub latency_max: u64,
    pub samples: Vec<u64>,
    capacity: usize,
    /// Arrival timestamp of the most recent reply.
    pub last_recv: u64,
}

impl ReceiverStats {
    pub fn new(capacity: usize) -> Self {
        ReceiverStats {
            rcodecounts: [0; 16],
            total_response_size: 0,
            latency_sum: 0,
            latency_sum_squares: 0,
            latency_min: u64::MAX,
            latency_max: 0,
            samples: Vec::with_capacity(capacity),
            capacity,
            last_recv: 0,
        }
    }

    pub fn record(&mut self, latency_us: u64, response_size: u64, rcode: u8) {
        if self.samples.len() < self.capacity {
            self.samples.push(latency_us);
        }
        self.rcodecounts[(rcode & 0x0F) as usize] += 1;
        self.total_response_size += response_size;
        self.latency_sum += latency_us;
        self.latency_sum_squares += latency_us * latency_us;
        if latency_us < self.latency_min {
            self.latency_min = latency_us;
        }
        if latency_us > self.latency_max {
            self.latency_max = latency_us;
        }
    }
}

/// Everything one worker contributed, assembled after its threads have
/// joined.
#[derive(Debug)]
pub struct WorkerReport {
    pub num_sent: u64,
    pub num_completed: u64,
    pub num_timedout: u64,
    pub num_interrupted: u64,
    pub sender: SenderStats,
    pub receiver: ReceiverStats,
}

/// Cross-worker totals.
#[derive(Debug)]
pub struct Summary {
    pub num_sent: u64,
    pub num_completed: u64,
    pub num_timedout: u64,
    pub num_interrupted: u64,
    pub rcodecounts: [u64; 16],
    pub total_request_size: u64,
    pub total_response_size: u64,
    pub latency_sum: u64,
    pub latency_sum_squares: u64,
    pub latency_min: u64,
    pub latency_max: u64,
}

impl Default for Summary {
    fn default() -> Self {
        Summary {
            num_sent: 0,
            num_completed: 0,
            num_timedout: 0,
            num_interrupted: 0,
            rcodecounts: [0; 16],
            total_request_size: 0,
            total_response_size: 0,
            latency_sum: 0,
            latency_sum_squares: 0,
            latency_min: u64::MAX,
            latency_max: 0,
        }
    }
}

fn safe_div(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Sample standard deviation from the running sums.
pub fn stddev(sum_of_squares: u64, sum: u64, total: u64) -> f64 {
    let squared = sum as f64 * sum as f64;
    ((sum_of_squares as f64 - squared / total as f64) / (total as f64 - 1.0)).sqrt()
}

impl Summary {
    pub fn accumulate(&mut self, report: &WorkerReport) {
        self.num_sent += report.num_sent;
        self.num_completed += report.num_completed;
        self.num_timedout += report.num_timedout;
        self.num_interrupted += report.num_interrupted;
        for (total, count) in self
            .rcodecounts
            .iter_mut()
            .zip(report.receiver.rcodecounts.iter())
        {
            *total += count;
        }
        self.total_request_size += report.sender.total_request_size;
        self.total_response_size += report.receiver.total_response_size;
        self.latency_sum += report.receiver.latency_sum;
        self.latency_sum_squares += report.receiver.latency_sum_squares;
        if report.receiver.latency_min < self.latency_min {
            self.latency_min = report.receiver.latency_min;
        }
        if report.receiver.latency_max > self.latency_max {
            self.latency_max = report.receiver.latency_max;
        }
    }

    /// Print the final statistics block.
    pub fn print(&self, run_time_us: u64) {
        println!("Statistics:\n");

        println!("  Queries sent:         {}", self.num_sent);
        println!(
            "  Queries completed:    {} ({:.2}%)",
            self.num_completed,
            100.0 * safe_div(self.num_completed, self.num_sent)
        );
        println!(
            "  Queries lost:         {} ({:.2}%)",
            self.num_timedout,
            100.0 * safe_div(self.num_timedout, self.num_sent)
        );
        if self.num_interrupted > 0 {
            println!(
                "  Queries interrupted:  {} ({:.2}%)",
                self.num_interrupted,
                100.0 * safe_div(self.num_interrupted, self.num_sent)
            );
        }
        println!();

        print!("  Response codes:       ");
        let mut first = true;
        for (rcode, count) in self.rcodecounts.iter().enumerate() {
            if *count == 0 {
                continue;
            }
            if !first {
                print!(", ");
            }
            first = false;
            print!(
                "{} {} ({:.2}%)",
                RCODE_STRINGS[rcode],
                count,
                100.0 * safe_div(*count, self.num_completed)
            );
        }
        println!();

        println!(
            "  Average packet size:  request {}, response {}",
            safe_div(self.total_request_size, self.num_sent) as u64,
            safe_div(self.total_response_size, self.num_completed) as u64
        );
        let (run_s, run_us) = split_secs(run_time_us);
        println!("  Run time (s):         {}.{:06}", run_s, run_us);
        println!(
            "  Queries per second:   {:.6}",
            if run_time_us == 0 {
                0.0
            } else {
                self.num_completed as f64 / (run_time_us as f64 / MICROS_PER_SEC as f64)
            }
        );
        println!();

        let latency_avg = safe_div(self.latency_sum, self.num_completed) as u64;
        let latency_min = if self.num_completed == 0 {
            0
        } else {
            self.latency_min
        };
        let (avg_s, avg_us) = split_secs(latency_avg);
        let (min_s, min_us) = split_secs(latency_min);
        let (max_s, max_us) = split_secs(self.latency_max);
        println!(
            "  Average Latency (s):  {}.{:06} (min {}.{:06}, max {}.{:06})",
            avg_s, avg_us, min_s, min_us, max_s, max_us
        );
        if self.num_completed > 1 {
            println!(
                "  Latency StdDev (s):   {:.6}",
                stddev(self.latency_sum_squares, self.latency_sum, self.num_completed)
                    / MICROS_PER_SEC as f64
            );
        }
    }
}

/// Dump every latency sample, per worker, in insertion order.
pub fn print_latency_details(reports: &[WorkerReport]) {
    println!("  Latency details(thread={}):", reports.len());
    let mut pos = 0u64;
    for (i, report) in reports.iter().enumerate() {
        for latency in &report.receiver.samples {
            pos += 1;
            println!("thread={}, pos={}, latency={} us", i + 1, pos, latency);
        }
    }
    println!();
}
