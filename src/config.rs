//! Run configuration
//!
//! The configuration is built entirely from command-line flags by the
//! `dnsbench` binary, validated once before any worker starts, and then
//! shared read-only across all threads. This module also implements the
//! rules that split the global limits (clients, outstanding queries, QPS)
//! across worker threads.

use std::net::SocketAddr;

use thiserror::Error;

use crate::dns::{EdnsOption, TsigKey};
use crate::net::Mode;

/// Default configuration constants
pub mod defaults {
    /// Default server to query
    pub const SERVER_NAME: &str = "127.0.0.1";

    /// Default DNS port for UDP and TCP
    pub const DNS_PORT: u16 = 53;

    /// Default DNS-over-TLS port
    pub const DNS_TLS_PORT: u16 = 853;

    /// Default global limit on outstanding queries
    pub const MAX_OUTSTANDING: u32 = 100;

    /// Default per-query timeout in seconds
    pub const TIMEOUT_SECS: f64 = 5.0;

    /// Hard cap on client sockets per worker
    pub const MAX_SOCKETS_PER_WORKER: u32 = 256;

    /// Per-worker latency sample buffer capacity.
    ///
    /// The buffer is reserved up front so the receiver never reallocates
    /// on the hot path; samples past capacity are silently dropped.
    pub const MAX_LATENCY_SAMPLES: usize = 100_000_000;

    /// Default log level
    pub const fn default_log_level() -> &'static str {
        "warn"
    }
}

/// Address family restriction for server resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Any,
    Inet,
    Inet6,
}

impl std::str::FromStr for Family {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "any" => Ok(Family::Any),
            "inet" => Ok(Family::Inet),
            "inet6" => Ok(Family::Inet6),
            _ => Err(ConfigError::InvalidValue(format!(
                "invalid family '{}' (expected any, inet or inet6)",
                s
            ))),
        }
    }
}

/// Immutable run configuration, shared by reference with every worker.
#[derive(Debug, Clone)]
pub struct Config {
    /// Transport mode
    pub mode: Mode,
    /// Resolved server address
    pub server_addr: SocketAddr,
    /// Server name as given on the command line (used for TLS SNI)
    pub server_name: String,
    /// Local address to bind, if any
    pub local_addr: Option<std::net::IpAddr>,
    /// Base local port; socket k of the run binds `local_port + k` when
    /// non-zero
    pub local_port: u16,
    /// Total client sockets across all workers
    pub clients: u32,
    /// Worker thread count (each worker runs a sender and a receiver)
    pub threads: u32,
    /// Maximum passes over the input (0 = unlimited)
    pub max_passes: u32,
    /// Total run time limit in microseconds (0 = unbounded)
    pub time_limit_us: u64,
    /// Per-query timeout in microseconds
    pub timeout_us: u64,
    /// Socket send/receive buffer size in kilobytes (0 = OS default)
    pub bufsize_kb: u32,
    /// Append an EDNS0 OPT record
    pub edns: bool,
    /// Set the DNSSEC OK bit (implies EDNS)
    pub dnssec: bool,
    /// TSIG key for signing requests
    pub tsig: Option<TsigKey>,
    /// Single EDNS option to attach (implies EDNS)
    pub edns_option: Option<EdnsOption>,
    /// Global limit on outstanding queries
    pub max_outstanding: u32,
    /// Global QPS ceiling (0 = unlimited)
    pub max_qps: u32,
    /// Interval statistics period in microseconds (0 = off)
    pub stats_interval_us: u64,
    /// Report each query on stdout
    pub verbose: bool,
}

/// Per-worker share of the global limits.
#[derive(Debug, Clone, Copy)]
pub struct WorkerLimits {
    pub max_outstanding: u32,
    pub max_qps: u32,
    pub nsocks: u32,
    /// Index of this worker's first socket in the run-wide numbering,
    /// used for local port assignment.
    pub socket_offset: u32,
}

impl Config {
    /// Validate the configuration. Called once before any worker starts;
    /// a failure here is fatal.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.clients == 0 {
            return Err(ConfigError::InvalidValue(
                "number of clients must be at least 1".to_string(),
            ));
        }
        if self.threads == 0 {
            return Err(ConfigError::InvalidValue(
                "number of threads must be at least 1".to_string(),
            ));
        }
        if self.max_outstanding == 0 {
            return Err(ConfigError::InvalidValue(
                "maximum outstanding queries must be at least 1".to_string(),
            ));
        }
        if self.timeout_us == 0 {
            return Err(ConfigError::InvalidValue(
                "query timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Reduce the thread count so that every worker gets a usable share.
    ///
    /// If we ran more threads than max QPS, some workers would have a QPS
    /// share of zero and be unlimited; more threads than clients would
    /// leave workers without a socket.
    pub fn apply_thread_caps(&mut self) {
        if self.max_qps > 0 && self.threads > self.max_qps {
            self.threads = self.max_qps;
        }
        if self.threads > self.clients {
            self.threads = self.clients;
        }
    }

    /// Compute worker `offset`'s share of the global limits.
    pub fn worker_limits(&self, offset: u32) -> WorkerLimits {
        let mut max_outstanding = share(self.max_outstanding, self.threads, offset);
        let max_qps = share(self.max_qps, self.threads, offset);
        let mut nsocks = share(self.clients, self.threads, offset);

        if max_outstanding > crate::engine::NQIDS as u32 {
            max_outstanding = crate::engine::NQIDS as u32;
        }
        if nsocks > defaults::MAX_SOCKETS_PER_WORKER {
            nsocks = defaults::MAX_SOCKETS_PER_WORKER;
        }

        let socket_offset: u32 = (0..offset).map(|i| self.worker_nsocks(i)).sum();

        WorkerLimits {
            max_outstanding,
            max_qps,
            nsocks,
            socket_offset,
        }
    }

    fn worker_nsocks(&self, offset: u32) -> u32 {
        share(self.clients, self.threads, offset).min(defaults::MAX_SOCKETS_PER_WORKER)
    }

    /// Sizing hint for the per-worker latency sample buffer: the full
    /// tunable, unless the run is bounded tightly enough to know fewer
    /// samples can ever be collected.
    pub fn latency_sample_capacity(&self) -> usize {
        let cap = defaults::MAX_LATENCY_SAMPLES;
        if self.max_qps > 0 && self.time_limit_us > 0 {
            let bound = (self.max_qps as u64)
                .saturating_mul(self.time_limit_us / crate::clock::MICROS_PER_SEC + 1)
                as usize;
            return bound.min(cap);
        }
        cap
    }
}

/// Split `total` across `nworkers` workers: an even share, plus one extra
/// for the first `total % nworkers` workers.
pub fn share(total: u32, nworkers: u32, offset: u32) -> u32 {
    let base = total / nworkers;
    if offset < total % nworkers {
        base + 1
    } else {
        base
    }
}

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    InvalidValue(String),

    #[error("unable to resolve server '{0}'")]
    Resolve(String),

    #[error("cannot open input: {0}")]
    Input(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
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

    #[test]
    fn test_share_even_and_remainder() {
        // 10 across 3 workers: 4, 3, 3
        assert_eq!(share(10, 3, 0), 4);
        assert_eq!(share(10, 3, 1), 3);
        assert_eq!(share(10, 3, 2), 3);
        // exact split
        assert_eq!(share(8, 4, 0), 2);
        assert_eq!(share(8, 4, 3), 2);
        // fewer than workers
        assert_eq!(share(2, 4, 0), 1);
        assert_eq!(share(2, 4, 1), 1);
        assert_eq!(share(2, 4, 2), 0);
    }

    #[test]
    fn test_thread_caps() {
        let mut config = test_config();
        config.threads = 8;
        config.clients = 4;
        config.max_qps = 6;
        config.apply_thread_caps();
        // first capped to max_qps (6), then to clients (4)
        assert_eq!(config.threads, 4);
    }

    #[test]
    fn test_worker_limits_socket_offsets() {
        let mut config = test_config();
        config.clients = 5;
        config.threads = 2;
        config.max_outstanding = 101;
        let w0 = config.worker_limits(0);
        let w1 = config.worker_limits(1);
        assert_eq!(w0.nsocks, 3);
        assert_eq!(w1.nsocks, 2);
        assert_eq!(w0.socket_offset, 0);
        assert_eq!(w1.socket_offset, 3);
        assert_eq!(w0.max_outstanding + w1.max_outstanding, 101);
    }

    #[test]
    fn test_worker_limits_caps() {
        let mut config = test_config();
        config.clients = 1000;
        config.threads = 1;
        config.max_outstanding = 1 << 20;
        let w = config.worker_limits(0);
        assert_eq!(w.nsocks, defaults::MAX_SOCKETS_PER_WORKER);
        assert_eq!(w.max_outstanding, crate::engine::NQIDS as u32);
    }

    #[test]
    fn test_validation() {
        let mut config = test_config();
        assert!(config.validate().is_ok());

        config.clients = 0;
        assert!(config.validate().is_err());
        config.clients = 1;

        config.timeout_us = 0;
        assert!(config.validate().is_err());
    }
}
