//! dnsbench - A Multi-Threaded DNS Load Generator
//!
//! dnsbench reads query descriptions from an input file (or stdin), sends
//! them to a target resolver as fast as the configured limits allow, and
//! reports latency and outcome statistics. It speaks DNS over UDP, TCP and
//! TLS and is intended for benchmarking resolvers and authoritative
//! servers.
//!
//! # Architecture
//!
//! dnsbench consists of several key components:
//!
//! - **Engine** ([`engine`]): the multi-threaded send/receive core. Each
//!   worker owns a sender thread and a receiver thread sharing a query
//!   table (one slot per DNS transaction id) and a bank of client sockets.
//!   The coordinator splits global limits across workers, opens the start
//!   barrier, watches for the deadline or an interrupt, and aggregates the
//!   per-worker statistics.
//! - **Transport Layer** ([`net`]): non-blocking UDP, TCP and TLS client
//!   sockets behind a common [`net::Transport`] trait, plus the poll(2)
//!   plumbing used for readiness checks and cross-thread wakeups.
//! - **DNS Builder** ([`dns`]): turns a textual query descriptor into a
//!   wire-format query message, with optional EDNS0, DNSSEC OK and TSIG.
//! - **Input Source** ([`input`]): a shared, internally serialized reader
//!   of query descriptors with pass counting and rewind.
//! - **Statistics** ([`stats`]): per-worker counters and latency samples,
//!   cross-worker summation and the final report.

pub mod clock;
pub mod config;
pub mod dns;
pub mod engine;
pub mod input;
pub mod logging;
pub mod net;
pub mod stats;
