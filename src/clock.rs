//! Monotonic microsecond clock
//!
//! All engine timestamps are microseconds since an arbitrary monotonic
//! epoch (the first call in the process). Using one anchored `Instant`
//! keeps timestamp math to plain `u64` arithmetic on the hot path.

use std::sync::OnceLock;
use std::time::Instant;

/// Microseconds per second.
pub const MICROS_PER_SEC: u64 = 1_000_000;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Current time in microseconds since the process-local epoch.
pub fn now_us() -> u64 {
    let epoch = *EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_micros() as u64
}

/// Split a microsecond value into whole seconds and the fractional
/// microseconds, for `<sec>.<usec>` formatting.
pub fn split_secs(us: u64) -> (u64, u64) {
    (us / MICROS_PER_SEC, us % MICROS_PER_SEC)
}
