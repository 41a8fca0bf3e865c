//! Monotonic nanosecond timestamps.
//!
//! Drivers take the current time as an argument (`transmit_queue_space(now)`)
//! so callers that already read the clock in their poll loop do not pay for
//! a second read, and tests can drive time explicitly.

use std::sync::OnceLock;
use std::time::Instant;

static ORIGIN: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds since the first call in this process.
pub fn now_nanos() -> u64 {
    let origin = ORIGIN.get_or_init(Instant::now);
    u64::try_from(origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
}
