//! Transmit queue estimation.
//!
//! NICs rarely expose how many bytes are still waiting in their transmit
//! queue, and asking is expensive when it is possible at all. Instead each
//! driver feeds every queued packet into a [`QueueEstimator`], which models
//! the queue draining at the link bandwidth:
//!
//! ```text
//! queue(now) = max(0, queue(last) - (now - last) * bandwidth)
//! ```
//!
//! Drivers compare the estimate against a ceiling derived from
//! [`max_transmit_queue_size`] to answer `transmit_queue_space`.

/// Longest time, in nanoseconds, that a full transmit queue should take to
/// drain. Bounds how far ahead of the wire a transport may run.
pub const MAX_DRAIN_TIME_NS: u32 = 2000;

/// Ceiling on the transmit queue for a link of `bandwidth_gbps`.
///
/// This is the number of bytes the link drains in [`MAX_DRAIN_TIME_NS`],
/// but never less than two maximum-size packets so the next packet can be
/// prepared while the current one is on the wire.
pub fn max_transmit_queue_size(bandwidth_gbps: u32, max_packet_size: u32) -> u32 {
    let drain = (f64::from(bandwidth_gbps) * f64::from(MAX_DRAIN_TIME_NS) / 8.0) as u32;
    drain.max(max_packet_size.saturating_mul(2))
}

/// Estimates the bytes still queued in a NIC's transmit queue.
#[derive(Debug, Clone)]
pub struct QueueEstimator {
    /// Drain rate in bytes per nanosecond
    bandwidth: f64,
    /// Estimated backlog as of `current_time`
    queue_size: f64,
    /// Time of the last update, in nanoseconds
    current_time: u64,
}

impl QueueEstimator {
    /// Create an estimator for a link of `bandwidth_gbps`.
    pub fn new(bandwidth_gbps: u32) -> Self {
        let mut estimator = Self {
            bandwidth: 0.0,
            queue_size: 0.0,
            current_time: 0,
        };
        estimator.set_bandwidth(bandwidth_gbps);
        estimator
    }

    /// Change the modeled link speed.
    pub fn set_bandwidth(&mut self, bandwidth_gbps: u32) {
        // Gbit/s == bits/ns
        self.bandwidth = f64::from(bandwidth_gbps) / 8.0;
    }

    /// Drain rate in bytes per nanosecond.
    pub fn bandwidth(&self) -> f64 {
        self.bandwidth
    }

    /// Record that `bytes` were handed to the NIC at time `now`.
    pub fn packet_queued(&mut self, bytes: u32, now: u64) {
        self.drain_to(now);
        self.queue_size += f64::from(bytes);
    }

    /// Estimated backlog at `now`, in bytes.
    ///
    /// Time that runs backwards (callers with stale timestamps) is treated
    /// as no time passing, so the estimate never grows without a send.
    pub fn queue_size(&mut self, now: u64) -> u32 {
        self.drain_to(now);
        self.queue_size.ceil() as u32
    }

    fn drain_to(&mut self, now: u64) {
        if now > self.current_time {
            let elapsed = (now - self.current_time) as f64;
            self.queue_size = (self.queue_size - elapsed * self.bandwidth).max(0.0);
            self.current_time = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_max_transmit_queue_size() {
        assert_eq!(max_transmit_queue_size(40, 2008), 10_000);
        assert_eq!(max_transmit_queue_size(1, 2008), 4016);
        assert_eq!(max_transmit_queue_size(10, 1486), 2972);
        assert_eq!(max_transmit_queue_size(100, 1486), 25_000);
    }

    #[test]
    fn test_bandwidth_conversion() {
        let est = QueueEstimator::new(40);
        assert_eq!(est.bandwidth(), 5.0);
    }

    #[test]
    fn test_queue_drains_over_time() {
        // 8 Gbit/s == 1 byte/ns
        let mut est = QueueEstimator::new(8);
        est.packet_queued(1000, 100);
        assert_eq!(est.queue_size(100), 1000);
        assert_eq!(est.queue_size(400), 700);
        assert_eq!(est.queue_size(1100), 0);
        assert_eq!(est.queue_size(5000), 0);
    }

    #[test]
    fn test_backlog_accumulates() {
        let mut est = QueueEstimator::new(8);
        est.packet_queued(500, 0);
        est.packet_queued(500, 100);
        assert_eq!(est.queue_size(100), 900);
    }

    #[test]
    fn test_time_going_backwards_is_ignored() {
        let mut est = QueueEstimator::new(8);
        est.packet_queued(1000, 1000);
        assert_eq!(est.queue_size(500), 1000);
        assert_eq!(est.queue_size(1200), 800);
    }

    #[test]
    fn test_zero_bandwidth_never_drains() {
        let mut est = QueueEstimator::new(0);
        est.packet_queued(64, 0);
        assert_eq!(est.queue_size(1_000_000), 64);
    }

    proptest! {
        #[test]
        fn prop_ceiling_never_below_two_packets(gbs in 0u32..400, max_packet in 1u32..10_000) {
            let ceiling = max_transmit_queue_size(gbs, max_packet);
            prop_assert!(ceiling >= 2 * max_packet);
            prop_assert!(ceiling >= gbs * MAX_DRAIN_TIME_NS / 8);
        }

        #[test]
        fn prop_queueing_never_shrinks_estimate(
            gbs in 1u32..100,
            first in 1u32..100_000,
            second in 1u32..100_000,
            gap in 0u64..100_000,
        ) {
            let mut est = QueueEstimator::new(gbs);
            est.packet_queued(first, 0);
            let before = est.queue_size(gap);
            est.packet_queued(second, gap);
            let after = est.queue_size(gap);
            prop_assert!(after >= before);
            prop_assert!(after <= before + second);
        }
    }
}
