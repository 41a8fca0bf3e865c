//! Per-driver packet counters.
//!
//! Failures on the send and receive paths are never reported to the caller;
//! these counters (and the logs) are the only place they become visible.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters shared between the poll loop and worker threads.
#[derive(Debug, Default)]
pub struct DriverStats {
    /// Packets handed to the caller by `receive_packets`
    rx_packets: AtomicU64,
    /// Payload bytes handed to the caller
    rx_bytes: AtomicU64,
    /// Packets queued for transmission
    tx_packets: AtomicU64,
    /// Bytes queued for transmission (header + payload)
    tx_bytes: AtomicU64,
    /// Sends dropped (oversize, no descriptor, fabric error)
    tx_dropped: AtomicU64,
    /// Arrivals skipped because no receive buffer was free
    rx_dropped: AtomicU64,
    /// Packets that went through the in-process loopback path
    loopback_packets: AtomicU64,
    /// Receive buffers returned to the driver
    buffers_released: AtomicU64,
}

impl DriverStats {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Record received packets
    pub fn record_rx(&self, count: u64, bytes: u64) {
        self.rx_packets.fetch_add(count, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a queued packet
    pub fn record_tx(&self, bytes: u64) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a dropped send
    pub fn record_tx_dropped(&self) {
        self.tx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dropped arrival
    pub fn record_rx_dropped(&self, count: u64) {
        self.rx_dropped.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a loopback delivery
    pub fn record_loopback(&self) {
        self.loopback_packets.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a returned receive buffer
    pub fn record_release(&self) {
        self.buffers_released.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of current statistics
    pub fn snapshot(&self) -> DriverStatsSnapshot {
        DriverStatsSnapshot {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            tx_dropped: self.tx_dropped.load(Ordering::Relaxed),
            rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
            loopback_packets: self.loopback_packets.load(Ordering::Relaxed),
            buffers_released: self.buffers_released.load(Ordering::Relaxed),
        }
    }

    /// Reset all statistics
    pub fn reset(&self) {
        self.rx_packets.store(0, Ordering::Relaxed);
        self.rx_bytes.store(0, Ordering::Relaxed);
        self.tx_packets.store(0, Ordering::Relaxed);
        self.tx_bytes.store(0, Ordering::Relaxed);
        self.tx_dropped.store(0, Ordering::Relaxed);
        self.rx_dropped.store(0, Ordering::Relaxed);
        self.loopback_packets.store(0, Ordering::Relaxed);
        self.buffers_released.store(0, Ordering::Relaxed);
    }
}

/// Non-atomic copy of [`DriverStats`] for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStatsSnapshot {
    /// Packets received
    pub rx_packets: u64,
    /// Bytes received
    pub rx_bytes: u64,
    /// Packets queued for transmission
    pub tx_packets: u64,
    /// Bytes queued for transmission
    pub tx_bytes: u64,
    /// Dropped sends
    pub tx_dropped: u64,
    /// Dropped arrivals
    pub rx_dropped: u64,
    /// Loopback deliveries
    pub loopback_packets: u64,
    /// Receive buffers returned
    pub buffers_released: u64,
}

impl DriverStatsSnapshot {
    /// Fraction of attempted sends that were dropped
    pub fn tx_drop_rate(&self) -> f64 {
        let total = self.tx_packets + self.tx_dropped;
        if total > 0 {
            self.tx_dropped as f64 / total as f64
        } else {
            0.0
        }
    }
}
