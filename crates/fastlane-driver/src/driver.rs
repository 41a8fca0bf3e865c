//! The contract every fabric backend implements.
//!
//! A driver is a passive library object. One polling context owns it
//! mutably and calls [`Driver::receive_packets`] and [`Driver::send_packet`];
//! no locking happens on those paths. Worker contexts never touch the driver
//! itself to give memory back: they drop or release the [`StolenPacket`]
//! handles they hold, which carry their own route home. Memory registration
//! from workers goes through a [`MemoryRegistrar`] handle for the same
//! reason.

use crate::address::Address;
use crate::buffer::BufferIter;
use crate::error::LocatorResult;
use crate::factory::DriverType;
use crate::locator::ServiceLocator;
use crate::received::{Received, StolenPacket};
use crate::stats::DriverStatsSnapshot;
use std::sync::Arc;

/// Transmit queue space reported by drivers that do not throttle.
pub const DEFAULT_TRANSMIT_QUEUE_SPACE: i64 = 10_000_000;

/// Registers memory with a driver's fabric.
///
/// Handles are shared with worker threads and may be used while the poll
/// loop holds the driver mutably.
pub trait MemoryRegistrar: Send + Sync {
    /// Make `region` directly addressable by the fabric.
    fn register(&self, region: &[u8]);
}

/// Registrar for fabrics that only transmit from driver-owned memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRegistration;

impl MemoryRegistrar for NoRegistration {
    fn register(&self, _region: &[u8]) {}
}

/// A datagram transport over one network fabric.
pub trait Driver: Send {
    /// Largest packet, in bytes, that [`send_packet`](Self::send_packet)
    /// accepts (caller header plus payload). Fabric headers the driver adds
    /// are not counted.
    fn max_packet_size(&self) -> u32;

    /// Bytes that can be queued right now without letting the NIC queue
    /// grow without bound. Negative once a caller has over-sent.
    ///
    /// `now` is a [`clock::now_nanos`](crate::clock::now_nanos) timestamp.
    fn transmit_queue_space(&mut self, _now: u64) -> i64 {
        DEFAULT_TRANSMIT_QUEUE_SPACE
    }

    /// Build an address for this fabric from locator options.
    ///
    /// Fails with [`LocatorError::NoSuchKey`](crate::LocatorError::NoSuchKey)
    /// when a required option is missing and
    /// [`LocatorError::BadValue`](crate::LocatorError::BadValue) when one is
    /// malformed.
    fn new_address(&self, locator: &ServiceLocator) -> LocatorResult<Address>;

    /// Append up to `max_packets` arrived packets to `received`, oldest
    /// first. Never blocks; appends nothing if nothing has arrived.
    fn receive_packets(&mut self, max_packets: usize, received: &mut Vec<Received>);

    /// Send `header` followed by `payload` to `recipient`.
    ///
    /// Both are copied before this returns. Failures are logged and the
    /// packet is dropped.
    fn send_packet(&mut self, recipient: &Address, header: &[u8], payload: Option<BufferIter<'_>>);

    /// Return a stolen packet. Equivalent to dropping it; safe from any
    /// thread.
    fn release(&self, packet: StolenPacket) {
        packet.release();
    }

    /// Handle worker threads use to register memory concurrently with
    /// the poll loop.
    fn memory_registrar(&self) -> Arc<dyn MemoryRegistrar> {
        Arc::new(NoRegistration)
    }

    /// Make `region` directly addressable by the fabric so it can be
    /// transmitted without copying. Does nothing unless the fabric supports
    /// it.
    fn register_memory(&self, region: &[u8]) {
        self.memory_registrar().register(region);
    }

    /// Locator string peers can use to reach this driver.
    fn service_locator(&self) -> String;

    /// Which backend this is.
    fn driver_type(&self) -> DriverType;

    /// Current packet counters.
    fn stats(&self) -> DriverStatsSnapshot;

    /// Log the packet counters.
    fn dump_stats(&self) {
        let s = self.stats();
        tracing::info!(
            "{} driver stats: rx {} pkts/{} bytes, tx {} pkts/{} bytes, \
             tx dropped {}, rx dropped {}, loopback {}, released {}",
            self.driver_type(),
            s.rx_packets,
            s.rx_bytes,
            s.tx_packets,
            s.tx_bytes,
            s.tx_dropped,
            s.rx_dropped,
            s.loopback_packets,
            s.buffers_released
        );
    }
}

/// Total bytes of a send request, header plus payload.
pub(crate) fn request_len(header: &[u8], payload: Option<&BufferIter<'_>>) -> usize {
    header.len() + payload.map_or(0, BufferIter::remaining)
}

/// Copy `header` then every payload segment into `dst`, which must be at
/// least [`request_len`] bytes. Returns the bytes written.
pub(crate) fn gather_into(dst: &mut [u8], header: &[u8], payload: Option<BufferIter<'_>>) -> usize {
    dst[..header.len()].copy_from_slice(header);
    let mut written = header.len();
    for segment in payload.into_iter().flatten() {
        dst[written..written + segment.len()].copy_from_slice(segment);
        written += segment.len();
    }
    written
}
