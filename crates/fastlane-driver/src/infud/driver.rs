//! RDMA unreliable-datagram driver.
//!
//! Receive buffers are posted to the queue pair up front and come back as
//! completions. Releasing a received packet re-posts its buffer rather than
//! freeing it, since the fabric only delivers into armed buffers. When every
//! buffer is on loan, arrivals are lost on the fabric.

use super::fabric::{Completion, GRH_SIZE, QueuePair, SendOutcome, UD_MTU, UdFabric};
use crate::address::{Address, QueuePairAddress};
use crate::buffer::BufferIter;
use crate::clock;
use crate::driver::{Driver, MemoryRegistrar, gather_into, request_len};
use crate::error::{DriverError, DriverResult, LocatorResult};
use crate::estimator::{QueueEstimator, max_transmit_queue_size};
use crate::factory::DriverType;
use crate::locator::ServiceLocator;
use crate::received::{PacketBuf, PacketRecycler, Received};
use crate::stats::{DriverStats, DriverStatsSnapshot};
use serde::Deserialize;
use std::ops::Range;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

/// Largest caller packet: one fabric MTU less the routing header.
pub const MAX_PACKET_SIZE: u32 = (UD_MTU - GRH_SIZE) as u32;

/// RDMA UD driver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct InfUdConfig {
    /// Receive buffers kept posted to the queue pair
    pub rx_buffers: usize,
    /// Most packets returned by one `receive_packets` call
    pub max_batch: usize,
    /// Link speed used when the locator has no `gbs` option
    pub bandwidth_gbps: u32,
}

impl Default for InfUdConfig {
    fn default() -> Self {
        Self {
            rx_buffers: 256,
            max_batch: 32,
            bandwidth_gbps: 24,
        }
    }
}

impl InfUdConfig {
    /// Check that every size is usable.
    pub fn validate(&self) -> DriverResult<()> {
        if self.rx_buffers == 0 || self.max_batch == 0 {
            return Err(DriverError::InvalidConfig(
                "rx_buffers and max_batch must be nonzero".into(),
            ));
        }
        Ok(())
    }
}

/// Puts released buffers back on the receive queue.
struct Reposter {
    qp: Arc<QueuePair>,
    stats: Arc<DriverStats>,
}

impl PacketRecycler for Reposter {
    fn recycle(&self, buf: PacketBuf) {
        match self.qp.repost(buf) {
            Ok(()) => self.stats.record_release(),
            Err(e) => tracing::error!("{} on queue pair {}", e, self.qp.address()),
        }
    }
}

/// Address ranges registered with the adapter.
#[derive(Debug, Default)]
struct MemoryRegistry {
    regions: Mutex<Vec<Range<usize>>>,
}

impl MemoryRegistry {
    fn contains(&self, bytes: &[u8]) -> bool {
        let start = bytes.as_ptr() as usize;
        let end = start + bytes.len();
        self.regions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|r| r.start <= start && end <= r.end)
    }
}

impl MemoryRegistrar for MemoryRegistry {
    fn register(&self, region: &[u8]) {
        let start = region.as_ptr() as usize;
        tracing::debug!("Registering {} bytes at {:#x}", region.len(), start);
        self.regions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(start..start + region.len());
    }
}

/// Driver for an RDMA unreliable-datagram queue pair.
pub struct InfUdDriver {
    fabric: UdFabric,
    qp: Arc<QueuePair>,
    recycler: Arc<Reposter>,
    /// The fabric copies at post time, so one staging buffer serves every send
    tx_buf: PacketBuf,
    completions: Vec<Completion>,
    estimator: QueueEstimator,
    bandwidth_gbps: u32,
    max_transmit_queue_size: u32,
    max_batch: usize,
    locator: OnceLock<String>,
    registry: Arc<MemoryRegistry>,
    stats: Arc<DriverStats>,
}

impl InfUdDriver {
    /// Create a queue pair on `fabric` and arm its receive buffers.
    ///
    /// Recognized options: `devport` (adapter index, default 0) and `gbs`.
    pub fn new(
        locator: Option<&ServiceLocator>,
        fabric: &UdFabric,
        config: InfUdConfig,
    ) -> DriverResult<Self> {
        config.validate()?;

        let (device, gbs) = match locator {
            Some(sl) => (
                sl.option_or_none::<u16>("devport")?.unwrap_or(0),
                sl.option_or_none::<u32>("gbs")?
                    .unwrap_or(config.bandwidth_gbps),
            ),
            None => (0, config.bandwidth_gbps),
        };

        if fabric.device_count() == 0 {
            return Err(DriverError::NoDevice("no RDMA devices found".into()));
        }
        let qp = fabric.create_queue_pair(device)?;
        for _ in 0..config.rx_buffers {
            qp.post_receive(PacketBuf::new(UD_MTU));
        }

        let stats = Arc::new(DriverStats::new());
        let max_transmit_queue_size = max_transmit_queue_size(gbs, MAX_PACKET_SIZE);
        tracing::info!(
            "InfUd driver on queue pair {}, bandwidth: {} Gbits/sec, maxTransmitQueueSize: {} bytes",
            qp.address(),
            gbs,
            max_transmit_queue_size
        );

        Ok(Self {
            fabric: fabric.clone(),
            recycler: Arc::new(Reposter {
                qp: Arc::clone(&qp),
                stats: Arc::clone(&stats),
            }),
            qp,
            tx_buf: PacketBuf::new(UD_MTU),
            completions: Vec::with_capacity(config.max_batch),
            estimator: QueueEstimator::new(gbs),
            bandwidth_gbps: gbs,
            max_transmit_queue_size,
            max_batch: config.max_batch,
            locator: OnceLock::new(),
            registry: Arc::default(),
            stats,
        })
    }

    /// This driver's fabric address.
    pub fn local_address(&self) -> QueuePairAddress {
        self.qp.address()
    }

    /// Configured link speed.
    pub fn bandwidth_gbps(&self) -> u32 {
        self.bandwidth_gbps
    }

    /// Ceiling used by `transmit_queue_space`.
    pub fn max_transmit_queue_size(&self) -> u32 {
        self.max_transmit_queue_size
    }

    /// Receive buffers held by callers.
    pub fn buffers_in_use(&self) -> usize {
        self.qp.loaned()
    }

    /// Receive buffers armed on the queue pair.
    pub fn buffers_posted(&self) -> usize {
        self.qp.posted()
    }

    /// Whether `bytes` lies inside a region passed to `register_memory`.
    pub fn is_registered(&self, bytes: &[u8]) -> bool {
        self.registry.contains(bytes)
    }

    /// Parse a queue pair locator. Requires `lid` and `qpn`.
    pub fn parse_address(locator: &ServiceLocator) -> LocatorResult<Address> {
        Ok(Address::QueuePair(QueuePairAddress {
            lid: locator.option("lid")?,
            qpn: locator.option("qpn")?,
        }))
    }

    fn drop_send(&self, recipient: &Address, reason: &str) {
        self.stats.record_tx_dropped();
        tracing::warn!("Dropping packet to {}: {}", recipient, reason);
    }
}

impl Driver for InfUdDriver {
    fn max_packet_size(&self) -> u32 {
        MAX_PACKET_SIZE
    }

    fn transmit_queue_space(&mut self, now: u64) -> i64 {
        i64::from(self.max_transmit_queue_size) - i64::from(self.estimator.queue_size(now))
    }

    fn new_address(&self, locator: &ServiceLocator) -> LocatorResult<Address> {
        Self::parse_address(locator)
    }

    fn receive_packets(&mut self, max_packets: usize, received: &mut Vec<Received>) {
        let max = max_packets.min(self.max_batch);
        if max == 0 {
            return;
        }
        self.qp.poll_completions(max, &mut self.completions);

        let recycler: Arc<dyn PacketRecycler> = self.recycler.clone();
        let mut bytes = 0u64;
        let count = self.completions.len() as u64;
        for completion in self.completions.drain(..) {
            bytes += completion.buf.len() as u64;
            received.push(Received::new(
                Address::QueuePair(completion.src),
                completion.buf,
                Arc::clone(&recycler),
            ));
        }
        self.stats.record_rx(count, bytes);
    }

    fn send_packet(&mut self, recipient: &Address, header: &[u8], payload: Option<BufferIter<'_>>) {
        let total = request_len(header, payload.as_ref());
        if total > MAX_PACKET_SIZE as usize {
            self.drop_send(
                recipient,
                &format!("{total} bytes exceeds maximum of {MAX_PACKET_SIZE}"),
            );
            return;
        }
        let Address::QueuePair(dst) = *recipient else {
            self.drop_send(recipient, "not a queue pair address");
            return;
        };

        let n = gather_into(self.tx_buf.storage_mut(), header, payload);
        self.tx_buf.set_payload(0, n);
        match self
            .fabric
            .post_send(self.qp.address(), dst, self.tx_buf.payload())
        {
            SendOutcome::Delivered => {}
            // Unreliable datagrams: the send itself succeeded
            outcome => tracing::debug!("Datagram to {} lost on fabric: {:?}", dst, outcome),
        }

        self.stats.record_tx(total as u64);
        self.estimator
            .packet_queued(total as u32, clock::now_nanos());
    }

    fn memory_registrar(&self) -> Arc<dyn MemoryRegistrar> {
        self.registry.clone()
    }

    fn register_memory(&self, region: &[u8]) {
        self.registry.register(region);
    }

    fn service_locator(&self) -> String {
        self.locator
            .get_or_init(|| {
                let addr = self.qp.address();
                format!("basic+infud:lid={},qpn={}", addr.lid, addr.qpn)
            })
            .clone()
    }

    fn driver_type(&self) -> DriverType {
        DriverType::InfUd
    }

    fn stats(&self) -> DriverStatsSnapshot {
        let mut snapshot = self.stats.snapshot();
        snapshot.rx_dropped += self.qp.dropped();
        snapshot
    }
}

impl Drop for InfUdDriver {
    fn drop(&mut self) {
        self.fabric.destroy_queue_pair(self.qp.address());
        let loaned = self.qp.loaned();
        if loaned != 0 {
            tracing::error!("InfUd driver deleted with {} packets still in use", loaned);
        }
    }
}
