//! Kernel-bypass driver over a burst-polled NIC port.
//!
//! Received frames are copied once into a [`PacketPool`] slot and the frame
//! goes straight back to the NIC. Self-addressed sends never reach the port:
//! they go into an in-process loopback ring that the next receive poll
//! drains alongside the hardware ring.

use super::nic::{
    ETHER_HEADER_LEN, ETHER_MAX_PAYLOAD, ETHER_TYPE_FASTLANE, EtherHeader, FRAME_SIZE, Frame,
    FramePool, NicDevice, NicPort, write_ether_header,
};
use crate::address::{Address, MacAddress};
use crate::buffer::BufferIter;
use crate::clock;
use crate::driver::{Driver, gather_into, request_len};
use crate::error::{DriverError, DriverResult, LocatorResult};
use crate::estimator::{QueueEstimator, max_transmit_queue_size};
use crate::factory::DriverType;
use crate::locator::ServiceLocator;
use crate::pool::PacketPool;
use crate::received::{PacketRecycler, Received};
use crate::stats::{DriverStats, DriverStatsSnapshot};
use crossbeam_queue::ArrayQueue;
use serde::Deserialize;
use std::sync::Arc;

/// Largest caller packet: one Ethernet payload.
pub const MAX_PACKET_SIZE: u32 = (ETHER_MAX_PAYLOAD - ETHER_HEADER_LEN) as u32;

/// Kernel-bypass driver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct KernelBypassConfig {
    /// Frames in the NIC frame pool
    pub frame_pool_size: usize,
    /// Descriptors in the port's receive ring
    pub ring_size: usize,
    /// Frames the loopback ring can hold
    pub loopback_ring_size: usize,
    /// Receive slots that can be out on loan at once
    pub rx_pool_capacity: usize,
    /// Most packets returned by one `receive_packets` call
    pub max_batch: usize,
    /// Link speed used when the locator has no `gbs` option
    pub bandwidth_gbps: u32,
}

impl Default for KernelBypassConfig {
    fn default() -> Self {
        Self {
            frame_pool_size: 8192,
            ring_size: 256,
            loopback_ring_size: 4096,
            rx_pool_capacity: 4096,
            max_batch: 32,
            bandwidth_gbps: 10,
        }
    }
}

impl KernelBypassConfig {
    /// Check that every size is usable.
    pub fn validate(&self) -> DriverResult<()> {
        let sizes = [
            ("frame_pool_size", self.frame_pool_size),
            ("ring_size", self.ring_size),
            ("loopback_ring_size", self.loopback_ring_size),
            ("rx_pool_capacity", self.rx_pool_capacity),
            ("max_batch", self.max_batch),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(DriverError::InvalidConfig(format!("{name} must be nonzero")));
        }
        if self.frame_pool_size < self.ring_size {
            return Err(DriverError::InvalidConfig(format!(
                "frame_pool_size ({}) smaller than ring_size ({})",
                self.frame_pool_size, self.ring_size
            )));
        }
        Ok(())
    }
}

/// Driver for a NIC port polled directly from user space.
pub struct KernelBypassDriver {
    port: Box<dyn NicPort>,
    local_mac: MacAddress,
    frames: Arc<FramePool>,
    loopback: ArrayQueue<Frame>,
    rx_pool: Arc<PacketPool>,
    recycler: Arc<dyn PacketRecycler>,
    estimator: QueueEstimator,
    max_transmit_queue_size: u32,
    locator: String,
    max_batch: usize,
    stats: Arc<DriverStats>,
    rx_scratch: Vec<Frame>,
    tx_scratch: Vec<Frame>,
}

impl KernelBypassDriver {
    /// Open a port on `nic` as described by `locator`.
    ///
    /// Recognized options: `mac` (all zeros or absent means the port's own
    /// MAC), `devport` (default 0) and `gbs`.
    pub fn new(
        locator: Option<&ServiceLocator>,
        nic: &dyn NicDevice,
        config: KernelBypassConfig,
    ) -> DriverResult<Self> {
        config.validate()?;

        let (mac, port_id, gbs) = match locator {
            Some(sl) => (
                sl.option_or_none::<MacAddress>("mac")?,
                sl.option_or_none::<u8>("devport")?.unwrap_or(0),
                sl.option_or_none::<u32>("gbs")?
                    .unwrap_or(config.bandwidth_gbps),
            ),
            None => (None, 0, config.bandwidth_gbps),
        };

        if nic.port_count() == 0 {
            return Err(DriverError::NoDevice("NIC has no ports".into()));
        }
        let mut port = nic.open_port(port_id, config.ring_size)?;
        if !port.link_up() {
            return Err(DriverError::LinkDown(format!("port {port_id}")));
        }
        port.set_mtu(ETHER_MAX_PAYLOAD)?;

        let (local_mac, locator) = match (mac, locator) {
            (Some(mac), Some(sl)) if !mac.is_null() => {
                port.set_mac(mac)?;
                (mac, sl.original_string().to_string())
            }
            _ => {
                let mac = port.mac();
                (mac, format!("basic+dpdk:mac={mac},devport={port_id}"))
            }
        };

        let frames = FramePool::new(config.frame_pool_size, FRAME_SIZE)?;
        let stats = Arc::new(DriverStats::new());
        let rx_pool = Arc::new(
            PacketPool::new(MAX_PACKET_SIZE as usize, config.rx_pool_capacity)?
                .with_stats(Arc::clone(&stats)),
        );
        let max_transmit_queue_size = max_transmit_queue_size(gbs, MAX_PACKET_SIZE);

        tracing::info!(
            "Kernel-bypass driver locator: {}, bandwidth: {} Gbits/sec, maxTransmitQueueSize: {} bytes",
            locator,
            gbs,
            max_transmit_queue_size
        );

        Ok(Self {
            port,
            local_mac,
            frames,
            loopback: ArrayQueue::new(config.loopback_ring_size),
            recycler: rx_pool.clone(),
            rx_pool,
            estimator: QueueEstimator::new(gbs),
            max_transmit_queue_size,
            locator,
            max_batch: config.max_batch,
            stats,
            rx_scratch: Vec::with_capacity(config.max_batch),
            tx_scratch: Vec::with_capacity(1),
        })
    }

    /// MAC this driver sends from and receives on.
    pub fn local_mac(&self) -> MacAddress {
        self.local_mac
    }

    /// Receive slots currently held by callers.
    pub fn buffers_in_use(&self) -> usize {
        self.rx_pool.in_use()
    }

    /// Parse a MAC address locator. Requires the `mac` option.
    pub fn parse_address(locator: &ServiceLocator) -> LocatorResult<Address> {
        Ok(Address::Mac(locator.option::<MacAddress>("mac")?))
    }

    fn drop_send(&self, recipient: &Address, reason: &str) {
        self.stats.record_tx_dropped();
        tracing::warn!("Dropping packet to {}: {}", recipient, reason);
    }
}

impl Driver for KernelBypassDriver {
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
        // Leave frames on the rings rather than pull more than we can hold
        let budget = max_packets
            .min(self.max_batch)
            .min(self.rx_pool.available());
        if budget == 0 {
            if max_packets > 0 {
                tracing::trace!(
                    "Receive pool exhausted ({} in use); skipping poll",
                    self.rx_pool.in_use()
                );
            }
            return;
        }

        let mut frames = std::mem::take(&mut self.rx_scratch);
        let incoming = self.port.rx_burst(budget.div_ceil(2), &mut frames);
        let mut looped = 0;
        while incoming + looped < budget {
            match self.loopback.pop() {
                Some(frame) => {
                    frames.push(frame);
                    looped += 1;
                }
                None => break,
            }
        }

        let mut count = 0u64;
        let mut bytes = 0u64;
        for frame in frames.drain(..) {
            let header = match EtherHeader::parse(frame.data()) {
                Some(h) if h.ether_type == ETHER_TYPE_FASTLANE => h,
                _ => {
                    tracing::debug!("Ignoring {}-byte frame that is not ours", frame.len());
                    continue;
                }
            };
            let len = frame.len() - ETHER_HEADER_LEN;
            if len > MAX_PACKET_SIZE as usize {
                self.stats.record_rx_dropped(1);
                tracing::warn!(
                    "Dropping {}-byte packet from {}: exceeds maximum of {}",
                    len,
                    header.src,
                    MAX_PACKET_SIZE
                );
                continue;
            }
            let Some(mut buf) = self.rx_pool.acquire() else {
                self.stats.record_rx_dropped(1);
                tracing::warn!("No receive buffer free; dropping packet from {}", header.src);
                continue;
            };
            let n = buf.fill(0, &frame.data()[ETHER_HEADER_LEN..]);
            count += 1;
            bytes += n as u64;
            received.push(Received::new(
                Address::Mac(header.src),
                buf,
                Arc::clone(&self.recycler),
            ));
            // `frame` drops here and goes back to its pool
        }
        self.rx_scratch = frames;
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
        let Address::Mac(dst) = *recipient else {
            self.drop_send(recipient, "not a MAC address");
            return;
        };
        let Some(mut frame) = self.frames.alloc() else {
            self.drop_send(recipient, "failed to allocate a packet buffer");
            return;
        };
        let Some(data) = frame.append(ETHER_HEADER_LEN + total) else {
            self.drop_send(recipient, "frame append failed");
            return;
        };
        write_ether_header(data, dst, self.local_mac, ETHER_TYPE_FASTLANE);
        gather_into(&mut data[ETHER_HEADER_LEN..], header, payload);

        if dst == self.local_mac {
            if self.loopback.push(frame).is_err() {
                self.drop_send(recipient, "loopback ring full");
                return;
            }
            self.stats.record_loopback();
        } else {
            self.tx_scratch.push(frame);
            if self.port.tx_burst(&mut self.tx_scratch) == 0 {
                self.tx_scratch.clear();
                self.drop_send(recipient, "transmit ring rejected frame");
                return;
            }
        }

        self.stats.record_tx(total as u64);
        self.estimator
            .packet_queued(total as u32, clock::now_nanos());
    }

    fn service_locator(&self) -> String {
        tracing::debug!("Locator string: {}", self.locator);
        self.locator.clone()
    }

    fn driver_type(&self) -> DriverType {
        DriverType::KernelBypass
    }

    fn stats(&self) -> DriverStatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for KernelBypassDriver {
    fn drop(&mut self) {
        let in_use = self.rx_pool.in_use();
        if in_use != 0 {
            tracing::error!(
                "Kernel-bypass driver deleted with {} packets still in use",
                in_use
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::error::LocatorError;
    use crate::bypass::nic::VirtualSwitch;

    fn driver(switch: &VirtualSwitch, locator: &str) -> KernelBypassDriver {
        let sl = ServiceLocator::parse(locator).unwrap();
        KernelBypassDriver::new(Some(&sl), switch, KernelBypassConfig::default()).unwrap()
    }

    fn send(d: &mut KernelBypassDriver, to: &Address, header: &[u8], body: &[u8]) {
        let mut buf = Buffer::new();
        buf.append_copy(body);
        d.send_packet(to, header, Some(buf.iter()));
    }

    #[test]
    fn test_config_validation() {
        assert!(KernelBypassConfig::default().validate().is_ok());
        let cfg = KernelBypassConfig {
            max_batch: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(DriverError::InvalidConfig(_))));
        let cfg = KernelBypassConfig {
            frame_pool_size: 16,
            ring_size: 256,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_null_mac_rewrites_locator() {
        let switch = VirtualSwitch::new(2);
        let d = driver(&switch, "basic+dpdk:mac=00:00:00:00:00:00,devport=1");
        assert_eq!(d.local_mac(), switch.port_mac(1).unwrap());
        assert_eq!(
            d.service_locator(),
            "basic+dpdk:mac=02:00:00:00:00:02,devport=1"
        );
    }

    #[test]
    fn test_explicit_mac_keeps_locator() {
        let switch = VirtualSwitch::new(1);
        let locator = "basic+dpdk:mac=02:aa:bb:cc:dd:ee,devport=0";
        let d = driver(&switch, locator);
        assert_eq!(d.service_locator(), locator);
        assert_eq!(d.local_mac().to_string(), "02:aa:bb:cc:dd:ee");
    }

    #[test]
    fn test_construction_failures() {
        let switch = VirtualSwitch::new(1);
        let cfg = KernelBypassConfig::default;

        let sl = ServiceLocator::parse("basic+dpdk:devport=4").unwrap();
        assert!(matches!(
            KernelBypassDriver::new(Some(&sl), &switch, cfg()),
            Err(DriverError::NoDevice(_))
        ));

        switch.set_link(0, false);
        assert!(matches!(
            KernelBypassDriver::new(None, &switch, cfg()),
            Err(DriverError::LinkDown(_))
        ));

        let sl = ServiceLocator::parse("basic+dpdk:gbs=fast").unwrap();
        assert!(matches!(
            KernelBypassDriver::new(Some(&sl), &switch, cfg()),
            Err(DriverError::Locator(LocatorError::BadValue { .. }))
        ));
    }

    #[test]
    fn test_loopback_delivery() {
        let switch = VirtualSwitch::new(1);
        let mut d = driver(&switch, "basic+dpdk:");
        let me = Address::Mac(d.local_mac());
        send(&mut d, &me, b"header:", b"This is a sample message");

        let mut rx = Vec::new();
        d.receive_packets(10, &mut rx);
        assert_eq!(rx.len(), 1);
        assert_eq!(rx[0].payload(), b"header:This is a sample message");
        assert_eq!(rx[0].sender(), &me);
        assert_eq!(switch.dropped_frames(), 0);
        assert_eq!(d.stats().loopback_packets, 1);
    }

    #[test]
    fn test_oversize_and_wrong_family_dropped() {
        let switch = VirtualSwitch::new(1);
        let mut d = driver(&switch, "basic+dpdk:");
        let me = Address::Mac(d.local_mac());
        let big = vec![0u8; MAX_PACKET_SIZE as usize];
        send(&mut d, &me, b"h", &big);

        let ip = Address::Ip("127.0.0.1:1".parse().unwrap());
        d.send_packet(&ip, b"h", None);

        let stats = d.stats();
        assert_eq!(stats.tx_dropped, 2);
        assert_eq!(stats.tx_packets, 0);
        let mut rx = Vec::new();
        d.receive_packets(10, &mut rx);
        assert!(rx.is_empty());
    }

    #[test]
    fn test_full_mtu_frame_dropped_not_truncated() {
        let switch = VirtualSwitch::new(2);
        let mut d = driver(&switch, "basic+dpdk:");
        let mut raw = switch.open_port(1, 8).unwrap();
        let pool = FramePool::new(2, FRAME_SIZE).unwrap();

        let mut frames = Vec::new();
        for body_len in [ETHER_MAX_PAYLOAD, MAX_PACKET_SIZE as usize] {
            let mut frame = pool.alloc().unwrap();
            let bytes = frame.append(ETHER_HEADER_LEN + body_len).unwrap();
            write_ether_header(bytes, d.local_mac(), raw.mac(), ETHER_TYPE_FASTLANE);
            frames.push(frame);
        }
        assert_eq!(raw.tx_burst(&mut frames), 2);
        assert_eq!(switch.dropped_frames(), 0);

        let mut rx = Vec::new();
        d.receive_packets(10, &mut rx);
        assert_eq!(rx.len(), 1);
        assert_eq!(rx[0].len(), MAX_PACKET_SIZE as usize);
        assert_eq!(d.stats().rx_dropped, 1);
        assert_eq!(d.buffers_in_use(), 1);
    }

    #[test]
    fn test_batch_cap() {
        let switch = VirtualSwitch::new(1);
        let mut d = driver(&switch, "basic+dpdk:");
        let me = Address::Mac(d.local_mac());
        for _ in 0..40 {
            d.send_packet(&me, b"x", None);
        }
        let mut rx = Vec::new();
        d.receive_packets(100, &mut rx);
        assert_eq!(rx.len(), 32);
        rx.clear();
        d.receive_packets(100, &mut rx);
        assert_eq!(rx.len(), 8);
    }

    #[test]
    fn test_pool_exhaustion_skips_poll() {
        let switch = VirtualSwitch::new(1);
        let sl = ServiceLocator::parse("basic+dpdk:").unwrap();
        let cfg = KernelBypassConfig {
            rx_pool_capacity: 2,
            ..Default::default()
        };
        let mut d = KernelBypassDriver::new(Some(&sl), &switch, cfg).unwrap();
        let me = Address::Mac(d.local_mac());
        for i in 0..3u8 {
            d.send_packet(&me, &[i], None);
        }

        let mut held = Vec::new();
        d.receive_packets(10, &mut held);
        assert_eq!(held.len(), 2);
        assert_eq!(d.buffers_in_use(), 2);

        let mut more = Vec::new();
        d.receive_packets(10, &mut more);
        assert!(more.is_empty());

        held.pop();
        d.receive_packets(10, &mut more);
        assert_eq!(more.len(), 1);
        assert_eq!(more[0].payload(), &[2]);
        assert_eq!(d.stats().rx_dropped, 0);
    }

    #[test]
    fn test_transmit_queue_space() {
        let switch = VirtualSwitch::new(1);
        let mut d = driver(&switch, "basic+dpdk:gbs=40");
        assert_eq!(d.transmit_queue_space(0), 10_000);
        let me = Address::Mac(d.local_mac());
        d.send_packet(&me, &[0u8; 1000], None);
        assert!(d.transmit_queue_space(clock::now_nanos()) <= 10_000);
        drop(d);

        // Port 0 is free again once the first driver is gone
        let mut d = driver(&switch, "basic+dpdk:devport=0,gbs=1");
        assert_eq!(
            d.transmit_queue_space(0),
            i64::from(2 * MAX_PACKET_SIZE)
        );
    }

    #[test]
    fn test_new_address() {
        let switch = VirtualSwitch::new(1);
        let d = driver(&switch, "basic+dpdk:");
        let sl = ServiceLocator::parse("basic+dpdk:mac=02:00:00:00:00:07").unwrap();
        assert_eq!(
            d.new_address(&sl).unwrap(),
            Address::Mac(MacAddress([2, 0, 0, 0, 0, 7]))
        );

        let sl = ServiceLocator::parse("basic+dpdk:devport=0").unwrap();
        assert!(matches!(
            d.new_address(&sl),
            Err(LocatorError::NoSuchKey { .. })
        ));
        let sl = ServiceLocator::parse("basic+dpdk:mac=nope").unwrap();
        assert!(matches!(
            d.new_address(&sl),
            Err(LocatorError::BadValue { .. })
        ));
    }
}
