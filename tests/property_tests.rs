//! Property-based tests for payload integrity, buffer slicing and the
//! transmit queue model.

use fastlane_driver::bypass::{self, KernelBypassConfig, KernelBypassDriver, VirtualSwitch};
use fastlane_driver::infud::{self, InfUdConfig, InfUdDriver, UdFabric};
use fastlane_driver::{Address, Buffer, Driver, QueueEstimator, ServiceLocator};
use proptest::prelude::*;

fn loopback_bypass() -> KernelBypassDriver {
    let config = KernelBypassConfig {
        frame_pool_size: 64,
        ring_size: 16,
        loopback_ring_size: 16,
        rx_pool_capacity: 16,
        ..Default::default()
    };
    KernelBypassDriver::new(None, &VirtualSwitch::new(1), config).unwrap()
}

/// Two drivers on ports 0 and 1 of one switch.
fn switched_bypass_pair() -> (KernelBypassDriver, KernelBypassDriver) {
    let switch = VirtualSwitch::new(2);
    let config = KernelBypassConfig {
        frame_pool_size: 64,
        ring_size: 16,
        loopback_ring_size: 16,
        rx_pool_capacity: 16,
        ..Default::default()
    };
    let open = |locator: &str| {
        let sl = ServiceLocator::parse(locator).unwrap();
        KernelBypassDriver::new(Some(&sl), &switch, config.clone()).unwrap()
    };
    (open("basic+dpdk:devport=0"), open("basic+dpdk:devport=1"))
}

fn loopback_infud() -> InfUdDriver {
    let config = InfUdConfig {
        rx_buffers: 16,
        ..Default::default()
    };
    InfUdDriver::new(None, &UdFabric::new(1), config).unwrap()
}

/// Send `header` + `body` to the driver itself and return what arrives.
fn echo(driver: &mut dyn Driver, me: &Address, header: &[u8], body: &Buffer) -> Vec<u8> {
    driver.send_packet(me, header, Some(body.iter()));
    let mut received = Vec::new();
    driver.receive_packets(1, &mut received);
    assert_eq!(received.len(), 1);
    received[0].payload().to_vec()
}

/// Build a buffer from `data`, split into chunks at `cuts`.
fn chunked(data: &[u8], cuts: &[usize]) -> Buffer {
    let mut points: Vec<usize> = cuts.iter().map(|c| c % (data.len() + 1)).collect();
    points.sort_unstable();
    let mut buf = Buffer::new();
    let mut start = 0;
    for p in points.into_iter().chain(std::iter::once(data.len())) {
        buf.append_copy(&data[start..p]);
        start = p;
    }
    buf
}

// ---------------------------------------------------------------------------
// Payload integrity
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_bypass_delivers_exact_bytes(
        header in proptest::collection::vec(any::<u8>(), 0..32),
        body in proptest::collection::vec(any::<u8>(), 0..1400),
        cuts in proptest::collection::vec(any::<usize>(), 0..4),
    ) {
        prop_assume!(header.len() + body.len() <= bypass::MAX_PACKET_SIZE as usize);
        let mut driver = loopback_bypass();
        let me = Address::Mac(driver.local_mac());

        let got = echo(&mut driver, &me, &header, &chunked(&body, &cuts));
        prop_assert_eq!(&got[..header.len()], &header[..]);
        prop_assert_eq!(&got[header.len()..], &body[..]);
        prop_assert_eq!(driver.buffers_in_use(), 0);
    }

    #[test]
    fn prop_bypass_delivers_exact_bytes_across_switch(
        header in proptest::collection::vec(any::<u8>(), 0..32),
        slack in 0usize..64,
        fill in any::<u8>(),
    ) {
        let (mut a, mut b) = switched_bypass_pair();
        let to = Address::Mac(b.local_mac());
        let body_len = bypass::MAX_PACKET_SIZE as usize - header.len() - slack;
        let body: Vec<u8> = (0..body_len).map(|i| fill.wrapping_add(i as u8)).collect();

        a.send_packet(&to, &header, Some(chunked(&body, &[body_len / 3]).iter()));
        let mut received = Vec::new();
        b.receive_packets(1, &mut received);
        prop_assert_eq!(received.len(), 1);
        let got = received[0].payload();
        prop_assert_eq!(got.len(), header.len() + body_len);
        prop_assert_eq!(&got[..header.len()], &header[..]);
        prop_assert_eq!(&got[header.len()..], &body[..]);
        prop_assert_eq!(received[0].sender(), &Address::Mac(a.local_mac()));
        prop_assert_eq!(a.stats().tx_dropped, 0);
        prop_assert_eq!(b.stats().rx_dropped, 0);
    }

    #[test]
    fn prop_infud_delivers_exact_bytes(
        header in proptest::collection::vec(any::<u8>(), 0..32),
        body in proptest::collection::vec(any::<u8>(), 0..1976),
        cuts in proptest::collection::vec(any::<usize>(), 0..4),
    ) {
        prop_assume!(header.len() + body.len() <= infud::MAX_PACKET_SIZE as usize);
        let mut driver = loopback_infud();
        let me = Address::QueuePair(driver.local_address());

        let got = echo(&mut driver, &me, &header, &chunked(&body, &cuts));
        prop_assert_eq!(got.len(), header.len() + body.len());
        prop_assert_eq!(&got[header.len()..], &body[..]);
    }

    #[test]
    fn prop_oversize_is_dropped(extra in 1usize..64) {
        let mut driver = loopback_bypass();
        let me = Address::Mac(driver.local_mac());
        let body = vec![0u8; bypass::MAX_PACKET_SIZE as usize + extra];

        driver.send_packet(&me, &body, None);
        let mut received = Vec::new();
        driver.receive_packets(4, &mut received);
        prop_assert!(received.is_empty());
        prop_assert_eq!(driver.stats().tx_dropped, 1);
    }
}

// ---------------------------------------------------------------------------
// Buffer slicing
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn prop_buffer_range_matches_flat_copy(
        data in proptest::collection::vec(any::<u8>(), 1..512),
        cuts in proptest::collection::vec(any::<usize>(), 0..8),
        offset in any::<usize>(),
        len in any::<usize>(),
    ) {
        let buf = chunked(&data, &cuts);
        prop_assert_eq!(buf.len(), data.len());
        prop_assert_eq!(buf.to_vec(), data.clone());

        let offset = offset % data.len();
        let len = len % (data.len() - offset + 1);
        let range = buf.get_range(offset, len).unwrap();
        prop_assert_eq!(&range[..], &data[offset..offset + len]);

        let iter = buf.iter_range(offset, len);
        prop_assert_eq!(iter.remaining(), len);
        let joined: Vec<u8> = iter.flat_map(|s| s.iter().copied()).collect();
        prop_assert_eq!(&joined[..], &data[offset..offset + len]);
    }

    #[test]
    fn prop_buffer_range_past_end_is_none(
        data in proptest::collection::vec(any::<u8>(), 0..64),
        past in 1usize..16,
    ) {
        let buf = chunked(&data, &[]);
        prop_assert!(buf.get_range(0, data.len() + past).is_none());
    }
}

// ---------------------------------------------------------------------------
// Queue estimator
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn prop_estimate_never_exceeds_bytes_queued(
        gbs in 1u32..100,
        sends in proptest::collection::vec((1u32..4096, 0u64..10_000), 1..32),
    ) {
        let mut est = QueueEstimator::new(gbs);
        let mut now = 0u64;
        let mut total = 0u64;
        for (bytes, gap) in sends {
            now += gap;
            est.packet_queued(bytes, now);
            total += u64::from(bytes);
            prop_assert!(u64::from(est.queue_size(now)) <= total);
        }
    }

    #[test]
    fn prop_estimate_drains_monotonically(
        gbs in 1u32..100,
        bytes in 1u32..1_000_000,
        steps in proptest::collection::vec(0u64..5_000, 1..32),
    ) {
        let mut est = QueueEstimator::new(gbs);
        est.packet_queued(bytes, 0);
        let mut now = 0u64;
        let mut last = est.queue_size(now);
        for step in steps {
            now += step;
            let size = est.queue_size(now);
            prop_assert!(size <= last);
            last = size;
        }
    }

    #[test]
    fn prop_stale_time_does_not_grow_estimate(
        bytes in 1u32..100_000,
        later in 1u64..1_000_000,
        earlier in 0u64..1_000_000,
    ) {
        let mut est = QueueEstimator::new(10);
        est.packet_queued(bytes, later);
        let at_send = est.queue_size(later);
        prop_assert_eq!(est.queue_size(earlier.min(later)), at_send);
    }
}
