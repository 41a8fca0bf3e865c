//! Burst-polled NIC ports and their frame memory.
//!
//! A kernel-bypass NIC is driven entirely from user space: the driver owns a
//! pool of fixed-size frames, hands frames to the port's transmit ring, and
//! pulls filled frames off its receive ring in bursts. A [`Frame`] goes back
//! to the pool it came from when it is dropped, wherever that happens.
//!
//! [`VirtualSwitch`] is a software [`NicDevice`]: each of its ports is an
//! Ethernet station that forwards frames by destination MAC to the other
//! ports' receive rings. It is what the driver runs on when no hardware is
//! attached, and what the tests use.

use crate::address::MacAddress;
use crate::error::{DriverError, DriverResult};
use crossbeam_queue::ArrayQueue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Ethernet header: destination MAC, source MAC, ethertype.
pub const ETHER_HEADER_LEN: usize = 14;

/// Ethertype carried by this driver's frames so shared NICs can filter them.
pub const ETHER_TYPE_FASTLANE: u16 = 0x88b5;

/// Largest Ethernet payload (standard MTU).
pub const ETHER_MAX_PAYLOAD: usize = 1500;

/// Size of one frame buffer.
pub const FRAME_SIZE: usize = 2048;

/// Write an Ethernet header at the start of `frame`.
pub fn write_ether_header(frame: &mut [u8], dst: MacAddress, src: MacAddress, ether_type: u16) {
    frame[0..6].copy_from_slice(&dst.octets());
    frame[6..12].copy_from_slice(&src.octets());
    frame[12..14].copy_from_slice(&ether_type.to_be_bytes());
}

/// Parsed Ethernet header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EtherHeader {
    /// Destination MAC
    pub dst: MacAddress,
    /// Source MAC
    pub src: MacAddress,
    /// Ethertype
    pub ether_type: u16,
}

impl EtherHeader {
    /// Parse the header at the start of `frame`, or `None` if it is short.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        let header = frame.get(..ETHER_HEADER_LEN)?;
        Some(Self {
            dst: MacAddress::from_slice(&header[0..6])?,
            src: MacAddress::from_slice(&header[6..12])?,
            ether_type: u16::from_be_bytes([header[12], header[13]]),
        })
    }
}

/// Preallocated frame memory shared by a driver and its port.
pub struct FramePool {
    free: ArrayQueue<Box<[u8]>>,
    frame_size: usize,
}

impl FramePool {
    /// Allocate `count` frames of `frame_size` bytes.
    pub fn new(count: usize, frame_size: usize) -> DriverResult<Arc<Self>> {
        if count == 0 || frame_size < ETHER_HEADER_LEN {
            return Err(DriverError::PoolCreation(format!(
                "cannot build frame pool of {count} x {frame_size} bytes"
            )));
        }
        let free = ArrayQueue::new(count);
        for _ in 0..count {
            let _ = free.push(vec![0u8; frame_size].into_boxed_slice());
        }
        Ok(Arc::new(Self { free, frame_size }))
    }

    /// Take an empty frame, or `None` if every frame is in flight.
    pub fn alloc(self: &Arc<Self>) -> Option<Frame> {
        let data = self.free.pop()?;
        Some(Frame {
            data: Some(data),
            len: 0,
            pool: Arc::clone(self),
        })
    }

    /// Frames ready to allocate.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Total frames.
    pub fn capacity(&self) -> usize {
        self.free.capacity()
    }

    /// Bytes per frame.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }
}

impl std::fmt::Debug for FramePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePool")
            .field("frame_size", &self.frame_size)
            .field("available", &self.available())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// One frame of NIC memory. Returns to its pool on drop.
pub struct Frame {
    data: Option<Box<[u8]>>,
    len: usize,
    pool: Arc<FramePool>,
}

impl Frame {
    /// Filled bytes.
    pub fn data(&self) -> &[u8] {
        self.data.as_deref().map(|d| &d[..self.len]).unwrap_or_default()
    }

    /// Filled length.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Grow the filled region by `n` bytes and return the new space, or
    /// `None` if the frame is too small.
    pub fn append(&mut self, n: usize) -> Option<&mut [u8]> {
        let data = self.data.as_deref_mut()?;
        let end = self.len.checked_add(n)?;
        if end > data.len() {
            return None;
        }
        let start = self.len;
        self.len = end;
        Some(&mut data[start..end])
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            let _ = self.pool.free.push(data);
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame").field("len", &self.len).finish()
    }
}

/// One port of a burst-polled NIC.
pub trait NicPort: Send {
    /// Port index on its device.
    fn port_id(&self) -> u8;

    /// Current hardware address.
    fn mac(&self) -> MacAddress;

    /// Override the hardware address.
    fn set_mac(&mut self, mac: MacAddress) -> DriverResult<()>;

    /// Whether the link is up.
    fn link_up(&self) -> bool;

    /// Set the largest Ethernet payload the port will carry.
    fn set_mtu(&mut self, mtu: usize) -> DriverResult<()>;

    /// Move up to `max` received frames into `out`. Returns how many.
    fn rx_burst(&mut self, max: usize, out: &mut Vec<Frame>) -> usize;

    /// Hand frames from the front of `frames` to the transmit ring. Frames
    /// the ring accepted are removed; the rest stay in `frames`. Returns how
    /// many were accepted.
    fn tx_burst(&mut self, frames: &mut Vec<Frame>) -> usize;
}

/// A NIC with one or more ports.
pub trait NicDevice: Send + Sync {
    /// Number of ports.
    fn port_count(&self) -> usize;

    /// Start port `port_id` with a receive ring of `ring_size` frames.
    fn open_port(&self, port_id: u8, ring_size: usize) -> DriverResult<Box<dyn NicPort>>;
}

struct SwitchPort {
    mac: MacAddress,
    link_up: AtomicBool,
    opened: AtomicBool,
}

struct SwitchInner {
    ports: Vec<SwitchPort>,
    /// Receive rings of opened ports, by station MAC
    stations: Mutex<HashMap<MacAddress, Arc<ArrayQueue<Frame>>>>,
    /// Frames with no station to deliver to, or whose station ring was full
    dropped: AtomicU64,
}

impl SwitchInner {
    fn stations(&self) -> std::sync::MutexGuard<'_, HashMap<MacAddress, Arc<ArrayQueue<Frame>>>> {
        self.stations.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Software Ethernet switch acting as a multi-port NIC.
///
/// Cloning yields another handle to the same switch.
#[derive(Clone)]
pub struct VirtualSwitch {
    inner: Arc<SwitchInner>,
}

impl VirtualSwitch {
    /// Create a switch with `port_count` ports, all with link up. Port `i`
    /// has MAC `02:00:00:00:00:<i+1>`.
    pub fn new(port_count: u8) -> Self {
        let ports = (0..port_count)
            .map(|i| SwitchPort {
                mac: MacAddress([0x02, 0, 0, 0, 0, i.wrapping_add(1)]),
                link_up: AtomicBool::new(true),
                opened: AtomicBool::new(false),
            })
            .collect();
        Self {
            inner: Arc::new(SwitchInner {
                ports,
                stations: Mutex::new(HashMap::new()),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Bring a port's link up or down.
    pub fn set_link(&self, port_id: u8, up: bool) {
        if let Some(port) = self.inner.ports.get(usize::from(port_id)) {
            port.link_up.store(up, Ordering::Release);
        }
    }

    /// Factory MAC of a port.
    pub fn port_mac(&self, port_id: u8) -> Option<MacAddress> {
        self.inner.ports.get(usize::from(port_id)).map(|p| p.mac)
    }

    /// Frames the switch could not deliver.
    pub fn dropped_frames(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for VirtualSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualSwitch")
            .field("ports", &self.inner.ports.len())
            .field("dropped", &self.dropped_frames())
            .finish()
    }
}

impl NicDevice for VirtualSwitch {
    fn port_count(&self) -> usize {
        self.inner.ports.len()
    }

    fn open_port(&self, port_id: u8, ring_size: usize) -> DriverResult<Box<dyn NicPort>> {
        let port = self
            .inner
            .ports
            .get(usize::from(port_id))
            .ok_or_else(|| {
                DriverError::NoDevice(format!(
                    "port {port_id} (switch has {} ports)",
                    self.inner.ports.len()
                ))
            })?;
        if ring_size == 0 {
            return Err(DriverError::InvalidConfig(
                "receive ring size must be nonzero".into(),
            ));
        }
        if port.opened.swap(true, Ordering::AcqRel) {
            return Err(DriverError::NoDevice(format!("port {port_id} already in use")));
        }

        let rx = Arc::new(ArrayQueue::new(ring_size));
        self.inner.stations().insert(port.mac, Arc::clone(&rx));
        Ok(Box::new(SoftPort {
            switch: Arc::clone(&self.inner),
            port_id,
            mac: port.mac,
            mtu: ETHER_MAX_PAYLOAD,
            rx,
        }))
    }
}

/// A port of a [`VirtualSwitch`].
struct SoftPort {
    switch: Arc<SwitchInner>,
    port_id: u8,
    mac: MacAddress,
    mtu: usize,
    rx: Arc<ArrayQueue<Frame>>,
}

impl SoftPort {
    fn slot(&self) -> &SwitchPort {
        &self.switch.ports[usize::from(self.port_id)]
    }
}

impl NicPort for SoftPort {
    fn port_id(&self) -> u8 {
        self.port_id
    }

    fn mac(&self) -> MacAddress {
        self.mac
    }

    fn set_mac(&mut self, mac: MacAddress) -> DriverResult<()> {
        let mut stations = self.switch.stations();
        if mac != self.mac && stations.contains_key(&mac) {
            return Err(DriverError::InvalidConfig(format!(
                "MAC {mac} already in use on this switch"
            )));
        }
        stations.remove(&self.mac);
        stations.insert(mac, Arc::clone(&self.rx));
        self.mac = mac;
        Ok(())
    }

    fn link_up(&self) -> bool {
        self.slot().link_up.load(Ordering::Acquire)
    }

    fn set_mtu(&mut self, mtu: usize) -> DriverResult<()> {
        if mtu == 0 || mtu + ETHER_HEADER_LEN > FRAME_SIZE {
            return Err(DriverError::InvalidConfig(format!("unsupported MTU {mtu}")));
        }
        self.mtu = mtu;
        Ok(())
    }

    fn rx_burst(&mut self, max: usize, out: &mut Vec<Frame>) -> usize {
        let mut count = 0;
        while count < max {
            match self.rx.pop() {
                Some(frame) => {
                    out.push(frame);
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    fn tx_burst(&mut self, frames: &mut Vec<Frame>) -> usize {
        if !self.link_up() {
            return 0;
        }
        let sent = frames.len();
        let stations = self.switch.stations();
        for frame in frames.drain(..) {
            let deliver = frame.len() <= self.mtu + ETHER_HEADER_LEN;
            let station = EtherHeader::parse(frame.data())
                .filter(|_| deliver)
                .and_then(|h| stations.get(&h.dst));
            // Undeliverable frames fall off the wire and return to their pool
            let delivered = station.is_some_and(|rx| rx.push(frame).is_ok());
            if !delivered {
                self.switch.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        sent
    }
}

impl Drop for SoftPort {
    fn drop(&mut self) {
        let mut stations = self.switch.stations();
        if stations
            .get(&self.mac)
            .is_some_and(|rx| Arc::ptr_eq(rx, &self.rx))
        {
            stations.remove(&self.mac);
        }
        drop(stations);
        self.slot().opened.store(false, Ordering::Release);
    }
}
