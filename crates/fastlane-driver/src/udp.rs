//! Plain UDP socket driver (`basic+udp`).
//!
//! The functional baseline: works anywhere, needs no special hardware, and
//! keeps no packet pool. Every received datagram lands in its own heap
//! buffer, which is simply freed when the caller is done with it. There is
//! no transmit throttling; the kernel's socket buffer absorbs bursts.

use crate::address::Address;
use crate::buffer::BufferIter;
use crate::driver::{Driver, gather_into, request_len};
use crate::error::{DriverError, DriverResult, LocatorError, LocatorResult};
use crate::factory::DriverType;
use crate::locator::ServiceLocator;
use crate::received::{PacketBuf, PacketRecycler, Received};
use crate::stats::{DriverStats, DriverStatsSnapshot};
use serde::Deserialize;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Largest caller packet; keeps datagrams inside a 1500-byte Ethernet MTU.
pub const MAX_PACKET_SIZE: u32 = 1400;

/// Receive buffer size, large enough to notice oversize datagrams.
const RECV_BUFFER_LEN: usize = 2048;

/// UDP driver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    /// Address to bind when the locator has no `host` option
    pub host: String,
    /// Port to bind when the locator has no `port` option (0 = ephemeral)
    pub port: u16,
    /// Kernel receive buffer size (SO_RCVBUF)
    pub recv_buffer_size: usize,
    /// Kernel send buffer size (SO_SNDBUF)
    pub send_buffer_size: usize,
    /// Most packets returned by one `receive_packets` call
    pub max_batch: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            recv_buffer_size: 4 * 1024 * 1024, // 4 MiB - covers more BDP at high throughput
            send_buffer_size: 4 * 1024 * 1024, // 4 MiB - reduces drops under burst conditions
            max_batch: 32,
        }
    }
}

impl UdpConfig {
    /// Check that every size is usable.
    pub fn validate(&self) -> DriverResult<()> {
        if self.recv_buffer_size == 0 || self.send_buffer_size == 0 || self.max_batch == 0 {
            return Err(DriverError::InvalidConfig(
                "socket buffer sizes and max_batch must be nonzero".into(),
            ));
        }
        if self.host.is_empty() {
            return Err(DriverError::InvalidConfig("host must not be empty".into()));
        }
        Ok(())
    }
}

/// Tracks heap buffers handed to callers.
struct HeapBuffers {
    outstanding: AtomicUsize,
    stats: Arc<DriverStats>,
}

impl PacketRecycler for HeapBuffers {
    fn recycle(&self, buf: PacketBuf) {
        drop(buf);
        match self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(_) => self.stats.record_release(),
            Err(_) => tracing::error!("UDP receive buffer released more often than received"),
        }
    }
}

fn resolve(host: &str, port: u16) -> Option<SocketAddr> {
    (host, port).to_socket_addrs().ok()?.next()
}

/// Driver for a non-blocking UDP socket.
pub struct UdpDriver {
    socket: UdpSocket,
    local_addr: SocketAddr,
    static_locator: Option<String>,
    locator: OnceLock<String>,
    buffers: Arc<HeapBuffers>,
    spare: Option<PacketBuf>,
    tx_buf: Vec<u8>,
    max_batch: usize,
    stats: Arc<DriverStats>,
}

impl UdpDriver {
    /// Bind a socket as described by `locator` (`host`, `port`), falling
    /// back to `config` for absent options.
    pub fn new(locator: Option<&ServiceLocator>, config: UdpConfig) -> DriverResult<Self> {
        config.validate()?;

        let (host, port) = match locator {
            Some(sl) => (
                sl.option_or_none::<String>("host")?
                    .unwrap_or_else(|| config.host.clone()),
                sl.option_or_none::<u16>("port")?.unwrap_or(config.port),
            ),
            None => (config.host.clone(), config.port),
        };

        let addr = match (resolve(&host, port), locator) {
            (Some(addr), _) => addr,
            (None, Some(sl)) => {
                return Err(LocatorError::BadValue {
                    key: "host".into(),
                    value: host,
                    locator: sl.original_string().to_string(),
                }
                .into());
            }
            (None, None) => {
                return Err(DriverError::InvalidConfig(format!(
                    "cannot resolve host '{host}'"
                )));
            }
        };

        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        socket.set_recv_buffer_size(config.recv_buffer_size)?;
        socket.set_send_buffer_size(config.send_buffer_size)?;
        socket.bind(&addr.into())?;
        let socket: UdpSocket = socket.into();
        let local_addr = socket.local_addr()?;

        // An explicit port is a static address; an ephemeral one is only
        // known after binding
        let static_locator = locator
            .filter(|_| port != 0)
            .map(|sl| sl.original_string().to_string());

        tracing::info!("UDP driver bound to {}", local_addr);

        let stats = Arc::new(DriverStats::new());
        Ok(Self {
            socket,
            local_addr,
            static_locator,
            locator: OnceLock::new(),
            buffers: Arc::new(HeapBuffers {
                outstanding: AtomicUsize::new(0),
                stats: Arc::clone(&stats),
            }),
            spare: None,
            tx_buf: Vec::with_capacity(MAX_PACKET_SIZE as usize),
            max_batch: config.max_batch,
            stats,
        })
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receive buffers held by callers.
    pub fn buffers_in_use(&self) -> usize {
        self.buffers.outstanding.load(Ordering::Acquire)
    }

    /// Parse an IP locator. Requires `host` and `port`.
    pub fn parse_address(locator: &ServiceLocator) -> LocatorResult<Address> {
        let host: String = locator.option("host")?;
        let port: u16 = locator.option("port")?;
        resolve(&host, port)
            .map(Address::Ip)
            .ok_or_else(|| LocatorError::BadValue {
                key: "host".into(),
                value: host,
                locator: locator.original_string().to_string(),
            })
    }

    fn drop_send(&self, recipient: &Address, reason: &str) {
        self.stats.record_tx_dropped();
        tracing::warn!("Dropping packet to {}: {}", recipient, reason);
    }
}

impl Driver for UdpDriver {
    fn max_packet_size(&self) -> u32 {
        MAX_PACKET_SIZE
    }

    fn new_address(&self, locator: &ServiceLocator) -> LocatorResult<Address> {
        Self::parse_address(locator)
    }

    fn receive_packets(&mut self, max_packets: usize, received: &mut Vec<Received>) {
        let max = max_packets.min(self.max_batch);
        let recycler: Arc<dyn PacketRecycler> = self.buffers.clone();
        let mut count = 0u64;
        let mut bytes = 0u64;

        while (count as usize) < max {
            let mut buf = self
                .spare
                .take()
                .unwrap_or_else(|| PacketBuf::new(RECV_BUFFER_LEN));
            match self.socket.recv_from(buf.storage_mut()) {
                Ok((n, from)) if n <= MAX_PACKET_SIZE as usize => {
                    buf.set_payload(0, n);
                    self.buffers.outstanding.fetch_add(1, Ordering::AcqRel);
                    received.push(Received::new(
                        Address::Ip(from),
                        buf,
                        Arc::clone(&recycler),
                    ));
                    count += 1;
                    bytes += n as u64;
                }
                Ok((n, from)) => {
                    self.stats.record_rx_dropped(1);
                    tracing::debug!("Ignoring oversize {}-byte datagram from {}", n, from);
                    self.spare = Some(buf);
                }
                Err(e) => {
                    if e.kind() != io::ErrorKind::WouldBlock {
                        tracing::warn!("UDP receive failed: {}", e);
                    }
                    self.spare = Some(buf);
                    break;
                }
            }
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
        let Address::Ip(dst) = *recipient else {
            self.drop_send(recipient, "not an IP address");
            return;
        };

        self.tx_buf.resize(total, 0);
        gather_into(&mut self.tx_buf, header, payload);
        match self.socket.send_to(&self.tx_buf, dst) {
            Ok(_) => self.stats.record_tx(total as u64),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.drop_send(recipient, "socket send buffer full");
            }
            Err(e) => self.drop_send(recipient, &e.to_string()),
        }
    }

    fn service_locator(&self) -> String {
        if let Some(locator) = &self.static_locator {
            return locator.clone();
        }
        self.locator
            .get_or_init(|| {
                format!(
                    "basic+udp:host={},port={}",
                    self.local_addr.ip(),
                    self.local_addr.port()
                )
            })
            .clone()
    }

    fn driver_type(&self) -> DriverType {
        DriverType::Udp
    }

    fn stats(&self) -> DriverStatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for UdpDriver {
    fn drop(&mut self) {
        let in_use = self.buffers_in_use();
        if in_use != 0 {
            tracing::error!("UDP driver deleted with {} packets still in use", in_use);
        }
    }
}
