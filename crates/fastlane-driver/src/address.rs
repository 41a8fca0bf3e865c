//! Fabric-specific endpoint addresses.
//!
//! Callers treat an [`Address`] as opaque: they clone it, print it, and hand
//! it back to the driver that created it. Each backend only accepts its own
//! variant.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use thiserror::Error;

/// A 48-bit Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// The all-zero address, used in locators to mean "use the NIC's MAC".
    pub const NULL: Self = Self([0; 6]);

    /// Whether every octet is zero.
    pub fn is_null(&self) -> bool {
        self.0 == [0; 6]
    }

    /// Raw octets.
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Read a MAC from the first six bytes of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let octets: [u8; 6] = bytes.get(..6)?.try_into().ok()?;
        Some(Self(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

/// Error returned when a MAC string does not parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid MAC address")]
pub struct ParseMacError;

impl FromStr for MacAddress {
    type Err = ParseMacError;

    /// Accepts `aa:bb:cc:dd:ee:ff` or `aa-bb-cc-dd-ee-ff`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for octet in &mut octets {
            let part = parts.next().ok_or(ParseMacError)?;
            if part.len() != 2 {
                return Err(ParseMacError);
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| ParseMacError)?;
        }
        if parts.next().is_some() {
            return Err(ParseMacError);
        }
        Ok(Self(octets))
    }
}

/// RDMA unreliable-datagram endpoint: local identifier plus queue pair number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueuePairAddress {
    /// Subnet-local port identifier
    pub lid: u16,
    /// Queue pair number
    pub qpn: u32,
}

impl fmt::Display for QueuePairAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.lid, self.qpn)
    }
}

/// Endpoint address for any supported fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    /// IP/port pair (datagram sockets)
    Ip(SocketAddr),
    /// Ethernet hardware address (kernel-bypass NICs)
    Mac(MacAddress),
    /// Queue pair identifier (RDMA unreliable datagram)
    QueuePair(QueuePairAddress),
}

impl Address {
    /// Short name of the address family, for log messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ip(_) => "ip",
            Self::Mac(_) => "mac",
            Self::QueuePair(_) => "queue-pair",
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(addr) => write!(f, "{addr}"),
            Self::Mac(mac) => write!(f, "{mac}"),
            Self::QueuePair(qp) => write!(f, "{qp}"),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self::Ip(addr)
    }
}

impl From<MacAddress> for Address {
    fn from(mac: MacAddress) -> Self {
        Self::Mac(mac)
    }
}

impl From<QueuePairAddress> for Address {
    fn from(qp: QueuePairAddress) -> Self {
        Self::QueuePair(qp)
    }
}
