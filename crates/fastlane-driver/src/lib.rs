//! # Fastlane Driver
//!
//! Packet-level transport for the Fastlane storage system.
//!
//! This crate provides:
//! - The [`Driver`] trait: one datagram send/receive contract for every fabric
//! - Zero-copy receive handoff ([`Received`], [`StolenPacket`]) and splicing
//!   into message [`Buffer`]s
//! - A bandwidth model ([`QueueEstimator`]) for transmit throttling
//! - A lock-free fixed-capacity receive [`PacketPool`]
//! - Backends: plain UDP sockets, kernel-bypass NIC polling, and RDMA
//!   unreliable datagrams
//! - A [`DriverFactory`] that builds backends from service locators
//!
//! ```
//! use fastlane_driver::{Buffer, Driver, DriverFactory, FabricContext, ServiceLocator};
//! use fastlane_driver::bypass::VirtualSwitch;
//! use std::sync::Arc;
//!
//! let ctx = FabricContext::new().with_nic(Arc::new(VirtualSwitch::new(1)));
//! let sl = ServiceLocator::parse("basic+dpdk:devport=0").unwrap();
//! let mut driver = DriverFactory::create(&sl, &ctx).unwrap();
//!
//! let me = driver
//!     .new_address(&ServiceLocator::parse(&driver.service_locator()).unwrap())
//!     .unwrap();
//! let mut body = Buffer::new();
//! body.append_copy(b"world");
//! driver.send_packet(&me, b"hello ", Some(body.iter()));
//!
//! let mut received = Vec::new();
//! driver.receive_packets(8, &mut received);
//! assert_eq!(received[0].payload(), b"hello world");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core abstractions
pub mod address;
pub mod buffer;
pub mod driver;
pub mod error;
pub mod locator;
pub mod received;

// Transmit throttling and receive memory
pub mod clock;
pub mod estimator;
pub mod pool;
pub mod stats;

// Backends
pub mod bypass;
pub mod factory;
pub mod infud;
pub mod udp;

pub use address::{Address, MacAddress, QueuePairAddress};
pub use buffer::{Buffer, BufferIter, Chunk, PayloadChunk};
pub use driver::{DEFAULT_TRANSMIT_QUEUE_SPACE, Driver, MemoryRegistrar, NoRegistration};
pub use error::{DriverError, DriverResult, LocatorError, LocatorResult, PoolError};
pub use estimator::{MAX_DRAIN_TIME_NS, QueueEstimator, max_transmit_queue_size};
pub use factory::{DriverFactory, DriverFactoryConfig, DriverType, FabricContext};
pub use locator::ServiceLocator;
pub use pool::PacketPool;
pub use received::{PacketBuf, PacketRecycler, Received, StolenPacket};
pub use stats::{DriverStats, DriverStatsSnapshot};
