//! RDMA unreliable-datagram backend (`basic+infud`).

mod driver;
pub mod fabric;

pub use driver::{InfUdConfig, InfUdDriver, MAX_PACKET_SIZE};
pub use fabric::{QueuePair, UdFabric};
