//! Kernel-bypass backend (`basic+dpdk`).
//!
//! [`KernelBypassDriver`] talks to any [`NicPort`]; [`VirtualSwitch`]
//! provides in-process ports when no hardware is present.

mod driver;
pub mod nic;

pub use driver::{KernelBypassConfig, KernelBypassDriver, MAX_PACKET_SIZE};
pub use nic::{Frame, FramePool, NicDevice, NicPort, VirtualSwitch};
