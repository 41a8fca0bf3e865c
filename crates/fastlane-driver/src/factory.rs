//! Driver factory for creating backends from service locators.
//!
//! The locator's protocol prefix selects the backend; its options configure
//! it. Fabrics that live in-process (the software NIC switch and the UD
//! fabric) are passed in through a [`FabricContext`] so several drivers can
//! share them.

use crate::bypass::{KernelBypassConfig, KernelBypassDriver, NicDevice};
use crate::driver::Driver;
use crate::error::{DriverError, DriverResult};
use crate::infud::{InfUdConfig, InfUdDriver, UdFabric};
use crate::locator::ServiceLocator;
use crate::udp::{UdpConfig, UdpDriver};
use serde::Deserialize;
use std::sync::Arc;

/// Backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DriverType {
    /// UDP sockets (always available)
    #[default]
    Udp,
    /// Burst-polled NIC port, bypassing the kernel
    KernelBypass,
    /// RDMA unreliable datagrams
    InfUd,
}

impl DriverType {
    /// Backend named by a locator protocol such as `basic+udp`, or `None`
    /// if no backend handles it.
    pub fn from_protocol(protocol: &str) -> Option<Self> {
        let name = protocol.strip_prefix("basic+").unwrap_or(protocol);
        match name {
            "udp" => Some(Self::Udp),
            "dpdk" => Some(Self::KernelBypass),
            "infud" => Some(Self::InfUd),
            _ => None,
        }
    }

    /// Canonical locator protocol.
    pub fn protocol(&self) -> &'static str {
        match self {
            Self::Udp => "basic+udp",
            Self::KernelBypass => "basic+dpdk",
            Self::InfUd => "basic+infud",
        }
    }
}

impl std::fmt::Display for DriverType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Udp => write!(f, "UDP"),
            Self::KernelBypass => write!(f, "kernel-bypass"),
            Self::InfUd => write!(f, "InfUd"),
        }
    }
}

/// Per-backend settings used by [`DriverFactory`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DriverFactoryConfig {
    /// UDP backend settings
    pub udp: UdpConfig,
    /// Kernel-bypass backend settings
    pub kernel_bypass: KernelBypassConfig,
    /// RDMA UD backend settings
    pub infud: InfUdConfig,
}

impl DriverFactoryConfig {
    /// Validate every backend's settings.
    pub fn validate(&self) -> DriverResult<()> {
        self.udp.validate()?;
        self.kernel_bypass.validate()?;
        self.infud.validate()
    }
}

/// Shared in-process fabrics drivers attach to.
#[derive(Clone, Default)]
pub struct FabricContext {
    /// NIC used by kernel-bypass drivers
    pub nic: Option<Arc<dyn NicDevice>>,
    /// Fabric used by RDMA UD drivers
    pub ud: Option<UdFabric>,
}

impl FabricContext {
    /// Context with no special fabrics; only UDP drivers can be created.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a NIC for kernel-bypass drivers.
    #[must_use]
    pub fn with_nic(mut self, nic: Arc<dyn NicDevice>) -> Self {
        self.nic = Some(nic);
        self
    }

    /// Attach a UD fabric.
    #[must_use]
    pub fn with_ud_fabric(mut self, fabric: UdFabric) -> Self {
        self.ud = Some(fabric);
        self
    }
}

impl std::fmt::Debug for FabricContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FabricContext")
            .field("nic", &self.nic.as_ref().map(|n| n.port_count()))
            .field("ud", &self.ud)
            .finish()
    }
}

/// Creates drivers from locators.
#[derive(Debug, Clone, Default)]
pub struct DriverFactory {
    config: DriverFactoryConfig,
}

impl DriverFactory {
    /// Factory using `config` for every driver it creates.
    pub fn new(config: DriverFactoryConfig) -> DriverResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Create a driver with default settings.
    pub fn create(locator: &ServiceLocator, ctx: &FabricContext) -> DriverResult<Box<dyn Driver>> {
        Self::default().build(locator, ctx)
    }

    /// Create the driver `locator` names.
    pub fn build(&self, locator: &ServiceLocator, ctx: &FabricContext) -> DriverResult<Box<dyn Driver>> {
        let driver_type = DriverType::from_protocol(locator.protocol()).ok_or_else(|| {
            DriverError::InvalidConfig(format!(
                "no driver for protocol '{}'",
                locator.protocol()
            ))
        })?;
        tracing::debug!("Creating {} driver for {}", driver_type, locator);

        let driver: Box<dyn Driver> = match driver_type {
            DriverType::Udp => Box::new(UdpDriver::new(Some(locator), self.config.udp.clone())?),
            DriverType::KernelBypass => {
                let nic = ctx
                    .nic
                    .as_deref()
                    .ok_or_else(|| DriverError::NoDevice("no kernel-bypass NIC attached".into()))?;
                Box::new(KernelBypassDriver::new(
                    Some(locator),
                    nic,
                    self.config.kernel_bypass.clone(),
                )?)
            }
            DriverType::InfUd => {
                let fabric = ctx
                    .ud
                    .as_ref()
                    .ok_or_else(|| DriverError::NoDevice("no RDMA fabric attached".into()))?;
                Box::new(InfUdDriver::new(
                    Some(locator),
                    fabric,
                    self.config.infud.clone(),
                )?)
            }
        };
        Ok(driver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bypass::VirtualSwitch;

    #[test]
    fn test_driver_type_from_protocol() {
        assert_eq!(DriverType::from_protocol("basic+udp"), Some(DriverType::Udp));
        assert_eq!(DriverType::from_protocol("dpdk"), Some(DriverType::KernelBypass));
        assert_eq!(DriverType::from_protocol("basic+infud"), Some(DriverType::InfUd));
        assert_eq!(DriverType::from_protocol("tcp"), None);
        assert_eq!(DriverType::KernelBypass.protocol(), "basic+dpdk");
    }

    #[test]
    fn test_driver_type_display() {
        assert_eq!(DriverType::Udp.to_string(), "UDP");
        assert_eq!(DriverType::InfUd.to_string(), "InfUd");
    }

    #[test]
    fn test_create_each_backend() {
        let ctx = FabricContext::new()
            .with_nic(Arc::new(VirtualSwitch::new(1)))
            .with_ud_fabric(UdFabric::new(1));

        for (locator, expected) in [
            ("basic+udp:host=127.0.0.1,port=0", DriverType::Udp),
            ("basic+dpdk:devport=0", DriverType::KernelBypass),
            ("basic+infud:", DriverType::InfUd),
        ] {
            let sl = ServiceLocator::parse(locator).unwrap();
            let driver = DriverFactory::create(&sl, &ctx).unwrap();
            assert_eq!(driver.driver_type(), expected);
        }
    }

    #[test]
    fn test_missing_fabric() {
        let ctx = FabricContext::new();
        let sl = ServiceLocator::parse("basic+dpdk:").unwrap();
        assert!(matches!(
            DriverFactory::create(&sl, &ctx),
            Err(DriverError::NoDevice(_))
        ));
        let sl = ServiceLocator::parse("basic+infud:").unwrap();
        assert!(matches!(
            DriverFactory::create(&sl, &ctx),
            Err(DriverError::NoDevice(_))
        ));
        let sl = ServiceLocator::parse("tcp:host=a").unwrap();
        assert!(matches!(
            DriverFactory::create(&sl, &ctx),
            Err(DriverError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_config_from_json() {
        let config: DriverFactoryConfig = serde_json::from_str(
            r#"{ "kernel_bypass": { "max_batch": 8 }, "infud": { "bandwidth_gbps": 40 } }"#,
        )
        .unwrap();
        assert_eq!(config.kernel_bypass.max_batch, 8);
        assert_eq!(config.kernel_bypass.ring_size, 256);
        assert_eq!(config.infud.bandwidth_gbps, 40);
        assert_eq!(config.udp, UdpConfig::default());
        assert!(config.validate().is_ok());

        let bad = DriverFactoryConfig {
            infud: InfUdConfig {
                rx_buffers: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(DriverFactory::new(bad).is_err());
    }
}
