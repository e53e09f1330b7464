//! `beamline-hardware`
//!
//! Hardware side of the scan engine:
//!
//! - [`DeviceRegistry`]: capability lookup by device name
//! - [`StagingLedger`]: per-device exclusivity between concurrently active scans
//! - [`drivers`]: simulated motors, detectors and flyers
//! - [`config`]: TOML description of a simulated beamline

pub mod config;
pub mod drivers;
pub mod registry;
pub mod staging;

pub use config::{create_sim_registry, HardwareConfig, SimDeviceConfig, SimDeviceKind};
pub use registry::{DeviceInfo, DeviceRegistry};
pub use staging::StagingLedger;
