//! Hardware configuration: which simulated devices make up the beamline.
//!
//! # Example TOML format:
//! ```toml
//! [[devices]]
//! name = "samx"
//! kind = "motor"
//! limits = [-50.0, 50.0]
//! speed = 500.0
//!
//! [[devices]]
//! name = "det"
//! kind = "detector"
//! readout_priority = "monitored"
//! value = 100.0
//! noise = 2.0
//! exposure = "5ms"
//!
//! [[devices]]
//! name = "flyer1"
//! kind = "flyer"
//! point_time = "10ms"
//! ```

use crate::drivers::{CallLog, SimFlyer, SimMonitor, SimMotor};
use crate::registry::DeviceRegistry;
use anyhow::{anyhow, Context, Result};
use beamline_core::{DeviceComponents, ReadoutPriority, ScanResult};
use figment::{
    providers::{Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Kind of simulated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimDeviceKind {
    /// [`SimMotor`]
    Motor,
    /// Non-triggerable [`SimMonitor`]
    Monitor,
    /// Triggerable [`SimMonitor`]
    Detector,
    /// [`SimFlyer`]
    Flyer,
}

fn default_enabled() -> bool {
    true
}

/// One simulated device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimDeviceConfig {
    /// Unique device name
    pub name: String,
    /// Device kind
    pub kind: SimDeviceKind,
    /// Overrides the kind's default readout priority
    #[serde(default)]
    pub readout_priority: Option<ReadoutPriority>,
    /// Whether scans use the device
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Motor soft limits `[low, high]`
    #[serde(default)]
    pub limits: Option<[f64; 2]>,
    /// Motor speed in units per second (0 = instant)
    #[serde(default)]
    pub speed: f64,
    /// Motor start position
    #[serde(default)]
    pub initial_position: f64,
    /// Monitor mean value
    #[serde(default)]
    pub value: f64,
    /// Monitor noise amplitude
    #[serde(default)]
    pub noise: f64,
    /// Monitor read latency
    #[serde(default, with = "humantime_serde")]
    pub latency: Duration,
    /// Detector exposure time
    #[serde(default, with = "humantime_serde")]
    pub exposure: Duration,
    /// Flyer time per point
    #[serde(default, with = "humantime_serde")]
    pub point_time: Duration,
}

impl SimDeviceConfig {
    fn new(name: &str, kind: SimDeviceKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            readout_priority: None,
            enabled: true,
            limits: None,
            speed: 0.0,
            initial_position: 0.0,
            value: 0.0,
            noise: 0.0,
            latency: Duration::ZERO,
            exposure: Duration::ZERO,
            point_time: Duration::ZERO,
        }
    }

    fn build(&self, log: &CallLog) -> DeviceComponents {
        match self.kind {
            SimDeviceKind::Motor => {
                let mut motor = SimMotor::new(&self.name)
                    .with_speed(self.speed)
                    .with_position(self.initial_position)
                    .with_log(log.clone());
                if let Some([low, high]) = self.limits {
                    motor = motor.with_limits(low, high);
                }
                if let Some(priority) = self.readout_priority {
                    motor = motor.with_readout_priority(priority);
                }
                if !self.enabled {
                    motor = motor.disabled();
                }
                DeviceComponents::motor(Arc::new(motor))
            }
            SimDeviceKind::Monitor | SimDeviceKind::Detector => {
                let mut monitor = SimMonitor::new(&self.name, self.value)
                    .with_noise(self.noise)
                    .with_read_latency(self.latency)
                    .with_exposure(self.exposure)
                    .with_log(log.clone());
                if let Some(priority) = self.readout_priority {
                    monitor = monitor.with_readout_priority(priority);
                }
                if !self.enabled {
                    monitor = monitor.disabled();
                }
                let monitor = Arc::new(monitor);
                if self.kind == SimDeviceKind::Detector {
                    DeviceComponents::detector(monitor)
                } else {
                    DeviceComponents::new(monitor)
                }
            }
            SimDeviceKind::Flyer => {
                let point_time = if self.point_time.is_zero() {
                    Duration::from_millis(10)
                } else {
                    self.point_time
                };
                let mut flyer = SimFlyer::new(&self.name, point_time).with_log(log.clone());
                if let Some(priority) = self.readout_priority {
                    flyer = flyer.with_readout_priority(priority);
                }
                DeviceComponents::flyer(Arc::new(flyer))
            }
        }
    }
}

/// Hardware configuration loaded from a TOML file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// List of devices to register
    #[serde(default)]
    pub devices: Vec<SimDeviceConfig>,
}

impl HardwareConfig {
    /// Load hardware configuration from a TOML file
    ///
    /// # Errors
    /// Returns an error if the file is missing or does not parse.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(anyhow!("Hardware config file not found: {}", path.display()));
        }
        Figment::new()
            .merge(Toml::file(path))
            .extract()
            .with_context(|| format!("Failed to parse hardware config: {}", path.display()))
    }

    /// The built-in simulated beamline.
    ///
    /// | device | kind | priority |
    /// |---|---|---|
    /// | samx, samy | motor, limits ±50 | baseline |
    /// | det | detector | monitored |
    /// | bpm4i | monitor | monitored |
    /// | ring_current | monitor | baseline |
    /// | temp | monitor | on_request |
    /// | flyer1 | flyer | async |
    pub fn simulated_beamline() -> Self {
        let motor = |name: &str| SimDeviceConfig {
            limits: Some([-50.0, 50.0]),
            speed: 500.0,
            ..SimDeviceConfig::new(name, SimDeviceKind::Motor)
        };
        let monitor = |name: &str, value: f64, priority: ReadoutPriority| SimDeviceConfig {
            value,
            noise: value * 0.01,
            readout_priority: Some(priority),
            ..SimDeviceConfig::new(name, SimDeviceKind::Monitor)
        };
        Self {
            devices: vec![
                motor("samx"),
                motor("samy"),
                SimDeviceConfig {
                    value: 1000.0,
                    noise: 10.0,
                    exposure: Duration::from_millis(2),
                    readout_priority: Some(ReadoutPriority::Monitored),
                    ..SimDeviceConfig::new("det", SimDeviceKind::Detector)
                },
                monitor("bpm4i", 5.0, ReadoutPriority::Monitored),
                monitor("ring_current", 400.0, ReadoutPriority::Baseline),
                monitor("temp", 21.5, ReadoutPriority::OnRequest),
                SimDeviceConfig {
                    point_time: Duration::from_millis(5),
                    ..SimDeviceConfig::new("flyer1", SimDeviceKind::Flyer)
                },
            ],
        }
    }

    /// Build a registry of simulated devices.
    ///
    /// # Errors
    /// `InvalidConfig` on duplicate device names.
    pub fn build_registry(&self) -> ScanResult<DeviceRegistry> {
        self.build_registry_with_log(&CallLog::new())
    }

    /// Build a registry whose devices all record into `log`.
    ///
    /// # Errors
    /// `InvalidConfig` on duplicate device names.
    pub fn build_registry_with_log(&self, log: &CallLog) -> ScanResult<DeviceRegistry> {
        let mut registry = DeviceRegistry::new();
        for device in &self.devices {
            registry.register(device.build(log))?;
        }
        info!(devices = registry.len(), "hardware registry ready");
        Ok(registry)
    }
}

/// Registry of the built-in simulated beamline.
///
/// # Errors
/// Never in practice; the built-in names are unique.
pub fn create_sim_registry() -> ScanResult<DeviceRegistry> {
    HardwareConfig::simulated_beamline().build_registry()
}
