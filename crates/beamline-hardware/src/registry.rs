//! Device Registry
//!
//! Central lookup of the devices known to the engine. Each entry is a
//! [`DeviceComponents`] bag; scans ask the registry for a capability by
//! device name and never inspect concrete driver types.
//!
//! The registry is filled at startup and shared read-only (`Arc`) afterwards,
//! so lookups need no locking.
//!
//! # Example Usage
//!
//! ```rust,ignore
//! let mut registry = DeviceRegistry::new();
//! registry.register(DeviceComponents::motor(Arc::new(SimMotor::new("samx"))))?;
//!
//! let samx = registry.positioner("samx")?;
//! let status = samx.move_to(1.0).await?;
//! ```

use beamline_core::{
    Capability, Device, DeviceComponents, Flyer, Positioner, ReadoutPriority, ScanError,
    ScanResult, SoftLimits, Triggerable,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Summary of a registered device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device name
    pub name: String,
    /// Supported capabilities
    pub capabilities: Vec<Capability>,
    /// Readout priority
    pub readout_priority: ReadoutPriority,
    /// Whether scans use the device
    pub enabled: bool,
    /// Soft limits of positioners
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<SoftLimits>,
}

/// Registry of devices by name.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<String, DeviceComponents>,
}

impl DeviceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device.
    ///
    /// # Errors
    /// `InvalidConfig` if a device with the same name is already registered.
    pub fn register(&mut self, components: DeviceComponents) -> ScanResult<()> {
        let name = components.name().to_string();
        if self.devices.contains_key(&name) {
            return Err(ScanError::InvalidConfig {
                target: name.clone(),
                message: format!("Device '{name}' is already registered"),
            });
        }
        info!(device = %name, capabilities = ?components.capabilities(), "registered device");
        self.devices.insert(name, components);
        Ok(())
    }

    /// Unregister a device. Returns true if it was present.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.devices.remove(name).is_some()
    }

    /// Check if a device is registered
    pub fn contains(&self, name: &str) -> bool {
        self.devices.contains_key(name)
    }

    /// Get count of registered devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// List all registered devices, sorted by name.
    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        self.devices.values().map(Self::info).collect()
    }

    /// Get device info by name
    pub fn device_info(&self, name: &str) -> Option<DeviceInfo> {
        self.devices.get(name).map(Self::info)
    }

    fn info(components: &DeviceComponents) -> DeviceInfo {
        DeviceInfo {
            name: components.name().to_string(),
            capabilities: components.capabilities(),
            readout_priority: components.device.readout_priority(),
            enabled: components.device.enabled(),
            limits: components.positioner.as_ref().and_then(|p| p.limits()),
        }
    }

    // =========================================================================
    // Capability Access
    // =========================================================================

    /// Capability bag of a device.
    pub fn components(&self, name: &str) -> Option<&DeviceComponents> {
        self.devices.get(name)
    }

    /// Base contract of a device, if registered.
    pub fn get_device(&self, name: &str) -> Option<Arc<dyn Device>> {
        self.devices.get(name).map(|d| d.device.clone())
    }

    /// Get a device as Positioner (if it supports this capability)
    pub fn get_positioner(&self, name: &str) -> Option<Arc<dyn Positioner>> {
        self.devices.get(name).and_then(|d| d.positioner.clone())
    }

    /// Get a device as Triggerable (if it supports this capability)
    pub fn get_triggerable(&self, name: &str) -> Option<Arc<dyn Triggerable>> {
        self.devices.get(name).and_then(|d| d.triggerable.clone())
    }

    /// Get a device as Flyer (if it supports this capability)
    pub fn get_flyer(&self, name: &str) -> Option<Arc<dyn Flyer>> {
        self.devices.get(name).and_then(|d| d.flyer.clone())
    }

    /// Base contract of a device.
    ///
    /// # Errors
    /// `UnknownDevice` if no such device is registered.
    pub fn device(&self, name: &str) -> ScanResult<Arc<dyn Device>> {
        self.get_device(name)
            .ok_or_else(|| ScanError::UnknownDevice(name.to_string()))
    }

    /// Positioner capability of a device.
    ///
    /// # Errors
    /// `UnknownDevice` or `MissingCapability`.
    pub fn positioner(&self, name: &str) -> ScanResult<Arc<dyn Positioner>> {
        self.require(name, Capability::Positioner, |d| d.positioner.clone())
    }

    /// Triggerable capability of a device.
    ///
    /// # Errors
    /// `UnknownDevice` or `MissingCapability`.
    pub fn triggerable(&self, name: &str) -> ScanResult<Arc<dyn Triggerable>> {
        self.require(name, Capability::Triggerable, |d| d.triggerable.clone())
    }

    /// Flyer capability of a device.
    ///
    /// # Errors
    /// `UnknownDevice` or `MissingCapability`.
    pub fn flyer(&self, name: &str) -> ScanResult<Arc<dyn Flyer>> {
        self.require(name, Capability::Flyer, |d| d.flyer.clone())
    }

    fn require<T: ?Sized>(
        &self,
        name: &str,
        capability: Capability,
        pick: impl Fn(&DeviceComponents) -> Option<Arc<T>>,
    ) -> ScanResult<Arc<T>> {
        let components = self
            .devices
            .get(name)
            .ok_or_else(|| ScanError::UnknownDevice(name.to_string()))?;
        pick(components).ok_or_else(|| ScanError::MissingCapability {
            device: name.to_string(),
            capability: capability.as_str(),
        })
    }

    /// Soft limits of a positioner.
    pub fn limits(&self, name: &str) -> Option<SoftLimits> {
        self.get_positioner(name).and_then(|p| p.limits())
    }

    /// Names of devices with a capability.
    pub fn devices_with_capability(&self, capability: Capability) -> Vec<String> {
        self.devices
            .values()
            .filter(|d| d.capabilities().contains(&capability))
            .map(|d| d.name().to_string())
            .collect()
    }

    /// Names of enabled devices with the given readout priority.
    pub fn devices_with_priority(&self, priority: ReadoutPriority) -> Vec<String> {
        self.devices
            .values()
            .filter(|d| d.device.enabled() && d.device.readout_priority() == priority)
            .map(|d| d.name().to_string())
            .collect()
    }

    /// Names of all enabled devices.
    pub fn enabled_devices(&self) -> Vec<String> {
        self.devices
            .values()
            .filter(|d| d.device.enabled())
            .map(|d| d.name().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{SimFlyer, SimMonitor, SimMotor};
    use std::time::Duration;

    fn registry() -> DeviceRegistry {
        let mut registry = DeviceRegistry::new();
        registry
            .register(DeviceComponents::motor(Arc::new(
                SimMotor::new("samx").with_limits(-5.0, 5.0),
            )))
            .unwrap();
        registry
            .register(DeviceComponents::detector(Arc::new(SimMonitor::new(
                "det", 1.0,
            ))))
            .unwrap();
        registry
            .register(DeviceComponents::new(Arc::new(
                SimMonitor::new("ring", 400.0).with_readout_priority(ReadoutPriority::Baseline),
            )))
            .unwrap();
        registry
            .register(DeviceComponents::new(Arc::new(
                SimMonitor::new("spare", 0.0).disabled(),
            )))
            .unwrap();
        registry
            .register(DeviceComponents::flyer(Arc::new(SimFlyer::new(
                "flyer1",
                Duration::from_millis(1),
            ))))
            .unwrap();
        registry
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = registry();
        let err = registry
            .register(DeviceComponents::motor(Arc::new(SimMotor::new("samx"))))
            .unwrap_err();
        assert!(matches!(err, ScanError::InvalidConfig { .. }));
        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn capability_lookups() {
        let registry = registry();
        assert!(registry.positioner("samx").is_ok());
        assert!(registry.get_positioner("det").is_none());
        assert!(registry.triggerable("det").is_ok());
        assert!(registry.flyer("flyer1").is_ok());
        assert!(matches!(
            registry.positioner("det"),
            Err(ScanError::MissingCapability { .. })
        ));
        assert!(matches!(
            registry.device("nope"),
            Err(ScanError::UnknownDevice(_))
        ));
    }

    #[test]
    fn priority_queries_skip_disabled_devices() {
        let registry = registry();
        assert_eq!(
            registry.devices_with_priority(ReadoutPriority::Monitored),
            vec!["det".to_string()]
        );
        assert_eq!(
            registry.devices_with_priority(ReadoutPriority::Baseline),
            vec!["ring".to_string(), "samx".to_string()]
        );
        assert!(!registry.enabled_devices().contains(&"spare".to_string()));
    }

    #[test]
    fn device_info_reports_limits() {
        let registry = registry();
        let info = registry.device_info("samx").unwrap();
        assert_eq!(info.limits, Some(SoftLimits::new(-5.0, 5.0)));
        assert!(info.capabilities.contains(&Capability::Positioner));
        assert_eq!(registry.list_devices().len(), 5);
    }

    #[test]
    fn devices_with_capability_filters() {
        let registry = registry();
        assert_eq!(
            registry.devices_with_capability(Capability::Flyer),
            vec!["flyer1".to_string()]
        );
    }
}
