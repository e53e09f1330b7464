//! Per-device staging exclusivity.
//!
//! Several queues run scans concurrently against one shared registry. Before a
//! scan stages a device it claims it here; a second scan trying to claim the
//! same device gets `AlreadyStaged` until the owner releases it.

use beamline_core::{RequestId, ScanError, ScanResult};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::debug;

/// Which scan currently holds each staged device.
#[derive(Debug, Default)]
pub struct StagingLedger {
    owners: Mutex<BTreeMap<String, RequestId>>,
}

impl StagingLedger {
    /// Empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `device` for scan `rid`.
    ///
    /// # Errors
    /// `AlreadyStaged` if the device is held by any scan, including `rid` itself.
    pub fn claim(&self, device: &str, rid: &RequestId) -> ScanResult<()> {
        let mut owners = self.owners.lock();
        if let Some(owner) = owners.get(device) {
            return Err(ScanError::AlreadyStaged {
                device: device.to_string(),
                owner: owner.to_string(),
            });
        }
        owners.insert(device.to_string(), rid.clone());
        debug!(device, %rid, "device claimed");
        Ok(())
    }

    /// Claim several devices at once: either all are claimed or none.
    ///
    /// Devices are claimed in sorted order.
    ///
    /// # Errors
    /// `AlreadyStaged` for the first device held by someone else.
    pub fn claim_all(&self, devices: &[String], rid: &RequestId) -> ScanResult<()> {
        let mut sorted: Vec<&String> = devices.iter().collect();
        sorted.sort();
        sorted.dedup();
        let mut owners = self.owners.lock();
        if let Some((device, owner)) = sorted
            .iter()
            .find_map(|d| owners.get(d.as_str()).map(|o| (d, o)))
        {
            return Err(ScanError::AlreadyStaged {
                device: device.to_string(),
                owner: owner.to_string(),
            });
        }
        for device in sorted {
            owners.insert(device.clone(), rid.clone());
        }
        Ok(())
    }

    /// Release `device` if held by `rid`. Returns whether it was released.
    ///
    /// Releasing a device that is not held, or held by another scan, is a no-op.
    pub fn release(&self, device: &str, rid: &RequestId) -> bool {
        let mut owners = self.owners.lock();
        if owners.get(device) == Some(rid) {
            owners.remove(device);
            debug!(device, %rid, "device released");
            true
        } else {
            false
        }
    }

    /// Release everything held by `rid`. Returns the released devices.
    pub fn release_all(&self, rid: &RequestId) -> Vec<String> {
        let mut owners = self.owners.lock();
        let held: Vec<String> = owners
            .iter()
            .filter(|(_, owner)| *owner == rid)
            .map(|(device, _)| device.clone())
            .collect();
        for device in &held {
            owners.remove(device);
        }
        held
    }

    /// Scan holding `device`.
    pub fn owner(&self, device: &str) -> Option<RequestId> {
        self.owners.lock().get(device).cloned()
    }

    /// Devices held by `rid`, sorted.
    pub fn held_by(&self, rid: &RequestId) -> Vec<String> {
        self.owners
            .lock()
            .iter()
            .filter(|(_, owner)| *owner == rid)
            .map(|(device, _)| device.clone())
            .collect()
    }
}
