//! Engine-wide services shared by every queue and every scan.

use crate::control::ScanControl;
use crate::correlator::InstructionCorrelator;
use crate::numbering::ScanNumbers;
use crate::scan::{ScanContext, ScanSettings};
use crate::scans::ScanCatalogue;
use crate::stubs::{ScanStubs, StubSettings, StubWiring};
use beamline_core::{EngineConfig, MessageBus, RequestId, ScanRequest};
use beamline_hardware::{DeviceRegistry, StagingLedger};
use std::sync::Arc;

/// Explicitly constructed engine context; there are no process globals.
#[derive(Clone)]
pub struct EngineContext {
    /// Devices
    pub registry: Arc<DeviceRegistry>,
    /// Transport
    pub bus: Arc<dyn MessageBus>,
    /// Known scan types
    pub catalogue: Arc<ScanCatalogue>,
    /// Outstanding device instructions of all scans
    pub correlator: Arc<InstructionCorrelator>,
    /// Staged devices of all scans
    pub ledger: Arc<StagingLedger>,
    /// Scan counter
    pub scan_numbers: Arc<ScanNumbers>,
    /// Tunables
    pub config: Arc<EngineConfig>,
}

impl EngineContext {
    /// Context with a fresh correlator, staging ledger and scan counter.
    ///
    /// The catalogue takes its point limit from `config`. The counter reads
    /// its backing file only once [`ScanNumbers::load`] is called.
    pub fn new(
        registry: Arc<DeviceRegistry>,
        bus: Arc<dyn MessageBus>,
        catalogue: ScanCatalogue,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            bus,
            catalogue: Arc::new(catalogue.with_max_points(config.max_points)),
            correlator: Arc::new(InstructionCorrelator::new()),
            ledger: Arc::new(StagingLedger::new()),
            scan_numbers: Arc::new(ScanNumbers::new(config.scan_number_file.clone())),
            config: Arc::new(config),
        }
    }

    fn wiring(&self) -> StubWiring {
        StubWiring {
            registry: self.registry.clone(),
            bus: self.bus.clone(),
            correlator: self.correlator.clone(),
            ledger: self.ledger.clone(),
        }
    }

    /// Everything one scan needs to run under `control`.
    pub fn scan_context(
        &self,
        rid: RequestId,
        request: Arc<ScanRequest>,
        control: ScanControl,
    ) -> ScanContext {
        let stubs = ScanStubs::new(
            rid,
            self.wiring(),
            control,
            StubSettings::from(self.config.as_ref()),
        );
        let settings = ScanSettings::resolve(&request, &self.config);
        ScanContext::new(request, stubs, self.registry.clone(), settings)
    }
}
