//! Shared harness for the scan engine integration tests.
#![allow(dead_code)]

use beamline_core::{
    readings_stream, BusMessage, EngineConfig, EntryState, LocalBus, MessageBus, ReadingUpdate,
    ReadoutStream, RequestId, ScanRequest,
};
use beamline_hardware::drivers::CallLog;
use beamline_hardware::{DeviceRegistry, HardwareConfig};
use beamline_scan::ScanServer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Harness {
    pub server: ScanServer,
    pub bus: Arc<LocalBus>,
    pub log: CallLog,
    pub registry: Arc<DeviceRegistry>,
}

/// Engine settings that keep tests fast.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        device_timeout: Duration::from_secs(2),
        fly_poll_interval: Duration::from_millis(5),
        retry_backoff: Duration::from_millis(5),
        ..EngineConfig::default()
    }
}

/// The simulated beamline with a detector slow enough to interrupt.
pub fn slow_beamline(exposure: Duration) -> HardwareConfig {
    let mut hardware = HardwareConfig::simulated_beamline();
    for device in &mut hardware.devices {
        if device.name == "det" {
            device.exposure = exposure;
        }
    }
    hardware
}

pub fn harness() -> Harness {
    harness_with(HardwareConfig::simulated_beamline(), test_config())
}

pub fn harness_with(hardware: HardwareConfig, config: EngineConfig) -> Harness {
    let log = CallLog::new();
    let registry = Arc::new(hardware.build_registry_with_log(&log).unwrap());
    harness_from(registry, log, config)
}

pub fn harness_from(registry: Arc<DeviceRegistry>, log: CallLog, config: EngineConfig) -> Harness {
    let bus = Arc::new(LocalBus::recording(4096));
    let server = ScanServer::new(registry.clone(), bus.clone(), config);
    server.start().unwrap();
    Harness {
        server,
        bus,
        log,
        registry,
    }
}

pub fn line_scan(motor: &str, start: f64, stop: f64, steps: u64) -> ScanRequest {
    ScanRequest::new("line_scan")
        .arg(motor)
        .arg(start)
        .arg(stop)
        .kwarg("steps", steps)
}

impl Harness {
    /// Wait for `rid` to finish, failing the test on a hang.
    pub async fn finish(&self, rid: &RequestId) -> EntryState {
        tokio::time::timeout(TEST_TIMEOUT, self.server.queues().wait_for(rid))
            .await
            .expect("scan did not finish in time")
            .unwrap()
    }

    /// Entry states published for `rid`, in order.
    pub fn transitions(&self, rid: &RequestId) -> Vec<EntryState> {
        self.bus
            .journal()
            .into_iter()
            .filter_map(|m| match m {
                BusMessage::EntryTransition(t) if &t.rid == rid => Some(t.to),
                _ => None,
            })
            .collect()
    }

    /// RIDs in activation order.
    pub fn activation_order(&self) -> Vec<RequestId> {
        self.bus
            .journal()
            .into_iter()
            .filter_map(|m| match m {
                BusMessage::EntryTransition(t) if t.to == EntryState::Active && t.from == Some(EntryState::Pending) => {
                    Some(t.rid)
                }
                _ => None,
            })
            .collect()
    }

    /// Readings of `rid` in `stream`, from its readings stream.
    pub fn readings(&self, rid: &RequestId, stream: ReadoutStream) -> Vec<ReadingUpdate> {
        self.bus
            .read_stream(&readings_stream(rid))
            .into_iter()
            .filter_map(|m| match m {
                BusMessage::Reading(r) if r.stream == stream => Some(r),
                _ => None,
            })
            .collect()
    }

    /// Point ids of the primary readings of `device`.
    pub fn points_of(&self, rid: &RequestId, device: &str) -> Vec<u64> {
        self.readings(rid, ReadoutStream::Primary)
            .into_iter()
            .filter(|r| r.device == device)
            .filter_map(|r| r.point_id.map(|p| p.value()))
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.bus.subscribe()
    }

    pub async fn position(&self, motor: &str) -> f64 {
        self.registry
            .positioner(motor)
            .unwrap()
            .position()
            .await
            .unwrap()
    }
}

/// Wait until `rid` reports scan progress of at least `points`.
pub async fn wait_for_progress(
    rx: &mut broadcast::Receiver<BusMessage>,
    rid: &RequestId,
    points: u64,
) {
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(BusMessage::Progress(p))
                    if &p.rid == rid && p.device.is_none() && p.value >= points =>
                {
                    return;
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("bus closed"),
            }
        }
    };
    tokio::time::timeout(TEST_TIMEOUT, wait)
        .await
        .expect("no progress in time");
}

/// Wait until `rid` is ACTIVE.
pub async fn wait_until_active(rx: &mut broadcast::Receiver<BusMessage>, rid: &RequestId) {
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(BusMessage::EntryTransition(t)) if &t.rid == rid && t.to == EntryState::Active => {
                    return;
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("bus closed"),
            }
        }
    };
    tokio::time::timeout(TEST_TIMEOUT, wait)
        .await
        .expect("entry never became active");
}
