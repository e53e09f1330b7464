//! Fly scans, device faults and staging conflicts between queues.

mod common;

use beamline_core::{
    BusMessage, DeviceComponents, EngineConfig, EntryState, ErrorKind, ReadoutPriority, ScanPhase,
    ScanRequest,
};
use beamline_hardware::drivers::{CallLog, FaultConfig, FaultScenario, SimMonitor, SimMotor};
use beamline_hardware::DeviceRegistry;
use beamline_scan::ScanState;
use common::*;
use std::sync::Arc;
use std::time::Duration;

fn sim_registry(motor_faults: FaultConfig, detector_faults: FaultConfig, log: &CallLog) -> DeviceRegistry {
    let mut registry = DeviceRegistry::new();
    registry
        .register(DeviceComponents::motor(Arc::new(
            SimMotor::new("samx")
                .with_limits(-10.0, 10.0)
                .with_faults(motor_faults)
                .with_log(log.clone()),
        )))
        .unwrap();
    registry
        .register(DeviceComponents::detector(Arc::new(
            SimMonitor::new("det", 7.0)
                .with_faults(detector_faults)
                .with_log(log.clone()),
        )))
        .unwrap();
    registry
}

fn faulty_beamline(motor_faults: FaultConfig, detector_faults: FaultConfig) -> (Arc<DeviceRegistry>, CallLog) {
    let log = CallLog::new();
    let registry = sim_registry(motor_faults, detector_faults, &log);
    (Arc::new(registry), log)
}

/// `samx` and `det` plus a baseline monitor `ring`.
fn beamline_with_baseline(
    baseline_faults: FaultConfig,
    detector_faults: FaultConfig,
) -> (Arc<DeviceRegistry>, CallLog) {
    let log = CallLog::new();
    let mut registry = sim_registry(FaultConfig::none(), detector_faults, &log);
    registry
        .register(DeviceComponents::new(Arc::new(
            SimMonitor::new("ring", 400.0)
                .with_readout_priority(ReadoutPriority::Baseline)
                .with_faults(baseline_faults)
                .with_log(log.clone()),
        )))
        .unwrap();
    (Arc::new(registry), log)
}

fn short_timeouts() -> EngineConfig {
    EngineConfig {
        device_timeout: Duration::from_millis(100),
        ..test_config()
    }
}

#[tokio::test]
async fn a_hung_move_is_retried_once() {
    let (registry, log) = faulty_beamline(
        FaultConfig::scenario(FaultScenario::Hang {
            operation: "move",
            times: 1,
        }),
        FaultConfig::none(),
    );
    let h = harness_from(registry, log, short_timeouts());
    let rid = h.server.submit(line_scan("samx", 0.0, 2.0, 3)).unwrap();

    assert_eq!(h.finish(&rid).await, EntryState::Completed);
    assert_eq!(h.points_of(&rid, "det"), vec![0, 1, 2]);
    assert_eq!(h.log.values("samx", "move")[..2], [0.0, 0.0]);
}

#[tokio::test]
async fn a_second_timeout_fails_the_scan() {
    let (registry, log) = faulty_beamline(
        FaultConfig::scenario(FaultScenario::Hang {
            operation: "move",
            times: 2,
        }),
        FaultConfig::none(),
    );
    let h = harness_from(registry, log, short_timeouts());
    let rid = h.server.submit(line_scan("samx", 0.0, 2.0, 3)).unwrap();

    assert_eq!(h.finish(&rid).await, EntryState::Failed);
    let error = h.server.queues().entry(&rid).unwrap().error.unwrap();
    assert_eq!(error.kind, ErrorKind::DeviceTimeout);
    assert_eq!(error.device.as_deref(), Some("samx"));
    assert!(h.points_of(&rid, "det").is_empty());
    assert_eq!(h.log.count("samx", "unstage"), 1);
    assert_eq!(h.log.count("det", "unstage"), 1);
}

#[tokio::test]
async fn without_retries_one_hang_fails_the_scan() {
    let (registry, log) = faulty_beamline(
        FaultConfig::scenario(FaultScenario::Hang {
            operation: "move",
            times: 1,
        }),
        FaultConfig::none(),
    );
    let config = EngineConfig {
        timeout_retries: 0,
        ..short_timeouts()
    };
    let h = harness_from(registry, log, config);
    let rid = h.server.submit(line_scan("samx", 0.0, 2.0, 3)).unwrap();

    assert_eq!(h.finish(&rid).await, EntryState::Failed);
    let error = h.server.queues().entry(&rid).unwrap().error.unwrap();
    assert_eq!(error.kind, ErrorKind::DeviceTimeout);
    assert_eq!(h.log.values("samx", "move"), vec![0.0]);
    assert_eq!(h.log.count("samx", "unstage"), 1);
}

#[tokio::test]
async fn a_monitored_read_that_hangs_once_is_retried() {
    let (registry, log) = faulty_beamline(
        FaultConfig::none(),
        FaultConfig::scenario(FaultScenario::Hang {
            operation: "read",
            times: 1,
        }),
    );
    let h = harness_from(registry, log, short_timeouts());
    let rid = h.server.submit(line_scan("samx", 0.0, 2.0, 3)).unwrap();

    assert_eq!(h.finish(&rid).await, EntryState::Completed);
    assert_eq!(h.points_of(&rid, "det"), vec![0, 1, 2]);
    assert_eq!(h.log.count("det", "read"), 4);
}

#[tokio::test]
async fn a_stage_slower_than_its_timeout_is_still_unstaged() {
    let log = CallLog::new();
    let motor = Arc::new(
        SimMotor::new("samx")
            .with_limits(-10.0, 10.0)
            .with_faults(FaultConfig::scenario(FaultScenario::Delay {
                operation: "stage",
                delay: Duration::from_millis(150),
                times: 1,
            }))
            .with_log(log.clone()),
    );
    let mut registry = DeviceRegistry::new();
    registry.register(DeviceComponents::motor(motor.clone())).unwrap();
    registry
        .register(DeviceComponents::detector(Arc::new(
            SimMonitor::new("det", 7.0).with_log(log.clone()),
        )))
        .unwrap();
    let config = EngineConfig {
        stage_timeout: Duration::from_millis(100),
        ..test_config()
    };
    let h = harness_from(Arc::new(registry), log, config);

    let rid = h.server.submit(line_scan("samx", 0.0, 2.0, 3)).unwrap();
    assert_eq!(h.finish(&rid).await, EntryState::Failed);
    let error = h.server.queues().entry(&rid).unwrap().error.unwrap();
    assert_eq!(error.kind, ErrorKind::DeviceTimeout);
    assert_eq!(error.device.as_deref(), Some("samx"));
    assert!(!motor.is_staged());
    assert_eq!(h.log.count("samx", "unstage"), 1);
    assert_eq!(h.log.count("det", "unstage"), 1);
    assert!(h.server.engine().ledger.held_by(&rid).is_empty());

    let next = h.server.submit(line_scan("samx", 0.0, 2.0, 3)).unwrap();
    assert_eq!(h.finish(&next).await, EntryState::Completed);
}

#[tokio::test]
async fn failures_before_the_first_point_unstage_everything() {
    let cases = [
        (
            FaultConfig::scenario(FaultScenario::FailAfterN {
                operation: "read",
                count: 0,
            }),
            FaultConfig::none(),
        ),
        (
            FaultConfig::none(),
            FaultConfig::scenario(FaultScenario::FailAfterN {
                operation: "pre_scan",
                count: 0,
            }),
        ),
    ];
    for (baseline_faults, detector_faults) in cases {
        let (registry, log) = beamline_with_baseline(baseline_faults, detector_faults);
        let h = harness_from(registry, log, test_config());
        let rid = h.server.submit(line_scan("samx", 0.0, 2.0, 3)).unwrap();

        assert_eq!(h.finish(&rid).await, EntryState::Failed);
        let error = h.server.queues().entry(&rid).unwrap().error.unwrap();
        assert_eq!(error.kind, ErrorKind::DeviceError);
        assert!(h.points_of(&rid, "det").is_empty());
        for device in ["samx", "det"] {
            assert_eq!(h.log.count(device, "stage"), 1, "{device} stage");
            assert_eq!(h.log.count(device, "unstage"), 1, "{device} unstage");
        }
        assert_eq!(h.log.count("ring", "stage"), 0);
        assert!(h.server.engine().ledger.held_by(&rid).is_empty());
    }
}

#[tokio::test]
async fn a_failing_detector_fails_the_scan_after_unwinding() {
    let (registry, log) = faulty_beamline(
        FaultConfig::none(),
        FaultConfig::scenario(FaultScenario::FailAfterN {
            operation: "trigger",
            count: 2,
        }),
    );
    let h = harness_from(registry, log, test_config());
    let rid = h.server.submit(line_scan("samx", 0.0, 4.0, 5)).unwrap();

    assert_eq!(h.finish(&rid).await, EntryState::Failed);
    let error = h.server.queues().entry(&rid).unwrap().error.unwrap();
    assert_eq!(error.kind, ErrorKind::DeviceError);
    assert_eq!(h.points_of(&rid, "det"), vec![0, 1]);
    assert_eq!(h.log.count("det", "stop"), 1);
    let report = h.server.queues().report(&rid).unwrap();
    assert_eq!(
        report.states[report.states.len() - 3..],
        [ScanState::Finalizing, ScanState::Unstaged, ScanState::Failed]
    );
    assert!(!report.states.contains(&ScanState::CleanedUp));
    assert_eq!(h.log.count("samx", "unstage"), 1);
    assert_eq!(h.log.count("det", "unstage"), 1);

    let closing = h
        .bus
        .journal()
        .into_iter()
        .filter_map(|m| match m {
            BusMessage::ScanStatus(s) if s.rid == rid => Some(s),
            _ => None,
        })
        .last()
        .unwrap();
    assert_eq!(closing.phase, ScanPhase::Failed);
}

#[tokio::test]
async fn fly_scan_reads_once_per_flyer_point() {
    let h = harness();
    let request = ScanRequest::new("fly_scan")
        .arg("flyer1")
        .kwarg("num_points", 5)
        .kwarg("exp_time", 0.002);
    let rid = h.server.submit(request).unwrap();

    assert_eq!(h.finish(&rid).await, EntryState::Completed);
    assert_eq!(h.points_of(&rid, "flyer1"), vec![0, 1, 2, 3, 4]);
    assert_eq!(h.points_of(&rid, "det"), vec![0, 1, 2, 3, 4]);
    for op in ["stage", "kickoff", "complete", "unstage"] {
        assert_eq!(h.log.count("flyer1", op), 1, "flyer1 {op}");
    }

    let opening = h
        .bus
        .journal()
        .into_iter()
        .find_map(|m| match m {
            BusMessage::ScanStatus(s) if s.rid == rid => Some(s),
            _ => None,
        })
        .unwrap();
    assert_eq!(opening.monitor_sync, "flyer1");
    let device_progress = h.bus.journal_filtered(|m| {
        matches!(m, BusMessage::Progress(p) if p.rid == rid && p.device.as_deref() == Some("flyer1"))
    });
    assert!(!device_progress.is_empty());
}

#[tokio::test]
async fn timed_fly_scan_reads_until_the_flyer_is_done() {
    let h = harness();
    let request = ScanRequest::new("timed_fly_scan")
        .arg("flyer1")
        .kwarg("num_points", 10)
        .kwarg("exp_time", 0.003)
        .kwarg("readout_interval", 0.005);
    let rid = h.server.submit(request).unwrap();

    assert_eq!(h.finish(&rid).await, EntryState::Completed);
    let points = h.points_of(&rid, "flyer1");
    assert!(!points.is_empty());
    assert_eq!(points, (0..points.len() as u64).collect::<Vec<_>>());
}

#[tokio::test]
async fn fly_scan_on_a_motor_is_rejected() {
    let h = harness();
    let request = ScanRequest::new("fly_scan").arg("samx").kwarg("num_points", 5);
    let rid = h.server.submit(request).unwrap();
    assert_eq!(h.finish(&rid).await, EntryState::Failed);
    let error = h.server.queues().entry(&rid).unwrap().error.unwrap();
    assert_eq!(error.kind, ErrorKind::MissingCapability);
    assert_eq!(h.log.count("samx", "stage"), 0);
}

#[tokio::test]
async fn aborting_a_fly_scan_stops_the_flyer() {
    let h = harness();
    let mut rx = h.subscribe();
    let request = ScanRequest::new("fly_scan")
        .arg("flyer1")
        .kwarg("num_points", 1000)
        .kwarg("exp_time", 0.01);
    let rid = h.server.submit(request).unwrap();

    wait_until_active(&mut rx, &rid).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.server.queues().abort(&rid).await.unwrap(), EntryState::Aborted);
    assert_eq!(h.log.count("flyer1", "stop"), 1);
    assert_eq!(h.log.count("flyer1", "unstage"), 1);
    assert!(h.points_of(&rid, "flyer1").len() < 1000);
}

#[tokio::test]
async fn queues_cannot_stage_the_same_device() {
    let h = harness_with(slow_beamline(Duration::from_millis(20)), test_config());
    let mut rx = h.subscribe();
    let first = h.server.submit(line_scan("samx", 0.0, 9.0, 10)).unwrap();
    wait_for_progress(&mut rx, &first, 1).await;

    let second = h
        .server
        .submit(line_scan("samy", 0.0, 1.0, 2).on_queue("alignment"))
        .unwrap();
    assert_eq!(h.finish(&second).await, EntryState::Failed);
    let error = h.server.queues().entry(&second).unwrap().error.unwrap();
    assert_eq!(error.kind, ErrorKind::AlreadyStaged);
    assert_eq!(h.log.count("samy", "stage"), 0);

    assert_eq!(h.finish(&first).await, EntryState::Completed);
    assert_eq!(h.log.count("det", "stage"), 1);
    assert_eq!(h.log.count("det", "unstage"), 1);
}

#[tokio::test]
async fn queues_with_disjoint_devices_run_concurrently() {
    let h = harness_with(slow_beamline(Duration::from_millis(20)), test_config());
    let mut rx = h.subscribe();
    let scan = h.server.submit(line_scan("samx", 0.0, 9.0, 10)).unwrap();
    wait_for_progress(&mut rx, &scan, 1).await;

    let mv = h
        .server
        .submit(ScanRequest::new("mv").arg("samy").arg(3.0).on_queue("alignment"))
        .unwrap();
    assert_eq!(h.finish(&mv).await, EntryState::Completed);
    assert_eq!(
        h.server.queues().entry(&scan).unwrap().state,
        EntryState::Active
    );
    assert_eq!(h.position("samy").await, 3.0);
    assert_eq!(h.finish(&scan).await, EntryState::Completed);
}
