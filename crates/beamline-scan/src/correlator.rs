//! Matching of device acknowledgements to in-flight instructions.
//!
//! Every device instruction is registered under its (RID, DIID) pair before
//! it is sent. The acknowledgement for that pair resolves the waiting stub
//! call exactly once; acknowledgements for unknown or already resolved pairs
//! are logged and dropped.

use beamline_core::{
    DeviceAck, DeviceInstructionId, InstructionAction, ReadingMap, RequestId, ScanError,
    ScanResult,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

type Key = (RequestId, DeviceInstructionId);

/// Data carried alongside a successful acknowledgement of a local device call.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum AckPayload {
    /// Nothing beyond success
    #[default]
    None,
    /// Result of a read
    Readings(ReadingMap),
    /// Return value of an rpc
    Value(Value),
}

/// What a waiter receives.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The acknowledgement itself
    pub ack: DeviceAck,
    /// Data of a local call
    pub payload: AckPayload,
    /// Structured failure of a local call
    pub error: Option<ScanError>,
}

/// Result of delivering an acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Resolved an outstanding instruction
    Resolved,
    /// The instruction had already been resolved; dropped
    Duplicate,
    /// No such instruction; dropped
    Unknown,
}

/// Why [`PendingAck::wait`] returned without a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// Nothing arrived in time
    TimedOut,
    /// The registration was withdrawn
    Withdrawn,
}

#[derive(Debug)]
struct Outstanding {
    device: String,
    action: InstructionAction,
    waiter: oneshot::Sender<Resolution>,
}

#[derive(Debug, Default)]
struct Ledger {
    outstanding: HashMap<Key, Outstanding>,
    resolved: HashSet<Key>,
}

/// Correlates DIIDs with the stub calls awaiting them.
#[derive(Debug, Default)]
pub struct InstructionCorrelator {
    ledger: Mutex<Ledger>,
}

impl InstructionCorrelator {
    /// Empty correlator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instruction before it is sent.
    ///
    /// # Errors
    /// `EngineFault` if the pair is already outstanding or was resolved before.
    pub fn register(
        &self,
        rid: &RequestId,
        diid: DeviceInstructionId,
        device: &str,
        action: InstructionAction,
    ) -> ScanResult<PendingAck> {
        let key = (rid.clone(), diid);
        let mut ledger = self.ledger.lock();
        if ledger.outstanding.contains_key(&key) || ledger.resolved.contains(&key) {
            return Err(ScanError::EngineFault(format!(
                "instruction {diid} of request {rid} is already registered"
            )));
        }
        let (waiter, rx) = oneshot::channel();
        ledger.outstanding.insert(
            key,
            Outstanding {
                device: device.to_string(),
                action,
                waiter,
            },
        );
        Ok(PendingAck {
            rid: rid.clone(),
            diid,
            rx,
        })
    }

    /// Deliver an acknowledgement from a remote device server.
    pub fn acknowledge(&self, ack: DeviceAck) -> AckOutcome {
        self.resolve(ack, AckPayload::None, None)
    }

    /// Deliver an acknowledgement together with local call results.
    pub fn resolve(
        &self,
        ack: DeviceAck,
        payload: AckPayload,
        error: Option<ScanError>,
    ) -> AckOutcome {
        let key = (ack.rid.clone(), ack.diid);
        let mut ledger = self.ledger.lock();
        match ledger.outstanding.remove(&key) {
            Some(outstanding) => {
                if outstanding.device != ack.device || outstanding.action != ack.action {
                    warn!(
                        rid = %ack.rid,
                        diid = %ack.diid,
                        expected_device = %outstanding.device,
                        device = %ack.device,
                        "acknowledgement does not match the registered instruction"
                    );
                }
                ledger.resolved.insert(key);
                // The waiter may have given up already; the ack still counts.
                let _ = outstanding.waiter.send(Resolution {
                    ack,
                    payload,
                    error,
                });
                AckOutcome::Resolved
            }
            None if ledger.resolved.contains(&key) => {
                debug!(rid = %ack.rid, diid = %ack.diid, device = %ack.device, "duplicate acknowledgement dropped");
                AckOutcome::Duplicate
            }
            None => {
                warn!(rid = %ack.rid, diid = %ack.diid, device = %ack.device, "acknowledgement for unknown instruction dropped");
                AckOutcome::Unknown
            }
        }
    }

    /// Withdraw an outstanding registration, e.g. after its waiter timed out.
    ///
    /// A late acknowledgement for it is then treated as unknown.
    pub fn withdraw(&self, rid: &RequestId, diid: DeviceInstructionId) -> bool {
        self.ledger
            .lock()
            .outstanding
            .remove(&(rid.clone(), diid))
            .is_some()
    }

    /// Whether the instruction is still awaiting its acknowledgement.
    pub fn is_outstanding(&self, rid: &RequestId, diid: DeviceInstructionId) -> bool {
        self.ledger
            .lock()
            .outstanding
            .contains_key(&(rid.clone(), diid))
    }

    /// Whether the instruction has been acknowledged.
    pub fn is_completed(&self, rid: &RequestId, diid: DeviceInstructionId) -> bool {
        self.ledger.lock().resolved.contains(&(rid.clone(), diid))
    }

    /// Number of outstanding instructions of a scan.
    pub fn outstanding(&self, rid: &RequestId) -> usize {
        self.ledger
            .lock()
            .outstanding
            .keys()
            .filter(|(r, _)| r == rid)
            .count()
    }

    /// Forget everything about a finished scan.
    pub fn retire(&self, rid: &RequestId) {
        let mut ledger = self.ledger.lock();
        ledger.outstanding.retain(|(r, _), _| r != rid);
        ledger.resolved.retain(|(r, _)| r != rid);
    }
}

/// Receiving side of a registered instruction.
#[derive(Debug)]
pub struct PendingAck {
    rid: RequestId,
    diid: DeviceInstructionId,
    rx: oneshot::Receiver<Resolution>,
}

impl PendingAck {
    /// Request the instruction belongs to.
    pub fn rid(&self) -> &RequestId {
        &self.rid
    }

    /// Instruction id.
    pub fn diid(&self) -> DeviceInstructionId {
        self.diid
    }

    /// Wait for the acknowledgement for at most `timeout`.
    pub async fn wait(self, timeout: Duration) -> Result<Resolution, WaitError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(resolution)) => Ok(resolution),
            Ok(Err(_)) => Err(WaitError::Withdrawn),
            Err(_) => Err(WaitError::TimedOut),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn ack(rid: &RequestId, diid: u64) -> DeviceAck {
        DeviceAck::success(
            rid.clone(),
            DeviceInstructionId(diid),
            "det",
            InstructionAction::Trigger,
        )
    }

    #[tokio::test]
    async fn acknowledgement_resolves_waiter() {
        let correlator = InstructionCorrelator::new();
        let rid = RequestId::new();
        let pending = correlator
            .register(&rid, DeviceInstructionId(0), "det", InstructionAction::Trigger)
            .unwrap();

        assert_eq!(correlator.acknowledge(ack(&rid, 0)), AckOutcome::Resolved);
        let resolution = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert!(resolution.ack.success);
        assert!(correlator.is_completed(&rid, DeviceInstructionId(0)));
    }

    #[test]
    #[traced_test]
    fn duplicates_and_unknowns_are_dropped() {
        let correlator = InstructionCorrelator::new();
        let rid = RequestId::new();
        let _pending = correlator
            .register(&rid, DeviceInstructionId(4), "det", InstructionAction::Trigger)
            .unwrap();

        assert_eq!(correlator.acknowledge(ack(&rid, 4)), AckOutcome::Resolved);
        assert_eq!(correlator.acknowledge(ack(&rid, 4)), AckOutcome::Duplicate);
        assert_eq!(correlator.acknowledge(ack(&rid, 5)), AckOutcome::Unknown);
        assert_eq!(
            correlator.acknowledge(ack(&RequestId::new(), 4)),
            AckOutcome::Unknown
        );
        assert!(logs_contain("duplicate acknowledgement dropped"));
        assert!(logs_contain("acknowledgement for unknown instruction dropped"));
    }

    #[test]
    fn registering_twice_is_an_engine_fault() {
        let correlator = InstructionCorrelator::new();
        let rid = RequestId::new();
        let _first = correlator
            .register(&rid, DeviceInstructionId(1), "samx", InstructionAction::Set)
            .unwrap();
        let second =
            correlator.register(&rid, DeviceInstructionId(1), "samx", InstructionAction::Set);
        assert!(matches!(second, Err(ScanError::EngineFault(_))));
    }

    #[tokio::test]
    async fn withdrawn_instruction_ignores_late_ack() {
        let correlator = InstructionCorrelator::new();
        let rid = RequestId::new();
        let pending = correlator
            .register(&rid, DeviceInstructionId(2), "det", InstructionAction::Trigger)
            .unwrap();

        assert_eq!(
            pending.wait(Duration::from_millis(10)).await.unwrap_err(),
            WaitError::TimedOut
        );
        assert!(correlator.withdraw(&rid, DeviceInstructionId(2)));
        assert_eq!(correlator.acknowledge(ack(&rid, 2)), AckOutcome::Unknown);
    }

    #[test]
    fn retire_forgets_a_scan() {
        let correlator = InstructionCorrelator::new();
        let rid = RequestId::new();
        let _a = correlator
            .register(&rid, DeviceInstructionId(0), "det", InstructionAction::Trigger)
            .unwrap();
        let _b = correlator
            .register(&rid, DeviceInstructionId(1), "det", InstructionAction::Trigger)
            .unwrap();
        correlator.acknowledge(ack(&rid, 0));
        assert_eq!(correlator.outstanding(&rid), 1);

        correlator.retire(&rid);
        assert_eq!(correlator.outstanding(&rid), 0);
        assert!(!correlator.is_completed(&rid, DeviceInstructionId(0)));
    }
}
