//! Messages published on the bus.
//!
//! Everything an observer can learn about the engine travels as a
//! [`BusMessage`]. Messages emitted on behalf of a scan carry its RID; device
//! traffic additionally carries the DIID of the instruction and readings carry
//! the PointID of the acquisition point.
//!
//! # Message Flow of one step scan
//!
//! ```text
//! ScanRequest ─► RequestResponse
//!                EntryTransition (PENDING)
//!                EntryTransition (ACTIVE)
//!                ReportInstructions
//!                ScanStatus (open)
//!                   │
//!                   ├── DeviceInstruction / DeviceAck (stage, moves, triggers, reads)
//!                   ├── Reading (baseline)
//!                   ├── Reading (primary, point 0..n-1)
//!                   └── Progress
//!                ScanStatus (closed)
//!                EntryTransition (COMPLETED)
//! ```

use crate::capabilities::ReadingMap;
use crate::error::ErrorInfo;
use crate::ids::{DeviceInstructionId, PointId, RequestId};
use crate::request::{ScanCategory, ScanRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current timestamp in nanoseconds since Unix epoch
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// Current timestamp in seconds since Unix epoch
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

// =============================================================================
// State Vocabulary
// =============================================================================

/// Lifecycle state of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Waiting in the queue
    Pending,
    /// Executing
    Active,
    /// Executing, parked at a suspension point
    Paused,
    /// Stopped by a client
    Aborted,
    /// Finished successfully
    Completed,
    /// Stopped by an error
    Failed,
}

impl EntryState {
    /// Whether no further transition can happen.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EntryState::Aborted | EntryState::Completed | EntryState::Failed
        )
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EntryState::Pending => "PENDING",
            EntryState::Active => "ACTIVE",
            EntryState::Paused => "PAUSED",
            EntryState::Aborted => "ABORTED",
            EntryState::Completed => "COMPLETED",
            EntryState::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

/// Status of a whole queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    /// Activates entries as soon as the slot is free
    Running,
    /// Activates nothing; the active scan is parked
    Paused,
    /// Held by at least one lock; activates nothing
    Locked,
}

/// Phase reported in [`ScanStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanPhase {
    /// Scan opened, acquisition ahead
    Open,
    /// Scan finished normally
    Closed,
    /// Scan stopped by abort
    Aborted,
    /// Scan stopped by halt
    Halted,
    /// Scan stopped by an error
    Failed,
}

/// Stream a reading belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadoutStream {
    /// Read once before acquisition
    Baseline,
    /// Read at every acquisition point
    Primary,
    /// Published independently of the scan loop
    Async,
    /// Read on explicit request
    OnRequest,
}

/// Kind of device instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstructionAction {
    /// Move or set a value
    Set,
    /// Read signals
    Read,
    /// Trigger an acquisition
    Trigger,
    /// Stage for a scan
    Stage,
    /// Unstage after a scan
    Unstage,
    /// Pre-scan hook
    PreScan,
    /// Start a flyer
    Kickoff,
    /// Wait for a flyer to finish
    Complete,
    /// Remote procedure call
    Rpc,
    /// Stop ongoing activity
    Stop,
    /// Data produced by the scan itself, published as a reading
    PublishDataAsRead,
}

impl InstructionAction {
    /// Label used in logs and error messages.
    pub fn as_str(self) -> &'static str {
        match self {
            InstructionAction::Set => "set",
            InstructionAction::Read => "read",
            InstructionAction::Trigger => "trigger",
            InstructionAction::Stage => "stage",
            InstructionAction::Unstage => "unstage",
            InstructionAction::PreScan => "pre_scan",
            InstructionAction::Kickoff => "kickoff",
            InstructionAction::Complete => "complete",
            InstructionAction::Rpc => "rpc",
            InstructionAction::Stop => "stop",
            InstructionAction::PublishDataAsRead => "publish_data_as_read",
        }
    }
}

impl fmt::Display for InstructionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How clients should visualize the progress of a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReportInstruction {
    /// Progress counted in acquisition points
    ScanProgress {
        /// Expected number of points
        points: u64,
    },
    /// Progress reported by a device (fly scans)
    DeviceProgress {
        /// Device whose progress is reported
        device: String,
    },
    /// Readback of motors moving from `start` to `end`
    Readback {
        /// Motors being moved
        devices: Vec<String>,
        /// Positions before the move
        start: Vec<f64>,
        /// Targets
        end: Vec<f64>,
    },
}

// =============================================================================
// Message Payloads
// =============================================================================

/// Outcome of a submitted request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestResponse {
    /// RID assigned to an accepted request
    pub rid: Option<RequestId>,
    /// Whether the request entered the queue
    pub accepted: bool,
    /// Rejection reason or confirmation
    pub message: String,
    /// Queue the request targeted
    pub queue: String,
    /// Client metadata of the request, echoed back
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

/// Snapshot of one queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Queue name
    pub queue: String,
    /// Queue status
    pub state: QueueState,
    /// Entry holding the execution slot
    pub active: Option<RequestId>,
    /// Pending entries in activation order
    pub pending: Vec<RequestId>,
    /// Lock id to reason
    pub locks: BTreeMap<String, String>,
}

/// A queue entry changed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryTransition {
    /// Entry RID
    pub rid: RequestId,
    /// Queue name
    pub queue: String,
    /// Previous state, absent for a fresh entry
    pub from: Option<EntryState>,
    /// New state
    pub to: EntryState,
    /// Error attached to FAILED entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// Nanoseconds since Unix epoch
    pub timestamp_ns: u64,
}

/// Scan metadata, published when a scan opens and when it closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanStatus {
    /// Scan RID
    pub rid: RequestId,
    /// Scan type name
    pub scan_type: String,
    /// Step or fly
    pub category: ScanCategory,
    /// Lifecycle phase
    pub phase: ScanPhase,
    /// Number of acquisition points (emitted so far when closing)
    pub num_points: u64,
    /// Motors driven by the scan
    pub scan_motors: Vec<String>,
    /// Readout priority label to participating devices
    pub readout_priority: BTreeMap<String, Vec<String>>,
    /// What paces readout: a flyer name, "self" or "scan"
    pub monitor_sync: String,
    /// Engine-wide scan number; none for plain moves
    #[serde(default)]
    pub scan_number: Option<u64>,
    /// Client metadata of the request
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    /// Nanoseconds since Unix epoch
    pub timestamp_ns: u64,
}

/// Report instructions of a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportInstructions {
    /// Scan RID
    pub rid: RequestId,
    /// Instructions for progress reporting
    pub instructions: Vec<ReportInstruction>,
}

/// An instruction sent to a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInstruction {
    /// Scan RID
    pub rid: RequestId,
    /// Instruction id, unique within the scan
    pub diid: DeviceInstructionId,
    /// Target device
    pub device: String,
    /// What to do
    pub action: InstructionAction,
    /// Action parameter (target value, rpc call, ...)
    #[serde(default)]
    pub parameter: Value,
    /// Acquisition point the instruction belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub point_id: Option<PointId>,
}

/// Acknowledgement that a device instruction has finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceAck {
    /// Scan RID
    pub rid: RequestId,
    /// Instruction being acknowledged
    pub diid: DeviceInstructionId,
    /// Device that executed the instruction
    pub device: String,
    /// Instruction kind
    pub action: InstructionAction,
    /// Whether the instruction succeeded
    pub success: bool,
    /// Failure description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Nanoseconds since Unix epoch
    pub timestamp_ns: u64,
}

impl DeviceAck {
    /// Successful acknowledgement.
    pub fn success(
        rid: RequestId,
        diid: DeviceInstructionId,
        device: impl Into<String>,
        action: InstructionAction,
    ) -> Self {
        Self {
            rid,
            diid,
            device: device.into(),
            action,
            success: true,
            error: None,
            timestamp_ns: now_ns(),
        }
    }

    /// Failed acknowledgement.
    pub fn failure(
        rid: RequestId,
        diid: DeviceInstructionId,
        device: impl Into<String>,
        action: InstructionAction,
        error: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::success(rid, diid, device, action)
        }
    }
}

/// Readings of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingUpdate {
    /// Scan RID
    pub rid: RequestId,
    /// Read instruction that produced the data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diid: Option<DeviceInstructionId>,
    /// Acquisition point, absent for baseline readings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub point_id: Option<PointId>,
    /// Stream the readings belong to
    pub stream: ReadoutStream,
    /// Device that was read
    pub device: String,
    /// Signal values
    pub values: ReadingMap,
}

/// Acquisition progress of a scan or a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Scan RID
    pub rid: RequestId,
    /// Reporting device, absent for scan progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// Points done
    pub value: u64,
    /// Points expected
    pub max: u64,
    /// True once acquisition has finished
    pub done: bool,
}

// =============================================================================
// Bus Message
// =============================================================================

/// Message types carried by the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    /// A client submits a scan
    ScanRequest(ScanRequest),
    /// Accept or reject a submission
    RequestResponse(RequestResponse),
    /// Queue snapshot
    QueueStatus(QueueStatus),
    /// Queue entry state change
    EntryTransition(EntryTransition),
    /// Scan opened or closed
    ScanStatus(ScanStatus),
    /// Progress reporting hints
    ReportInstructions(ReportInstructions),
    /// RID/DIID pairing of an instruction
    DeviceInstruction(DeviceInstruction),
    /// Completion of an instruction
    DeviceAck(DeviceAck),
    /// Device readings
    Reading(ReadingUpdate),
    /// Acquisition progress
    Progress(ProgressUpdate),
}

impl BusMessage {
    /// RID of the scan this message belongs to, if any.
    pub fn rid(&self) -> Option<&RequestId> {
        match self {
            BusMessage::ScanRequest(_) | BusMessage::QueueStatus(_) => None,
            BusMessage::RequestResponse(m) => m.rid.as_ref(),
            BusMessage::EntryTransition(m) => Some(&m.rid),
            BusMessage::ScanStatus(m) => Some(&m.rid),
            BusMessage::ReportInstructions(m) => Some(&m.rid),
            BusMessage::DeviceInstruction(m) => Some(&m.rid),
            BusMessage::DeviceAck(m) => Some(&m.rid),
            BusMessage::Reading(m) => Some(&m.rid),
            BusMessage::Progress(m) => Some(&m.rid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::Reading;

    #[test]
    fn terminal_entry_states() {
        assert!(EntryState::Completed.is_terminal());
        assert!(EntryState::Aborted.is_terminal());
        assert!(EntryState::Failed.is_terminal());
        assert!(!EntryState::Paused.is_terminal());
        assert!(!EntryState::Pending.is_terminal());
    }

    #[test]
    fn messages_are_tagged_by_type() {
        let rid = RequestId::from("r1");
        let ack = BusMessage::DeviceAck(DeviceAck::success(
            rid.clone(),
            DeviceInstructionId(3),
            "det",
            InstructionAction::Trigger,
        ));
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(json["type"], "device_ack");
        assert_eq!(json["diid"], 3);
        assert_eq!(ack.rid(), Some(&rid));

        let back: BusMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, ack);
    }

    #[test]
    fn readings_carry_point_ids() {
        let mut values = ReadingMap::new();
        values.insert("det".into(), Reading::now(1.5));
        let msg = BusMessage::Reading(ReadingUpdate {
            rid: RequestId::from("r2"),
            diid: Some(DeviceInstructionId(7)),
            point_id: Some(PointId(2)),
            stream: ReadoutStream::Primary,
            device: "det".into(),
            values,
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["point_id"], 2);
        assert_eq!(json["stream"], "primary");
    }

    #[test]
    fn failure_ack_keeps_error_text() {
        let ack = DeviceAck::failure(
            RequestId::from("r3"),
            DeviceInstructionId(0),
            "samx",
            InstructionAction::Set,
            "limit switch",
        );
        assert!(!ack.success);
        assert_eq!(ack.error.as_deref(), Some("limit switch"));
    }
}
