//! `beamline-core`
//!
//! Shared vocabulary of the beamline scan engine: identifiers, errors,
//! device capability traits, scan requests and their schemas, bus messages
//! and the message bus abstraction.
//!
//! ## Key Types
//!
//! - [`ScanRequest`]: immutable description of a scan submitted by a client
//! - [`ScanError`]: the engine error type, mapped to a serializable [`ErrorKind`]
//! - [`DeviceComponents`]: the capability set of one device instance
//! - [`DeviceStatus`]: completion handle of an in-flight device operation
//! - [`BusMessage`] / [`MessageBus`]: everything observers can see
//!
//! Identifiers follow a three level model. A [`RequestId`] tags every
//! message of one scan, a [`DeviceInstructionId`] tags one device instruction
//! inside that scan and a [`PointId`] tags every reading of one acquisition
//! point.

pub mod bus;
pub mod capabilities;
pub mod config;
pub mod device_config;
pub mod error;
pub mod ids;
pub mod limits;
pub mod messages;
pub mod readout;
pub mod request;
pub mod retry;

pub use bus::{readings_stream, LocalBus, MessageBus, Topic};
pub use capabilities::{
    Capability, Device, DeviceComponents, DeviceStatus, FlyProgress, Flyer, Positioner, Reading,
    ReadingMap, StatusError, StatusNotifier, Triggerable,
};
pub use config::{ConfigError, EngineConfig, LogConfig};
pub use device_config::{ConfigKind, ConfigSchema, ConfigUpdate};
pub use error::{ErrorInfo, ErrorKind, ScanError, ScanResult};
pub use ids::{DeviceInstructionId, InstructionCounter, PointCounter, PointId, RequestId};
pub use limits::{SoftLimits, MAX_POINTS, STREAM_RETENTION};
pub use messages::{
    now_ns, now_secs, BusMessage, DeviceAck, DeviceInstruction, EntryState, EntryTransition,
    InstructionAction, ProgressUpdate, QueueState, QueueStatus, ReadingUpdate, ReadoutStream,
    ReportInstruction, ReportInstructions, RequestResponse, ScanPhase, ScanStatus,
};
pub use readout::ReadoutPriority;
pub use request::{ArgType, BundleSize, ScanCategory, ScanRequest, ScanSchema, DEFAULT_QUEUE};
pub use retry::{retry_on_timeout, RetryPolicy};
