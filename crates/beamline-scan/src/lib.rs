//! Scan orchestration for the beamline scan engine.
//!
//! Requests enter named queues, each queue runs one scan at a time, and each
//! scan drives its devices through a fixed lifecycle with guaranteed unwind.
//!
//! # Architecture
//!
//! - **Queues** ([`QueueManager`]): pending/active entries, pause, deferred
//!   pause, abort, halt, restart, reorder, locks and history; activated scans
//!   are numbered by [`ScanNumbers`]
//! - **Scans** ([`Scan`], [`ScanCatalogue`]): step and fly scan types, run by
//!   [`run_scan`] under a [`ScanStateMachine`]
//! - **Stubs** ([`ScanStubs`]): every device instruction a scan issues, with
//!   timeouts, retries and bus traffic
//! - **Correlator** ([`InstructionCorrelator`]): matches asynchronous
//!   acknowledgements to the instruction that caused them
//!
//! # Example
//!
//! ```rust,ignore
//! let server = ScanServer::new(registry, bus, EngineConfig::default());
//! server.start()?;
//!
//! let rid = server.submit(
//!     ScanRequest::new("grid_scan")
//!         .arg("samx").arg(-1.0).arg(1.0).arg(3)
//!         .arg("samy").arg(-1.0).arg(1.0).arg(3),
//! )?;
//! server.queues().pause("primary")?;
//! server.queues().resume("primary")?;
//! server.queues().wait_for(&rid).await?;
//! ```

pub mod context;
pub mod control;
pub mod correlator;
pub mod numbering;
pub mod positions;
pub mod queue;
pub mod runner;
pub mod scan;
pub mod scans;
pub mod server;
pub mod state;
pub mod stubs;

pub use context::EngineContext;
pub use control::{ScanControl, StopKind};
pub use correlator::{AckOutcome, AckPayload, InstructionCorrelator, PendingAck, Resolution};
pub use numbering::ScanNumbers;
pub use positions::{linspace, ScanPositions};
pub use queue::{OrderAction, QueueEntry, QueueManager};
pub use runner::{run_scan, ScanOutcome, ScanReport};
pub use scan::{step_scan_core, Scan, ScanContext, ScanSettings};
pub use scans::{ScanBuilder, ScanCatalogue};
pub use server::ScanServer;
pub use state::{ScanState, ScanStateMachine};
pub use stubs::{PendingInstruction, PendingReads, ScanStubs, StubSettings, StubWiring};
