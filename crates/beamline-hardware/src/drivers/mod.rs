//! Simulated devices.
//!
//! Drop-in stand-ins for motors, detectors and flyers so the engine can run
//! without hardware. All of them support latency, soft limits where they make
//! sense, fault injection and a shared [`CallLog`] for ordering assertions.

pub mod common;
pub mod sim_flyer;
pub mod sim_monitor;
pub mod sim_motor;

pub use common::{CallLog, FaultAction, FaultConfig, FaultScenario, HungCalls, SimCall};
pub use sim_flyer::SimFlyer;
pub use sim_monitor::SimMonitor;
pub use sim_motor::SimMotor;
