//! Error type of the scan engine.
//!
//! `ScanError` is the single error enum that flows through the queue manager,
//! the scan lifecycle and the stub layer. Device drivers report failures as
//! `anyhow::Error`; the stub layer wraps them into [`ScanError::DeviceError`]
//! with the device name and the operation attached, unless the driver already
//! returned a `ScanError` (for example `AlreadyStaged`), which is passed
//! through unchanged.
//!
//! ## Error Categories
//!
//! 1. **Request Errors** - `InvalidRequest`, `LimitExceeded`, `UnknownDevice`,
//!    `MissingCapability`, `InvalidConfig`
//!    - Detected before any motion is commanded
//!    - Recovery: fix the request or configuration and resubmit
//!
//! 2. **Device Errors** - `AlreadyStaged`, `DeviceTimeout`, `DeviceError`
//!    - Occur while a scan drives hardware
//!    - Only `DeviceTimeout` is retried (once) by the stub layer
//!
//! 3. **Control Flow** - `Cancelled`, `EngineFault`
//!    - `Cancelled` marks a cooperative abort, never a failure
//!    - `EngineFault` is an internal invariant violation

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Primary error type of the scan engine.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScanError {
    /// Request failed validation against the scan type's schema.
    ///
    /// Also used for queue operations naming an unknown RID or a reorder that
    /// is not a permutation of the pending entries.
    #[error("Invalid scan request: {0}")]
    InvalidRequest(String),

    /// A computed position lies outside a motor's soft limits.
    ///
    /// Raised while preparing positions, before any motion is commanded.
    #[error("Position {position} of '{device}' is outside soft limits [{low}, {high}]")]
    LimitExceeded {
        /// Motor name
        device: String,
        /// Offending target
        position: f64,
        /// Lower soft limit
        low: f64,
        /// Upper soft limit
        high: f64,
    },

    /// Device is already claimed by a staging scan.
    #[error("Device '{device}' is already staged by {owner}")]
    AlreadyStaged {
        /// Device name
        device: String,
        /// RID of the scan holding the device, or a driver supplied label
        owner: String,
    },

    /// A completion handle did not resolve in time.
    #[error("Device '{device}' timed out after {timeout:?} during {operation}")]
    DeviceTimeout {
        /// Device name
        device: String,
        /// Operation that was awaited
        operation: String,
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// A device operation completed with a failure.
    #[error("Device '{device}' failed during {operation}: {message}")]
    DeviceError {
        /// Device name
        device: String,
        /// Operation that failed
        operation: String,
        /// Driver supplied failure description
        message: String,
    },

    /// Cooperative cancellation (abort or halt) was observed.
    #[error("Scan cancelled: {reason}")]
    Cancelled {
        /// Why the scan stopped
        reason: String,
    },

    /// Internal invariant violated (illegal state transition, DIID collision).
    #[error("Engine fault: {0}")]
    EngineFault(String),

    /// No device with this name is registered.
    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    /// The device exists but lacks the capability the scan needs.
    #[error("Device '{device}' does not provide the {capability} capability")]
    MissingCapability {
        /// Device name
        device: String,
        /// Capability that was requested
        capability: &'static str,
    },

    /// Configuration rejected by a device schema or the engine settings.
    #[error("Invalid configuration for '{target}': {message}")]
    InvalidConfig {
        /// Device or section that rejected the configuration
        target: String,
        /// Validation failure
        message: String,
    },
}

impl ScanError {
    /// Build a `DeviceError` from a driver failure.
    ///
    /// A `ScanError` carried inside the `anyhow::Error` is returned as is so
    /// drivers can report engine level conditions such as `AlreadyStaged`.
    pub fn from_device(device: &str, operation: &str, err: anyhow::Error) -> Self {
        match err.downcast::<ScanError>() {
            Ok(scan_err) => scan_err,
            Err(other) => ScanError::DeviceError {
                device: device.to_string(),
                operation: operation.to_string(),
                message: format!("{other:#}"),
            },
        }
    }

    /// Shorthand for a cancellation with a reason.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        ScanError::Cancelled {
            reason: reason.into(),
        }
    }

    /// Serializable classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScanError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            ScanError::LimitExceeded { .. } => ErrorKind::LimitExceeded,
            ScanError::AlreadyStaged { .. } => ErrorKind::AlreadyStaged,
            ScanError::DeviceTimeout { .. } => ErrorKind::DeviceTimeout,
            ScanError::DeviceError { .. } => ErrorKind::DeviceError,
            ScanError::Cancelled { .. } => ErrorKind::Cancelled,
            ScanError::EngineFault(_) => ErrorKind::EngineFault,
            ScanError::UnknownDevice(_) => ErrorKind::UnknownDevice,
            ScanError::MissingCapability { .. } => ErrorKind::MissingCapability,
            ScanError::InvalidConfig { .. } => ErrorKind::InvalidConfig,
        }
    }

    /// Whether the stub layer may retry the failed call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ScanError::DeviceTimeout { .. })
    }

    /// Whether this error represents a cooperative abort.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ScanError::Cancelled { .. })
    }

    /// Device the error refers to, when there is one.
    pub fn device(&self) -> Option<&str> {
        match self {
            ScanError::LimitExceeded { device, .. }
            | ScanError::AlreadyStaged { device, .. }
            | ScanError::DeviceTimeout { device, .. }
            | ScanError::DeviceError { device, .. }
            | ScanError::MissingCapability { device, .. } => Some(device),
            ScanError::UnknownDevice(device) => Some(device),
            _ => None,
        }
    }
}

/// Serializable error classification attached to FAILED queue entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`ScanError::InvalidRequest`]
    InvalidRequest,
    /// See [`ScanError::LimitExceeded`]
    LimitExceeded,
    /// See [`ScanError::AlreadyStaged`]
    AlreadyStaged,
    /// See [`ScanError::DeviceTimeout`]
    DeviceTimeout,
    /// See [`ScanError::DeviceError`]
    DeviceError,
    /// See [`ScanError::Cancelled`]
    Cancelled,
    /// See [`ScanError::EngineFault`]
    EngineFault,
    /// See [`ScanError::UnknownDevice`]
    UnknownDevice,
    /// See [`ScanError::MissingCapability`]
    MissingCapability,
    /// See [`ScanError::InvalidConfig`]
    InvalidConfig,
}

/// Error summary as published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Classification
    pub kind: ErrorKind,
    /// Human readable message
    pub message: String,
    /// Device involved, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl From<&ScanError> for ErrorInfo {
    fn from(err: &ScanError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            device: err.device().map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeouts_are_retryable() {
        let timeout = ScanError::DeviceTimeout {
            device: "samx".into(),
            operation: "move".into(),
            timeout: Duration::from_secs(1),
        };
        assert!(timeout.is_retryable());
        assert!(!ScanError::EngineFault("x".into()).is_retryable());
        assert!(!ScanError::cancelled("abort").is_retryable());
    }

    #[test]
    fn driver_scan_errors_pass_through() {
        let err = anyhow::Error::new(ScanError::AlreadyStaged {
            device: "samx".into(),
            owner: "driver".into(),
        });
        let mapped = ScanError::from_device("samx", "stage", err);
        assert_eq!(mapped.kind(), ErrorKind::AlreadyStaged);
    }

    #[test]
    fn driver_failures_become_device_errors() {
        let mapped = ScanError::from_device("det", "trigger", anyhow::anyhow!("shutter jammed"));
        match mapped {
            ScanError::DeviceError {
                device,
                operation,
                message,
            } => {
                assert_eq!(device, "det");
                assert_eq!(operation, "trigger");
                assert!(message.contains("shutter jammed"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn error_info_serializes_kind_in_snake_case() {
        let err = ScanError::LimitExceeded {
            device: "samx".into(),
            position: 60.0,
            low: -50.0,
            high: 50.0,
        };
        let info = ErrorInfo::from(&err);
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["kind"], "limit_exceeded");
        assert_eq!(json["device"], "samx");
    }
}
