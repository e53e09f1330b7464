//! Identifiers that tie asynchronous traffic back to the scan that caused it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Request identifier (RID), assigned once when a request is accepted.
///
/// Every message emitted on behalf of a scan carries its RID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh UUIDv4 RID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The RID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Device instruction identifier (DIID), unique within one scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceInstructionId(pub u64);

impl fmt::Display for DeviceInstructionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Acquisition point identifier, starting at 0 for every scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PointId(pub u64);

impl PointId {
    /// Numeric value of the point.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic DIID source for a single scan.
///
/// Shared by every stub call of the scan, so it hands out ids through `&self`.
#[derive(Debug, Default)]
pub struct InstructionCounter {
    next: AtomicU64,
}

impl InstructionCounter {
    /// Counter starting at DIID 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next DIID.
    pub fn next_id(&self) -> DeviceInstructionId {
        DeviceInstructionId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of DIIDs handed out so far.
    pub fn issued(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

/// PointID sequence of a single scan. Never skips or reuses a value.
#[derive(Debug, Default)]
pub struct PointCounter {
    next: u64,
}

impl PointCounter {
    /// Counter whose first point is 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the next point id.
    pub fn advance(&mut self) -> PointId {
        let id = PointId(self.next);
        self.next += 1;
        id
    }

    /// Number of points emitted so far.
    pub fn emitted(&self) -> u64 {
        self.next
    }
}
