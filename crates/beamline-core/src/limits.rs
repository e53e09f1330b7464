//! Soft limits and the engine's default timeouts.
//!
//! This module centralizes:
//! - Timeout durations for device calls awaited by the stub layer
//! - Size ceilings for scans and retained bus streams
//! - Soft limit ranges checked before any motion is commanded

use crate::error::{ScanError, ScanResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// =============================================================================
// Timeout Constants
// =============================================================================

/// Default timeout for a single device completion handle (10 seconds).
///
/// Applies to moves, triggers, reads, kickoff and RPC calls unless the
/// engine configuration overrides it.
pub const DEVICE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for stage and unstage calls (30 seconds).
pub const STAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for a flyer's `complete` handle (10 minutes).
///
/// Fly scans may legitimately run for a long time, but the await is still
/// bounded.
pub const COMPLETE_TIMEOUT: Duration = Duration::from_secs(600);

/// Default interval at which fly scans poll flyer progress (100 ms).
pub const FLY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Delay before a timed out move or read is retried (50 ms).
pub const RETRY_BACKOFF: Duration = Duration::from_millis(50);

// =============================================================================
// Size Constants
// =============================================================================

/// Default ceiling on the acquisition points of one scan.
///
/// Position tables are built in memory, so larger requests are rejected
/// before they reach a queue.
pub const MAX_POINTS: u64 = 1_000_000;

/// Default number of streams an in-process bus keeps before dropping the oldest.
pub const STREAM_RETENTION: usize = 256;

// =============================================================================
// Soft Limits
// =============================================================================

/// Allowed position range of a motor, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SoftLimits {
    /// Lower bound
    pub low: f64,
    /// Upper bound
    pub high: f64,
}

impl SoftLimits {
    /// Build limits, swapping the bounds if given in reverse order.
    pub fn new(a: f64, b: f64) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    /// True if `position` lies within the range.
    pub fn contains(&self, position: f64) -> bool {
        position >= self.low && position <= self.high
    }

    /// Validate a target position for `device`.
    ///
    /// # Errors
    ///
    /// Returns `LimitExceeded` if the position lies outside the range or is NaN.
    pub fn check(&self, device: &str, position: f64) -> ScanResult<()> {
        if self.contains(position) {
            Ok(())
        } else {
            Err(ScanError::LimitExceeded {
                device: device.to_string(),
                position,
                low: self.low,
                high: self.high,
            })
        }
    }
}
