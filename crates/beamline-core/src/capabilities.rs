//! Device Capabilities
//!
//! Devices are described by small capability traits instead of one monolithic
//! interface:
//!
//! - every device implements [`Device`] (stage, unstage, read, stop, configure)
//! - a detector adds [`Triggerable`]
//! - a motor adds [`Positioner`]
//! - a fly-scan controller adds [`Flyer`]
//!
//! The capabilities of one instance are collected in [`DeviceComponents`] and
//! queried through the device registry, never by inspecting concrete types.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for driver errors
//!
//! Operations that complete asynchronously on the hardware side return a
//! [`DeviceStatus`]. Issuing the operation and awaiting its completion are
//! separate steps so a scan can issue a batch and join it.

use crate::device_config::{ConfigSchema, ConfigUpdate};
use crate::limits::SoftLimits;
use crate::messages::now_secs;
use crate::readout::ReadoutPriority;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

// =============================================================================
// Readings
// =============================================================================

/// One value of a device signal with the time it was sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Sampled value
    pub value: Value,
    /// Seconds since the Unix epoch
    pub timestamp: f64,
}

impl Reading {
    /// Reading stamped with the current time.
    pub fn now(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            timestamp: now_secs(),
        }
    }

    /// Numeric value, if the reading holds a number.
    pub fn as_f64(&self) -> Option<f64> {
        self.value.as_f64()
    }
}

/// Signal name to reading, as returned by [`Device::read`].
pub type ReadingMap = HashMap<String, Reading>;

// =============================================================================
// Completion Handles
// =============================================================================

/// Why awaiting a [`DeviceStatus`] did not yield success.
#[derive(Debug, Error)]
pub enum StatusError {
    /// The handle did not resolve within the allowed time.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    /// The device reported a failure.
    #[error("{0:#}")]
    Failed(anyhow::Error),
    /// The device dropped the handle without resolving it.
    #[error("completion handle dropped before resolving")]
    Dropped,
}

/// Completion handle of an in-flight device operation.
///
/// Resolves exactly once, to success or to a failure.
pub struct DeviceStatus {
    rx: oneshot::Receiver<Result<()>>,
}

/// Device side of a pending [`DeviceStatus`].
pub struct StatusNotifier {
    tx: oneshot::Sender<Result<()>>,
}

impl StatusNotifier {
    /// Resolve the handle successfully.
    pub fn finish(self) {
        let _ = self.tx.send(Ok(()));
    }

    /// Resolve the handle with a failure.
    pub fn fail(self, err: anyhow::Error) {
        let _ = self.tx.send(Err(err));
    }

    /// Resolve the handle from a result.
    pub fn complete(self, result: Result<()>) {
        let _ = self.tx.send(result);
    }

    /// True once the [`DeviceStatus`] has been dropped; resolving is then moot.
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

impl DeviceStatus {
    /// Unresolved handle plus the notifier that resolves it.
    pub fn pending() -> (StatusNotifier, DeviceStatus) {
        let (tx, rx) = oneshot::channel();
        (StatusNotifier { tx }, DeviceStatus { rx })
    }

    /// Handle that has already succeeded.
    pub fn finished() -> Self {
        let (notifier, status) = Self::pending();
        notifier.finish();
        status
    }

    /// Handle that has already failed.
    pub fn failed(err: anyhow::Error) -> Self {
        let (notifier, status) = Self::pending();
        notifier.fail(err);
        status
    }

    /// Handle resolved by a background task running `fut`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let (notifier, status) = Self::pending();
        tokio::spawn(async move {
            notifier.complete(fut.await);
        });
        status
    }

    /// Await resolution without a deadline.
    pub async fn resolve(self) -> std::result::Result<(), StatusError> {
        match self.rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(StatusError::Failed(err)),
            Err(_) => Err(StatusError::Dropped),
        }
    }

    /// Await resolution for at most `timeout`.
    pub async fn wait(self, timeout: Duration) -> std::result::Result<(), StatusError> {
        match tokio::time::timeout(timeout, self.resolve()).await {
            Ok(result) => result,
            Err(_) => Err(StatusError::TimedOut(timeout)),
        }
    }
}

impl fmt::Debug for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceStatus").finish_non_exhaustive()
    }
}

// =============================================================================
// Capability Traits
// =============================================================================

/// Capability tags, used for reporting and registry queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Readable and stageable. Every device has it.
    Signal,
    /// Corresponds to [`Triggerable`]
    Triggerable,
    /// Corresponds to [`Positioner`]
    Positioner,
    /// Corresponds to [`Flyer`]
    Flyer,
}

impl Capability {
    /// Label used in error messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Signal => "signal",
            Capability::Triggerable => "triggerable",
            Capability::Positioner => "positioner",
            Capability::Flyer => "flyer",
        }
    }
}

/// Base contract every device implements.
///
/// # Contract
///
/// - `stage` prepares the device for a scan and fails if it is already staged.
/// - `unstage` returns the device to idle and is idempotent.
/// - `read` returns the current value of each of the device's signals.
/// - `configure` only ever sees updates validated against `config_schema`.
#[async_trait]
pub trait Device: Send + Sync {
    /// Unique device name.
    fn name(&self) -> &str;

    /// When scans read this device.
    fn readout_priority(&self) -> ReadoutPriority;

    /// Disabled devices are skipped by scans.
    fn enabled(&self) -> bool {
        true
    }

    /// Prepare for acquisition. Returns the names of the staged components.
    async fn stage(&self) -> Result<Vec<String>>;

    /// Return to idle. Returns the names of the unstaged components.
    async fn unstage(&self) -> Result<Vec<String>>;

    /// Read all signals.
    async fn read(&self) -> Result<ReadingMap>;

    /// Hook invoked after staging, right before the acquisition loop.
    async fn pre_scan(&self) -> Result<()> {
        Ok(())
    }

    /// Stop any ongoing activity. `success` is false when a scan was aborted.
    async fn stop(&self, _success: bool) -> Result<()> {
        Ok(())
    }

    /// Keys accepted by [`Device::configure`].
    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::new()
    }

    /// Apply a configuration update and return the resulting settings.
    ///
    /// The default validates the update and applies nothing.
    async fn configure(&self, update: ConfigUpdate) -> Result<ConfigUpdate> {
        self.config_schema().validate(self.name(), &update)?;
        Ok(ConfigUpdate::new())
    }

    /// Invoke a named remote procedure on the device.
    async fn call(&self, method: &str, _args: &[Value]) -> Result<Value> {
        anyhow::bail!("device '{}' has no method '{}'", self.name(), method)
    }
}

/// Devices that acquire on demand (detectors, counters).
///
/// # Contract
///
/// The returned handle resolves when the acquisition has finished and a
/// subsequent `read` returns its data.
#[async_trait]
pub trait Triggerable: Send + Sync {
    /// Start one acquisition.
    async fn trigger(&self) -> Result<DeviceStatus>;
}

/// Devices with a settable position (motors, stages).
///
/// # Contract
///
/// - `move_to` returns once the motion is commanded; the handle resolves when
///   the motor has arrived.
/// - Targets outside the device's own hard limits fail the call or the handle.
#[async_trait]
pub trait Positioner: Send + Sync {
    /// Command a move to an absolute target.
    async fn move_to(&self, target: f64) -> Result<DeviceStatus>;

    /// Current position. May be approximate while moving.
    async fn position(&self) -> Result<f64>;

    /// Soft limits enforced by the engine before any motion.
    fn limits(&self) -> Option<SoftLimits> {
        None
    }
}

/// Progress report of a flyer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlyProgress {
    /// Points acquired so far
    pub value: u64,
    /// Points expected in total
    pub max: u64,
    /// True once the flyer has finished
    pub done: bool,
}

/// Devices that acquire autonomously once started (fly scans).
///
/// # Contract
///
/// - `kickoff`'s handle resolves once acquisition has started.
/// - `complete`'s handle resolves once acquisition has finished.
/// - `progress` may be polled at any time after kickoff.
#[async_trait]
pub trait Flyer: Send + Sync {
    /// Start autonomous acquisition with scan supplied parameters.
    async fn kickoff(&self, params: HashMap<String, Value>) -> Result<DeviceStatus>;

    /// Handle resolving when acquisition has finished.
    async fn complete(&self) -> Result<DeviceStatus>;

    /// Current acquisition progress.
    async fn progress(&self) -> Result<FlyProgress>;
}

// =============================================================================
// Device Components
// =============================================================================

/// Capability set of one device instance.
///
/// Each capability is stored separately so lookups never need downcasting and
/// a device only provides what it actually supports.
#[derive(Clone)]
pub struct DeviceComponents {
    /// Base device contract
    pub device: Arc<dyn Device>,
    /// Trigger support
    pub triggerable: Option<Arc<dyn Triggerable>>,
    /// Motion support
    pub positioner: Option<Arc<dyn Positioner>>,
    /// Fly scan support
    pub flyer: Option<Arc<dyn Flyer>>,
}

impl DeviceComponents {
    /// Components exposing only the base contract.
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            device,
            triggerable: None,
            positioner: None,
            flyer: None,
        }
    }

    /// A motor: base contract plus positioner.
    pub fn motor<T>(device: Arc<T>) -> Self
    where
        T: Device + Positioner + 'static,
    {
        Self::new(device.clone()).with_positioner(device)
    }

    /// A detector: base contract plus trigger.
    pub fn detector<T>(device: Arc<T>) -> Self
    where
        T: Device + Triggerable + 'static,
    {
        Self::new(device.clone()).with_triggerable(device)
    }

    /// A fly-scan controller: base contract plus flyer.
    pub fn flyer<T>(device: Arc<T>) -> Self
    where
        T: Device + Flyer + 'static,
    {
        Self::new(device.clone()).with_flyer(device)
    }

    /// Add trigger support.
    pub fn with_triggerable(mut self, triggerable: Arc<dyn Triggerable>) -> Self {
        self.triggerable = Some(triggerable);
        self
    }

    /// Add motion support.
    pub fn with_positioner(mut self, positioner: Arc<dyn Positioner>) -> Self {
        self.positioner = Some(positioner);
        self
    }

    /// Add fly scan support.
    pub fn with_flyer(mut self, flyer: Arc<dyn Flyer>) -> Self {
        self.flyer = Some(flyer);
        self
    }

    /// Device name.
    pub fn name(&self) -> &str {
        self.device.name()
    }

    /// Capabilities this device supports.
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps = vec![Capability::Signal];
        if self.triggerable.is_some() {
            caps.push(Capability::Triggerable);
        }
        if self.positioner.is_some() {
            caps.push(Capability::Positioner);
        }
        if self.flyer.is_some() {
            caps.push(Capability::Flyer);
        }
        caps
    }
}

impl fmt::Debug for DeviceComponents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceComponents")
            .field("name", &self.name())
            .field("capabilities", &self.capabilities())
            .finish()
    }
}
