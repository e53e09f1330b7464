//! Simulated signal and detector.
//!
//! A `SimMonitor` reports a noisy scalar. When built as a detector it is also
//! [`Triggerable`]: every trigger "exposes" for the configured time and bumps a
//! frame counter that is part of the reading.

use super::common::{CallLog, FaultAction, FaultConfig, HungCalls};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use beamline_core::{
    ConfigKind, ConfigSchema, ConfigUpdate, Device, DeviceStatus, Reading, ReadingMap,
    ReadoutPriority, ScanError, Triggerable,
};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct MonitorSettings {
    value: f64,
    noise: f64,
    exposure: Duration,
    read_latency: Duration,
}

/// Simulated scalar signal, optionally triggerable.
pub struct SimMonitor {
    name: String,
    readout_priority: ReadoutPriority,
    enabled: bool,
    settings: Mutex<MonitorSettings>,
    frames: Arc<AtomicU64>,
    staged: Mutex<bool>,
    log: CallLog,
    faults: FaultConfig,
    hung: HungCalls,
}

impl SimMonitor {
    /// Monitored signal reading `value` without noise or latency.
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            readout_priority: ReadoutPriority::Monitored,
            enabled: true,
            settings: Mutex::new(MonitorSettings {
                value,
                noise: 0.0,
                exposure: Duration::ZERO,
                read_latency: Duration::ZERO,
            }),
            frames: Arc::new(AtomicU64::new(0)),
            staged: Mutex::new(false),
            log: CallLog::new(),
            faults: FaultConfig::none(),
            hung: HungCalls::default(),
        }
    }

    /// Set the readout priority.
    pub fn with_readout_priority(mut self, priority: ReadoutPriority) -> Self {
        self.readout_priority = priority;
        self
    }

    /// Add uniform noise of the given amplitude to every reading.
    pub fn with_noise(self, amplitude: f64) -> Self {
        self.settings.lock().noise = amplitude.abs();
        self
    }

    /// Time a trigger takes to complete.
    pub fn with_exposure(self, exposure: Duration) -> Self {
        self.settings.lock().exposure = exposure;
        self
    }

    /// Time a read takes to return.
    pub fn with_read_latency(self, latency: Duration) -> Self {
        self.settings.lock().read_latency = latency;
        self
    }

    /// Record calls into a shared journal.
    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }

    /// Inject faults.
    pub fn with_faults(mut self, faults: FaultConfig) -> Self {
        self.faults = faults;
        self
    }

    /// Mark the signal as disabled.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Journal of calls on this device.
    pub fn log(&self) -> &CallLog {
        &self.log
    }

    /// Completed triggers.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }

    fn sample(&self) -> f64 {
        let settings = *self.settings.lock();
        if settings.noise == 0.0 {
            settings.value
        } else {
            settings.value + rand::thread_rng().gen_range(-settings.noise..=settings.noise)
        }
    }
}

#[async_trait]
impl Device for SimMonitor {
    fn name(&self) -> &str {
        &self.name
    }

    fn readout_priority(&self) -> ReadoutPriority {
        self.readout_priority
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    async fn stage(&self) -> Result<Vec<String>> {
        self.log.record(&self.name, "stage", None);
        if let FaultAction::Fail(err) = self.faults.check(&self.name, "stage").settle().await {
            return Err(err);
        }
        let mut staged = self.staged.lock();
        if *staged {
            return Err(ScanError::AlreadyStaged {
                device: self.name.clone(),
                owner: "a previous stage call".into(),
            }
            .into());
        }
        *staged = true;
        Ok(vec![self.name.clone()])
    }

    async fn unstage(&self) -> Result<Vec<String>> {
        self.log.record(&self.name, "unstage", None);
        *self.staged.lock() = false;
        Ok(vec![self.name.clone()])
    }

    async fn read(&self) -> Result<ReadingMap> {
        self.log.record(&self.name, "read", None);
        match self.faults.check(&self.name, "read").settle().await {
            FaultAction::Fail(err) => return Err(err),
            FaultAction::Hang => std::future::pending::<()>().await,
            FaultAction::Proceed | FaultAction::Delay(_) => {}
        }
        let latency = self.settings.lock().read_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut values = ReadingMap::new();
        values.insert(self.name.clone(), Reading::now(self.sample()));
        values.insert(
            format!("{}_frames", self.name),
            Reading::now(self.frames.load(Ordering::SeqCst)),
        );
        self.log.record(&self.name, "read_done", None);
        Ok(values)
    }

    async fn pre_scan(&self) -> Result<()> {
        self.log.record(&self.name, "pre_scan", None);
        match self.faults.check(&self.name, "pre_scan").settle().await {
            FaultAction::Fail(err) => Err(err),
            FaultAction::Hang => std::future::pending().await,
            FaultAction::Proceed | FaultAction::Delay(_) => Ok(()),
        }
    }

    async fn stop(&self, success: bool) -> Result<()> {
        self.log.record(&self.name, "stop", Some(if success { 1.0 } else { 0.0 }));
        let released = self.hung.release(&self.name);
        if released > 0 {
            debug!(device = %self.name, released, "hung calls failed on stop");
        }
        Ok(())
    }

    fn config_schema(&self) -> ConfigSchema {
        ConfigSchema::new()
            .field("value", ConfigKind::Float)
            .field("noise", ConfigKind::Float)
            .field("exposure", ConfigKind::Float)
    }

    async fn configure(&self, update: ConfigUpdate) -> Result<ConfigUpdate> {
        self.config_schema().validate(&self.name, &update)?;
        let mut settings = self.settings.lock();
        if let Some(value) = update.get("value").and_then(Value::as_f64) {
            settings.value = value;
        }
        if let Some(noise) = update.get("noise").and_then(Value::as_f64) {
            settings.noise = noise.abs();
        }
        if let Some(exposure) = update.get("exposure").and_then(Value::as_f64) {
            settings.exposure = Duration::try_from_secs_f64(exposure)
                .map_err(|e| anyhow!("invalid exposure {exposure}: {e}"))?;
        }
        let mut current = ConfigUpdate::new();
        current.insert("value".into(), json!(settings.value));
        current.insert("noise".into(), json!(settings.noise));
        current.insert("exposure".into(), json!(settings.exposure.as_secs_f64()));
        Ok(current)
    }

    async fn call(&self, method: &str, _args: &[Value]) -> Result<Value> {
        match method {
            "frames" => Ok(json!(self.frames())),
            "reset_frames" => {
                self.frames.store(0, Ordering::SeqCst);
                Ok(Value::Null)
            }
            other => Err(anyhow!("device '{}' has no method '{}'", self.name, other)),
        }
    }
}

#[async_trait]
impl Triggerable for SimMonitor {
    async fn trigger(&self) -> Result<DeviceStatus> {
        self.log.record(&self.name, "trigger", None);
        match self.faults.check(&self.name, "trigger").settle().await {
            FaultAction::Fail(err) => return Err(err),
            FaultAction::Hang => {
                let (notifier, status) = DeviceStatus::pending();
                self.hung.park(notifier);
                return Ok(status);
            }
            FaultAction::Proceed | FaultAction::Delay(_) => {}
        }
        let exposure = self.settings.lock().exposure;
        let frames = Arc::clone(&self.frames);
        Ok(DeviceStatus::spawn(async move {
            if !exposure.is_zero() {
                tokio::time::sleep(exposure).await;
            }
            frames.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
    }
}
