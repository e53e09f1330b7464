//! Simulated fly-scan controller.
//!
//! After kickoff the flyer acquires `num_points` points on its own clock, one
//! every `point_time`. Progress is published through a watch channel so
//! `complete` can resolve without polling.

use super::common::{CallLog, FaultAction, FaultConfig};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use beamline_core::{
    Device, DeviceStatus, FlyProgress, Flyer, Reading, ReadingMap, ReadoutPriority, ScanError,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

const DEFAULT_POINTS: u64 = 10;

/// Simulated flyer.
pub struct SimFlyer {
    name: String,
    readout_priority: ReadoutPriority,
    enabled: bool,
    point_time: Duration,
    progress: watch::Sender<FlyProgress>,
    acquisition: Mutex<Option<JoinHandle<()>>>,
    staged: Mutex<bool>,
    log: CallLog,
    faults: FaultConfig,
}

impl SimFlyer {
    /// Flyer acquiring one point every `point_time`.
    pub fn new(name: impl Into<String>, point_time: Duration) -> Self {
        let (progress, _) = watch::channel(FlyProgress {
            value: 0,
            max: 0,
            done: false,
        });
        Self {
            name: name.into(),
            readout_priority: ReadoutPriority::Async,
            enabled: true,
            point_time,
            progress,
            acquisition: Mutex::new(None),
            staged: Mutex::new(false),
            log: CallLog::new(),
            faults: FaultConfig::none(),
        }
    }

    /// Set the readout priority.
    pub fn with_readout_priority(mut self, priority: ReadoutPriority) -> Self {
        self.readout_priority = priority;
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

    /// Journal of calls on this device.
    pub fn log(&self) -> &CallLog {
        &self.log
    }

    fn abort_acquisition(&self) {
        if let Some(handle) = self.acquisition.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Device for SimFlyer {
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
        self.abort_acquisition();
        *self.staged.lock() = false;
        Ok(vec![self.name.clone()])
    }

    async fn read(&self) -> Result<ReadingMap> {
        let progress = *self.progress.borrow();
        let mut values = ReadingMap::new();
        values.insert(format!("{}_count", self.name), Reading::now(progress.value));
        Ok(values)
    }

    async fn stop(&self, success: bool) -> Result<()> {
        self.log.record(&self.name, "stop", Some(if success { 1.0 } else { 0.0 }));
        self.abort_acquisition();
        self.progress.send_modify(|p| p.done = true);
        Ok(())
    }
}

#[async_trait]
impl Flyer for SimFlyer {
    async fn kickoff(&self, params: HashMap<String, Value>) -> Result<DeviceStatus> {
        self.log.record(&self.name, "kickoff", None);
        if let FaultAction::Fail(err) = self.faults.check(&self.name, "kickoff").settle().await {
            return Err(err);
        }
        let num_points = params
            .get("num_points")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_POINTS);
        let point_time = match params.get("exp_time").and_then(Value::as_f64) {
            Some(secs) => Duration::try_from_secs_f64(secs)
                .map_err(|e| anyhow!("invalid exp_time {secs}: {e}"))?,
            None => self.point_time,
        };

        self.abort_acquisition();
        self.progress.send_replace(FlyProgress {
            value: 0,
            max: num_points,
            done: num_points == 0,
        });
        debug!(device = %self.name, num_points, ?point_time, "flyer kicked off");

        let progress = self.progress.clone();
        let handle = tokio::spawn(async move {
            for _ in 0..num_points {
                tokio::time::sleep(point_time).await;
                progress.send_modify(|p| p.value += 1);
            }
            progress.send_modify(|p| p.done = true);
        });
        *self.acquisition.lock() = Some(handle);
        Ok(DeviceStatus::finished())
    }

    async fn complete(&self) -> Result<DeviceStatus> {
        self.log.record(&self.name, "complete", None);
        if let FaultAction::Fail(err) = self.faults.check(&self.name, "complete").settle().await {
            return Err(err);
        }
        let mut rx = self.progress.subscribe();
        Ok(DeviceStatus::spawn(async move {
            rx.wait_for(|p| p.done)
                .await
                .map(|_| ())
                .map_err(|_| anyhow!("flyer shut down before completing"))
        }))
    }

    async fn progress(&self) -> Result<FlyProgress> {
        Ok(*self.progress.borrow())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn acquires_requested_points() {
        let flyer = SimFlyer::new("flyer1", Duration::from_millis(1));
        let mut params = HashMap::new();
        params.insert("num_points".to_string(), json!(5));
        flyer
            .kickoff(params)
            .await
            .unwrap()
            .wait(Duration::from_secs(1))
            .await
            .unwrap();
        flyer
            .complete()
            .await
            .unwrap()
            .wait(Duration::from_secs(2))
            .await
            .unwrap();

        let progress = flyer.progress().await.unwrap();
        assert_eq!(progress.value, 5);
        assert_eq!(progress.max, 5);
        assert!(progress.done);
    }

    #[tokio::test]
    async fn stop_finishes_acquisition() {
        let flyer = SimFlyer::new("flyer1", Duration::from_secs(10));
        flyer.kickoff(HashMap::new()).await.unwrap();
        let complete = flyer.complete().await.unwrap();
        flyer.stop(false).await.unwrap();
        assert!(complete.wait(Duration::from_secs(1)).await.is_ok());
        assert!(flyer.progress().await.unwrap().value < DEFAULT_POINTS);
    }
}
