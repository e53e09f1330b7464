//! Simulated motor.

use super::common::{CallLog, FaultAction, FaultConfig, HungCalls};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use beamline_core::{
    ConfigKind, ConfigSchema, ConfigUpdate, Device, DeviceStatus, Positioner, Reading, ReadingMap,
    ReadoutPriority, ScanError, SoftLimits,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct MotorState {
    position: f64,
    setpoint: f64,
}

/// Motor with a constant velocity and soft limits.
///
/// A speed of zero makes every move complete immediately.
pub struct SimMotor {
    name: String,
    readout_priority: ReadoutPriority,
    enabled: bool,
    limits: Option<SoftLimits>,
    speed: Mutex<f64>,
    state: Arc<Mutex<MotorState>>,
    staged: Mutex<bool>,
    log: CallLog,
    faults: FaultConfig,
    hung: HungCalls,
}

impl SimMotor {
    /// Motor at position 0 with no limits and instant moves.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            readout_priority: ReadoutPriority::Baseline,
            enabled: true,
            limits: None,
            speed: Mutex::new(0.0),
            state: Arc::new(Mutex::new(MotorState {
                position: 0.0,
                setpoint: 0.0,
            })),
            staged: Mutex::new(false),
            log: CallLog::new(),
            faults: FaultConfig::none(),
            hung: HungCalls::default(),
        }
    }

    /// Set soft limits.
    pub fn with_limits(mut self, low: f64, high: f64) -> Self {
        self.limits = Some(SoftLimits::new(low, high));
        self
    }

    /// Set velocity in units per second.
    pub fn with_speed(self, speed: f64) -> Self {
        *self.speed.lock() = speed.max(0.0);
        self
    }

    /// Set the initial position.
    pub fn with_position(self, position: f64) -> Self {
        *self.state.lock() = MotorState {
            position,
            setpoint: position,
        };
        self
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

    /// Mark the motor as disabled.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Journal of calls on this motor.
    pub fn log(&self) -> &CallLog {
        &self.log
    }

    /// Whether the motor is currently staged.
    pub fn is_staged(&self) -> bool {
        *self.staged.lock()
    }

    fn travel_time(&self, from: f64, to: f64) -> Duration {
        let speed = *self.speed.lock();
        if speed <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((to - from).abs() / speed)
        }
    }
}

#[async_trait]
impl Device for SimMotor {
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
            FaultAction::Hang => stalled().await,
            FaultAction::Proceed | FaultAction::Delay(_) => {}
        }
        let state = *self.state.lock();
        let mut values = ReadingMap::new();
        values.insert(self.name.clone(), Reading::now(state.position));
        values.insert(format!("{}_setpoint", self.name), Reading::now(state.setpoint));
        Ok(values)
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
        ConfigSchema::new().field("speed", ConfigKind::Float)
    }

    async fn configure(&self, update: ConfigUpdate) -> Result<ConfigUpdate> {
        self.config_schema().validate(&self.name, &update)?;
        if let Some(speed) = update.get("speed").and_then(Value::as_f64) {
            *self.speed.lock() = speed.max(0.0);
        }
        let mut current = ConfigUpdate::new();
        current.insert("speed".into(), json!(*self.speed.lock()));
        Ok(current)
    }

    async fn call(&self, method: &str, _args: &[Value]) -> Result<Value> {
        match method {
            "position" => Ok(json!(self.state.lock().position)),
            "speed" => Ok(json!(*self.speed.lock())),
            other => Err(anyhow!("motor '{}' has no method '{}'", self.name, other)),
        }
    }
}

#[async_trait]
impl Positioner for SimMotor {
    async fn move_to(&self, target: f64) -> Result<DeviceStatus> {
        self.log.record(&self.name, "move", Some(target));
        match self.faults.check(&self.name, "move").settle().await {
            FaultAction::Fail(err) => return Err(err),
            FaultAction::Hang => {
                let (notifier, status) = DeviceStatus::pending();
                self.hung.park(notifier);
                return Ok(status);
            }
            FaultAction::Proceed | FaultAction::Delay(_) => {}
        }
        if let Some(limits) = self.limits {
            if !limits.contains(target) {
                return Err(anyhow!(
                    "target {target} of '{}' exceeds hard limits [{}, {}]",
                    self.name,
                    limits.low,
                    limits.high
                ));
            }
        }

        let from = {
            let mut state = self.state.lock();
            state.setpoint = target;
            state.position
        };
        let travel = self.travel_time(from, target);
        let state = Arc::clone(&self.state);
        let log = self.log.clone();
        let name = self.name.clone();
        Ok(DeviceStatus::spawn(async move {
            if !travel.is_zero() {
                tokio::time::sleep(travel).await;
            }
            state.lock().position = target;
            log.record(&name, "move_done", Some(target));
            Ok(())
        }))
    }

    async fn position(&self) -> Result<f64> {
        Ok(self.state.lock().position)
    }

    fn limits(&self) -> Option<SoftLimits> {
        self.limits
    }
}

/// Never resolves. Stands in for a device that stopped answering.
async fn stalled() {
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::common::FaultScenario;

    #[tokio::test]
    async fn move_updates_position() {
        let motor = SimMotor::new("samx").with_speed(1000.0);
        let status = motor.move_to(2.5).await.unwrap();
        status.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(motor.position().await.unwrap(), 2.5);
        assert_eq!(motor.log().values("samx", "move_done"), vec![2.5]);
    }

    #[tokio::test]
    async fn hard_limits_reject_targets() {
        let motor = SimMotor::new("samx").with_limits(-1.0, 1.0);
        assert!(motor.move_to(3.0).await.is_err());
        assert_eq!(motor.position().await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn stage_twice_reports_already_staged() {
        let motor = SimMotor::new("samy");
        motor.stage().await.unwrap();
        let err = motor.stage().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ScanError>(),
            Some(ScanError::AlreadyStaged { .. })
        ));
    }

    #[tokio::test]
    async fn unstage_is_idempotent() {
        let motor = SimMotor::new("samy");
        motor.stage().await.unwrap();
        motor.unstage().await.unwrap();
        motor.unstage().await.unwrap();
        assert!(!motor.is_staged());
    }

    #[tokio::test]
    async fn hung_move_times_out() {
        let motor = SimMotor::new("samx").with_faults(FaultConfig::scenario(FaultScenario::Hang {
            operation: "move",
            times: 1,
        }));
        let status = motor.move_to(1.0).await.unwrap();
        assert!(status.wait(Duration::from_millis(20)).await.is_err());
        let status = motor.move_to(1.0).await.unwrap();
        assert!(status.wait(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn stop_fails_hung_moves_and_abandoned_ones_are_dropped() {
        let motor = SimMotor::new("samx").with_faults(FaultConfig::scenario(FaultScenario::Hang {
            operation: "move",
            times: 3,
        }));
        for _ in 0..2 {
            let abandoned = motor.move_to(1.0).await.unwrap();
            drop(abandoned);
        }
        let waiting = motor.move_to(1.0).await.unwrap();
        assert_eq!(motor.hung.len(), 1);

        motor.stop(false).await.unwrap();
        assert!(motor.hung.is_empty());
        assert!(waiting.wait(Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn delayed_stage_still_stages() {
        let motor = SimMotor::new("samx").with_faults(FaultConfig::scenario(FaultScenario::Delay {
            operation: "stage",
            delay: Duration::from_millis(20),
            times: 1,
        }));
        let started = std::time::Instant::now();
        motor.stage().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(motor.is_staged());
    }

    #[tokio::test]
    async fn configure_rejects_unknown_keys() {
        let motor = SimMotor::new("samx");
        let mut update = ConfigUpdate::new();
        update.insert("acceleration".into(), json!(3.0));
        assert!(motor.configure(update).await.is_err());

        let mut update = ConfigUpdate::new();
        update.insert("speed".into(), json!(3.0));
        let applied = motor.configure(update).await.unwrap();
        assert_eq!(applied["speed"], json!(3.0));
    }
}
