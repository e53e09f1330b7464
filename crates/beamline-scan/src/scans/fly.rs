//! Fly scans: a flyer acquires on its own clock while the engine reads the
//! monitored devices alongside.
//!
//! - [`FlyScan`] paces readout by the flyer: one monitored readout per
//!   point the flyer reports.
//! - [`TimedFlyScan`] paces readout by the engine: one monitored readout per
//!   interval until the flyer is done.

use super::{arg_device, kwarg_count, ScanBuilder};
use crate::positions::ScanPositions;
use crate::scan::{Scan, ScanContext};
use async_trait::async_trait;
use beamline_core::{
    ArgType, ReadoutPriority, ReadoutStream, ReportInstruction, ScanCategory, ScanError,
    ScanRequest, ScanResult, ScanSchema,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

struct FlyParams {
    flyer: Vec<String>,
    num_points: u64,
    exp_time: Option<f64>,
}

impl FlyParams {
    fn parse(request: &ScanRequest) -> ScanResult<Self> {
        let flyer = request
            .args
            .first()
            .map(arg_device)
            .transpose()?
            .ok_or_else(|| ScanError::InvalidRequest("a fly scan needs a flyer".into()))?;
        let num_points = kwarg_count(request, "num_points")? as u64;
        if num_points == 0 {
            return Err(ScanError::InvalidRequest(
                "num_points must be at least 1".into(),
            ));
        }
        let exp_time = request.kwargs.get("exp_time").and_then(Value::as_f64);
        if matches!(exp_time, Some(t) if !(t > 0.0)) {
            return Err(ScanError::InvalidRequest("exp_time must be positive".into()));
        }
        Ok(Self {
            flyer: vec![flyer],
            num_points,
            exp_time,
        })
    }

    fn name(&self) -> &str {
        &self.flyer[0]
    }

    fn kickoff_params(&self) -> HashMap<String, Value> {
        let mut params = HashMap::from([("num_points".to_string(), json!(self.num_points))]);
        if let Some(exp_time) = self.exp_time {
            params.insert("exp_time".to_string(), json!(exp_time));
        }
        params
    }

    fn schema(scan_type: &str) -> ScanSchema {
        ScanSchema::new(scan_type, ScanCategory::Fly)
            .bundle(vec![ArgType::Device], 1, Some(1))
            .required("num_points", ArgType::Int)
            .optional("exp_time", ArgType::Float)
    }

    /// Flyer plus the monitored devices, read together at every point.
    fn readout(&self, ctx: &ScanContext) -> Vec<String> {
        let mut devices = self.flyer.clone();
        devices.extend(ctx.devices_with_priority(ReadoutPriority::Monitored, &self.flyer));
        devices
    }

    fn check_flyer(&self, ctx: &ScanContext) -> ScanResult<()> {
        ctx.registry.flyer(self.name()).map(|_| ())
    }
}

// =============================================================================
// Flyer-paced
// =============================================================================

/// `fly_scan flyer1 num_points=100 exp_time=0.01`
pub struct FlyScan {
    params: FlyParams,
    positions: ScanPositions,
}

/// Builds [`FlyScan`]s.
pub struct FlyScanBuilder;

impl ScanBuilder for FlyScanBuilder {
    fn schema(&self) -> ScanSchema {
        FlyParams::schema("fly_scan")
    }

    fn build(&self, request: &ScanRequest) -> ScanResult<Box<dyn Scan>> {
        Ok(Box::new(FlyScan {
            params: FlyParams::parse(request)?,
            positions: ScanPositions::default(),
        }))
    }
}

#[async_trait]
impl Scan for FlyScan {
    fn scan_type(&self) -> &str {
        "fly_scan"
    }

    fn category(&self) -> ScanCategory {
        ScanCategory::Fly
    }

    fn scan_motors(&self) -> &[String] {
        &[]
    }

    fn positions(&self) -> &ScanPositions {
        &self.positions
    }

    fn num_points(&self) -> u64 {
        self.params.num_points
    }

    fn flyers(&self) -> &[String] {
        &self.params.flyer
    }

    fn monitor_sync(&self) -> String {
        self.params.name().to_string()
    }

    fn report_instructions(&self) -> Vec<ReportInstruction> {
        vec![ReportInstruction::DeviceProgress {
            device: self.params.name().to_string(),
        }]
    }

    async fn prepare_positions(&mut self, ctx: &mut ScanContext) -> ScanResult<()> {
        self.params.check_flyer(ctx)
    }

    async fn scan_core(&mut self, ctx: &mut ScanContext) -> ScanResult<()> {
        let flyer = self.params.name().to_string();
        let readout = self.params.readout(ctx);
        ctx.stubs
            .kickoff(&flyer, self.params.kickoff_params())
            .await?;

        let mut read = 0;
        loop {
            let progress = ctx.stubs.device_progress(&flyer).await?;
            while read < progress.value {
                let point_id = ctx.next_point();
                ctx.stubs
                    .read_and_wait(&readout, Some(point_id), ReadoutStream::Primary)
                    .await?;
                read += 1;
            }
            if progress.done {
                debug!(flyer = %flyer, points = read, "flyer finished");
                return Ok(());
            }
            ctx.stubs.wait(ctx.settings.fly_poll_interval).await?;
        }
    }
}

// =============================================================================
// Engine-paced
// =============================================================================

/// `timed_fly_scan flyer1 num_points=100 readout_interval=0.05`
pub struct TimedFlyScan {
    params: FlyParams,
    interval: Option<Duration>,
    positions: ScanPositions,
}

/// Builds [`TimedFlyScan`]s.
pub struct TimedFlyScanBuilder;

impl ScanBuilder for TimedFlyScanBuilder {
    fn schema(&self) -> ScanSchema {
        FlyParams::schema("timed_fly_scan").optional("readout_interval", ArgType::Float)
    }

    fn build(&self, request: &ScanRequest) -> ScanResult<Box<dyn Scan>> {
        let interval = match request.kwargs.get("readout_interval").and_then(Value::as_f64) {
            Some(secs) => Some(Duration::try_from_secs_f64(secs).map_err(|e| {
                ScanError::InvalidRequest(format!("readout_interval {secs}: {e}"))
            })?),
            None => None,
        };
        if interval.is_some_and(|i| i.is_zero()) {
            return Err(ScanError::InvalidRequest(
                "readout_interval must be positive".into(),
            ));
        }
        Ok(Box::new(TimedFlyScan {
            params: FlyParams::parse(request)?,
            interval,
            positions: ScanPositions::default(),
        }))
    }
}

#[async_trait]
impl Scan for TimedFlyScan {
    fn scan_type(&self) -> &str {
        "timed_fly_scan"
    }

    fn category(&self) -> ScanCategory {
        ScanCategory::Fly
    }

    fn scan_motors(&self) -> &[String] {
        &[]
    }

    fn positions(&self) -> &ScanPositions {
        &self.positions
    }

    fn num_points(&self) -> u64 {
        self.params.num_points
    }

    fn flyers(&self) -> &[String] {
        &self.params.flyer
    }

    fn monitor_sync(&self) -> String {
        "self".to_string()
    }

    fn report_instructions(&self) -> Vec<ReportInstruction> {
        vec![ReportInstruction::DeviceProgress {
            device: self.params.name().to_string(),
        }]
    }

    async fn prepare_positions(&mut self, ctx: &mut ScanContext) -> ScanResult<()> {
        self.params.check_flyer(ctx)
    }

    async fn scan_core(&mut self, ctx: &mut ScanContext) -> ScanResult<()> {
        let flyer = self.params.name().to_string();
        let readout = self.params.readout(ctx);
        let interval = self.interval.unwrap_or(ctx.settings.fly_poll_interval);
        ctx.stubs
            .kickoff(&flyer, self.params.kickoff_params())
            .await?;

        loop {
            let point_id = ctx.next_point();
            ctx.stubs
                .read_and_wait(&readout, Some(point_id), ReadoutStream::Primary)
                .await?;
            let progress = ctx.stubs.device_progress(&flyer).await?;
            if progress.done {
                debug!(flyer = %flyer, readouts = ctx.points.emitted(), "flyer finished");
                return Ok(());
            }
            ctx.stubs.wait(interval).await?;
        }
    }
}
