//! The scan contract.
//!
//! A scan type implements [`Scan`]. Only `prepare_positions` is mandatory;
//! the lifecycle hooks default to the generic step-scan behaviour below and
//! are overridden where a scan type differs (moves skip staging, fly scans
//! replace the core loop).
//!
//! Hooks run in a fixed order, driven by [`crate::runner::run_scan`]:
//!
//! ```text
//! prepare_positions -> stage -> baseline_reading -> pre_scan -> scan_core
//!     -> finalize -> unstage
//! ```

use crate::control::StopKind;
use crate::positions::ScanPositions;
use crate::stubs::ScanStubs;
use async_trait::async_trait;
use beamline_core::{
    EngineConfig, PointCounter, PointId, ReadoutPriority, ReadoutStream, ReportInstruction,
    RequestId, ScanCategory, ScanError, ScanRequest, ScanResult,
};
use beamline_hardware::DeviceRegistry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Per-scan tunables resolved from the request and the engine config.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanSettings {
    /// Pause after each step before acquiring
    pub settle_time: Duration,
    /// Move motors back to where they started once the scan ends
    pub return_to_start: bool,
    /// Flyer polling and async readout interval
    pub fly_poll_interval: Duration,
}

impl ScanSettings {
    /// Request kwargs override the engine defaults. Relative scans return
    /// to start unless told otherwise.
    pub fn resolve(request: &ScanRequest, config: &EngineConfig) -> Self {
        let settle = request.kwarg_f64("settle_time", config.settle_time.as_secs_f64());
        Self {
            settle_time: Duration::try_from_secs_f64(settle).unwrap_or(config.settle_time),
            return_to_start: request
                .kwarg_bool("return_to_start", config.return_to_start || request.relative),
            fly_poll_interval: config.fly_poll_interval,
        }
    }
}

/// Everything a scan needs while it runs.
pub struct ScanContext {
    /// The request being executed
    pub request: Arc<ScanRequest>,
    /// Device coordination
    pub stubs: ScanStubs,
    /// Device lookup
    pub registry: Arc<DeviceRegistry>,
    /// Resolved tunables
    pub settings: ScanSettings,
    /// Point ids emitted so far
    pub points: PointCounter,
    /// Motor positions captured before the scan moved anything
    pub start_positions: BTreeMap<String, f64>,
    /// Number handed out at activation
    pub scan_number: Option<u64>,
}

impl ScanContext {
    /// Context for running `request` through `stubs`.
    pub fn new(
        request: Arc<ScanRequest>,
        stubs: ScanStubs,
        registry: Arc<DeviceRegistry>,
        settings: ScanSettings,
    ) -> Self {
        Self {
            request,
            stubs,
            registry,
            settings,
            points: PointCounter::new(),
            start_positions: BTreeMap::new(),
            scan_number: None,
        }
    }

    /// Scan RID.
    pub fn rid(&self) -> &RequestId {
        self.stubs.rid()
    }

    /// Allocate the next point id.
    pub fn next_point(&mut self) -> PointId {
        self.points.advance()
    }

    /// Enabled devices of `priority`, minus `exclude`.
    pub fn devices_with_priority(
        &self,
        priority: ReadoutPriority,
        exclude: &[String],
    ) -> Vec<String> {
        self.registry
            .devices_with_priority(priority)
            .into_iter()
            .filter(|d| !exclude.contains(d))
            .collect()
    }

    /// Record the current position of every motor.
    ///
    /// # Errors
    /// `UnknownDevice`, `MissingCapability` or the driver's failure.
    pub async fn capture_start_positions(&mut self, motors: &[String]) -> ScanResult<Vec<f64>> {
        let mut positions = Vec::with_capacity(motors.len());
        for motor in motors {
            let position = self
                .registry
                .positioner(motor)?
                .position()
                .await
                .map_err(|e| ScanError::from_device(motor, "position", e))?;
            self.start_positions.insert(motor.clone(), position);
            positions.push(position);
        }
        debug!(rid = %self.rid(), start = ?self.start_positions, "start positions captured");
        Ok(positions)
    }

    /// Make `positions` absolute (for relative requests) and check limits.
    ///
    /// # Errors
    /// As [`ScanContext::capture_start_positions`], or `LimitExceeded`.
    pub async fn prepare_step_positions(
        &mut self,
        mut positions: ScanPositions,
    ) -> ScanResult<ScanPositions> {
        let motors = positions.motors().to_vec();
        self.capture_start_positions(&motors).await?;
        if self.request.relative {
            positions.offset(&self.start_positions);
        }
        let limits = motors
            .iter()
            .filter_map(|m| self.registry.limits(m).map(|l| (m.clone(), l)))
            .collect();
        positions.check_limits(&limits)?;
        Ok(positions)
    }

    /// Motors this scan staged, with their start positions, for returning.
    fn return_targets(&self, motors: &[String]) -> (Vec<String>, Vec<f64>) {
        motors
            .iter()
            .filter(|m| self.stubs.is_staged(m))
            .filter_map(|m| self.start_positions.get(m).map(|p| (m.clone(), *p)))
            .unzip()
    }
}

/// A scan type.
#[async_trait]
pub trait Scan: Send + Sync {
    /// Registered name, e.g. "line_scan".
    fn scan_type(&self) -> &str;

    /// Step or fly.
    fn category(&self) -> ScanCategory {
        ScanCategory::Step
    }

    /// Whether activation hands out a scan number.
    fn numbered(&self) -> bool {
        true
    }

    /// Motors driven by the scan.
    fn scan_motors(&self) -> &[String];

    /// Position table; empty until `prepare_positions` ran.
    fn positions(&self) -> &ScanPositions;

    /// Expected number of acquisition points.
    fn num_points(&self) -> u64 {
        self.positions().num_points() as u64
    }

    /// Flyers kicked off by the scan.
    fn flyers(&self) -> &[String] {
        &[]
    }

    /// What paces readout: a flyer name, "self" or "scan".
    fn monitor_sync(&self) -> String {
        "scan".to_string()
    }

    /// Progress reporting hints published when the scan opens.
    fn report_instructions(&self) -> Vec<ReportInstruction> {
        vec![ReportInstruction::ScanProgress {
            points: self.num_points(),
        }]
    }

    /// Readout priority label to participating devices.
    fn readout_groups(&self, ctx: &ScanContext) -> BTreeMap<String, Vec<String>> {
        let mut exclude = self.scan_motors().to_vec();
        exclude.extend(self.flyers().iter().cloned());
        let mut groups = BTreeMap::new();
        groups.insert(
            ReadoutPriority::Monitored.as_str().to_string(),
            [
                self.scan_motors().to_vec(),
                ctx.devices_with_priority(ReadoutPriority::Monitored, &exclude),
            ]
            .concat(),
        );
        groups.insert(
            ReadoutPriority::Baseline.as_str().to_string(),
            ctx.devices_with_priority(ReadoutPriority::Baseline, &exclude),
        );
        groups.insert(
            ReadoutPriority::Async.as_str().to_string(),
            [
                self.flyers().to_vec(),
                ctx.devices_with_priority(ReadoutPriority::Async, &exclude),
            ]
            .concat(),
        );
        groups.insert(
            ReadoutPriority::OnRequest.as_str().to_string(),
            ctx.devices_with_priority(ReadoutPriority::OnRequest, &exclude),
        );
        groups
    }

    /// Devices staged for the scan: its motors, its flyers and the
    /// monitored devices read at every point.
    ///
    /// Baseline, async and on-request devices are read without being staged.
    fn participants(&self, ctx: &ScanContext) -> Vec<String> {
        let groups = self.readout_groups(ctx);
        let mut devices: BTreeSet<String> = self.flyers().iter().cloned().collect();
        if let Some(monitored) = groups.get(ReadoutPriority::Monitored.as_str()) {
            devices.extend(monitored.iter().cloned());
        }
        devices.into_iter().collect()
    }

    /// Compute and validate the position table. Nothing moves yet.
    async fn prepare_positions(&mut self, ctx: &mut ScanContext) -> ScanResult<()>;

    /// Stage every participant.
    async fn stage(&mut self, ctx: &mut ScanContext) -> ScanResult<()> {
        let devices = self.participants(ctx);
        ctx.stubs.stage_all(&devices).await
    }

    /// Read baseline devices once.
    async fn baseline_reading(&mut self, ctx: &mut ScanContext) -> ScanResult<()> {
        let devices = ctx.devices_with_priority(ReadoutPriority::Baseline, self.scan_motors());
        if !devices.is_empty() {
            ctx.stubs.baseline_reading(&devices).await?;
        }
        Ok(())
    }

    /// Run device pre-scan hooks and move to the first point.
    async fn pre_scan(&mut self, ctx: &mut ScanContext) -> ScanResult<()> {
        let staged = ctx.stubs.staged_devices();
        ctx.stubs.pre_scan(&staged).await?;
        if let Some(first) = self.positions().row(0) {
            if !self.scan_motors().is_empty() {
                let first = first.to_vec();
                ctx.stubs.set_and_wait(self.scan_motors(), &first).await?;
            }
        }
        Ok(())
    }

    /// Acquire every point.
    async fn scan_core(&mut self, ctx: &mut ScanContext) -> ScanResult<()> {
        step_scan_core(self.scan_motors(), self.positions(), ctx).await
    }

    /// Return motors, stop or complete flyers.
    ///
    /// Runs shielded from pause and abort. `unwinding` is true when the
    /// scan body stopped early.
    async fn finalize(&mut self, ctx: &mut ScanContext, unwinding: bool) -> ScanResult<()> {
        let mut first_error = None;
        if unwinding {
            let staged = ctx.stubs.staged_devices();
            ctx.stubs.stop_devices(&staged).await;
        }
        for flyer in self.flyers() {
            if ctx.stubs.is_staged(flyer) {
                if let Err(err) = ctx.stubs.complete(flyer).await {
                    first_error.get_or_insert(err);
                }
            }
        }
        let halted = ctx.stubs.stop_kind() == Some(StopKind::Halt);
        if ctx.settings.return_to_start && !halted {
            let (motors, targets) = ctx.return_targets(self.scan_motors());
            if !motors.is_empty() {
                debug!(rid = %ctx.rid(), ?motors, "returning motors to start");
                if let Err(err) = ctx.stubs.set_and_wait(&motors, &targets).await {
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Unstage everything staged; best effort.
    async fn unstage(&mut self, ctx: &mut ScanContext) -> Vec<ScanError> {
        ctx.stubs.unstage_all().await
    }
}

/// The generic step-scan loop.
///
/// For each point: wait for the move to arrive, settle, trigger, start the
/// monitored readout, read the motors, start the move to the next point,
/// then wait for the monitored readout. The next move thus overlaps the
/// readout of the current point, but the next trigger never starts before
/// the current readout has resolved. Timed out moves and reads are retried
/// under the engine's retry policy. A deferred pause parks the scan between
/// two points.
///
/// # Errors
/// The first failure, or `Cancelled` at a suspension point.
pub async fn step_scan_core(
    motors: &[String],
    positions: &ScanPositions,
    ctx: &mut ScanContext,
) -> ScanResult<()> {
    let total = positions.num_points() as u64;
    let monitored = ctx.devices_with_priority(ReadoutPriority::Monitored, motors);
    let detectors: Vec<String> = monitored
        .iter()
        .filter(|d| ctx.registry.get_triggerable(d).is_some())
        .cloned()
        .collect();

    let mut in_flight = None;
    for (index, row) in positions.rows().iter().enumerate() {
        ctx.stubs.point_boundary().await?;
        match in_flight.take() {
            Some(moves) => ctx.stubs.finish_moves(moves, motors, row).await?,
            None => ctx.stubs.set_and_wait(motors, row).await?,
        }
        if !ctx.settings.settle_time.is_zero() {
            ctx.stubs.wait(ctx.settings.settle_time).await?;
        }

        let point_id = ctx.next_point();
        ctx.stubs.trigger(&detectors, Some(point_id)).await?;
        let readout = ctx
            .stubs
            .read(&monitored, Some(point_id), ReadoutStream::Primary)
            .await?;
        ctx.stubs
            .read_and_wait(motors, Some(point_id), ReadoutStream::Primary)
            .await?;
        if let Some(next) = positions.row(index + 1) {
            if !motors.is_empty() {
                in_flight = Some(ctx.stubs.set_many(motors, next).await?);
            }
        }
        ctx.stubs
            .finish_reads(readout, Some(point_id), ReadoutStream::Primary)
            .await?;

        let done = point_id.value() + 1;
        ctx.stubs.publish_progress(None, done, total, done == total);
    }
    Ok(())
}
