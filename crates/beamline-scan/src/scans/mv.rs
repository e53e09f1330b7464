//! Plain move of one or more motors, with no acquisition.

use super::{arg_device, arg_f64, ScanBuilder};
use crate::positions::ScanPositions;
use crate::scan::{Scan, ScanContext};
use async_trait::async_trait;
use beamline_core::{
    ArgType, ReadoutPriority, ReportInstruction, ScanCategory, ScanRequest, ScanResult,
    ScanSchema,
};
use std::collections::BTreeMap;

/// `mv samx 1.5 [samy -2 ...]`
pub struct Move {
    motors: Vec<String>,
    targets: Vec<f64>,
    start: Vec<f64>,
    positions: ScanPositions,
}

/// Builds [`Move`]s.
pub struct MoveBuilder;

impl ScanBuilder for MoveBuilder {
    fn schema(&self) -> ScanSchema {
        ScanSchema::new("mv", ScanCategory::Step).bundle(
            vec![ArgType::Device, ArgType::Float],
            1,
            None,
        )
    }

    fn build(&self, request: &ScanRequest) -> ScanResult<Box<dyn Scan>> {
        let (motors, targets): (Vec<String>, Vec<f64>) = request
            .bundles(2)
            .into_iter()
            .map(|b| Ok((arg_device(&b[0])?, arg_f64(&b[1])?)))
            .collect::<ScanResult<Vec<_>>>()?
            .into_iter()
            .unzip();
        Ok(Box::new(Move {
            motors,
            targets,
            start: Vec::new(),
            positions: ScanPositions::default(),
        }))
    }
}

#[async_trait]
impl Scan for Move {
    fn scan_type(&self) -> &str {
        "mv"
    }

    fn numbered(&self) -> bool {
        false
    }

    fn scan_motors(&self) -> &[String] {
        &self.motors
    }

    fn positions(&self) -> &ScanPositions {
        &self.positions
    }

    fn num_points(&self) -> u64 {
        0
    }

    fn report_instructions(&self) -> Vec<ReportInstruction> {
        vec![ReportInstruction::Readback {
            devices: self.motors.clone(),
            start: self.start.clone(),
            end: self.positions.row(0).map(<[f64]>::to_vec).unwrap_or_default(),
        }]
    }

    fn readout_groups(&self, _ctx: &ScanContext) -> BTreeMap<String, Vec<String>> {
        BTreeMap::from([(
            ReadoutPriority::Monitored.as_str().to_string(),
            self.motors.clone(),
        )])
    }

    async fn prepare_positions(&mut self, ctx: &mut ScanContext) -> ScanResult<()> {
        let table = ScanPositions::new(self.motors.clone(), vec![self.targets.clone()])?;
        self.positions = ctx.prepare_step_positions(table).await?;
        self.start = self
            .motors
            .iter()
            .filter_map(|m| ctx.start_positions.get(m).copied())
            .collect();
        Ok(())
    }

    async fn baseline_reading(&mut self, _ctx: &mut ScanContext) -> ScanResult<()> {
        Ok(())
    }

    async fn pre_scan(&mut self, _ctx: &mut ScanContext) -> ScanResult<()> {
        Ok(())
    }

    async fn scan_core(&mut self, ctx: &mut ScanContext) -> ScanResult<()> {
        let targets = self.positions.row(0).map(<[f64]>::to_vec).unwrap_or_default();
        ctx.stubs.set_and_wait(&self.motors, &targets).await
    }

    async fn finalize(&mut self, ctx: &mut ScanContext, unwinding: bool) -> ScanResult<()> {
        if unwinding {
            let staged = ctx.stubs.staged_devices();
            ctx.stubs.stop_devices(&staged).await;
        }
        Ok(())
    }
}
