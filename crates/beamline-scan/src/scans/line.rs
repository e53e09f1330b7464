//! Straight-line step scan of one or more motors moving together.

use super::{arg_device, arg_f64, kwarg_count, with_step_kwargs, ScanBuilder};
use crate::positions::ScanPositions;
use crate::scan::{Scan, ScanContext};
use async_trait::async_trait;
use beamline_core::{ArgType, ScanCategory, ScanError, ScanRequest, ScanResult, ScanSchema};

/// `line_scan samx 0 4 [samy 1 2 ...] steps=5`
pub struct LineScan {
    motors: Vec<String>,
    axes: Vec<(String, f64, f64)>,
    steps: usize,
    positions: ScanPositions,
}

/// Builds [`LineScan`]s.
pub struct LineScanBuilder;

impl ScanBuilder for LineScanBuilder {
    fn schema(&self) -> ScanSchema {
        with_step_kwargs(
            ScanSchema::new("line_scan", ScanCategory::Step)
                .bundle(vec![ArgType::Device, ArgType::Float, ArgType::Float], 1, None)
                .required("steps", ArgType::Int),
        )
    }

    fn build(&self, request: &ScanRequest) -> ScanResult<Box<dyn Scan>> {
        let axes = request
            .bundles(3)
            .into_iter()
            .map(|b| Ok((arg_device(&b[0])?, arg_f64(&b[1])?, arg_f64(&b[2])?)))
            .collect::<ScanResult<Vec<_>>>()?;
        let steps = kwarg_count(request, "steps")?;
        if steps == 0 {
            return Err(ScanError::InvalidRequest(
                "line_scan: steps must be at least 1".into(),
            ));
        }
        Ok(Box::new(LineScan {
            motors: axes.iter().map(|(m, _, _)| m.clone()).collect(),
            axes,
            steps,
            positions: ScanPositions::default(),
        }))
    }
}

#[async_trait]
impl Scan for LineScan {
    fn scan_type(&self) -> &str {
        "line_scan"
    }

    fn scan_motors(&self) -> &[String] {
        &self.motors
    }

    fn positions(&self) -> &ScanPositions {
        &self.positions
    }

    fn num_points(&self) -> u64 {
        self.steps as u64
    }

    async fn prepare_positions(&mut self, ctx: &mut ScanContext) -> ScanResult<()> {
        let table = ScanPositions::line(&self.axes, self.steps)?;
        self.positions = ctx.prepare_step_positions(table).await?;
        Ok(())
    }
}
