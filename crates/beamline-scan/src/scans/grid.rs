//! Multi-axis grid scan; the first motor is the slowest axis.

use super::{arg_count, arg_device, arg_f64, point_product, with_step_kwargs, ScanBuilder};
use crate::positions::ScanPositions;
use crate::scan::{Scan, ScanContext};
use async_trait::async_trait;
use beamline_core::{ArgType, ScanCategory, ScanError, ScanRequest, ScanResult, ScanSchema};

/// `grid_scan samx -1 1 3 samy -1 1 3 snake=true`
pub struct GridScan {
    motors: Vec<String>,
    axes: Vec<(String, f64, f64, usize)>,
    snake: bool,
    positions: ScanPositions,
}

/// Builds [`GridScan`]s.
pub struct GridScanBuilder;

impl ScanBuilder for GridScanBuilder {
    fn schema(&self) -> ScanSchema {
        with_step_kwargs(
            ScanSchema::new("grid_scan", ScanCategory::Step)
                .bundle(
                    vec![ArgType::Device, ArgType::Float, ArgType::Float, ArgType::Int],
                    2,
                    None,
                )
                .optional("snake", ArgType::Bool),
        )
    }

    fn build(&self, request: &ScanRequest) -> ScanResult<Box<dyn Scan>> {
        let axes = request
            .bundles(4)
            .into_iter()
            .map(|b| {
                Ok((
                    arg_device(&b[0])?,
                    arg_f64(&b[1])?,
                    arg_f64(&b[2])?,
                    arg_count(&b[3])?,
                ))
            })
            .collect::<ScanResult<Vec<_>>>()?;
        if let Some((motor, ..)) = axes.iter().find(|(.., points)| *points == 0) {
            return Err(ScanError::InvalidRequest(format!(
                "grid_scan: axis '{motor}' needs at least one point"
            )));
        }
        Ok(Box::new(GridScan {
            motors: axes.iter().map(|(m, ..)| m.clone()).collect(),
            axes,
            snake: request.kwarg_bool("snake", true),
            positions: ScanPositions::default(),
        }))
    }
}

#[async_trait]
impl Scan for GridScan {
    fn scan_type(&self) -> &str {
        "grid_scan"
    }

    fn scan_motors(&self) -> &[String] {
        &self.motors
    }

    fn positions(&self) -> &ScanPositions {
        &self.positions
    }

    fn num_points(&self) -> u64 {
        point_product(self.axes.iter().map(|(.., points)| *points))
    }

    async fn prepare_positions(&mut self, ctx: &mut ScanContext) -> ScanResult<()> {
        let table = ScanPositions::grid(&self.axes, self.snake)?;
        self.positions = ctx.prepare_step_positions(table).await?;
        Ok(())
    }
}
