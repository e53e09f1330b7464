//! Repeated acquisition without motion.

use super::ScanBuilder;
use crate::positions::ScanPositions;
use crate::scan::{Scan, ScanContext};
use async_trait::async_trait;
use beamline_core::{ArgType, ScanCategory, ScanError, ScanRequest, ScanResult, ScanSchema};

/// `acquire num_points=10`
pub struct Acquire {
    points: usize,
    positions: ScanPositions,
}

/// Builds [`Acquire`] scans.
pub struct AcquireBuilder;

impl ScanBuilder for AcquireBuilder {
    fn schema(&self) -> ScanSchema {
        ScanSchema::new("acquire", ScanCategory::Step)
            .optional("num_points", ArgType::Int)
            .optional("settle_time", ArgType::Float)
    }

    fn build(&self, request: &ScanRequest) -> ScanResult<Box<dyn Scan>> {
        let points = usize::try_from(request.kwarg_u64("num_points", 1))
            .map_err(|e| ScanError::InvalidRequest(format!("acquire: num_points: {e}")))?;
        if points == 0 {
            return Err(ScanError::InvalidRequest(
                "acquire: num_points must be at least 1".into(),
            ));
        }
        Ok(Box::new(Acquire {
            points,
            positions: ScanPositions::default(),
        }))
    }
}

#[async_trait]
impl Scan for Acquire {
    fn scan_type(&self) -> &str {
        "acquire"
    }

    fn scan_motors(&self) -> &[String] {
        &[]
    }

    fn positions(&self) -> &ScanPositions {
        &self.positions
    }

    fn num_points(&self) -> u64 {
        self.points as u64
    }

    async fn prepare_positions(&mut self, _ctx: &mut ScanContext) -> ScanResult<()> {
        self.positions = ScanPositions::motionless(self.points);
        Ok(())
    }
}
