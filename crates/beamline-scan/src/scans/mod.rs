//! Built-in scan types and the catalogue that maps names to them.
//!
//! | name | category | arguments |
//! |---|---|---|
//! | `mv` | step | `motor, target` bundles |
//! | `line_scan` | step | `motor, start, stop` bundles, `steps` |
//! | `grid_scan` | step | `motor, start, stop, points` bundles (2+) |
//! | `acquire` | step | `num_points` |
//! | `fly_scan` | fly | `flyer`, `num_points`; readout paced by the flyer |
//! | `timed_fly_scan` | fly | `flyer`, `num_points`; readout paced by the engine |

mod acquire;
mod fly;
mod grid;
mod line;
mod mv;

pub use acquire::{Acquire, AcquireBuilder};
pub use fly::{FlyScan, FlyScanBuilder, TimedFlyScan, TimedFlyScanBuilder};
pub use grid::{GridScan, GridScanBuilder};
pub use line::{LineScan, LineScanBuilder};
pub use mv::{Move, MoveBuilder};

use crate::scan::Scan;
use beamline_core::{ArgType, ScanError, ScanRequest, ScanResult, ScanSchema, MAX_POINTS};
use beamline_hardware::DeviceRegistry;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::info;

/// Creates scans of one type from requests.
pub trait ScanBuilder: Send + Sync {
    /// Argument schema, which also names the scan type.
    fn schema(&self) -> ScanSchema;

    /// Build a scan from a request that passed schema validation.
    ///
    /// # Errors
    /// `InvalidRequest` for values the schema cannot express (e.g. zero steps).
    fn build(&self, request: &ScanRequest) -> ScanResult<Box<dyn Scan>>;
}

/// Registered scan types by name.
pub struct ScanCatalogue {
    builders: BTreeMap<String, Box<dyn ScanBuilder>>,
    max_points: u64,
}

impl Default for ScanCatalogue {
    fn default() -> Self {
        Self {
            builders: BTreeMap::new(),
            max_points: MAX_POINTS,
        }
    }
}

impl ScanCatalogue {
    /// Empty catalogue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to build scans with more than `max_points` points.
    pub fn with_max_points(mut self, max_points: u64) -> Self {
        self.max_points = max_points;
        self
    }

    /// Largest point count [`ScanCatalogue::build`] accepts.
    pub fn max_points(&self) -> u64 {
        self.max_points
    }

    /// Catalogue with every built-in scan type.
    pub fn with_builtin() -> Self {
        let mut catalogue = Self::new();
        let builders: Vec<Box<dyn ScanBuilder>> = vec![
            Box::new(MoveBuilder),
            Box::new(LineScanBuilder),
            Box::new(GridScanBuilder),
            Box::new(AcquireBuilder),
            Box::new(FlyScanBuilder),
            Box::new(TimedFlyScanBuilder),
        ];
        for builder in builders {
            let name = builder.schema().scan_type;
            catalogue.builders.insert(name, builder);
        }
        catalogue
    }

    /// Add a scan type.
    ///
    /// # Errors
    /// `InvalidConfig` if the name is taken.
    pub fn register(&mut self, builder: Box<dyn ScanBuilder>) -> ScanResult<()> {
        let name = builder.schema().scan_type;
        if self.builders.contains_key(&name) {
            return Err(ScanError::InvalidConfig {
                target: name.clone(),
                message: format!("scan type '{name}' is already registered"),
            });
        }
        info!(scan_type = %name, "registered scan type");
        self.builders.insert(name, builder);
        Ok(())
    }

    /// Registered names, sorted.
    pub fn scan_types(&self) -> Vec<String> {
        self.builders.keys().cloned().collect()
    }

    /// Schema of a scan type.
    pub fn schema(&self, scan_type: &str) -> Option<ScanSchema> {
        self.builders.get(scan_type).map(|b| b.schema())
    }

    /// All schemas, sorted by name.
    pub fn schemas(&self) -> Vec<ScanSchema> {
        self.builders.values().map(|b| b.schema()).collect()
    }

    /// Check a request against its schema and the registry.
    ///
    /// # Errors
    /// `InvalidRequest` for unknown scan types, schema violations and
    /// arguments naming unknown devices.
    pub fn validate(&self, request: &ScanRequest, registry: &DeviceRegistry) -> ScanResult<()> {
        let schema = self.schema(&request.scan_type).ok_or_else(|| {
            ScanError::InvalidRequest(format!("unknown scan type '{}'", request.scan_type))
        })?;
        schema.validate(request)?;
        if !schema.arg_input.is_empty() {
            for bundle in request.bundles(schema.arg_input.len()) {
                for (kind, value) in schema.arg_input.iter().zip(bundle) {
                    if *kind == ArgType::Device {
                        let name = value.as_str().unwrap_or_default();
                        if !registry.contains(name) {
                            return Err(ScanError::InvalidRequest(format!(
                                "unknown device '{name}'"
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Build the scan for a request.
    ///
    /// Nothing is allocated per point here, so oversized requests are
    /// refused before their position tables exist.
    ///
    /// # Errors
    /// `InvalidRequest` for unknown types, invalid arguments or more points
    /// than the catalogue allows.
    pub fn build(&self, request: &ScanRequest) -> ScanResult<Box<dyn Scan>> {
        let builder = self.builders.get(&request.scan_type).ok_or_else(|| {
            ScanError::InvalidRequest(format!("unknown scan type '{}'", request.scan_type))
        })?;
        builder.schema().validate(request)?;
        let scan = builder.build(request)?;
        let points = scan.num_points();
        if points > self.max_points {
            return Err(ScanError::InvalidRequest(format!(
                "{}: {points} points exceed the limit of {}",
                request.scan_type, self.max_points
            )));
        }
        Ok(scan)
    }
}

/// Kwargs shared by the step scans.
pub(crate) fn with_step_kwargs(schema: ScanSchema) -> ScanSchema {
    schema
        .optional("settle_time", ArgType::Float)
        .optional("return_to_start", ArgType::Bool)
}

pub(crate) fn arg_device(value: &Value) -> ScanResult<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ScanError::InvalidRequest(format!("expected a device name, got {value}")))
}

pub(crate) fn arg_f64(value: &Value) -> ScanResult<f64> {
    value
        .as_f64()
        .ok_or_else(|| ScanError::InvalidRequest(format!("expected a number, got {value}")))
}

pub(crate) fn arg_count(value: &Value) -> ScanResult<usize> {
    value
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| ScanError::InvalidRequest(format!("expected a count, got {value}")))
}

/// Product of per-axis point counts; `u64::MAX` if it overflows.
pub(crate) fn point_product(counts: impl IntoIterator<Item = usize>) -> u64 {
    counts
        .into_iter()
        .try_fold(1u64, |total, n| total.checked_mul(n as u64))
        .unwrap_or(u64::MAX)
}

/// Required count kwarg.
pub(crate) fn kwarg_count(request: &ScanRequest, key: &str) -> ScanResult<usize> {
    let value = request
        .kwargs
        .get(key)
        .ok_or_else(|| ScanError::InvalidRequest(format!("missing required kwarg '{key}'")))?;
    arg_count(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use beamline_hardware::create_sim_registry;

    #[test]
    fn builtin_catalogue_lists_every_type() {
        let catalogue = ScanCatalogue::with_builtin();
        assert_eq!(
            catalogue.scan_types(),
            vec![
                "acquire",
                "fly_scan",
                "grid_scan",
                "line_scan",
                "mv",
                "timed_fly_scan"
            ]
        );
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut catalogue = ScanCatalogue::with_builtin();
        assert!(catalogue.register(Box::new(LineScanBuilder)).is_err());
    }

    #[test]
    fn validation_checks_devices_and_schema() {
        let catalogue = ScanCatalogue::with_builtin();
        let registry = create_sim_registry().unwrap();

        let ok = ScanRequest::new("line_scan")
            .arg("samx")
            .arg(0.0)
            .arg(4.0)
            .kwarg("steps", 5);
        assert!(catalogue.validate(&ok, &registry).is_ok());

        let unknown_device = ScanRequest::new("line_scan")
            .arg("nope")
            .arg(0.0)
            .arg(4.0)
            .kwarg("steps", 5);
        assert!(matches!(
            catalogue.validate(&unknown_device, &registry),
            Err(ScanError::InvalidRequest(_))
        ));

        let missing_steps = ScanRequest::new("line_scan").arg("samx").arg(0.0).arg(4.0);
        assert!(catalogue.validate(&missing_steps, &registry).is_err());

        let unknown_type = ScanRequest::new("spiral_scan");
        assert!(catalogue.validate(&unknown_type, &registry).is_err());

        let unknown_kwarg = ok.clone().kwarg("wobble", true);
        assert!(catalogue.validate(&unknown_kwarg, &registry).is_err());
    }

    #[test]
    fn oversized_scans_are_rejected_before_building_positions() {
        let catalogue = ScanCatalogue::with_builtin();
        let huge_acquire = ScanRequest::new("acquire").kwarg("num_points", 1_000_000_000_000_000u64);
        let huge_line = ScanRequest::new("line_scan")
            .arg("samx")
            .arg(0.0)
            .arg(1.0)
            .kwarg("steps", MAX_POINTS + 1);
        let overflowing_grid = ScanRequest::new("grid_scan")
            .arg("samx")
            .arg(0.0)
            .arg(1.0)
            .arg(1u64 << 40)
            .arg("samy")
            .arg(0.0)
            .arg(1.0)
            .arg(1u64 << 40);
        let huge_fly = ScanRequest::new("fly_scan")
            .arg("flyer1")
            .kwarg("num_points", MAX_POINTS * 10);
        for request in [huge_acquire, huge_line, overflowing_grid, huge_fly] {
            match catalogue.build(&request) {
                Err(ScanError::InvalidRequest(message)) => {
                    assert!(message.contains("exceed the limit"), "{message}")
                }
                Err(other) => panic!("{}: unexpected {other}", request.scan_type),
                Ok(_) => panic!("{} was accepted", request.scan_type),
            }
        }

        let at_limit = ScanRequest::new("acquire").kwarg("num_points", 10);
        let small = ScanCatalogue::with_builtin().with_max_points(10);
        assert!(small.build(&at_limit).is_ok());
        assert!(small
            .build(&ScanRequest::new("acquire").kwarg("num_points", 11))
            .is_err());
    }

    #[test]
    fn point_product_saturates() {
        assert_eq!(point_product([2, 3]), 6);
        assert_eq!(point_product([usize::MAX, 2]), u64::MAX);
    }

    #[test]
    fn build_rejects_zero_steps() {
        let catalogue = ScanCatalogue::with_builtin();
        let request = ScanRequest::new("line_scan")
            .arg("samx")
            .arg(0.0)
            .arg(1.0)
            .kwarg("steps", 0);
        assert!(catalogue.build(&request).is_err());
    }
}
