//! Position tables of step scans.
//!
//! A table has one column per scan motor and one row per acquisition point.

use beamline_core::{ScanError, ScanResult, SoftLimits};
use std::collections::BTreeMap;

/// Ordered target positions of a step scan.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScanPositions {
    motors: Vec<String>,
    rows: Vec<Vec<f64>>,
}

/// `count` evenly spaced values from `start` to `stop`, both included.
pub fn linspace(start: f64, stop: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![start],
        n => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { stop } else { start + step * i as f64 })
                .collect()
        }
    }
}

impl ScanPositions {
    /// Table from explicit rows.
    ///
    /// # Errors
    /// `InvalidRequest` if a row length differs from the number of motors.
    pub fn new(motors: Vec<String>, rows: Vec<Vec<f64>>) -> ScanResult<Self> {
        if let Some(bad) = rows.iter().position(|row| row.len() != motors.len()) {
            return Err(ScanError::InvalidRequest(format!(
                "row {bad} has {} values for {} motors",
                rows[bad].len(),
                motors.len()
            )));
        }
        Ok(Self { motors, rows })
    }

    /// `points` rows for a scan without motors.
    pub fn motionless(points: usize) -> Self {
        Self {
            motors: Vec::new(),
            rows: vec![Vec::new(); points],
        }
    }

    /// All motors move together from start to stop in `steps` points.
    ///
    /// # Errors
    /// `InvalidRequest` if `steps` is zero or no motor is given.
    pub fn line(axes: &[(String, f64, f64)], steps: usize) -> ScanResult<Self> {
        if axes.is_empty() {
            return Err(ScanError::InvalidRequest("a line scan needs a motor".into()));
        }
        if steps == 0 {
            return Err(ScanError::InvalidRequest("steps must be at least 1".into()));
        }
        let columns: Vec<Vec<f64>> = axes
            .iter()
            .map(|(_, start, stop)| linspace(*start, *stop, steps))
            .collect();
        let rows = (0..steps)
            .map(|i| columns.iter().map(|column| column[i]).collect())
            .collect();
        Ok(Self {
            motors: axes.iter().map(|(name, _, _)| name.clone()).collect(),
            rows,
        })
    }

    /// Cartesian grid; the first axis is the slowest.
    ///
    /// With `snake` every other sweep of the faster axes is reversed so
    /// consecutive points stay close.
    ///
    /// # Errors
    /// `InvalidRequest` if no axis is given or an axis has zero points.
    pub fn grid(axes: &[(String, f64, f64, usize)], snake: bool) -> ScanResult<Self> {
        if axes.is_empty() {
            return Err(ScanError::InvalidRequest("a grid scan needs a motor".into()));
        }
        if let Some((name, ..)) = axes.iter().find(|(.., points)| *points == 0) {
            return Err(ScanError::InvalidRequest(format!(
                "axis '{name}' needs at least one point"
            )));
        }
        let total = axes
            .iter()
            .try_fold(1usize, |total, (.., points)| total.checked_mul(*points))
            .ok_or_else(|| ScanError::InvalidRequest("grid has too many points".into()))?;
        let mut rows: Vec<Vec<f64>> = vec![Vec::new()];
        for (name, start, stop, points) in axes {
            let values = linspace(*start, *stop, *points);
            let mut next = Vec::with_capacity(rows.len() * values.len());
            for (index, prefix) in rows.iter().enumerate() {
                let reversed = snake && index % 2 == 1;
                let sweep: Box<dyn Iterator<Item = &f64>> = if reversed {
                    Box::new(values.iter().rev())
                } else {
                    Box::new(values.iter())
                };
                for value in sweep {
                    let mut row = prefix.clone();
                    row.push(*value);
                    next.push(row);
                }
            }
            rows = next;
            tracing::trace!(axis = %name, rows = rows.len(), "grid axis expanded");
        }
        debug_assert_eq!(rows.len(), total);
        Ok(Self {
            motors: axes.iter().map(|(name, ..)| name.clone()).collect(),
            rows,
        })
    }

    /// Shift every column by the motor's offset (relative scans).
    pub fn offset(&mut self, offsets: &BTreeMap<String, f64>) {
        for (column, motor) in self.motors.iter().enumerate() {
            if let Some(offset) = offsets.get(motor) {
                for row in &mut self.rows {
                    row[column] += offset;
                }
            }
        }
    }

    /// Verify every position against the motors' soft limits.
    ///
    /// # Errors
    /// `LimitExceeded` for the first offending position.
    pub fn check_limits(&self, limits: &BTreeMap<String, SoftLimits>) -> ScanResult<()> {
        for (column, motor) in self.motors.iter().enumerate() {
            if let Some(limits) = limits.get(motor) {
                for row in &self.rows {
                    limits.check(motor, row[column])?;
                }
            }
        }
        Ok(())
    }

    /// Motor names, in column order.
    pub fn motors(&self) -> &[String] {
        &self.motors
    }

    /// All rows.
    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    /// Row `index`, if present.
    pub fn row(&self, index: usize) -> Option<&[f64]> {
        self.rows.get(index).map(Vec::as_slice)
    }

    /// Number of acquisition points.
    pub fn num_points(&self) -> usize {
        self.rows.len()
    }

    /// True if there is nothing to acquire.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axis(name: &str, start: f64, stop: f64) -> (String, f64, f64) {
        (name.to_string(), start, stop)
    }

    #[test]
    fn linspace_includes_both_ends() {
        assert_eq!(linspace(0.0, 4.0, 5), vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(linspace(2.0, 2.0, 1), vec![2.0]);
        assert!(linspace(0.0, 1.0, 0).is_empty());
        assert_eq!(linspace(1.0, -1.0, 3), vec![1.0, 0.0, -1.0]);
    }

    #[test]
    fn line_moves_motors_together() {
        let positions =
            ScanPositions::line(&[axis("samx", 0.0, 4.0), axis("samy", 10.0, 6.0)], 5).unwrap();
        assert_eq!(positions.num_points(), 5);
        assert_eq!(positions.row(0), Some(&[0.0, 10.0][..]));
        assert_eq!(positions.row(4), Some(&[4.0, 6.0][..]));
        assert!(ScanPositions::line(&[axis("samx", 0.0, 1.0)], 0).is_err());
    }

    #[test]
    fn grid_orders_first_axis_slowest() {
        let axes = vec![
            ("samx".to_string(), 0.0, 1.0, 2),
            ("samy".to_string(), 0.0, 2.0, 3),
        ];
        let plain = ScanPositions::grid(&axes, false).unwrap();
        let rows: Vec<Vec<f64>> = plain.rows().to_vec();
        assert_eq!(
            rows,
            vec![
                vec![0.0, 0.0],
                vec![0.0, 1.0],
                vec![0.0, 2.0],
                vec![1.0, 0.0],
                vec![1.0, 1.0],
                vec![1.0, 2.0],
            ]
        );

        let snake = ScanPositions::grid(&axes, true).unwrap();
        assert_eq!(snake.row(3), Some(&[1.0, 2.0][..]));
        assert_eq!(snake.row(5), Some(&[1.0, 0.0][..]));
    }

    #[test]
    fn offset_shifts_only_named_motors() {
        let mut positions =
            ScanPositions::line(&[axis("samx", -1.0, 1.0), axis("samy", 0.0, 0.0)], 3).unwrap();
        positions.offset(&BTreeMap::from([("samx".to_string(), 10.0)]));
        assert_eq!(positions.row(0), Some(&[9.0, 0.0][..]));
        assert_eq!(positions.row(2), Some(&[11.0, 0.0][..]));
    }

    #[test]
    fn limits_are_checked_per_motor() {
        let positions = ScanPositions::line(&[axis("samx", 0.0, 60.0)], 4).unwrap();
        let limits = BTreeMap::from([("samx".to_string(), SoftLimits::new(-50.0, 50.0))]);
        let err = positions.check_limits(&limits).unwrap_err();
        assert!(matches!(err, ScanError::LimitExceeded { position, .. } if position == 60.0));
        assert!(positions.check_limits(&BTreeMap::new()).is_ok());
    }

    #[test]
    fn overflowing_grid_is_rejected() {
        let huge = usize::MAX / 2;
        let axes = vec![
            ("samx".to_string(), 0.0, 1.0, huge),
            ("samy".to_string(), 0.0, 1.0, 3),
        ];
        assert!(matches!(
            ScanPositions::grid(&axes, false),
            Err(ScanError::InvalidRequest(_))
        ));
    }

    #[test]
    fn mismatched_rows_are_rejected() {
        assert!(ScanPositions::new(vec!["samx".into()], vec![vec![1.0, 2.0]]).is_err());
        assert_eq!(ScanPositions::motionless(3).num_points(), 3);
    }
}
