//! Sensor-to-reference alignment from observed directions.
//!
//! A sensor reports unit directions towards reference points whose positions are
//! known in the reference frame. The sensor position is searched on a regular grid;
//! for each candidate the directions are scaled by the candidate-to-reference
//! distance, the rotation is fitted with Kabsch, and the transform is scored by the
//! mean angle between each reference point and its transformed observation.

use crate::rigid::{umeyama, UmeyamaError};
use crate::so3::rows_to_mat3;
use glam::DVec3;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Errors raised by [`IterativeKabschSolver`].
#[derive(Debug, Error)]
pub enum CalibrationError {
    /// `solve` was called without samples.
    #[error("No calibration samples")]
    NoSamples,

    /// An observed direction cannot be normalized.
    #[error("Observed direction {0:?} has zero length or is not finite")]
    InvalidDirection([f64; 3]),

    /// A reference point is NaN or infinite.
    #[error("Reference point {0:?} is not finite")]
    InvalidReference([f64; 3]),

    /// A grid axis has a non-positive step.
    #[error("Grid axis {axis} has non-positive step {step}")]
    InvalidStep {
        /// Axis name
        axis: char,
        /// Offending step
        step: i32,
    },

    /// The grid contains no candidate positions.
    #[error("Grid search range is empty")]
    EmptyGrid,

    /// Reference points and directions differ in count.
    #[error("Got {references} reference points but {directions} directions")]
    MismatchedLengths {
        /// Number of reference points
        references: usize,
        /// Number of directions
        directions: usize,
    },

    /// Cancelled before any candidate was evaluated.
    #[error("Calibration cancelled before any candidate was evaluated")]
    Cancelled,

    /// Rotation fit failed.
    #[error(transparent)]
    Alignment(#[from] UmeyamaError),
}

/// Inclusive integer range `min..=max` walked with `step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GridAxis {
    /// First value.
    pub min: i32,
    /// Last value (inclusive).
    pub max: i32,
    /// Increment, must be positive.
    pub step: i32,
}

impl GridAxis {
    /// Create a new axis.
    pub const fn new(min: i32, max: i32, step: i32) -> Self {
        Self { min, max, step }
    }

    fn values(&self) -> impl Iterator<Item = i32> {
        let step = self.step.max(1) as usize;
        (self.min..=self.max).step_by(step)
    }
}

/// Grid of candidate sensor positions, in integer units of `unit` metres.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct GridSearchParams {
    /// Candidate x positions.
    pub x: GridAxis,
    /// Candidate y positions.
    pub y: GridAxis,
    /// Candidate z positions.
    pub z: GridAxis,
    /// Size of one grid unit, metres.
    pub unit: f64,
}

impl Default for GridSearchParams {
    fn default() -> Self {
        Self {
            x: GridAxis::new(0, 0, 1),
            y: GridAxis::new(0, 30, 1),
            z: GridAxis::new(0, 40, 2),
            unit: 0.001,
        }
    }
}

impl GridSearchParams {
    /// Replace the x axis.
    pub fn with_x(mut self, axis: GridAxis) -> Self {
        self.x = axis;
        self
    }

    /// Replace the y axis.
    pub fn with_y(mut self, axis: GridAxis) -> Self {
        self.y = axis;
        self
    }

    /// Replace the z axis.
    pub fn with_z(mut self, axis: GridAxis) -> Self {
        self.z = axis;
        self
    }

    fn validate(&self) -> Result<(), CalibrationError> {
        for (name, axis) in [('x', &self.x), ('y', &self.y), ('z', &self.z)] {
            if axis.step <= 0 {
                return Err(CalibrationError::InvalidStep {
                    axis: name,
                    step: axis.step,
                });
            }
            if axis.min > axis.max {
                return Err(CalibrationError::EmptyGrid);
            }
        }
        Ok(())
    }

    /// Number of candidate positions.
    pub fn num_candidates(&self) -> usize {
        self.x.values().count() * self.y.values().count() * self.z.values().count()
    }
}

/// Best transform found by the grid search.
#[derive(Debug, Clone, PartialEq)]
pub struct KabschSolution {
    /// Sensor → reference rotation, row-major.
    pub rotation: [[f64; 3]; 3],
    /// Sensor position in the reference frame, metres.
    pub position: [f64; 3],
    /// Mean angular error over the samples, degrees.
    pub error_deg: f64,
    /// How many grid candidates were scored.
    pub candidates_evaluated: usize,
}

impl KabschSolution {
    /// Map a sensor-frame point into the reference frame.
    pub fn transform_point(&self, p: [f64; 3]) -> [f64; 3] {
        (rows_to_mat3(&self.rotation) * DVec3::from_array(p) + DVec3::from_array(self.position))
            .to_array()
    }

    /// 4×4 homogeneous matrix, row-major.
    pub fn to_homogeneous(&self) -> [[f64; 4]; 4] {
        let r = &self.rotation;
        let p = &self.position;
        [
            [r[0][0], r[0][1], r[0][2], p[0]],
            [r[1][0], r[1][1], r[1][2], p[1]],
            [r[2][0], r[2][1], r[2][2], p[2]],
            [0.0, 0.0, 0.0, 1.0],
        ]
    }
}

/// Grid-search Kabsch calibration over collected samples.
#[derive(Debug, Default)]
pub struct IterativeKabschSolver {
    params: GridSearchParams,
    reference_points: Vec<DVec3>,
    directions: Vec<DVec3>,
    solution: Option<KabschSolution>,
}

impl IterativeKabschSolver {
    /// Create a solver with the given grid.
    pub fn new(params: GridSearchParams) -> Self {
        Self {
            params,
            ..Default::default()
        }
    }

    /// The grid in use.
    pub fn params(&self) -> &GridSearchParams {
        &self.params
    }

    /// Record a reference point and the direction the sensor observed it in.
    /// The direction is normalized.
    pub fn add_sample(
        &mut self,
        reference_point: [f64; 3],
        observed_direction: [f64; 3],
    ) -> Result<(), CalibrationError> {
        let reference = DVec3::from_array(reference_point);
        if !reference.is_finite() {
            return Err(CalibrationError::InvalidReference(reference_point));
        }
        let direction = DVec3::from_array(observed_direction)
            .try_normalize()
            .ok_or(CalibrationError::InvalidDirection(observed_direction))?;

        self.reference_points.push(reference);
        self.directions.push(direction);
        Ok(())
    }

    /// Drop all samples.
    pub fn clear(&mut self) {
        self.reference_points.clear();
        self.directions.clear();
    }

    /// Number of recorded samples.
    pub fn sample_count(&self) -> usize {
        self.reference_points.len()
    }

    /// Result of the last successful solve.
    pub fn solution(&self) -> Option<&KabschSolution> {
        self.solution.as_ref()
    }

    /// Run the full grid search.
    pub fn solve(&mut self) -> Result<KabschSolution, CalibrationError> {
        self.solve_with_cancel(&AtomicBool::new(false))
    }

    /// Run the grid search, stopping early once `cancel` is raised.
    ///
    /// On cancellation the best candidate scored so far is returned.
    pub fn solve_with_cancel(
        &mut self,
        cancel: &AtomicBool,
    ) -> Result<KabschSolution, CalibrationError> {
        if self.reference_points.is_empty() {
            return Err(CalibrationError::NoSamples);
        }
        self.params.validate()?;

        let mut best: Option<KabschSolution> = None;
        let mut evaluated = 0usize;

        'search: for x in self.params.x.values() {
            for y in self.params.y.values() {
                for z in self.params.z.values() {
                    if cancel.load(Ordering::Relaxed) {
                        log::debug!("calibration cancelled after {evaluated} candidates");
                        break 'search;
                    }

                    let position = DVec3::new(x as f64, y as f64, z as f64) * self.params.unit;
                    let rotation = self.solve_for_position(position)?;
                    let error = evaluate_vec(&self.reference_points, &self.directions, &rotation, position);
                    evaluated += 1;

                    if best.as_ref().map_or(true, |b| error < b.error_deg) {
                        best = Some(KabschSolution {
                            rotation,
                            position: position.to_array(),
                            error_deg: error,
                            candidates_evaluated: 0,
                        });
                    }
                }
            }
        }

        let mut solution = best.ok_or(CalibrationError::Cancelled)?;
        solution.candidates_evaluated = evaluated;
        log::debug!(
            "calibration: {} samples, {evaluated} candidates, best position {:?}, mean error {:.4} deg",
            self.sample_count(),
            solution.position,
            solution.error_deg
        );
        self.solution = Some(solution.clone());
        Ok(solution)
    }

    /// Kabsch rotation mapping distance-scaled observations onto the reference points.
    fn solve_for_position(&self, sensor_pos: DVec3) -> Result<[[f64; 3]; 3], CalibrationError> {
        let observed: Vec<DVec3> = self
            .reference_points
            .iter()
            .zip(self.directions.iter())
            .map(|(r, d)| *d * r.distance(sensor_pos))
            .collect();
        let (rotation, _, _) = umeyama(&observed, &self.reference_points)?;
        Ok(rotation)
    }
}

/// Mean angle in degrees between each reference point and the observation
/// transformed by `(rotation, position)`, both seen from the reference origin.
///
/// Observations are scaled by the distance from `position` to their reference point.
/// Both slices must have the same length.
pub fn evaluate(
    reference_points: &[[f64; 3]],
    directions: &[[f64; 3]],
    rotation: &[[f64; 3]; 3],
    position: [f64; 3],
) -> Result<f64, CalibrationError> {
    if reference_points.len() != directions.len() {
        return Err(CalibrationError::MismatchedLengths {
            references: reference_points.len(),
            directions: directions.len(),
        });
    }
    let refs: Vec<DVec3> = reference_points.iter().map(|p| DVec3::from_array(*p)).collect();
    let dirs: Vec<DVec3> = directions.iter().map(|d| DVec3::from_array(*d)).collect();
    Ok(evaluate_vec(&refs, &dirs, rotation, DVec3::from_array(position)))
}

fn evaluate_vec(refs: &[DVec3], dirs: &[DVec3], rotation: &[[f64; 3]; 3], position: DVec3) -> f64 {
    if dirs.is_empty() {
        return 0.0;
    }
    let r = rows_to_mat3(rotation);
    let total: f64 = refs
        .iter()
        .zip(dirs.iter())
        .map(|(&reference, &dir)| {
            let transformed = r * (dir * position.distance(reference)) + position;
            angle_deg(reference, transformed)
        })
        .sum();
    total / dirs.len() as f64
}

fn angle_deg(a: DVec3, b: DVec3) -> f64 {
    if a.length_squared() <= f64::MIN_POSITIVE || b.length_squared() <= f64::MIN_POSITIVE {
        return 0.0;
    }
    a.cross(b).length().atan2(a.dot(b)).to_degrees()
}
