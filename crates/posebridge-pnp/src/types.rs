//! Common data types shared across Perspective-n-Point (PnP) solvers.

use crate::camera::{CameraError, CameraModel, PolynomialDistortion};
use thiserror::Error;

/// Error types for PnP solvers.
#[derive(Debug, Error)]
pub enum PnPError {
    /// Invalid input data - insufficient correspondences for the specific solver
    #[error("PnP solver requires at least {required} 2D-3D correspondences, got {actual}")]
    InsufficientCorrespondences {
        /// Minimum number of correspondences required by the solver
        required: usize,
        /// Actual number of correspondences provided
        actual: usize,
    },

    /// Invalid input data - mismatched array lengths with descriptive labels.
    #[error("Mismatched array lengths: {left_name} ({left_len}) != {right_name} ({right_len})")]
    MismatchedArrayLengths {
        /// Label for the left-hand slice
        left_name: &'static str,
        /// Length of the left-hand slice
        left_len: usize,
        /// Label for the right-hand slice
        right_name: &'static str,
        /// Length of the right-hand slice
        right_len: usize,
    },

    /// A coordinate is NaN or infinite.
    #[error("Non-finite {what} at index {index}")]
    NonFiniteInput {
        /// Which input carried the bad value
        what: &'static str,
        /// Index of the offending correspondence
        index: usize,
    },

    /// The object points do not span enough dimensions to fix a pose.
    #[error("Degenerate point configuration: {0}")]
    DegenerateConfiguration(String),

    /// The camera model was rejected.
    #[error(transparent)]
    Camera(#[from] CameraError),

    /// The solver produced no usable pose.
    #[error("Solver did not converge: {0}")]
    NoConvergence(String),

    /// Singular value decomposition failed
    #[error("SVD computation failed: {0}")]
    SvdFailed(String),
}

/// Numeric tolerances used by linear algebra routines throughout the PnP pipeline.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct NumericTol {
    /// Tolerance for singular-value decomposition.
    pub svd: f64,
    /// Epsilon threshold for determinant / singular-value checks when deciding whether to fall back to a pseudo-inverse.
    pub eps: f64,
    /// Relative eigenvalue ratio below which a point-cloud axis is considered flat.
    pub degenerate: f64,
}

impl Default for NumericTol {
    fn default() -> Self {
        Self {
            svd: 1e-12,
            eps: 1e-12,
            degenerate: 1e-10,
        }
    }
}

impl NumericTol {
    /// Set the eigenvalue ratio used to detect flat or collinear point sets.
    pub fn with_degenerate(mut self, ratio: f64) -> Self {
        self.degenerate = ratio;
        self
    }
}

/// Result returned by any PnP solver.
///
/// The rotation matrix maps coordinates from the **world** frame to the
/// **camera** frame, stored row-major (`rotation[row][col]`).
#[derive(Debug, Clone)]
pub struct PnPResult {
    /// Estimated rotation matrix.
    pub rotation: [[f64; 3]; 3],
    /// Estimated translation vector.
    pub translation: [f64; 3],
    /// Rodrigues axis-angle representation of the rotation.
    pub rvec: [f64; 3],
    /// Root-mean-square reprojection error in pixels (if computed).
    pub reproj_rmse: Option<f64>,
    /// Number of iterations taken (if applicable).
    pub num_iterations: Option<usize>,
    /// Whether the solver converged (if applicable).
    pub converged: Option<bool>,
}

/// Trait for PnP solvers.
pub trait PnPSolver {
    /// Solver-specific parameters.
    type Param;

    /// Solve for camera pose given 2D-3D correspondences.
    ///
    /// # Arguments
    /// * `world` – 3-D coordinates in the world frame.
    /// * `image` – Corresponding pixel coordinates, already undistorted.
    /// * `k` – Camera intrinsics matrix.
    /// * `params` – Solver-specific parameters.
    fn solve(
        world: &[[f64; 3]],
        image: &[[f64; 2]],
        k: &[[f64; 3]; 3],
        params: &Self::Param,
    ) -> Result<PnPResult, PnPError>;
}

/// Trait for PnP solvers that support camera models with distortion.
pub trait PnPSolverWithCamera {
    /// Solver-specific parameters.
    type Param;

    /// Solve for camera pose given 2D-3D correspondences with camera model support.
    ///
    /// # Arguments
    /// * `world` – 3-D coordinates in the world frame.
    /// * `image` – Corresponding pixel coordinates (may be distorted).
    /// * `camera` – Camera model with intrinsics and optional distortion.
    /// * `params` – Solver-specific parameters.
    fn solve_with_camera(
        world: &[[f64; 3]],
        image: &[[f64; 2]],
        camera: &CameraModel,
        params: &Self::Param,
    ) -> Result<PnPResult, PnPError>;
}

/// Undistorts the image points and forwards to the plain solver.
impl<T: PnPSolver> PnPSolverWithCamera for T {
    type Param = T::Param;

    fn solve_with_camera(
        world: &[[f64; 3]],
        image: &[[f64; 2]],
        camera: &CameraModel,
        params: &Self::Param,
    ) -> Result<PnPResult, PnPError> {
        // Bad input is reported as such rather than as an undistortion failure.
        check_correspondences(world, image, 0)?;
        let undistorted_image = if camera.has_distortion() {
            camera.undistort_points(image)?
        } else {
            image.to_vec()
        };

        let k = camera.intrinsics_matrix();

        T::solve(world, &undistorted_image, &k, params)
    }
}

/// Check the common preconditions of every PnP solver.
pub(crate) fn check_correspondences(
    world: &[[f64; 3]],
    image: &[[f64; 2]],
    required: usize,
) -> Result<(), PnPError> {
    if world.len() != image.len() {
        return Err(PnPError::MismatchedArrayLengths {
            left_name: "world points",
            left_len: world.len(),
            right_name: "image points",
            right_len: image.len(),
        });
    }
    if world.len() < required {
        return Err(PnPError::InsufficientCorrespondences {
            required,
            actual: world.len(),
        });
    }
    if let Some(index) = world.iter().position(|p| p.iter().any(|v| !v.is_finite())) {
        return Err(PnPError::NonFiniteInput {
            what: "world point",
            index,
        });
    }
    if let Some(index) = image.iter().position(|p| p.iter().any(|v| !v.is_finite())) {
        return Err(PnPError::NonFiniteInput {
            what: "image point",
            index,
        });
    }
    Ok(())
}

/// Build a camera model from a raw intrinsics matrix and an optional distortion.
pub(crate) fn camera_from_parts(
    k: &[[f64; 3]; 3],
    distortion: Option<&PolynomialDistortion>,
) -> Result<CameraModel, PnPError> {
    let intrinsics = crate::camera::CameraIntrinsics::from_matrix(k)?;
    Ok(match distortion {
        Some(d) => {
            d.validate()?;
            CameraModel::with_distortion(intrinsics, d.clone())
        }
        None => CameraModel::pinhole(intrinsics),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_correspondences_length_mismatch() {
        let world = [[0.0; 3]; 4];
        let image = [[0.0; 2]; 5];
        let err = check_correspondences(&world, &image, 4).unwrap_err();
        assert!(matches!(
            err,
            PnPError::MismatchedArrayLengths {
                left_len: 4,
                right_len: 5,
                ..
            }
        ));
    }

    #[test]
    fn test_check_correspondences_too_few() {
        let world = [[0.0; 3]; 3];
        let image = [[0.0; 2]; 3];
        let err = check_correspondences(&world, &image, 4).unwrap_err();
        assert!(matches!(
            err,
            PnPError::InsufficientCorrespondences {
                required: 4,
                actual: 3
            }
        ));
    }

    #[test]
    fn test_check_correspondences_nan() {
        let world = [[0.0; 3], [1.0, f64::NAN, 0.0], [0.0; 3], [0.0; 3]];
        let image = [[0.0; 2]; 4];
        let err = check_correspondences(&world, &image, 4).unwrap_err();
        assert!(matches!(
            err,
            PnPError::NonFiniteInput {
                what: "world point",
                index: 1
            }
        ));
    }
}
