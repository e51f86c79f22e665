#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]
//!
//! # Posebridge PnP (Perspective-n-Point)
//!
//! Camera pose estimation from 2D-3D point correspondences, with the camera's
//! pose in the world recovered by inverting the estimated transform.
//!
//! ## Key Features
//!
//! - **Iterative solver**: EPnP, P3P or planar homography starts, refined with Levenberg–Marquardt
//! - **EPnP Algorithm**: Closed-form Efficient Perspective-n-Point solver
//! - **Distortion Handling**: 8-coefficient rational lens model, undistorted before solving
//! - **Degeneracy checks**: Collinear or coincident object points are rejected up front
//! - **Calibration**: Grid-search Kabsch alignment of a direction sensor to reference points
//!
//! ## Example: World pose
//!
//! ```rust
//! use posebridge_pnp::{solve_world_pose, IterativeParams};
//!
//! // Unit cube corners
//! let world_points: Vec<[f64; 3]> = (0..8)
//!     .map(|i| {
//!         let s = |b: i32| if (i >> b) & 1 == 1 { 0.5 } else { -0.5 };
//!         [s(0), s(1), s(2)]
//!     })
//!     .collect();
//!
//! // Seen by a camera at (0, 0, -5) looking down +z
//! let image_points: Vec<[f64; 2]> = world_points
//!     .iter()
//!     .map(|p| [800.0 * p[0] / (p[2] + 5.0) + 320.0, 800.0 * p[1] / (p[2] + 5.0) + 320.0])
//!     .collect();
//!
//! let k = [[800.0, 0.0, 320.0], [0.0, 800.0, 320.0], [0.0, 0.0, 1.0]];
//!
//! let pose = solve_world_pose(&world_points, &image_points, &k, None, &IterativeParams::default())?;
//!
//! assert!((pose.position[2] + 5.0).abs() < 1e-6);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Example: EPnP
//!
//! ```rust
//! use posebridge_pnp::{solve_pnp, PnPMethod};
//!
//! let world_points = vec![
//!     [0.0, 0.0, 0.0],
//!     [1.0, 0.0, 0.0],
//!     [0.0, 1.0, 0.0],
//!     [0.0, 0.0, 1.0],
//! ];
//! // Seen from t = (0.2, 0.1, 4) with no rotation
//! let image_points = vec![
//!     [360.0, 260.0],
//!     [560.0, 260.0],
//!     [360.0, 460.0],
//!     [352.0, 256.0],
//! ];
//! let k = [[800.0, 0.0, 320.0], [0.0, 800.0, 240.0], [0.0, 0.0, 1.0]];
//!
//! let result = solve_pnp(&world_points, &image_points, &k, None, PnPMethod::EPnPDefault)?;
//!
//! println!("Rotation: {:?}", result.rotation);
//! println!("Translation: {:?}", result.translation);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

/// Pinhole camera intrinsics and the polynomial lens distortion model.
pub mod camera;

/// Grid-search Kabsch calibration of a direction sensor.
pub mod calibration;

/// Efficient Perspective-n-Point (EPnP) solver implementation.
///
/// A fast and accurate method for computing camera pose from 2D-3D correspondences.
pub mod epnp;

/// Initialise-then-refine solver used by the C boundary.
pub mod iterative;

/// Minimal three-point solver seeding small point sets.
pub mod p3p;

/// Pose initialisation for coplanar object points.
pub mod planar;

/// Camera pose in world coordinates.
pub mod pose;

/// Levenberg–Marquardt pose refinement.
pub mod refine;

/// Rigid alignment between point sets.
pub mod rigid;

/// Rotations and Rodrigues vectors.
pub mod so3;

/// Common data types and traits for PnP solvers.
///
/// Defines the interface and result types shared across different PnP algorithms.
pub mod types;

mod ops;

pub use camera::{CameraError, CameraIntrinsics, CameraModel, PolynomialDistortion};
pub use epnp::{solve_epnp, EPnP, EPnPParams};
pub use iterative::{
    solve_iterative, Iterative, IterativeParams, DEFAULT_MAX_REPROJECTION_ERROR,
};
pub use p3p::solve_p3p;
pub use planar::solve_planar_homography;
pub use pose::WorldPose;
pub use refine::{refine_pose_lm, LMParams};
pub use types::{NumericTol, PnPError, PnPResult, PnPSolver, PnPSolverWithCamera};

/// Enumeration of the Perspective-n-Point algorithms available in this crate.
#[derive(Debug, Clone)]
pub enum PnPMethod {
    /// Efficient PnP solver with a user-supplied parameter object.
    EPnP(EPnPParams),
    /// Efficient PnP solver with the crate's default parameters.
    EPnPDefault,
    /// Initialise and refine with a user-supplied parameter object.
    Iterative(IterativeParams),
    /// Initialise and refine with the crate's default parameters.
    IterativeDefault,
}

/// Dispatch function that routes to the chosen PnP solver.
///
/// When `distortion` is given, the image points are undistorted before solving.
pub fn solve_pnp(
    world: &[[f64; 3]],
    image: &[[f64; 2]],
    k: &[[f64; 3]; 3],
    distortion: Option<&PolynomialDistortion>,
    method: PnPMethod,
) -> Result<PnPResult, PnPError> {
    let camera = types::camera_from_parts(k, distortion)?;
    match method {
        PnPMethod::EPnP(params) => EPnP::solve_with_camera(world, image, &camera, &params),
        PnPMethod::EPnPDefault => {
            EPnP::solve_with_camera(world, image, &camera, &EPnPParams::default())
        }
        PnPMethod::Iterative(params) => {
            Iterative::solve_with_camera(world, image, &camera, &params)
        }
        PnPMethod::IterativeDefault => {
            Iterative::solve_with_camera(world, image, &camera, &IterativeParams::default())
        }
    }
}

/// Solve with the iterative solver against a full camera model.
pub fn solve_pnp_with_camera(
    world: &[[f64; 3]],
    image: &[[f64; 2]],
    camera: &CameraModel,
    params: &IterativeParams,
) -> Result<PnPResult, PnPError> {
    if let Some(d) = &camera.distortion {
        d.validate()?;
    }
    Iterative::solve_with_camera(world, image, camera, params)
}

/// Estimate where the camera is in the world and how it is oriented.
///
/// Runs the iterative solver and inverts its world → camera transform.
pub fn solve_world_pose(
    world: &[[f64; 3]],
    image: &[[f64; 2]],
    k: &[[f64; 3]; 3],
    distortion: Option<&PolynomialDistortion>,
    params: &IterativeParams,
) -> Result<WorldPose, PnPError> {
    let result = solve_pnp(world, image, k, distortion, PnPMethod::Iterative(params.clone()))?;
    Ok(WorldPose::from_pnp(&result))
}
