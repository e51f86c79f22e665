//! Iterative PnP: a closed-form initialisation chosen from the object-point layout,
//! followed by Levenberg–Marquardt refinement of the reprojection error.

use crate::camera::CameraIntrinsics;
use crate::epnp::{solve_epnp, EPnPParams};
use crate::ops::{classify_layout, count_behind_camera, rmse_px, PointLayout};
use crate::p3p::solve_p3p;
use crate::planar::solve_planar_in_frame;
use crate::refine::{refine_pose_lm, LMParams};
use crate::so3::{matrix_to_rodrigues, rodrigues_to_matrix};
use crate::types::{check_correspondences, NumericTol, PnPError, PnPResult, PnPSolver};
use glam::DVec3;

/// Marker type for the iterative (initialise + refine) solver.
pub struct Iterative;

impl PnPSolver for Iterative {
    type Param = IterativeParams;

    fn solve(
        points_world: &[[f64; 3]],
        points_image: &[[f64; 2]],
        k: &[[f64; 3]; 3],
        params: &Self::Param,
    ) -> Result<PnPResult, PnPError> {
        solve_iterative(points_world, points_image, k, params)
    }
}

/// Default bound on the refined RMSE, in pixels.
pub const DEFAULT_MAX_REPROJECTION_ERROR: f64 = 2.0;

/// Below this many correspondences the general layout is also seeded from P3P.
const P3P_SEED_MAX_POINTS: usize = 6;

/// A refined RMSE below this many pixels is an exact fit; no further starts are tried.
const EXACT_FIT_PX: f64 = 1e-6;

/// Minimum `|ab × ac| / max edge²` for a triple to seed P3P.
const MIN_TRIANGLE_SHAPE: f64 = 1e-3;

/// Parameters for [`Iterative`].
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct IterativeParams {
    /// Shared numeric tolerances.
    pub tol: NumericTol,
    /// Refinement settings.
    pub lm: LMParams,
    /// Reject the pose when the refined RMSE (pixels) exceeds this bound.
    /// `None` accepts any finite RMSE.
    pub max_reprojection_error: Option<f64>,
}

impl Default for IterativeParams {
    fn default() -> Self {
        Self {
            tol: NumericTol::default(),
            lm: LMParams::default().with_max_iters(50),
            max_reprojection_error: Some(DEFAULT_MAX_REPROJECTION_ERROR),
        }
    }
}

impl IterativeParams {
    /// Replace the refinement settings.
    pub fn with_lm(mut self, lm: LMParams) -> Self {
        self.lm = lm;
        self
    }

    /// Replace the numeric tolerances.
    pub fn with_tol(mut self, tol: NumericTol) -> Self {
        self.tol = tol;
        self
    }

    /// Fail when the refined RMSE is above `max_px`.
    pub fn with_max_reprojection_error(mut self, max_px: f64) -> Self {
        self.max_reprojection_error = Some(max_px);
        self
    }

    /// Accept any finite refined RMSE.
    pub fn without_max_reprojection_error(mut self) -> Self {
        self.max_reprojection_error = None;
        self
    }
}

type Pose = ([[f64; 3]; 3], [f64; 3]);

/// Estimate the world → camera pose from undistorted pixel correspondences.
///
/// Collinear or coincident object points are rejected. Coplanar points start from
/// a homography decomposition, all others from EPnP. With fewer than six points
/// P3P on every well-shaped triple adds further starts. Each start is refined and
/// the lowest RMSE wins.
pub fn solve_iterative(
    points_world: &[[f64; 3]],
    points_image: &[[f64; 2]],
    k: &[[f64; 3]; 3],
    params: &IterativeParams,
) -> Result<PnPResult, PnPError> {
    check_correspondences(points_world, points_image, 4)?;
    let intrinsics = CameraIntrinsics::from_matrix(k)?;

    let mut last_err = None;
    let mut starts: Vec<Pose> = Vec::new();
    let init = match classify_layout(points_world, params.tol.degenerate) {
        PointLayout::Coincident => {
            return Err(PnPError::DegenerateConfiguration(
                "object points coincide".to_string(),
            ))
        }
        PointLayout::Collinear => {
            return Err(PnPError::DegenerateConfiguration(
                "object points are collinear".to_string(),
            ))
        }
        PointLayout::Planar(frame) => {
            log::debug!("object points are coplanar, initialising from a homography");
            solve_planar_in_frame(points_world, points_image, k, &params.tol, &frame)
        }
        PointLayout::General => {
            log::debug!("initialising from EPnP");
            let epnp = EPnPParams {
                tol: params.tol.clone(),
                refine_lm: None,
            };
            solve_epnp(points_world, points_image, k, &epnp)
        }
    };
    match init {
        Ok(init) => starts.push((init.rotation, init.translation)),
        Err(e) => {
            log::debug!("closed-form start failed: {e}");
            last_err = Some(e);
        }
    }
    if points_world.len() < P3P_SEED_MAX_POINTS {
        starts.extend(p3p_starts(points_world, points_image, &intrinsics));
        log::debug!("{} starts including P3P", starts.len());
    }

    // Rank the starts by their initial error; starts with points behind the camera
    // cannot be refined.
    let mut ranked: Vec<(f64, Pose)> = starts
        .into_iter()
        .filter(|(r, t)| count_behind_camera(points_world, r, t) == 0)
        .map(|(r, t)| (rmse_px(points_world, points_image, &r, &t, k), (r, t)))
        .filter(|(err, _)| err.is_finite())
        .collect();
    ranked.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut best: Option<([f64; 3], [f64; 3], f64, usize, bool)> = None;
    for (_, (r, t)) in ranked {
        let mut rvec = matrix_to_rodrigues(&r);
        let mut t = t;
        match refine_pose_lm(points_world, points_image, k, &mut rvec, &mut t, &params.lm) {
            Ok((rmse, iters, converged)) => {
                if !rmse.is_finite() || !rvec.iter().chain(t.iter()).all(|v| v.is_finite()) {
                    continue;
                }
                if best.as_ref().map_or(true, |b| rmse < b.2) {
                    best = Some((rvec, t, rmse, iters, converged));
                }
                if rmse < EXACT_FIT_PX {
                    break;
                }
            }
            Err(e) => last_err = Some(e),
        }
    }

    let (rvec, t, rmse, iters, converged) = best.ok_or_else(|| {
        last_err.unwrap_or_else(|| {
            PnPError::NoConvergence("no start has every point in front of the camera".to_string())
        })
    })?;
    let rotation = rodrigues_to_matrix(&rvec);

    if !rotation.iter().flatten().all(|v| v.is_finite()) {
        return Err(PnPError::NoConvergence(
            "refined pose is not finite".to_string(),
        ));
    }

    let behind = count_behind_camera(points_world, &rotation, &t);
    if behind > 0 {
        return Err(PnPError::NoConvergence(format!(
            "{behind} object points lie behind the camera"
        )));
    }

    if let Some(max_px) = params.max_reprojection_error {
        if rmse > max_px {
            return Err(PnPError::NoConvergence(format!(
                "reprojection RMSE {rmse:.4} px exceeds {max_px:.4} px"
            )));
        }
    }

    log::debug!("iterative PnP: {iters} LM iterations, rmse {rmse:.6} px, converged {converged}");

    Ok(PnPResult {
        rotation,
        translation: t,
        rvec,
        reproj_rmse: Some(rmse),
        num_iterations: Some(iters),
        converged: Some(converged),
    })
}

/// P3P poses from every well-shaped triple of correspondences.
fn p3p_starts(
    points_world: &[[f64; 3]],
    points_image: &[[f64; 2]],
    intrinsics: &CameraIntrinsics,
) -> Vec<Pose> {
    let bearings: Vec<[f64; 3]> = points_image
        .iter()
        .map(|&[u, v]| {
            let (x, y) = intrinsics.normalize(u, v);
            [x, y, 1.0]
        })
        .collect();

    let n = points_world.len();
    let mut starts = Vec::new();
    for a in 0..n {
        for b in a + 1..n {
            for c in b + 1..n {
                let tri = [points_world[a], points_world[b], points_world[c]];
                if triangle_shape(&tri) < MIN_TRIANGLE_SHAPE {
                    continue;
                }
                starts.extend(solve_p3p(&tri, &[bearings[a], bearings[b], bearings[c]]));
            }
        }
    }
    starts
}

/// Twice the triangle area over the longest squared edge; zero for collinear points.
fn triangle_shape(tri: &[[f64; 3]; 3]) -> f64 {
    let [a, b, c] = tri.map(DVec3::from);
    let longest = (b - a)
        .length_squared()
        .max((c - a).length_squared())
        .max((c - b).length_squared());
    if longest <= f64::MIN_POSITIVE {
        return 0.0;
    }
    (b - a).cross(c - a).length() / longest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::CameraModel;
    use approx::assert_relative_eq;

    fn camera() -> CameraModel {
        CameraModel::pinhole(CameraIntrinsics::new(800.0, 800.0, 320.0, 320.0))
    }

    #[test]
    fn test_iterative_general_layout() -> Result<(), PnPError> {
        let cam = camera();
        let world = vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
            [0.5, 0.7, 0.2],
            [-0.4, 0.1, 0.9],
        ];
        let r = rodrigues_to_matrix(&[0.2, 0.1, -0.3]);
        let t = [0.1, 0.2, 6.0];
        let image = cam.project_points(&world, &r, &t);

        let res = Iterative::solve(&world, &image, &cam.intrinsics_matrix(), &IterativeParams::default())?;
        for i in 0..3 {
            assert_relative_eq!(res.translation[i], t[i], epsilon = 1e-6);
            for j in 0..3 {
                assert_relative_eq!(res.rotation[i][j], r[i][j], epsilon = 1e-6);
            }
        }
        assert_eq!(res.converged, Some(true));
        Ok(())
    }

    #[test]
    fn test_iterative_planar_layout() -> Result<(), PnPError> {
        let cam = camera();
        let world = vec![
            [-0.5, -0.5, 0.0],
            [0.5, -0.5, 0.0],
            [0.5, 0.5, 0.0],
            [-0.5, 0.5, 0.0],
            [0.1, 0.3, 0.0],
        ];
        let r = rodrigues_to_matrix(&[0.4, -0.3, 0.2]);
        let t = [0.3, -0.1, 3.0];
        let image = cam.project_points(&world, &r, &t);

        let res = Iterative::solve(&world, &image, &cam.intrinsics_matrix(), &IterativeParams::default())?;
        for i in 0..3 {
            assert_relative_eq!(res.translation[i], t[i], epsilon = 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_iterative_rejects_collinear() {
        let cam = camera();
        let world = [[0.0, 0.0, 0.0], [1.0, 1.0, 1.0], [2.0, 2.0, 2.0], [3.0, 3.0, 3.0]];
        let image = [[100.0, 100.0], [110.0, 110.0], [120.0, 120.0], [130.0, 130.0]];
        let err = Iterative::solve(&world, &image, &cam.intrinsics_matrix(), &IterativeParams::default())
            .unwrap_err();
        assert!(matches!(err, PnPError::DegenerateConfiguration(_)));
    }

    #[test]
    fn test_iterative_rejects_coincident() {
        let cam = camera();
        let world = [[1.0, 2.0, 3.0]; 5];
        let image = [[100.0, 100.0]; 5];
        let err = Iterative::solve(&world, &image, &cam.intrinsics_matrix(), &IterativeParams::default())
            .unwrap_err();
        assert!(matches!(err, PnPError::DegenerateConfiguration(_)));
    }

    #[test]
    fn test_iterative_rmse_bound() {
        let cam = camera();
        let world = vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
            [1.0, 1.0, 1.0],
            [0.5, 0.2, 0.8],
            [0.3, 0.9, 0.1],
            [0.7, 0.4, 0.5],
        ];
        let r = rodrigues_to_matrix(&[0.0, 0.0, 0.0]);
        let mut image = cam.project_points(&world, &r, &[0.0, 0.0, 5.0]);
        image[4][0] += 25.0;

        let params = IterativeParams::default().with_max_reprojection_error(0.5);
        let err = Iterative::solve(&world, &image, &cam.intrinsics_matrix(), &params).unwrap_err();
        assert!(matches!(err, PnPError::NoConvergence(_)));

        let err = Iterative::solve(&world, &image, &cam.intrinsics_matrix(), &IterativeParams::default())
            .unwrap_err();
        assert!(matches!(err, PnPError::NoConvergence(_)));

        let params = IterativeParams::default().without_max_reprojection_error();
        let res = Iterative::solve(&world, &image, &cam.intrinsics_matrix(), &params)
            .expect("unbounded solve accepts the outlier");
        assert!(res.reproj_rmse.is_some_and(|e| e > DEFAULT_MAX_REPROJECTION_ERROR));
    }

    #[test]
    fn test_iterative_four_points_large_rotation() -> Result<(), PnPError> {
        let cam = camera();
        let world = vec![
            [0.6, -0.3, 0.2],
            [-0.5, 0.4, -0.1],
            [0.1, 0.7, 0.5],
            [-0.2, -0.6, -0.4],
        ];
        let k = cam.intrinsics_matrix();
        for rvec in [[1.5, -2.0, 0.7], [0.0, 3.0, 0.0], [-0.4, 0.3, 0.2]] {
            let r = rodrigues_to_matrix(&rvec);
            let t = [0.2, -0.1, 6.0];
            let image = cam.project_points(&world, &r, &t);

            let res = Iterative::solve(&world, &image, &k, &IterativeParams::default())?;
            for i in 0..3 {
                assert_relative_eq!(res.translation[i], t[i], epsilon = 1e-6);
                for j in 0..3 {
                    assert_relative_eq!(res.rotation[i][j], r[i][j], epsilon = 1e-6);
                }
            }
            assert!(res.reproj_rmse.is_some_and(|e| e < 1e-6));
        }
        Ok(())
    }

    #[test]
    fn test_triangle_shape() {
        let flat = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [2.0, 0.0, 0.0]];
        assert_eq!(triangle_shape(&flat), 0.0);
        let right = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        assert_relative_eq!(triangle_shape(&right), 0.5);
    }
}
