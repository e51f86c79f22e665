//! Efficient Perspective-n-Point (EPnP) solver
//! Paper: [Lepetit et al., IJCV 2009](https://www.tugraz.at/fileadmin/user_upload/Institute/ICG/Images/team_lepetit/publications/lepetit_ijcv08.pdf)
//! Reference: [OpenCV EPnP implementation](https://github.com/opencv/opencv/blob/4.x/modules/calib3d/src/epnp.cpp)

use crate::camera::CameraIntrinsics;
use crate::ops::{compute_centroid, gauss_newton, principal_axes, rmse_px, PAIRS};
use crate::refine::{refine_pose_lm, LMParams};
use crate::rigid::umeyama;
use crate::so3::matrix_to_rodrigues;
use crate::types::{check_correspondences, NumericTol, PnPError, PnPResult, PnPSolver};
use glam::DVec3;
use nalgebra::{DMatrix, DVector, Matrix3};

/// Marker type representing the Efficient PnP algorithm.
pub struct EPnP;

impl PnPSolver for EPnP {
    type Param = EPnPParams;

    fn solve(
        points_world: &[[f64; 3]],
        points_image: &[[f64; 2]],
        k: &[[f64; 3]; 3],
        params: &Self::Param,
    ) -> Result<PnPResult, PnPError> {
        solve_epnp(points_world, points_image, k, params)
    }
}

/// Parameters controlling the EPnP solver.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EPnPParams {
    /// Shared numeric tolerances.
    pub tol: NumericTol,
    /// Optional LM refinement parameters. If `Some`, the pose will be refined
    /// after the initial EPnP solution.
    pub refine_lm: Option<LMParams>,
}

impl EPnPParams {
    /// Enable LM refinement with the given parameters.
    pub fn with_refine_lm(mut self, lm: LMParams) -> Self {
        self.refine_lm = Some(lm);
        self
    }
}

/// Solve Perspective-n-Point (EPnP).
///
/// # Arguments
/// * `points_world` – 3-D coordinates in the world frame, shape *(N,3)* with `N≥4`.
/// * `points_image` – Corresponding undistorted pixel coordinates, shape *(N,2)*.
/// * `k` – Camera intrinsics matrix.
///
/// # Returns
/// A [`PnPResult`] with
/// * `rotation` – 3×3 rotation **world → camera**,
/// * `translation` – 3-vector translation,
/// * `rvec` – Rodrigues axis-angle representation of `rotation`.
pub fn solve_epnp(
    points_world: &[[f64; 3]],
    points_image: &[[f64; 2]],
    k: &[[f64; 3]; 3],
    params: &EPnPParams,
) -> Result<PnPResult, PnPError> {
    check_correspondences(points_world, points_image, 4)?;
    CameraIntrinsics::from_matrix(k)?;
    let n = points_world.len();

    let cw = select_control_points(points_world);

    let alphas = compute_barycentric(points_world, &cw, params.tol.eps)?;

    // Build the 2N×12 design matrix M
    let m_rows = build_m(&alphas, points_image, k)?;

    let m_flat: Vec<f64> = m_rows.iter().flat_map(|row| row.iter()).cloned().collect();
    let m_mat = DMatrix::<f64>::from_row_slice(2 * n, 12, &m_flat);

    // Null-space of M from the eigen-decomposition of MᵀM (12×12); this also
    // covers N < 6 where M has fewer rows than columns.
    let mtm = m_mat.transpose() * &m_mat;
    let eig = mtm.symmetric_eigen();

    let mut order: Vec<usize> = (0..12).collect();
    order.sort_by(|&a, &b| eig.eigenvalues[a].total_cmp(&eig.eigenvalues[b]));

    // Column k holds the eigenvector of the (k+1)-th smallest eigenvalue.
    let null4 = DMatrix::<f64>::from_fn(12, 4, |r, c| eig.eigenvectors[(r, order[c])]);

    let l = build_l6x10(&null4);
    let rho = rho_ctrlpts(&cw);
    let rho_vec = DVector::<f64>::from_column_slice(&rho);

    let betas: Vec<[f64; 4]> = [
        estimate_beta([0, 1, 3, 6], &l, &rho_vec, params.tol.svd),
        estimate_beta([0, 1, 2], &l, &rho_vec, params.tol.svd),
        estimate_beta([0, 1, 2, 3, 4], &l, &rho_vec, params.tol.svd),
    ]
    .into_iter()
    .flatten()
    .map(|b| gauss_newton(b, &null4, &rho))
    .collect();

    let mut best: Option<([[f64; 3]; 3], [f64; 3], f64)> = None;
    for bet in &betas {
        let Ok((r_c, t_c)) = pose_from_betas(bet, &null4, &alphas, points_world) else {
            continue;
        };
        let err = rmse_px(points_world, points_image, &r_c, &t_c, k);
        if !err.is_finite() {
            continue;
        }
        if best.as_ref().map_or(true, |b| err < b.2) {
            best = Some((r_c, t_c, err));
        }
    }

    let (best_r, best_t, best_err) = best.ok_or_else(|| {
        PnPError::NoConvergence("no EPnP beta hypothesis produced a finite pose".to_string())
    })?;
    log::debug!("EPnP: {} hypotheses, best rmse {best_err:.6} px", betas.len());

    let mut rvec = matrix_to_rodrigues(&best_r);

    if let Some(ref lm_params) = params.refine_lm {
        let mut t = best_t;
        let (rmse, iters, converged) =
            refine_pose_lm(points_world, points_image, k, &mut rvec, &mut t, lm_params)?;
        return Ok(PnPResult {
            rotation: crate::so3::rodrigues_to_matrix(&rvec),
            translation: t,
            rvec,
            reproj_rmse: Some(rmse),
            num_iterations: Some(iters),
            converged: Some(converged),
        });
    }

    Ok(PnPResult {
        rotation: best_r,
        translation: best_t,
        rvec,
        reproj_rmse: Some(best_err),
        num_iterations: None,
        converged: Some(true),
    })
}

/// Compute pose (R, t) from a set of betas using the null-space vectors.
fn pose_from_betas(
    betas: &[f64; 4],
    null4: &DMatrix<f64>, // 12×4 matrix (V)
    alphas: &[[f64; 4]],  // barycentric coordinates for each world point
    points_world: &[[f64; 3]],
) -> Result<([[f64; 3]; 3], [f64; 3]), PnPError> {
    let beta_vec = DVector::from_column_slice(betas);
    let cc_flat = null4 * beta_vec; // 12×1 vector

    let mut cc = [DVec3::ZERO; 4];
    for (i, c) in cc.iter_mut().enumerate() {
        *c = DVec3::new(cc_flat[3 * i], cc_flat[3 * i + 1], cc_flat[3 * i + 2]);
    }

    let camera_point = |a: &[f64; 4]| -> DVec3 {
        a.iter()
            .zip(cc.iter())
            .fold(DVec3::ZERO, |acc, (&w, &c)| acc + c * w)
    };

    // The null-space is only defined up to sign: keep the solution in front of the camera.
    let sign = if camera_point(&alphas[0]).z < 0.0 { -1.0 } else { 1.0 };

    let pc: Vec<DVec3> = alphas.iter().map(|a| camera_point(a) * sign).collect();
    let pw: Vec<DVec3> = points_world.iter().map(|&p| DVec3::from(p)).collect();

    let (r, t, _s) = umeyama(&pw, &pc).map_err(|e| PnPError::SvdFailed(e.to_string()))?;
    Ok((r, t))
}

/// Control points: the centroid plus one point along each principal axis, scaled by
/// the standard deviation of the cloud along that axis.
fn select_control_points(points_world: &[[f64; 3]]) -> [DVec3; 4] {
    let c = DVec3::from(compute_centroid(points_world));
    let (variances, axes) = principal_axes(points_world);

    let mut cw = [c; 4];
    for (i, (var, axis)) in variances.iter().zip(axes.iter()).enumerate() {
        cw[i + 1] = c + *axis * var.sqrt();
    }
    cw
}

/// Compute barycentric coordinates of world-space points with respect to the
/// 4 control points returned by `select_control_points`.
///
/// # Arguments
/// - `points_world`: World points, shape `(N, 3)`.
/// - `cw`: Control points, shape `(4, 3)`.
/// - `eps`: Degeneracy threshold for the control-point tetrahedron. If `|det(B)| <= eps`,
///   a Moore–Penrose pseudo-inverse is used instead of the exact inverse.
///
/// # Returns
/// `Vec<[f64; 4]>` of length `N`. For each point, the weights `[a0, a1, a2, a3]` satisfy
/// `a0 + a1 + a2 + a3 = 1` and `pw_i = sum_j(a_j * Cw_j)`.
fn compute_barycentric(
    points_world: &[[f64; 3]],
    cw: &[DVec3; 4],
    eps: f64,
) -> Result<Vec<[f64; 4]>, PnPError> {
    let d: [DVec3; 3] = std::array::from_fn(|i| cw[i + 1] - cw[0]);
    let b = Matrix3::from_columns(&[
        nalgebra::Vector3::new(d[0].x, d[0].y, d[0].z),
        nalgebra::Vector3::new(d[1].x, d[1].y, d[1].z),
        nalgebra::Vector3::new(d[2].x, d[2].y, d[2].z),
    ]);

    let b_inv = if b.determinant().abs() > eps {
        b.try_inverse()
            .ok_or_else(|| PnPError::SvdFailed("control-point basis is singular".to_string()))?
    } else {
        b.pseudo_inverse(eps)
            .map_err(|e| PnPError::SvdFailed(e.to_string()))?
    };

    Ok(points_world
        .iter()
        .map(|p| {
            let diff = DVec3::from(*p) - cw[0];
            let lamb = b_inv * nalgebra::Vector3::new(diff.x, diff.y, diff.z);
            [1.0 - (lamb.x + lamb.y + lamb.z), lamb.x, lamb.y, lamb.z]
        })
        .collect())
}

/// Construct the 2N x 12 design matrix `M` used by EPnP.
///
/// # Arguments
/// - `alphas`: Barycentric coordinates for each world point, produced by [`compute_barycentric`]; shape `(N, 4)`.
/// - `points_image`: Pixel coordinates for each correspondence; shape `(N, 2)`.
/// - `k`: Camera intrinsics 3 x 3 matrix.
///
/// # Returns
/// A vector of length `2*N` where each element is a row of `M` (two rows per correspondence).
fn build_m(
    alphas: &[[f64; 4]],
    points_image: &[[f64; 2]],
    k: &[[f64; 3]; 3],
) -> Result<Vec<[f64; 12]>, PnPError> {
    if alphas.len() != points_image.len() {
        return Err(PnPError::MismatchedArrayLengths {
            left_name: "barycentric alphas",
            left_len: alphas.len(),
            right_name: "image points",
            right_len: points_image.len(),
        });
    }
    let n = alphas.len();

    let fu = k[0][0];
    let fv = k[1][1];
    let uc = k[0][2];
    let vc = k[1][2];

    let mut m = vec![[0.0f64; 12]; 2 * n];

    for (i, (a, &[u, v])) in alphas.iter().zip(points_image.iter()).enumerate() {
        let row_x = 2 * i;
        let row_y = row_x + 1;

        for (j, &alpha) in a.iter().enumerate() {
            let base = 3 * j;
            m[row_x][base] = alpha * fu;
            m[row_x][base + 2] = alpha * (uc - u);
            m[row_y][base + 1] = alpha * fv;
            m[row_y][base + 2] = alpha * (vc - v);
        }
    }

    Ok(m)
}

/// Build the 6×10 matrix **L** from the 12×4 null-space matrix `V`.
///
/// Row `r` expresses the squared distance between camera control points of pair `r`
/// as a linear function of the products `βa·βb` in the order
/// `[β0², β0β1, β1², β0β2, β1β2, β2², β0β3, β1β3, β2β3, β3²]`.
fn build_l6x10(null4: &DMatrix<f64>) -> [[f64; 10]; 6] {
    let mut l = [[0.0f64; 10]; 6];

    for (j, &(a, b)) in PAIRS.iter().enumerate() {
        let mut d = [DVec3::ZERO; 4];
        for (k, dk) in d.iter_mut().enumerate() {
            let col = null4.column(k);
            *dk = DVec3::new(
                col[3 * a] - col[3 * b],
                col[3 * a + 1] - col[3 * b + 1],
                col[3 * a + 2] - col[3 * b + 2],
            );
        }

        l[j] = [
            d[0].dot(d[0]),
            2.0 * d[0].dot(d[1]),
            d[1].dot(d[1]),
            2.0 * d[0].dot(d[2]),
            2.0 * d[1].dot(d[2]),
            d[2].dot(d[2]),
            2.0 * d[0].dot(d[3]),
            2.0 * d[1].dot(d[3]),
            2.0 * d[2].dot(d[3]),
            d[3].dot(d[3]),
        ];
    }
    l
}

/// Extracts a 6×k `DMatrix` by picking the specified columns from the 6×10 `L` matrix.
fn l_submatrix(l: &[[f64; 10]; 6], cols: &[usize]) -> DMatrix<f64> {
    DMatrix::<f64>::from_fn(6, cols.len(), |r, c| l[r][cols[c]])
}

/// Solve for a beta vector given a column subset of the 6×10 L matrix.
/// Returns `None` if the least-squares solve fails or the hypothesis is degenerate.
fn estimate_beta<const K: usize>(
    cols: [usize; K],
    l: &[[f64; 10]; 6],
    rho: &DVector<f64>,
    tol_svd: f64,
) -> Option<[f64; 4]> {
    let l_sub = l_submatrix(l, &cols);
    let sol = l_sub.svd(true, true).solve(rho, tol_svd).ok()?;
    let x = sol.column(0);

    let mut beta = [0.0; 4];
    match K {
        // [β0², β0β1, β0β2, β0β3]
        4 => {
            let b0 = x[0].abs().sqrt();
            if b0 == 0.0 {
                return None;
            }
            let sign = if x[0] < 0.0 { -1.0 } else { 1.0 };
            beta = [b0, sign * x[1] / b0, sign * x[2] / b0, sign * x[3] / b0];
        }
        // [β0², β0β1, β1²]
        3 => {
            if x[0] < 0.0 {
                beta[0] = (-x[0]).sqrt();
                beta[1] = if x[2] < 0.0 { (-x[2]).sqrt() } else { 0.0 };
            } else {
                beta[0] = x[0].sqrt();
                beta[1] = if x[2] > 0.0 { x[2].sqrt() } else { 0.0 };
            }
            if x[1] < 0.0 {
                beta[0] = -beta[0];
            }
        }
        // [β0², β0β1, β1², β0β2, β1β2]
        5 => {
            if x[0] < 0.0 {
                beta[0] = (-x[0]).sqrt();
                beta[1] = if x[2] < 0.0 { (-x[2]).sqrt() } else { 0.0 };
            } else {
                beta[0] = x[0].sqrt();
                beta[1] = if x[2] > 0.0 { x[2].sqrt() } else { 0.0 };
            }
            if x[1] < 0.0 {
                beta[0] = -beta[0];
            }
            if beta[0] == 0.0 {
                return None;
            }
            beta[2] = x[3] / beta[0];
        }
        _ => return None,
    }

    beta.iter().all(|b| b.is_finite()).then_some(beta)
}

/// Compute the six squared distances (ρ vector) between the 4 control points.
fn rho_ctrlpts(cw: &[DVec3; 4]) -> [f64; 6] {
    PAIRS.map(|(i, j)| cw[i].distance_squared(cw[j]))
}

#[cfg(test)]
mod solve_epnp_tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_scene() -> (Vec<[f64; 3]>, Vec<[f64; 2]>, [[f64; 3]; 3], [[f64; 3]; 3], [f64; 3]) {
        let k = [[800.0, 0.0, 640.0], [0.0, 800.0, 480.0], [0.0, 0.0, 1.0]];
        let r = crate::so3::rodrigues_to_matrix(&[0.1, -0.25, 0.05]);
        let t = [0.15, -0.05, 4.0];

        let world = vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
            [1.0, 1.0, 0.5],
            [-0.5, 0.3, 0.8],
            [0.4, -0.6, 0.2],
        ];
        let camera = crate::camera::CameraModel::pinhole(CameraIntrinsics::new(800.0, 800.0, 640.0, 480.0));
        let image = camera.project_points(&world, &r, &t);
        (world, image, k, r, t)
    }

    #[test]
    fn test_barycentric_reconstructs_points() -> Result<(), PnPError> {
        let (world, _, _, _, _) = sample_scene();
        let cw = select_control_points(&world);
        let alphas = compute_barycentric(&world, &cw, NumericTol::default().eps)?;

        for (p, alpha) in world.iter().zip(alphas.iter()) {
            let recon = alpha
                .iter()
                .zip(cw.iter())
                .fold(DVec3::ZERO, |acc, (&a, &c)| acc + c * a);
            assert_relative_eq!(recon.x, p[0], epsilon = 1e-9);
            assert_relative_eq!(recon.y, p[1], epsilon = 1e-9);
            assert_relative_eq!(recon.z, p[2], epsilon = 1e-9);
            assert_relative_eq!(alpha.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
        }
        Ok(())
    }

    #[test]
    fn test_build_m_rows() -> Result<(), PnPError> {
        let (world, image, k, _, _) = sample_scene();
        let cw = select_control_points(&world);
        let alphas = compute_barycentric(&world, &cw, NumericTol::default().eps)?;

        let m = build_m(&alphas, &image, &k)?;
        assert_eq!(m.len(), 2 * world.len());

        for j in 0..4 {
            let base = 3 * j;
            assert_relative_eq!(m[0][base], alphas[0][j] * 800.0);
            assert_relative_eq!(m[0][base + 2], alphas[0][j] * (640.0 - image[0][0]));
            assert_relative_eq!(m[1][base + 1], alphas[0][j] * 800.0);
            assert_relative_eq!(m[1][base + 2], alphas[0][j] * (480.0 - image[0][1]));
        }

        assert!(build_m(&alphas[..2], &image, &k).is_err());
        Ok(())
    }

    #[test]
    fn test_solve_epnp_noise_free() -> Result<(), PnPError> {
        let (world, image, k, r, t) = sample_scene();

        let result = EPnP::solve(&world, &image, &k, &EPnPParams::default())?;

        for i in 0..3 {
            for j in 0..3 {
                assert_relative_eq!(result.rotation[i][j], r[i][j], epsilon = 1e-6);
            }
            assert_relative_eq!(result.translation[i], t[i], epsilon = 1e-6);
        }
        assert_relative_eq!(result.rvec[0], 0.1, epsilon = 1e-6);
        assert!(result.reproj_rmse.is_some_and(|e| e < 1e-6));
        Ok(())
    }

    #[test]
    fn test_solve_epnp_minimal_four_points() -> Result<(), PnPError> {
        let (world, image, k, r, t) = sample_scene();

        let result = EPnP::solve(&world[..4], &image[..4], &k, &EPnPParams::default())?;

        for i in 0..3 {
            for j in 0..3 {
                assert_relative_eq!(result.rotation[i][j], r[i][j], epsilon = 1e-3);
            }
            assert_relative_eq!(result.translation[i], t[i], epsilon = 1e-3);
        }
        Ok(())
    }

    #[test]
    fn test_refine_does_not_worsen_rmse() -> Result<(), PnPError> {
        let (world, mut image, k, _, _) = sample_scene();
        // Perturb observations by a fraction of a pixel.
        for (i, p) in image.iter_mut().enumerate() {
            p[0] += if i % 2 == 0 { 0.4 } else { -0.3 };
            p[1] += if i % 3 == 0 { -0.2 } else { 0.25 };
        }

        let plain = EPnP::solve(&world, &image, &k, &EPnPParams::default())?;
        let refined = EPnP::solve(
            &world,
            &image,
            &k,
            &EPnPParams::default().with_refine_lm(LMParams::default()),
        )?;

        let rmse0 = plain.reproj_rmse.unwrap_or(f64::INFINITY);
        let rmse1 = refined.reproj_rmse.unwrap_or(f64::INFINITY);
        assert!(rmse1 <= rmse0 + 1e-9, "LM RMSE should not be worse: {rmse1} vs {rmse0}");
        Ok(())
    }

    #[test]
    fn test_solve_epnp_rejects_few_points() {
        let (world, image, k, _, _) = sample_scene();
        let err = EPnP::solve(&world[..3], &image[..3], &k, &EPnPParams::default()).unwrap_err();
        assert!(matches!(
            err,
            PnPError::InsufficientCorrespondences {
                required: 4,
                actual: 3
            }
        ));
    }
}
