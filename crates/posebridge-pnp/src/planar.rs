//! Pose initialisation for coplanar object points via a plane-to-image homography.
//!
//! The object points are expressed in a 2-D frame on their best-fit plane, a
//! normalized DLT homography maps that frame onto normalized image coordinates,
//! and the homography is decomposed into `[r1 r2 t]`.

use crate::camera::CameraIntrinsics;
use crate::ops::{compute_centroid, principal_axes, rmse_px, PlaneFrame};
use crate::so3::{mat3_to_rows, matrix_to_rodrigues, rows_to_mat3};
use crate::types::{check_correspondences, NumericTol, PnPError, PnPResult};
use glam::{DMat3, DVec2, DVec3};
use nalgebra::{DMatrix, Matrix3};

/// Estimate a world → camera pose from coplanar correspondences.
///
/// The points only need to be close to a plane; the best-fit plane is used and the
/// residual out-of-plane offsets are left for a later refinement. Image points must
/// be undistorted pixels.
pub fn solve_planar_homography(
    points_world: &[[f64; 3]],
    points_image: &[[f64; 2]],
    k: &[[f64; 3]; 3],
    tol: &NumericTol,
) -> Result<PnPResult, PnPError> {
    check_correspondences(points_world, points_image, 4)?;
    let (variances, axes) = principal_axes(points_world);
    if variances[0] <= f64::MIN_POSITIVE || variances[1] / variances[0] < tol.degenerate {
        return Err(PnPError::DegenerateConfiguration(
            "object points do not span a plane".to_string(),
        ));
    }
    let frame = PlaneFrame::from_axes(axes[0], axes[1]);
    solve_planar_in_frame(points_world, points_image, k, tol, &frame)
}

/// Homography pose in a plane frame already fitted to the object points.
pub(crate) fn solve_planar_in_frame(
    points_world: &[[f64; 3]],
    points_image: &[[f64; 2]],
    k: &[[f64; 3]; 3],
    tol: &NumericTol,
    frame: &PlaneFrame,
) -> Result<PnPResult, PnPError> {
    let intrinsics = CameraIntrinsics::from_matrix(k)?;
    let c = DVec3::from(compute_centroid(points_world));
    let PlaneFrame { e0, e1, normal } = *frame;
    let plane_rot = DMat3::from_cols(e0, e1, normal).transpose();

    let src: Vec<DVec2> = points_world
        .iter()
        .map(|p| {
            let d = DVec3::from(*p) - c;
            DVec2::new(d.dot(e0), d.dot(e1))
        })
        .collect();
    let dst: Vec<DVec2> = points_image
        .iter()
        .map(|uv| {
            let (x, y) = intrinsics.normalize(uv[0], uv[1]);
            DVec2::new(x, y)
        })
        .collect();

    let h = homography_dlt(&src, &dst, tol)?;
    let (r_h, t_h) = decompose_homography(&h, tol)?;

    // p_cam = R_h · (P · (p − c)) + t_h
    let r = r_h * plane_rot;
    let t = t_h - r * c;

    let rotation = mat3_to_rows(&r);
    let translation = t.to_array();
    let rmse = rmse_px(points_world, points_image, &rotation, &translation, k);
    log::debug!("planar homography init: rmse {rmse:.6} px");

    Ok(PnPResult {
        rotation,
        translation,
        rvec: matrix_to_rodrigues(&rotation),
        reproj_rmse: Some(rmse),
        num_iterations: None,
        converged: None,
    })
}

/// Similarity transform moving the points' centroid to the origin and their mean
/// distance to √2.
fn hartley_normalization(pts: &[DVec2]) -> Result<DMat3, PnPError> {
    let n = pts.len() as f64;
    let c = pts.iter().fold(DVec2::ZERO, |acc, &p| acc + p) / n;
    let mean_dist = pts.iter().map(|&p| p.distance(c)).sum::<f64>() / n;
    if mean_dist <= f64::MIN_POSITIVE || !mean_dist.is_finite() {
        return Err(PnPError::DegenerateConfiguration(
            "points collapse to a single location".to_string(),
        ));
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    Ok(DMat3::from_cols(
        DVec3::new(s, 0.0, 0.0),
        DVec3::new(0.0, s, 0.0),
        DVec3::new(-s * c.x, -s * c.y, 1.0),
    ))
}

/// Normalized direct linear transform for the homography mapping `src` onto `dst`.
fn homography_dlt(src: &[DVec2], dst: &[DVec2], tol: &NumericTol) -> Result<DMat3, PnPError> {
    let t_src = hartley_normalization(src)?;
    let t_dst = hartley_normalization(dst)?;

    let n = src.len();
    let mut mat_a = DMatrix::<f64>::zeros(2 * n, 9);
    for (i, (s, d)) in src.iter().zip(dst.iter()).enumerate() {
        let x1 = t_src.transform_point2(*s);
        let x2 = t_dst.transform_point2(*d);

        mat_a[(2 * i, 0)] = x1.x;
        mat_a[(2 * i, 1)] = x1.y;
        mat_a[(2 * i, 2)] = 1.0;
        mat_a[(2 * i, 6)] = -x2.x * x1.x;
        mat_a[(2 * i, 7)] = -x2.x * x1.y;
        mat_a[(2 * i, 8)] = -x2.x;

        mat_a[(2 * i + 1, 3)] = x1.x;
        mat_a[(2 * i + 1, 4)] = x1.y;
        mat_a[(2 * i + 1, 5)] = 1.0;
        mat_a[(2 * i + 1, 6)] = -x2.y * x1.x;
        mat_a[(2 * i + 1, 7)] = -x2.y * x1.y;
        mat_a[(2 * i + 1, 8)] = -x2.y;
    }

    // Smallest eigenvector of AᵀA; also valid for the minimal 4-point case.
    let eig = (mat_a.transpose() * &mat_a).symmetric_eigen();
    let min_idx = (0..9)
        .min_by(|&a, &b| eig.eigenvalues[a].total_cmp(&eig.eigenvalues[b]))
        .unwrap_or(8);
    let h = eig.eigenvectors.column(min_idx);

    let h_norm = rows_to_mat3(&[[h[0], h[1], h[2]], [h[3], h[4], h[5]], [h[6], h[7], h[8]]]);
    if h_norm.determinant().abs() < tol.eps {
        return Err(PnPError::DegenerateConfiguration(
            "homography is singular".to_string(),
        ));
    }

    Ok(t_dst.inverse() * h_norm * t_src)
}

/// Split `H ~ [r1 r2 t]` into a proper rotation and a translation in front of the camera.
fn decompose_homography(h: &DMat3, tol: &NumericTol) -> Result<(DMat3, DVec3), PnPError> {
    let h1 = h.x_axis;
    let h2 = h.y_axis;
    let h3 = h.z_axis;

    let norm_sum = h1.length() + h2.length();
    if norm_sum <= tol.eps {
        return Err(PnPError::DegenerateConfiguration(
            "homography has vanishing rotation columns".to_string(),
        ));
    }
    let mut lambda = 2.0 / norm_sum;
    if h3.z * lambda < 0.0 {
        lambda = -lambda;
    }

    let r1 = h1 * lambda;
    let r2 = h2 * lambda;
    let r3 = r1.cross(r2);
    let t = h3 * lambda;

    // Project onto SO(3).
    let m = Matrix3::new(
        r1.x, r2.x, r3.x, //
        r1.y, r2.y, r3.y, //
        r1.z, r2.z, r3.z,
    );
    let svd = m.svd(true, true);
    let u = svd
        .u
        .ok_or_else(|| PnPError::SvdFailed("homography rotation U".to_string()))?;
    let v_t = svd
        .v_t
        .ok_or_else(|| PnPError::SvdFailed("homography rotation Vᵀ".to_string()))?;
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let correction = Matrix3::from_diagonal(&nalgebra::Vector3::new(1.0, 1.0, -1.0));
        r = u * correction * v_t;
    }

    let rows: [[f64; 3]; 3] = std::array::from_fn(|i| std::array::from_fn(|j| r[(i, j)]));
    Ok((rows_to_mat3(&rows), t))
}
