#![allow(clippy::op_ref)]
use glam::DVec3;
use nalgebra::{DMatrix, Matrix3, Matrix3x4, Matrix4, SMatrix, SVector, Vector3, Vector4};

/// Compute the centroid of a set of points.
pub(crate) fn compute_centroid(pts: &[[f64; 3]]) -> [f64; 3] {
    let n = pts.len() as f64;
    let sum = pts.iter().fold(DVec3::ZERO, |acc, &p| acc + DVec3::from(p));

    (sum / n).to_array()
}

/// Principal axes of a point set: eigenvalues of the covariance in descending order,
/// with the matching unit eigenvectors.
pub(crate) fn principal_axes(pts: &[[f64; 3]]) -> ([f64; 3], [DVec3; 3]) {
    let n = pts.len() as f64;
    let c = DVec3::from(compute_centroid(pts));

    let mut cov = Matrix3::<f64>::zeros();
    for p in pts {
        let d = DVec3::from(*p) - c;
        let d = Vector3::new(d.x, d.y, d.z);
        cov += d * d.transpose();
    }
    cov /= n;

    let eig = cov.symmetric_eigen();
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eig.eigenvalues[b].total_cmp(&eig.eigenvalues[a]));

    let values = order.map(|i| eig.eigenvalues[i].max(0.0));
    let axes = order.map(|i| {
        let v = eig.eigenvectors.column(i);
        DVec3::new(v[0], v[1], v[2])
    });
    (values, axes)
}

/// Right-handed frame on the best-fit plane of a point set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct PlaneFrame {
    /// First in-plane axis
    pub e0: DVec3,
    /// Second in-plane axis
    pub e1: DVec3,
    /// Plane normal, `e0 × e1`
    pub normal: DVec3,
}

impl PlaneFrame {
    /// Orthonormalize the two dominant principal axes.
    pub(crate) fn from_axes(a0: DVec3, a1: DVec3) -> Self {
        let e0 = a0.normalize();
        let e1 = (a1 - e0 * e0.dot(a1)).normalize();
        Self {
            e0,
            e1,
            normal: e0.cross(e1),
        }
    }
}

/// Spatial layout of an object point set, as seen by the solvers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum PointLayout {
    /// Points span all three dimensions.
    General,
    /// Points lie on a plane.
    Planar(PlaneFrame),
    /// All points coincide.
    Coincident,
    /// All points lie on a line.
    Collinear,
}

/// Classify the point set from the ratios of its covariance eigenvalues.
pub(crate) fn classify_layout(pts: &[[f64; 3]], degenerate_ratio: f64) -> PointLayout {
    let (values, axes) = principal_axes(pts);

    if values[0] <= f64::MIN_POSITIVE {
        return PointLayout::Coincident;
    }
    if values[1] / values[0] < degenerate_ratio {
        return PointLayout::Collinear;
    }
    if values[2] / values[0] < degenerate_ratio {
        return PointLayout::Planar(PlaneFrame::from_axes(axes[0], axes[1]));
    }
    PointLayout::General
}

/// Squared pixel reprojection error for a single correspondence.
pub(crate) fn project_sq_error(
    world_point: &[f64; 3],
    image_point: &[f64; 2],
    r: &[[f64; 3]; 3],
    t: &[f64; 3],
    k: &[[f64; 3]; 3],
) -> f64 {
    let pc: [f64; 3] = std::array::from_fn(|i| {
        r[i][0] * world_point[0] + r[i][1] * world_point[1] + r[i][2] * world_point[2] + t[i]
    });
    let inv_z = 1.0 / pc[2];
    let u_hat = k[0][0] * pc[0] * inv_z + k[0][2];
    let v_hat = k[1][1] * pc[1] * inv_z + k[1][2];
    let du = u_hat - image_point[0];
    let dv = v_hat - image_point[1];
    du.mul_add(du, dv * dv)
}

/// Root-mean-square reprojection error in pixels over all correspondences.
pub(crate) fn rmse_px(
    points_world: &[[f64; 3]],
    points_image: &[[f64; 2]],
    r: &[[f64; 3]; 3],
    t: &[f64; 3],
    k: &[[f64; 3]; 3],
) -> f64 {
    let sum_sq: f64 = points_world
        .iter()
        .zip(points_image.iter())
        .map(|(pw, uv)| project_sq_error(pw, uv, r, t, k))
        .sum();
    (sum_sq / points_world.len() as f64).sqrt()
}

/// Number of world points that land at or behind the camera plane.
pub(crate) fn count_behind_camera(
    points_world: &[[f64; 3]],
    r: &[[f64; 3]; 3],
    t: &[f64; 3],
) -> usize {
    points_world
        .iter()
        .filter(|p| r[2][0] * p[0] + r[2][1] * p[1] + r[2][2] * p[2] + t[2] <= 0.0)
        .count()
}

const EPSILON: f64 = 1e-20;
const NUM_CONTROL_POINTS: usize = 4;
const MAX_ITERATIONS: usize = 6;
pub(crate) const PAIRS: [(usize, usize); 6] = [(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)];
const NUM_PAIRS: usize = PAIRS.len(); // 6

/// Solves the linear system A * x = b for a 4x4 symmetric positive-definite matrix A
/// using an unrolled Cholesky decomposition.
///
/// # Arguments
/// * `a` - A reference to a 4x4 matrix, assumed to be symmetric positive-definite.
/// * `b` - A reference to a 4x4 vector.
///
/// # Returns
/// * `Some(Vector4<f64>)` containing the solution vector `x` if `A` is positive-definite.
/// * `None` if the decomposition fails (i.e., `A` is not positive-definite).
#[inline(always)]
pub fn solve_4x4_cholesky(a: &Matrix4<f64>, b: &Vector4<f64>) -> Option<Vector4<f64>> {
    // --- Cholesky Decomposition (L * L^T = A) ---
    let l_11 = a.m11.sqrt();
    if l_11.is_nan() || l_11 < EPSILON {
        return None;
    }
    let l_21 = a.m21 / l_11;
    let l_31 = a.m31 / l_11;
    let l_41 = a.m41 / l_11;

    let l_22_sq = a.m22 - l_21 * l_21;
    if l_22_sq < EPSILON {
        return None;
    }
    let l_22 = l_22_sq.sqrt();
    let l_32 = (a.m32 - l_31 * l_21) / l_22;
    let l_42 = (a.m42 - l_41 * l_21) / l_22;

    let l_33_sq = a.m33 - l_31 * l_31 - l_32 * l_32;
    if l_33_sq < EPSILON {
        return None;
    }
    let l_33 = l_33_sq.sqrt();
    let l_43 = (a.m43 - l_41 * l_31 - l_42 * l_32) / l_33;

    let l_44_sq = a.m44 - l_41 * l_41 - l_42 * l_42 - l_43 * l_43;
    if l_44_sq < EPSILON {
        return None;
    }
    let l_44 = l_44_sq.sqrt();

    // --- Solve L * y = b (Forward substitution) ---
    let inv_l11 = 1.0 / l_11;
    let inv_l22 = 1.0 / l_22;
    let inv_l33 = 1.0 / l_33;
    let inv_l44 = 1.0 / l_44;

    let y1 = b[0] * inv_l11;
    let y2 = (b[1] - l_21 * y1) * inv_l22;
    let y3 = (b[2] - (l_31 * y1 + l_32 * y2)) * inv_l33;
    let y4 = (b[3] - (l_41 * y1 + l_42 * y2 + l_43 * y3)) * inv_l44;

    // --- Solve L^T * x = y (Backward substitution) ---
    let x4 = y4 * inv_l44;
    let x3 = (y3 - l_43 * x4) * inv_l33;
    let x2 = (y2 - (l_32 * x3 + l_42 * x4)) * inv_l22;
    let x1 = (y1 - (l_21 * x2 + l_31 * x3 + l_41 * x4)) * inv_l11;
    Some(Vector4::new(x1, x2, x3, x4))
}

/// Refine the EPnP betas with Gauss-Newton so that the camera-frame control points
/// reproduce the world-frame inter-point distances `rho`.
///
/// Column `k` of `null4` is scaled by `beta[k]`.
pub(crate) fn gauss_newton(beta_init: [f64; 4], null4: &DMatrix<f64>, rho: &[f64; 6]) -> [f64; 4] {
    const DAMPING: f64 = 1e-12;
    const STOP_EPS: f64 = 1e-14;

    let mut bet = Vector4::from(beta_init);
    let rho_vec = SVector::<f64, NUM_PAIRS>::from_row_slice(rho);

    for _ in 0..MAX_ITERATIONS {
        let mut vs = [Vector3::zeros(); NUM_CONTROL_POINTS];

        for (i, v) in vs.iter_mut().enumerate() {
            let m: Matrix3x4<f64> = null4.fixed_view::<3, 4>(i * 3, 0).into();
            *v = m * bet;
        }

        let mut f = SVector::<f64, NUM_PAIRS>::zeros();
        let mut j = SMatrix::<f64, NUM_PAIRS, NUM_CONTROL_POINTS>::zeros();

        for (r, &(i, jj)) in PAIRS.iter().enumerate() {
            let diff = vs[i] - vs[jj];
            f[r] = diff.norm_squared();

            let rows_i = null4.fixed_rows::<3>(i * 3);
            let rows_jj = null4.fixed_rows::<3>(jj * 3);

            for k in 0..NUM_CONTROL_POINTS {
                let d_col = rows_i.column(k) - rows_jj.column(k);
                j[(r, k)] = 2.0 * diff.dot(&d_col);
            }
        }

        f -= rho_vec;

        let mut a = Matrix4::from(j.transpose() * j);
        let b = Vector4::from(j.transpose() * f);

        // Tikhonov damping relative to the system scale.
        let scale = a.diagonal().max().max(1.0);
        for d in 0..4 {
            a[(d, d)] += DAMPING * scale;
        }

        if let Some(delta) = solve_4x4_cholesky(&a, &b) {
            bet -= delta;
            if delta.norm() < STOP_EPS {
                break;
            }
        } else {
            break;
        }
    }

    bet.into()
}
