//! Levenberg–Marquardt pose refinement for PnP solutions.

use crate::so3::SO3;
use crate::types::PnPError;
use glam::DVec3;

/// Parameters controlling the LM pose refinement.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LMParams {
    /// Maximum number of LM iterations.
    pub max_iters: usize,
    /// Convergence threshold on squared reprojection error decrease.
    pub eps: f64,
    /// Initial damping factor (lambda).
    pub lambda_init: f64,
    /// Multiplicative factor to increase/decrease lambda.
    pub lambda_mul: f64,
}

impl Default for LMParams {
    fn default() -> Self {
        Self {
            max_iters: 20,
            eps: 1e-10,
            lambda_init: 1e-3,
            lambda_mul: 10.0,
        }
    }
}

impl LMParams {
    /// Set the iteration cap.
    pub fn with_max_iters(mut self, max_iters: usize) -> Self {
        self.max_iters = max_iters;
        self
    }

    /// Set the convergence threshold.
    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    /// Set the initial damping and its update factor.
    pub fn with_lambda(mut self, lambda_init: f64, lambda_mul: f64) -> Self {
        self.lambda_init = lambda_init;
        self.lambda_mul = lambda_mul;
        self
    }
}

// Damping beyond this means no step can lower the error any further.
const LAMBDA_MAX: f64 = 1e16;
// Mean squared pixel error treated as an exact fit.
const MIN_MEAN_SQ_ERROR: f64 = 1e-20;

/// Refine a pose (rvec, t) with Levenberg–Marquardt to minimize pixel reprojection error.
///
/// - `points_world`: World points (N,3)
/// - `points_image`: Undistorted pixel points (N,2)
/// - `k`: Intrinsics 3x3
/// - `rvec`: Initial axis-angle rotation (input/output)
/// - `t`: Initial translation (input/output)
///
/// Returns `(rmse, num_iters, converged)` and writes refined `rvec` and `t` in place.
/// The RMSE is per correspondence, in pixels.
pub fn refine_pose_lm(
    points_world: &[[f64; 3]],
    points_image: &[[f64; 2]],
    k: &[[f64; 3]; 3],
    rvec: &mut [f64; 3],
    t: &mut [f64; 3],
    params: &LMParams,
) -> Result<(f64, usize, bool), PnPError> {
    if points_world.len() != points_image.len() {
        return Err(PnPError::MismatchedArrayLengths {
            left_name: "world points",
            left_len: points_world.len(),
            right_name: "image points",
            right_len: points_image.len(),
        });
    }

    let n = points_world.len();
    if n < 3 {
        return Err(PnPError::InsufficientCorrespondences {
            required: 3,
            actual: n,
        });
    }

    // Parameters vector x = [rx, ry, rz, tx, ty, tz]
    let mut x = [rvec[0], rvec[1], rvec[2], t[0], t[1], t[2]];

    let fx = k[0][0];
    let fy = k[1][1];
    let cx = k[0][2];
    let cy = k[1][2];

    let mut residuals = vec![0.0f64; 2 * n];
    let mut residuals_p = vec![0.0f64; 2 * n];
    let mut residuals_m = vec![0.0f64; 2 * n];

    // Writes residuals in place; a point at or behind the camera makes the cost infinite.
    let project_all_in_place = |x: &[f64; 6], out: &mut [f64]| -> f64 {
        let r_mat = SO3::exp(DVec3::new(x[0], x[1], x[2])).matrix();
        let t_vec = DVec3::new(x[3], x[4], x[5]);

        let mut sum_sq = 0.0f64;
        let mut behind = false;
        for (i, (pw_arr, &uv)) in points_world.iter().zip(points_image.iter()).enumerate() {
            let pc = r_mat * DVec3::from_array(*pw_arr) + t_vec;
            behind |= pc.z <= 0.0;
            let inv_z = 1.0 / pc.z;
            let du = fx * pc.x * inv_z + cx - uv[0];
            let dv = fy * pc.y * inv_z + cy - uv[1];
            out[2 * i] = du;
            out[2 * i + 1] = dv;
            sum_sq += du.mul_add(du, dv * dv);
        }
        if behind {
            f64::INFINITY
        } else {
            sum_sq
        }
    };

    let mut lambda = params.lambda_init;
    let mut err_sq_base = project_all_in_place(&x, &mut residuals);
    if !err_sq_base.is_finite() {
        return Err(PnPError::NoConvergence(
            "initial pose places points at or behind the camera".to_string(),
        ));
    }

    let mut iters = 0usize;
    let mut converged = false;

    let mut j = vec![0.0f64; 2 * n * 6];
    let mut a = [0.0f64; 36];
    let mut b = [0.0f64; 6];

    while iters < params.max_iters {
        if err_sq_base / n as f64 <= MIN_MEAN_SQ_ERROR {
            converged = true;
            break;
        }
        iters += 1;
        j.fill(0.0);
        a.fill(0.0);
        b.fill(0.0);
        const H_ROT: f64 = 1e-6; // radians
        let t_scale = x[3].abs().max(x[4].abs()).max(x[5].abs()).max(1.0);
        let h_trans = 1e-6 * t_scale; // world units

        for k_idx in 0..6 {
            // Central differences
            let h = if k_idx < 3 { H_ROT } else { h_trans };
            let mut x_plus = x;
            let mut x_minus = x;
            x_plus[k_idx] += h;
            x_minus[k_idx] -= h;
            let _ = project_all_in_place(&x_plus, &mut residuals_p);
            let _ = project_all_in_place(&x_minus, &mut residuals_m);
            for i in 0..(2 * n) {
                j[i * 6 + k_idx] = (residuals_p[i] - residuals_m[i]) / (2.0 * h);
            }
        }

        // Build normal equations: (J^T J + lambda I) delta = -J^T r
        for r_i in 0..(2 * n) {
            let r_val = residuals[r_i];
            for c in 0..6 {
                let j_ic = j[r_i * 6 + c];
                b[c] += j_ic * r_val;
                for d in 0..6 {
                    a[c * 6 + d] += j_ic * j[r_i * 6 + d];
                }
            }
        }
        for d in 0..6 {
            a[d * 6 + d] += lambda;
        }

        let mut rhs = b.map(|v| -v);
        let mut a_mat = a;
        if let Some(delta) = solve_6x6(&mut a_mat, &mut rhs) {
            let mut x_new = x;
            for (xi, di) in x_new.iter_mut().zip(delta.iter()) {
                *xi += di;
            }
            let err_sq_new = project_all_in_place(&x_new, &mut residuals_p);
            if err_sq_new < err_sq_base {
                x = x_new;
                residuals.copy_from_slice(&residuals_p);
                let decrease = err_sq_base - err_sq_new;
                err_sq_base = err_sq_new;
                if decrease < params.eps {
                    converged = true;
                    break;
                }
                lambda = (lambda / params.lambda_mul).max(1e-12);
            } else {
                lambda *= params.lambda_mul;
            }
        } else {
            // Singular system, increase damping
            lambda *= params.lambda_mul;
        }

        if lambda > LAMBDA_MAX {
            converged = true;
            break;
        }
    }

    rvec.copy_from_slice(&x[0..3]);
    t.copy_from_slice(&x[3..6]);

    let rmse = (err_sq_base / n as f64).sqrt();
    log::trace!("LM refinement: {iters} iterations, rmse {rmse:.6} px, converged {converged}");
    Ok((rmse, iters, converged))
}

// Dense 6x6 solver using Gaussian elimination with partial pivoting.
fn solve_6x6(a: &mut [f64; 36], b: &mut [f64; 6]) -> Option<[f64; 6]> {
    for i in 0..6 {
        let mut piv = i;
        let mut max_val = a[i * 6 + i].abs();
        for r in (i + 1)..6 {
            let v = a[r * 6 + i].abs();
            if v > max_val {
                max_val = v;
                piv = r;
            }
        }
        if max_val < 1e-300 || !max_val.is_finite() {
            return None;
        }
        if piv != i {
            for c in i..6 {
                a.swap(i * 6 + c, piv * 6 + c);
            }
            b.swap(i, piv);
        }
        let diag = a[i * 6 + i];
        for c in i..6 {
            a[i * 6 + c] /= diag;
        }
        b[i] /= diag;
        for r in (i + 1)..6 {
            let factor = a[r * 6 + i];
            if factor == 0.0 {
                continue;
            }
            for c in i..6 {
                a[r * 6 + c] -= factor * a[i * 6 + c];
            }
            b[r] -= factor * b[i];
        }
    }
    // Back substitution
    for i in (0..6).rev() {
        for r in 0..i {
            let factor = a[r * 6 + i];
            if factor != 0.0 {
                a[r * 6 + i] = 0.0;
                b[r] -= factor * b[i];
            }
        }
    }
    Some(*b)
}
