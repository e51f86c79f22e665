//! Rigid alignment utilities (Kabsch / Umeyama)

use glam::{DMat3, DVec3};
use nalgebra::Matrix3;
use thiserror::Error;

/// Rotation (R, row-major), translation (t), and scale (s) output of Umeyama without scaling (s = 1).
pub type UmeyamaOutput = ([[f64; 3]; 3], [f64; 3], f64);

/// Error type for Umeyama rigid alignment operations.
#[derive(Debug, Error)]
pub enum UmeyamaError {
    /// Source and destination arrays must have the same length
    #[error("Source and destination arrays must have the same length")]
    MismatchedInputLengths,

    /// At least one correspondence is needed
    #[error("Cannot align empty point sets")]
    EmptyInput,

    /// SVD of the cross-covariance did not produce singular vectors
    #[error("SVD of the cross-covariance failed")]
    SvdFailed,
}

/// Result type alias for Umeyama.
pub type UmeyamaResult = Result<UmeyamaOutput, UmeyamaError>;

/// Umeyama/Kabsch algorithm without scale.
///
/// Finds `R`, `t` minimising `Σ |dst_i - (R src_i + t)|²`.
/// Returns (R, t, s) where s == 1.0.
pub fn umeyama(src: &[DVec3], dst: &[DVec3]) -> UmeyamaResult {
    if src.len() != dst.len() {
        return Err(UmeyamaError::MismatchedInputLengths);
    }
    if src.is_empty() {
        return Err(UmeyamaError::EmptyInput);
    }
    let n = src.len() as f64;

    let mu_s = src.iter().fold(DVec3::ZERO, |acc, &p| acc + p) / n;
    let mu_d = dst.iter().fold(DVec3::ZERO, |acc, &p| acc + p) / n;

    // H_ij = Sum( (dst_i - mu_d) * (src_j - mu_s) ) / n
    let mut h = Matrix3::<f64>::zeros();
    for (s, d) in src.iter().zip(dst.iter()) {
        let sc = *s - mu_s;
        let dc = *d - mu_d;
        for (r, dc_r) in dc.to_array().into_iter().enumerate() {
            for (c, sc_c) in sc.to_array().into_iter().enumerate() {
                h[(r, c)] += dc_r * sc_c;
            }
        }
    }
    h /= n;

    let svd = h.svd(true, true);
    let u = svd.u.ok_or(UmeyamaError::SvdFailed)?;
    let v_t = svd.v_t.ok_or(UmeyamaError::SvdFailed)?;

    // R = U * V^T, with the reflection case handled by flipping the last axis.
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let correction = Matrix3::from_diagonal(&nalgebra::Vector3::new(1.0, 1.0, -1.0));
        r = u * correction * v_t;
    }

    let r_rows: [[f64; 3]; 3] = std::array::from_fn(|i| std::array::from_fn(|j| r[(i, j)]));
    let r_glam = DMat3::from_cols_array_2d(&r_rows).transpose();
    let t = mu_d - r_glam * mu_s;

    Ok((r_rows, t.to_array(), 1.0))
}
