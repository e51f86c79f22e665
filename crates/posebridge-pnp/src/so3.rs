//! Rotations in 3D, with the Rodrigues (axis-angle) exponential and logarithm.

use glam::{DMat3, DQuat, DVec3};

/// Element of the special orthogonal group SO(3), stored as a unit quaternion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SO3 {
    /// Unit quaternion.
    pub q: DQuat,
}

impl SO3 {
    /// The identity rotation.
    pub const IDENTITY: Self = Self { q: DQuat::IDENTITY };

    /// Create from a quaternion; the input is normalized.
    pub fn from_quaternion(quat: &DQuat) -> Self {
        Self {
            q: quat.normalize(),
        }
    }

    /// Create from a rotation matrix.
    pub fn from_matrix(mat: &DMat3) -> Self {
        Self {
            q: DQuat::from_mat3(mat).normalize(),
        }
    }

    /// Create from a row-major rotation matrix.
    pub fn from_rows(rows: &[[f64; 3]; 3]) -> Self {
        Self::from_matrix(&rows_to_mat3(rows))
    }

    /// The rotation matrix.
    pub fn matrix(&self) -> DMat3 {
        DMat3::from_quat(self.q)
    }

    /// The rotation matrix, row-major.
    pub fn to_rows(&self) -> [[f64; 3]; 3] {
        mat3_to_rows(&self.matrix())
    }

    /// Inverse rotation.
    pub fn inverse(&self) -> Self {
        Self {
            q: self.q.conjugate(),
        }
    }

    /// Rotate a vector.
    pub fn transform(&self, v: DVec3) -> DVec3 {
        self.q * v
    }

    /// Lie algebra -> Lie group (Rodrigues vector to rotation).
    pub fn exp(v: DVec3) -> Self {
        let theta = v.length();
        let theta_half = theta / 2.0;

        // sin(θ/2)/θ tends to 1/2 near zero.
        let (w, b) = if theta > 1e-12 {
            (theta_half.cos(), theta_half.sin() / theta)
        } else {
            (1.0 - theta * theta / 8.0, 0.5 - theta * theta / 48.0)
        };
        let xyz = v * b;

        Self {
            q: DQuat::from_xyzw(xyz.x, xyz.y, xyz.z, w).normalize(),
        }
    }

    /// Lie group -> Lie algebra (rotation to Rodrigues vector, angle in `[0, π]`).
    pub fn log(&self) -> DVec3 {
        // q and -q are the same rotation; pick the one with w >= 0.
        let q = if self.q.w < 0.0 { -self.q } else { self.q };
        let vec = DVec3::new(q.x, q.y, q.z);
        let sin_half = vec.length();

        if sin_half > 1e-12 {
            let theta = 2.0 * sin_half.atan2(q.w);
            vec * (theta / sin_half)
        } else {
            vec * (2.0 / q.w)
        }
    }

    /// Vector space -> Lie algebra (skew-symmetric matrix).
    pub fn hat(v: DVec3) -> DMat3 {
        DMat3::from_cols(
            DVec3::new(0.0, v.z, -v.y),
            DVec3::new(-v.z, 0.0, v.x),
            DVec3::new(v.y, -v.x, 0.0),
        )
    }

    /// Lie algebra -> vector space
    pub fn vee(omega: DMat3) -> DVec3 {
        DVec3::new(omega.y_axis.z, omega.z_axis.x, omega.x_axis.y)
    }
}

impl std::ops::Mul for SO3 {
    type Output = SO3;

    fn mul(self, rhs: Self) -> Self::Output {
        Self {
            q: (self.q * rhs.q).normalize(),
        }
    }
}

/// Rodrigues vector to row-major rotation matrix.
pub fn rodrigues_to_matrix(rvec: &[f64; 3]) -> [[f64; 3]; 3] {
    SO3::exp(DVec3::from_array(*rvec)).to_rows()
}

/// Row-major rotation matrix to Rodrigues vector.
pub fn matrix_to_rodrigues(rows: &[[f64; 3]; 3]) -> [f64; 3] {
    SO3::from_rows(rows).log().to_array()
}

/// Build a glam matrix from a row-major array.
pub(crate) fn rows_to_mat3(rows: &[[f64; 3]; 3]) -> DMat3 {
    DMat3::from_cols_array_2d(rows).transpose()
}

/// Row-major array from a glam matrix.
pub(crate) fn mat3_to_rows(m: &DMat3) -> [[f64; 3]; 3] {
    m.transpose().to_cols_array_2d()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_exp_zero_is_identity() {
        let s = SO3::exp(DVec3::ZERO);
        assert_relative_eq!(s.q.w, 1.0);
        assert_relative_eq!(s.log().length(), 0.0);
    }

    #[test]
    fn test_exp_log_consistency() {
        for v in [
            DVec3::new(1.0, 0.0, 0.0),
            DVec3::new(0.1, -0.2, 0.3),
            DVec3::new(-2.0, 1.0, 0.5),
            DVec3::new(1e-9, 0.0, -1e-9),
        ] {
            let log = SO3::exp(v).log();
            assert_relative_eq!(log.x, v.x, epsilon = 1e-9);
            assert_relative_eq!(log.y, v.y, epsilon = 1e-9);
            assert_relative_eq!(log.z, v.z, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_rodrigues_quarter_turn_about_z() {
        let r = rodrigues_to_matrix(&[0.0, 0.0, std::f64::consts::FRAC_PI_2]);
        // x axis maps onto y axis
        assert_relative_eq!(r[0][0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(r[1][0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(r[0][1], -1.0, epsilon = 1e-12);
        assert_relative_eq!(r[2][2], 1.0, epsilon = 1e-12);

        let back = matrix_to_rodrigues(&r);
        assert_relative_eq!(back[2], std::f64::consts::FRAC_PI_2, epsilon = 1e-12);
    }

    #[test]
    fn test_matrix_is_orthonormal() {
        let m = SO3::exp(DVec3::new(0.4, -1.1, 2.3)).matrix();
        let should_be_identity = m.transpose() * m;
        assert!(should_be_identity.abs_diff_eq(DMat3::IDENTITY, 1e-12));
        assert_relative_eq!(m.determinant(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_hat_vee() {
        let v = DVec3::new(1.0, 2.0, 3.0);
        let hat_v = SO3::hat(v);
        assert_eq!(hat_v.row(0), DVec3::new(0.0, -3.0, 2.0));
        assert_eq!(hat_v.row(1), DVec3::new(3.0, 0.0, -1.0));
        assert_eq!(SO3::vee(hat_v), v);
        assert_eq!(hat_v * DVec3::new(0.5, -1.0, 2.0), v.cross(DVec3::new(0.5, -1.0, 2.0)));
    }

    #[test]
    fn test_inverse_composes_to_identity() {
        let s = SO3::exp(DVec3::new(0.3, 0.2, -0.1));
        let id = s * s.inverse();
        assert_relative_eq!(id.log().length(), 0.0, epsilon = 1e-12);
    }
}
