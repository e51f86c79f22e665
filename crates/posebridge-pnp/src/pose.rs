//! Camera pose expressed in the world frame.

use crate::so3::{mat3_to_rows, rows_to_mat3};
use crate::types::PnPResult;
use glam::{DMat3, DVec3};

/// Number of floats in the flat pose layout: 9 rotation entries then 3 position entries.
pub const POSE_ARRAY_LEN: usize = 12;

/// Pose of the camera in the world: the inverse of a world → camera transform.
///
/// `rotation` maps camera-frame directions into the world frame and is stored
/// row-major. `position` is the camera centre in world coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldPose {
    /// Camera → world rotation, row-major.
    pub rotation: [[f64; 3]; 3],
    /// Camera centre in world coordinates.
    pub position: [f64; 3],
}

impl WorldPose {
    /// Invert a world → camera transform `(R, t)`: `R_world = Rᵀ`, `position = -Rᵀ t`.
    pub fn from_camera_pose(rotation: &[[f64; 3]; 3], translation: &[f64; 3]) -> Self {
        let r_t = rows_to_mat3(rotation).transpose();
        let position = -(r_t * DVec3::from_array(*translation));
        Self {
            rotation: mat3_to_rows(&r_t),
            position: position.to_array(),
        }
    }

    /// Invert the pose estimated by a PnP solver.
    pub fn from_pnp(result: &PnPResult) -> Self {
        Self::from_camera_pose(&result.rotation, &result.translation)
    }

    /// The world → camera transform `(R, t)` this pose was built from.
    pub fn camera_from_world(&self) -> ([[f64; 3]; 3], [f64; 3]) {
        let r = rows_to_mat3(&self.rotation).transpose();
        let t = -(r * DVec3::from_array(self.position));
        (mat3_to_rows(&r), t.to_array())
    }

    /// Flatten to `[r00, r01, r02, r10, .., r22, px, py, pz]` in single precision.
    pub fn to_array(&self) -> [f32; POSE_ARRAY_LEN] {
        let mut out = [0.0f32; POSE_ARRAY_LEN];
        for (dst, src) in out
            .iter_mut()
            .zip(self.rotation.iter().flatten().chain(self.position.iter()))
        {
            *dst = *src as f32;
        }
        out
    }

    /// Inverse of [`WorldPose::to_array`].
    pub fn from_array(values: &[f32; POSE_ARRAY_LEN]) -> Self {
        let v = |i: usize| values[i] as f64;
        Self {
            rotation: std::array::from_fn(|r| std::array::from_fn(|c| v(3 * r + c))),
            position: [v(9), v(10), v(11)],
        }
    }

    /// Whether `rotation` is orthonormal with determinant +1, within `tol`.
    pub fn is_orthonormal(&self, tol: f64) -> bool {
        let r = rows_to_mat3(&self.rotation);
        (r.transpose() * r).abs_diff_eq(DMat3::IDENTITY, tol) && (r.determinant() - 1.0).abs() <= tol
    }
}

impl From<&PnPResult> for WorldPose {
    fn from(result: &PnPResult) -> Self {
        Self::from_pnp(result)
    }
}
