//! Camera models and distortion handling for PnP solvers.
use thiserror::Error;

/// Error types for camera operations.
#[derive(Debug, Error)]
pub enum CameraError {
    /// Invalid camera intrinsics matrix
    #[error("Invalid camera intrinsics matrix: {0}")]
    InvalidIntrinsics(String),

    /// Invalid distortion parameters
    #[error("Invalid distortion parameters: {0}")]
    InvalidDistortion(String),

    /// Failed to undistort point
    #[error("Failed to undistort point: {0}")]
    UndistortFailed(String),
}

/// Result type for camera operations.
pub type CameraResult<T> = Result<T, CameraError>;

/// Represents the intrinsic parameters of a pinhole camera.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraIntrinsics {
    /// Focal length in x direction
    pub fx: f64,
    /// Focal length in y direction
    pub fy: f64,
    /// Principal point x coordinate
    pub cx: f64,
    /// Principal point y coordinate
    pub cy: f64,
}

impl CameraIntrinsics {
    /// Create camera intrinsics from focal lengths and principal point.
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// Create camera intrinsics from a row-major 3x3 intrinsics matrix.
    ///
    /// The matrix must have the form `[[fx, 0, cx], [0, fy, cy], [0, 0, 1]]` with
    /// strictly positive, finite focal lengths.
    pub fn from_matrix(k: &[[f64; 3]; 3]) -> CameraResult<Self> {
        const TOL: f64 = 1e-9;

        if k.iter().flatten().any(|v| !v.is_finite()) {
            return Err(CameraError::InvalidIntrinsics(
                "matrix contains non-finite values".to_string(),
            ));
        }
        if k[0][1].abs() > TOL
            || k[1][0].abs() > TOL
            || k[2][0].abs() > TOL
            || k[2][1].abs() > TOL
            || (k[2][2] - 1.0).abs() > TOL
        {
            return Err(CameraError::InvalidIntrinsics(
                "Intrinsics matrix must have form [[fx, 0, cx], [0, fy, cy], [0, 0, 1]]".to_string(),
            ));
        }
        if k[0][0] <= 0.0 || k[1][1] <= 0.0 {
            return Err(CameraError::InvalidIntrinsics(format!(
                "focal lengths must be positive, got fx={} fy={}",
                k[0][0], k[1][1]
            )));
        }

        Ok(Self {
            fx: k[0][0],
            fy: k[1][1],
            cx: k[0][2],
            cy: k[1][2],
        })
    }

    /// Convert to 3x3 intrinsics matrix.
    pub fn to_matrix(&self) -> [[f64; 3]; 3] {
        [
            [self.fx, 0.0, self.cx],
            [0.0, self.fy, self.cy],
            [0.0, 0.0, 1.0],
        ]
    }

    /// Pixel coordinates to normalized image coordinates.
    #[inline]
    pub fn normalize(&self, u: f64, v: f64) -> (f64, f64) {
        ((u - self.cx) / self.fx, (v - self.cy) / self.fy)
    }

    /// Normalized image coordinates to pixel coordinates.
    #[inline]
    pub fn denormalize(&self, x: f64, y: f64) -> (f64, f64) {
        (self.fx * x + self.cx, self.fy * y + self.cy)
    }
}

/// Rational polynomial distortion (radial `k1..k6`, tangential `p1, p2`).
///
/// The radial term is `(1 + k1 r² + k2 r⁴ + k3 r⁶) / (1 + k4 r² + k5 r⁴ + k6 r⁶)`.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub struct PolynomialDistortion {
    /// Radial distortion coefficients
    pub k1: f64,
    pub k2: f64,
    pub k3: f64,
    pub k4: f64,
    pub k5: f64,
    pub k6: f64,
    /// Tangential distortion coefficients
    pub p1: f64,
    pub p2: f64,
}

impl PolynomialDistortion {
    /// Create distortion parameters with all coefficients set to zero (no distortion).
    pub fn none() -> Self {
        Self::from_opencv_coeffs(&[0.0; 8])
    }

    /// Create distortion parameters with only first two radial coefficients.
    pub fn radial(k1: f64, k2: f64) -> Self {
        Self::from_opencv_coeffs(&[k1, k2, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])
    }

    /// Create distortion parameters with radial and tangential coefficients.
    pub fn radial_tangential(k1: f64, k2: f64, p1: f64, p2: f64) -> Self {
        Self::from_opencv_coeffs(&[k1, k2, p1, p2, 0.0, 0.0, 0.0, 0.0])
    }

    /// Create distortion parameters from the 8-vector `[k1, k2, p1, p2, k3, k4, k5, k6]`.
    pub fn from_opencv_coeffs(c: &[f64; 8]) -> Self {
        Self {
            k1: c[0],
            k2: c[1],
            p1: c[2],
            p2: c[3],
            k3: c[4],
            k4: c[5],
            k5: c[6],
            k6: c[7],
        }
    }

    /// Coefficients in `[k1, k2, p1, p2, k3, k4, k5, k6]` order.
    pub fn to_opencv_coeffs(&self) -> [f64; 8] {
        [
            self.k1, self.k2, self.p1, self.p2, self.k3, self.k4, self.k5, self.k6,
        ]
    }

    /// Check if there is any distortion.
    pub fn has_distortion(&self) -> bool {
        self.to_opencv_coeffs().iter().any(|&c| c != 0.0)
    }

    /// Reject non-finite coefficients.
    pub fn validate(&self) -> CameraResult<()> {
        if self.to_opencv_coeffs().iter().any(|c| !c.is_finite()) {
            return Err(CameraError::InvalidDistortion(
                "coefficients must be finite".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply the model to normalized coordinates.
    pub fn distort_normalized(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let kr = self.radial_factor(r2);
        let (dx, dy) = self.tangential(x, y, r2);
        (x * kr + dx, y * kr + dy)
    }

    /// Invert the model on normalized coordinates by fixed-point iteration.
    pub fn undistort_normalized(&self, xd: f64, yd: f64) -> CameraResult<(f64, f64)> {
        const MAX_ITERATIONS: usize = 20;
        const EPSILON: f64 = 1e-14;

        let mut x = xd;
        let mut y = yd;

        for _ in 0..MAX_ITERATIONS {
            let r2 = x * x + y * y;
            let kr = self.radial_factor(r2);
            if kr.abs() < f64::EPSILON {
                return Err(CameraError::UndistortFailed(format!(
                    "radial factor vanished at ({xd}, {yd})"
                )));
            }
            let (dx, dy) = self.tangential(x, y, r2);
            let x_next = (xd - dx) / kr;
            let y_next = (yd - dy) / kr;

            let step = (x_next - x).abs().max((y_next - y).abs());
            x = x_next;
            y = y_next;
            if step < EPSILON {
                break;
            }
        }

        if !x.is_finite() || !y.is_finite() {
            return Err(CameraError::UndistortFailed(format!(
                "iteration diverged at ({xd}, {yd})"
            )));
        }
        Ok((x, y))
    }

    #[inline]
    fn radial_factor(&self, r2: f64) -> f64 {
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        (1.0 + self.k1 * r2 + self.k2 * r4 + self.k3 * r6)
            / (1.0 + self.k4 * r2 + self.k5 * r4 + self.k6 * r6)
    }

    #[inline]
    fn tangential(&self, x: f64, y: f64, r2: f64) -> (f64, f64) {
        let xy_2 = 2.0 * x * y;
        (
            self.p1 * xy_2 + self.p2 * (r2 + 2.0 * x * x),
            self.p1 * (r2 + 2.0 * y * y) + self.p2 * xy_2,
        )
    }
}

/// A complete camera model with intrinsics and optional distortion.
#[derive(Debug, Clone)]
pub struct CameraModel {
    /// Camera intrinsics
    pub intrinsics: CameraIntrinsics,
    /// Distortion parameters (None for no distortion)
    pub distortion: Option<PolynomialDistortion>,
}

impl CameraModel {
    /// Create a camera model without distortion.
    pub fn pinhole(intrinsics: CameraIntrinsics) -> Self {
        Self {
            intrinsics,
            distortion: None,
        }
    }

    /// Create a camera model with distortion.
    pub fn with_distortion(intrinsics: CameraIntrinsics, distortion: PolynomialDistortion) -> Self {
        Self {
            intrinsics,
            distortion: Some(distortion),
        }
    }

    /// Check if the camera has distortion.
    pub fn has_distortion(&self) -> bool {
        self.distortion.as_ref().is_some_and(|d| d.has_distortion())
    }

    /// Undistort a pixel.
    pub fn undistort_point(&self, u: f64, v: f64) -> CameraResult<(f64, f64)> {
        match &self.distortion {
            Some(d) if d.has_distortion() => {
                let (xd, yd) = self.intrinsics.normalize(u, v);
                let (x, y) = d.undistort_normalized(xd, yd)?;
                Ok(self.intrinsics.denormalize(x, y))
            }
            _ => Ok((u, v)),
        }
    }

    /// Undistort multiple points.
    pub fn undistort_points(&self, points: &[[f64; 2]]) -> CameraResult<Vec<[f64; 2]>> {
        points
            .iter()
            .map(|&[u, v]| self.undistort_point(u, v).map(|(x, y)| [x, y]))
            .collect()
    }

    /// Apply distortion to an ideal pixel.
    pub fn distort_point(&self, u: f64, v: f64) -> (f64, f64) {
        match &self.distortion {
            Some(d) => {
                let (x, y) = self.intrinsics.normalize(u, v);
                let (xd, yd) = d.distort_normalized(x, y);
                self.intrinsics.denormalize(xd, yd)
            }
            None => (u, v),
        }
    }

    /// Get the intrinsics matrix for use with existing PnP solvers.
    pub fn intrinsics_matrix(&self) -> [[f64; 3]; 3] {
        self.intrinsics.to_matrix()
    }

    /// Project world points through a world → camera pose onto the (distorted) image.
    ///
    /// `rotation` is row-major. Points at or behind the camera plane come back as NaN.
    pub fn project_points(
        &self,
        points_world: &[[f64; 3]],
        rotation: &[[f64; 3]; 3],
        translation: &[f64; 3],
    ) -> Vec<[f64; 2]> {
        points_world
            .iter()
            .map(|p| {
                let pc: [f64; 3] = std::array::from_fn(|r| {
                    rotation[r][0] * p[0]
                        + rotation[r][1] * p[1]
                        + rotation[r][2] * p[2]
                        + translation[r]
                });
                if pc[2] <= 0.0 {
                    return [f64::NAN, f64::NAN];
                }
                let x = pc[0] / pc[2];
                let y = pc[1] / pc[2];
                let (xd, yd) = match &self.distortion {
                    Some(d) => d.distort_normalized(x, y),
                    None => (x, y),
                };
                let (u, v) = self.intrinsics.denormalize(xd, yd);
                [u, v]
            })
            .collect()
    }
}

impl Default for CameraModel {
    fn default() -> Self {
        Self::pinhole(CameraIntrinsics::new(1000.0, 1000.0, 640.0, 480.0))
    }
}
