#![doc = env!("CARGO_PKG_DESCRIPTION")]
//!
//! Exposes the iterative PnP solver of [`posebridge_pnp`] through a small C ABI:
//!
//! ```c
//! float* CGetCameraPose(int npoints, float* objectPoints, float* imagePoints,
//!                       float* cameraMatrix, float* distCoeffs);
//! void   CFree(void* ptr);
//! int    CGetCameraPoseEx(int npoints, const float* objectPoints, const float* imagePoints,
//!                         const float* cameraMatrix, const float* distCoeffs,
//!                         float* outPose, float* outRmse);
//! const char* CPoseStatusMessage(int status);
//! void   CInitLogging(void);
//! ```
//!
//! A pose is 12 floats: the camera → world rotation row-major, then the camera
//! position in world coordinates. Matrices are read row-major and distortion
//! coefficients in the order `k1 k2 p1 p2 k3 k4 k5 k6`.

use posebridge_pnp::camera::CameraError;
use posebridge_pnp::pose::POSE_ARRAY_LEN;
use posebridge_pnp::{
    solve_pnp, IterativeParams, PnPError, PnPMethod, PolynomialDistortion, WorldPose,
};
use std::ffi::{c_char, c_int, c_void, CStr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Once;

/// Number of distortion coefficients read from `distCoeffs`.
pub const DIST_COEFFS_LEN: usize = 8;

/// Outcome of [`CGetCameraPoseEx`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoseStatus {
    /// Pose written.
    Ok = 0,
    /// Null pointer or non-positive point count.
    InvalidArgument = 1,
    /// Fewer than four correspondences.
    InsufficientCorrespondences = 2,
    /// Object points are collinear or coincident.
    DegenerateConfiguration = 3,
    /// Camera matrix rejected.
    InvalidIntrinsics = 4,
    /// Distortion coefficients rejected.
    InvalidDistortion = 5,
    /// An input coordinate is NaN or infinite.
    NonFiniteInput = 6,
    /// No valid pose was found.
    NoConvergence = 7,
    /// Numeric failure or panic inside the solver.
    InternalFailure = 8,
}

impl PoseStatus {
    /// Static description of the status.
    pub fn message(self) -> &'static CStr {
        match self {
            PoseStatus::Ok => c"ok",
            PoseStatus::InvalidArgument => c"invalid argument: null pointer or non-positive point count",
            PoseStatus::InsufficientCorrespondences => c"at least 4 point correspondences are required",
            PoseStatus::DegenerateConfiguration => c"object points are collinear or coincident",
            PoseStatus::InvalidIntrinsics => c"invalid camera matrix",
            PoseStatus::InvalidDistortion => c"invalid distortion coefficients",
            PoseStatus::NonFiniteInput => c"input contains NaN or infinite values",
            PoseStatus::NoConvergence => c"solver did not find a valid pose",
            PoseStatus::InternalFailure => c"internal solver failure",
        }
    }

    fn from_code(code: c_int) -> Option<Self> {
        Some(match code {
            0 => PoseStatus::Ok,
            1 => PoseStatus::InvalidArgument,
            2 => PoseStatus::InsufficientCorrespondences,
            3 => PoseStatus::DegenerateConfiguration,
            4 => PoseStatus::InvalidIntrinsics,
            5 => PoseStatus::InvalidDistortion,
            6 => PoseStatus::NonFiniteInput,
            7 => PoseStatus::NoConvergence,
            8 => PoseStatus::InternalFailure,
            _ => return None,
        })
    }
}

impl From<&PnPError> for PoseStatus {
    fn from(err: &PnPError) -> Self {
        match err {
            PnPError::InsufficientCorrespondences { .. } => PoseStatus::InsufficientCorrespondences,
            PnPError::MismatchedArrayLengths { .. } => PoseStatus::InvalidArgument,
            PnPError::NonFiniteInput { .. } => PoseStatus::NonFiniteInput,
            PnPError::DegenerateConfiguration(_) => PoseStatus::DegenerateConfiguration,
            PnPError::Camera(CameraError::InvalidIntrinsics(_)) => PoseStatus::InvalidIntrinsics,
            PnPError::Camera(CameraError::InvalidDistortion(_)) => PoseStatus::InvalidDistortion,
            PnPError::Camera(CameraError::UndistortFailed(_)) | PnPError::NoConvergence(_) => {
                PoseStatus::NoConvergence
            }
            PnPError::SvdFailed(_) => PoseStatus::InternalFailure,
        }
    }
}

static LOGGER: Once = Once::new();

fn init_logging() {
    LOGGER.call_once(|| {
        // A host that already installed a logger keeps it.
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .try_init();
    });
}

/// Validated, owned copies of the raw inputs.
struct RawInputs {
    world: Vec<[f64; 3]>,
    image: Vec<[f64; 2]>,
    k: [[f64; 3]; 3],
    distortion: PolynomialDistortion,
}

/// Copy the caller's arrays into owned `f64` buffers.
///
/// # Safety
///
/// Non-null pointers must reference at least `3n`, `2n`, 9 and 8 readable floats.
unsafe fn read_inputs(
    npoints: c_int,
    object_points: *const f32,
    image_points: *const f32,
    camera_matrix: *const f32,
    dist_coeffs: *const f32,
) -> Result<RawInputs, PoseStatus> {
    if object_points.is_null()
        || image_points.is_null()
        || camera_matrix.is_null()
        || dist_coeffs.is_null()
    {
        return Err(PoseStatus::InvalidArgument);
    }
    let n = usize::try_from(npoints)
        .ok()
        .filter(|&n| n > 0)
        .ok_or(PoseStatus::InvalidArgument)?;
    let obj_len = n.checked_mul(3).ok_or(PoseStatus::InvalidArgument)?;

    let obj = unsafe { std::slice::from_raw_parts(object_points, obj_len) };
    let img = unsafe { std::slice::from_raw_parts(image_points, 2 * n) };
    let cam = unsafe { std::slice::from_raw_parts(camera_matrix, 9) };
    let dist = unsafe { std::slice::from_raw_parts(dist_coeffs, DIST_COEFFS_LEN) };

    let world = obj
        .chunks_exact(3)
        .map(|p| [p[0] as f64, p[1] as f64, p[2] as f64])
        .collect();
    let image = img.chunks_exact(2).map(|p| [p[0] as f64, p[1] as f64]).collect();
    let k = std::array::from_fn(|r| std::array::from_fn(|c| cam[3 * r + c] as f64));
    let coeffs: [f64; DIST_COEFFS_LEN] = std::array::from_fn(|i| dist[i] as f64);

    Ok(RawInputs {
        world,
        image,
        k,
        distortion: PolynomialDistortion::from_opencv_coeffs(&coeffs),
    })
}

/// Shared body of the pose entry points: solve, log, never unwind.
///
/// # Safety
///
/// Same as [`read_inputs`].
unsafe fn solve_raw(
    npoints: c_int,
    object_points: *const f32,
    image_points: *const f32,
    camera_matrix: *const f32,
    dist_coeffs: *const f32,
) -> Result<(WorldPose, f64), PoseStatus> {
    init_logging();

    let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<(WorldPose, f64), PoseStatus> {
        let inputs =
            unsafe { read_inputs(npoints, object_points, image_points, camera_matrix, dist_coeffs) }?;
        let params = IterativeParams::default();
        let result = solve_pnp(
            &inputs.world,
            &inputs.image,
            &inputs.k,
            Some(&inputs.distortion),
            PnPMethod::Iterative(params),
        )
        .map_err(|e| {
            log::warn!("pose solve failed for {npoints} points: {e}");
            PoseStatus::from(&e)
        })?;
        Ok((
            WorldPose::from_pnp(&result),
            result.reproj_rmse.unwrap_or(f64::NAN),
        ))
    }));

    match outcome {
        Ok(Err(PoseStatus::InvalidArgument)) => {
            log::warn!("pose solve rejected: null pointer or npoints = {npoints}");
            Err(PoseStatus::InvalidArgument)
        }
        Ok(res) => res,
        Err(_) => {
            log::error!("pose solver panicked");
            Err(PoseStatus::InternalFailure)
        }
    }
}

/// Estimate the camera's pose in the world from `npoints` 2D-3D correspondences.
///
/// Returns a newly allocated array of 12 floats (row-major camera → world rotation,
/// then the camera position) or null on failure. A non-null result must be
/// released exactly once with [`CFree`].
///
/// # Safety
///
/// `objectPoints`, `imagePoints`, `cameraMatrix` and `distCoeffs` must each be
/// null or point to at least `3 * npoints`, `2 * npoints`, 9 and 8 floats.
#[no_mangle]
pub unsafe extern "C" fn CGetCameraPose(
    npoints: c_int,
    object_points: *const f32,
    image_points: *const f32,
    camera_matrix: *const f32,
    dist_coeffs: *const f32,
) -> *mut f32 {
    match unsafe { solve_raw(npoints, object_points, image_points, camera_matrix, dist_coeffs) } {
        Ok((pose, rmse)) => {
            let ptr = Box::into_raw(Box::new(pose.to_array()));
            log::info!(
                "camera position {:?}, rmse {rmse:.4} px, result at {ptr:p}",
                pose.position
            );
            ptr.cast::<f32>()
        }
        Err(_) => std::ptr::null_mut(),
    }
}

/// Release a buffer returned by [`CGetCameraPose`]. Null is ignored.
///
/// # Safety
///
/// `ptr` must be null or a pointer returned by [`CGetCameraPose`] that has not
/// been freed yet.
#[no_mangle]
pub unsafe extern "C" fn CFree(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    log::debug!("releasing pose buffer at {ptr:p}");
    unsafe {
        drop(Box::from_raw(ptr.cast::<[f32; POSE_ARRAY_LEN]>()));
    }
}

/// Like [`CGetCameraPose`] but writes into caller memory and reports a status code.
///
/// On success the pose is written to `out_pose` (12 floats) and, when `out_rmse` is
/// not null, the reprojection RMSE in pixels to `out_rmse`. Nothing is written on
/// failure.
///
/// # Safety
///
/// Input pointers as for [`CGetCameraPose`]. `out_pose` must be null or point to 12
/// writable floats; `out_rmse` must be null or point to one writable float.
#[no_mangle]
pub unsafe extern "C" fn CGetCameraPoseEx(
    npoints: c_int,
    object_points: *const f32,
    image_points: *const f32,
    camera_matrix: *const f32,
    dist_coeffs: *const f32,
    out_pose: *mut f32,
    out_rmse: *mut f32,
) -> c_int {
    if out_pose.is_null() {
        init_logging();
        log::warn!("pose solve rejected: null output buffer");
        return PoseStatus::InvalidArgument as c_int;
    }
    match unsafe { solve_raw(npoints, object_points, image_points, camera_matrix, dist_coeffs) } {
        Ok((pose, rmse)) => {
            let out = unsafe { std::slice::from_raw_parts_mut(out_pose, POSE_ARRAY_LEN) };
            out.copy_from_slice(&pose.to_array());
            if !out_rmse.is_null() {
                unsafe { *out_rmse = rmse as f32 };
            }
            log::info!("camera position {:?}, rmse {rmse:.4} px", pose.position);
            PoseStatus::Ok as c_int
        }
        Err(status) => status as c_int,
    }
}

/// Static, NUL-terminated description of a [`CGetCameraPoseEx`] status code.
/// The string must not be freed.
#[no_mangle]
pub extern "C" fn CPoseStatusMessage(status: c_int) -> *const c_char {
    PoseStatus::from_code(status)
        .map_or(c"unknown status", PoseStatus::message)
        .as_ptr()
}

/// Install the `env_logger` backend, honouring `RUST_LOG`. Safe to call repeatedly;
/// the pose entry points also install it on first use.
#[no_mangle]
pub extern "C" fn CInitLogging() {
    init_logging();
    log::debug!("posebridge logging initialized");
}
