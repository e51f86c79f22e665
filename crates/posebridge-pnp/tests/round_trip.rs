use approx::assert_relative_eq;
use glam::DVec3;
use posebridge_pnp::so3::rodrigues_to_matrix;
use posebridge_pnp::{
    solve_pnp, solve_world_pose, CameraIntrinsics, CameraModel, IterativeParams, PnPError,
    PnPMethod, PolynomialDistortion, WorldPose,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

const TRIALS: usize = 20;
const MINIMAL_TRIALS: usize = 100;

struct Scene {
    world: Vec<[f64; 3]>,
    image: Vec<[f64; 2]>,
    rotation: [[f64; 3]; 3],
    translation: [f64; 3],
}

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn intrinsics() -> CameraIntrinsics {
    CameraIntrinsics::new(820.0, 810.0, 640.0, 360.0)
}

fn random_scene(rng: &mut StdRng, camera: &CameraModel, n: usize, planar: bool) -> Scene {
    let world: Vec<[f64; 3]> = (0..n)
        .map(|_| {
            let z = if planar { 0.0 } else { rng.random_range(-1.0..1.0) };
            [rng.random_range(-1.0..1.0), rng.random_range(-1.0..1.0), z]
        })
        .collect();
    let rvec = [
        rng.random_range(-0.5..0.5),
        rng.random_range(-0.5..0.5),
        rng.random_range(-0.5..0.5),
    ];
    let rotation = rodrigues_to_matrix(&rvec);
    let translation = [
        rng.random_range(-0.5..0.5),
        rng.random_range(-0.5..0.5),
        rng.random_range(5.0..8.0),
    ];
    let image = camera.project_points(&world, &rotation, &translation);
    Scene {
        world,
        image,
        rotation,
        translation,
    }
}

fn assert_pose_matches(pose: &WorldPose, scene: &Scene) {
    assert!(pose.is_orthonormal(1e-9));
    let expected = WorldPose::from_camera_pose(&scene.rotation, &scene.translation);
    for i in 0..3 {
        for j in 0..3 {
            assert_relative_eq!(pose.rotation[i][j], expected.rotation[i][j], epsilon = 1e-6);
        }
        assert_relative_eq!(pose.position[i], expected.position[i], epsilon = 1e-5);
    }
}

/// Scene with `n` points and a rotation of up to 3 rad about a random axis.
///
/// General scenes keep the first four points well spread in volume; planar scenes
/// keep every triple well spread and the board facing the camera.
fn minimal_scene(rng: &mut StdRng, camera: &CameraModel, n: usize, planar: bool) -> Scene {
    loop {
        let world: Vec<[f64; 3]> = (0..n)
            .map(|_| {
                let z = if planar { 0.0 } else { rng.random_range(-1.0..1.0) };
                [rng.random_range(-1.0..1.0), rng.random_range(-1.0..1.0), z]
            })
            .collect();
        let axis = DVec3::new(
            rng.random_range(-1.0..1.0),
            rng.random_range(-1.0..1.0),
            rng.random_range(-1.0..1.0),
        );
        if axis.length() < 0.1 {
            continue;
        }
        let rvec = (axis.normalize() * rng.random_range(0.0..3.0)).to_array();
        let rotation = rodrigues_to_matrix(&rvec);
        let translation = [
            rng.random_range(-0.5..0.5),
            rng.random_range(-0.5..0.5),
            rng.random_range(5.0..8.0),
        ];

        let spread = if planar {
            rotation[2][2].abs() > 0.5 && min_triangle_area(&world) > 0.1
        } else {
            tetrahedron_volume6(&world) > 0.1
        };
        if !spread {
            continue;
        }

        let image = camera.project_points(&world, &rotation, &translation);
        return Scene {
            world,
            image,
            rotation,
            translation,
        };
    }
}

fn tetrahedron_volume6(world: &[[f64; 3]]) -> f64 {
    let p: Vec<DVec3> = world[..4].iter().map(|&q| DVec3::from(q)).collect();
    (p[1] - p[0]).cross(p[2] - p[0]).dot(p[3] - p[0]).abs()
}

fn min_triangle_area(world: &[[f64; 3]]) -> f64 {
    let p: Vec<DVec3> = world.iter().map(|&q| DVec3::from(q)).collect();
    let mut min = f64::INFINITY;
    for a in 0..p.len() {
        for b in a + 1..p.len() {
            for c in b + 1..p.len() {
                min = min.min((p[b] - p[a]).cross(p[c] - p[a]).length());
            }
        }
    }
    min
}

fn assert_position_close(pose: &WorldPose, scene: &Scene) {
    assert!(pose.is_orthonormal(1e-9));
    let expected = WorldPose::from_camera_pose(&scene.rotation, &scene.translation);
    let want = DVec3::from(expected.position);
    let got = DVec3::from(pose.position);
    assert!(
        got.distance(want) < 1e-3 * want.length(),
        "camera position {got:?}, expected {want:?}"
    );
}

fn minimal_round_trip(seed: u64, n: usize, planar: bool) -> Result<(), PnPError> {
    init_logger();
    let camera = CameraModel::pinhole(intrinsics());
    let k = camera.intrinsics_matrix();
    let mut rng = StdRng::seed_from_u64(seed);

    for _ in 0..MINIMAL_TRIALS {
        let scene = minimal_scene(&mut rng, &camera, n, planar);
        let pose = solve_world_pose(&scene.world, &scene.image, &k, None, &IterativeParams::default())?;
        assert_position_close(&pose, &scene);
    }
    Ok(())
}

#[test]
fn four_general_points_round_trip() -> Result<(), PnPError> {
    minimal_round_trip(101, 4, false)
}

#[test]
fn five_general_points_round_trip() -> Result<(), PnPError> {
    minimal_round_trip(102, 5, false)
}

#[test]
fn four_planar_points_round_trip() -> Result<(), PnPError> {
    minimal_round_trip(103, 4, true)
}

#[test]
fn five_planar_points_round_trip() -> Result<(), PnPError> {
    minimal_round_trip(104, 5, true)
}

#[test]
fn general_layout_round_trip() -> Result<(), PnPError> {
    init_logger();
    let camera = CameraModel::pinhole(intrinsics());
    let k = camera.intrinsics_matrix();
    let mut rng = StdRng::seed_from_u64(7);

    for _ in 0..TRIALS {
        let n = rng.random_range(6..40);
        let scene = random_scene(&mut rng, &camera, n, false);
        let pose = solve_world_pose(&scene.world, &scene.image, &k, None, &IterativeParams::default())?;
        assert_pose_matches(&pose, &scene);
    }
    Ok(())
}

#[test]
fn planar_layout_round_trip() -> Result<(), PnPError> {
    init_logger();
    let camera = CameraModel::pinhole(intrinsics());
    let k = camera.intrinsics_matrix();
    let mut rng = StdRng::seed_from_u64(11);

    for _ in 0..TRIALS {
        let n = rng.random_range(6..40);
        let scene = random_scene(&mut rng, &camera, n, true);
        let pose = solve_world_pose(&scene.world, &scene.image, &k, None, &IterativeParams::default())?;
        assert_pose_matches(&pose, &scene);
    }
    Ok(())
}

#[test]
fn distorted_round_trip() -> Result<(), PnPError> {
    init_logger();
    let distortion = PolynomialDistortion::from_opencv_coeffs(&[
        -0.12, 0.03, 4e-4, -3e-4, 0.002, 0.01, 0.001, 0.0005,
    ]);
    let camera = CameraModel::with_distortion(intrinsics(), distortion.clone());
    let k = camera.intrinsics_matrix();
    let mut rng = StdRng::seed_from_u64(23);

    for trial in 0..TRIALS {
        let planar = trial % 2 == 0;
        let scene = random_scene(&mut rng, &camera, 24, planar);
        let pose = solve_world_pose(
            &scene.world,
            &scene.image,
            &k,
            Some(&distortion),
            &IterativeParams::default(),
        )?;
        assert_pose_matches(&pose, &scene);
    }
    Ok(())
}

#[test]
fn epnp_method_matches_iterative() -> Result<(), PnPError> {
    let camera = CameraModel::pinhole(intrinsics());
    let k = camera.intrinsics_matrix();
    let mut rng = StdRng::seed_from_u64(3);
    let scene = random_scene(&mut rng, &camera, 30, false);

    let epnp = solve_pnp(&scene.world, &scene.image, &k, None, PnPMethod::EPnPDefault)?;
    let iterative = solve_pnp(&scene.world, &scene.image, &k, None, PnPMethod::IterativeDefault)?;
    for i in 0..3 {
        assert_relative_eq!(epnp.translation[i], iterative.translation[i], epsilon = 1e-5);
        assert_relative_eq!(iterative.translation[i], scene.translation[i], epsilon = 1e-6);
    }
    Ok(())
}

#[test]
fn invalid_inputs_are_rejected() {
    let camera = CameraModel::pinhole(intrinsics());
    let k = camera.intrinsics_matrix();
    let mut rng = StdRng::seed_from_u64(5);
    let scene = random_scene(&mut rng, &camera, 8, false);
    let params = IterativeParams::default();

    let few = solve_world_pose(&scene.world[..3], &scene.image[..3], &k, None, &params);
    assert!(matches!(
        few,
        Err(PnPError::InsufficientCorrespondences { required: 4, actual: 3 })
    ));

    let mut bad_k = k;
    bad_k[0][0] = -1.0;
    let res = solve_world_pose(&scene.world, &scene.image, &bad_k, None, &params);
    assert!(matches!(res, Err(PnPError::Camera(_))));

    let mut skewed = k;
    skewed[0][1] = 0.5;
    let res = solve_world_pose(&scene.world, &scene.image, &skewed, None, &params);
    assert!(matches!(res, Err(PnPError::Camera(_))));

    let bad_dist = PolynomialDistortion::radial(f64::NAN, 0.0);
    let res = solve_world_pose(&scene.world, &scene.image, &k, Some(&bad_dist), &params);
    assert!(matches!(res, Err(PnPError::Camera(_))));

    let mut nan_image = scene.image.clone();
    nan_image[2][1] = f64::INFINITY;
    let res = solve_world_pose(&scene.world, &nan_image, &k, None, &params);
    assert!(matches!(
        res,
        Err(PnPError::NonFiniteInput { what: "image point", index: 2 })
    ));

    let line: Vec<[f64; 3]> = (0..6).map(|i| [i as f64 * 0.2, 0.0, 0.0]).collect();
    let res = solve_world_pose(&line, &scene.image[..6], &k, None, &params);
    assert!(matches!(res, Err(PnPError::DegenerateConfiguration(_))));
}
