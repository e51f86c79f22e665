use approx::assert_relative_eq;
use posebridge_pnp::{solve_world_pose, IterativeParams, PnPError, PolynomialDistortion};

fn cube() -> Vec<[f64; 3]> {
    let mut pts = Vec::with_capacity(8);
    for x in [-0.5, 0.5] {
        for y in [-0.5, 0.5] {
            for z in [-0.5, 0.5] {
                pts.push([x, y, z]);
            }
        }
    }
    pts
}

/// Camera at (0, 0, -5) looking at the origin along +z.
fn project(points: &[[f64; 3]]) -> Vec<[f64; 2]> {
    points
        .iter()
        .map(|p| {
            let z = p[2] + 5.0;
            [800.0 * p[0] / z + 320.0, 800.0 * p[1] / z + 320.0]
        })
        .collect()
}

#[test]
fn unit_cube_seen_from_minus_five() -> Result<(), PnPError> {
    let world = cube();
    let image = project(&world);
    let k = [[800.0, 0.0, 320.0], [0.0, 800.0, 320.0], [0.0, 0.0, 1.0]];
    let no_distortion = PolynomialDistortion::from_opencv_coeffs(&[0.0; 8]);

    let pose = solve_world_pose(&world, &image, &k, Some(&no_distortion), &IterativeParams::default())?;

    assert_relative_eq!(pose.position[0], 0.0, epsilon = 1e-6);
    assert_relative_eq!(pose.position[1], 0.0, epsilon = 1e-6);
    assert_relative_eq!(pose.position[2], -5.0, epsilon = 1e-6);
    for i in 0..3 {
        for j in 0..3 {
            let expected = if i == j { 1.0 } else { 0.0 };
            assert_relative_eq!(pose.rotation[i][j], expected, epsilon = 1e-6);
        }
    }

    let flat = pose.to_array();
    assert_relative_eq!(flat[0], 1.0f32, epsilon = 1e-5);
    assert_relative_eq!(flat[11], -5.0f32, epsilon = 1e-5);
    Ok(())
}
