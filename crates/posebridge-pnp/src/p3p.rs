//! Minimal three-point pose solver.
//!
//! Lambda Twist: Persson, M. and Nordberg, K., "An Accurate Fast Robust
//! Perspective Three Point (P3P) Solver", ECCV 2018.
//! Reference: [lambdatwist-p3p](https://github.com/midjji/lambdatwist-p3p)

use crate::rigid::umeyama;
use glam::DVec3;
use nalgebra::{Matrix3, Vector3};

/// Up to four world → camera poses `(R, t)` (row-major `R`) satisfying
/// `λᵢ yᵢ = R xᵢ + t` for the three correspondences.
///
/// `bearings` are camera-frame rays, for example `[x, y, 1]` in normalized image
/// coordinates; they do not need unit length. Degenerate triples yield no pose.
pub fn solve_p3p(
    world: &[[f64; 3]; 3],
    bearings: &[[f64; 3]; 3],
) -> Vec<([[f64; 3]; 3], [f64; 3])> {
    let wp = world.map(|p| Vector3::from(p));
    let f = bearings.map(|b| Vector3::from(b).normalize());
    if f.iter().any(|v| !v.iter().all(|c| c.is_finite())) {
        return Vec::new();
    }

    let a12 = (wp[0] - wp[1]).norm_squared();
    let a13 = (wp[0] - wp[2]).norm_squared();
    let a23 = (wp[1] - wp[2]).norm_squared();

    let c12 = f[0].dot(&f[1]);
    let c23 = f[1].dot(&f[2]);
    let c31 = f[2].dot(&f[0]);
    let blob = c12 * c23 * c31 - 1.0;

    let s12_sqr = 1.0 - c12 * c12;
    let s23_sqr = 1.0 - c23 * c23;
    let s31_sqr = 1.0 - c31 * c31;

    let b12 = -2.0 * c12;
    let b13 = -2.0 * c31;
    let b23 = -2.0 * c23;

    // Cubic in the pencil parameter γ, equation (10) of the paper.
    let p3 = a13 * (a23 * s31_sqr - a13 * s23_sqr);
    let p2 =
        2.0 * blob * a23 * a13 + a13 * (2.0 * a12 + a13) * s23_sqr + a23 * (a23 - a12) * s31_sqr;
    let p1 = a23 * (a13 - a23) * s12_sqr
        - a12 * a12 * s23_sqr
        - 2.0 * a12 * (blob * a23 + a13 * s23_sqr);
    let p0 = a12 * (a12 * s23_sqr - a23 * s12_sqr);

    if p3.abs() <= f64::MIN_POSITIVE {
        return Vec::new();
    }
    let g = cubic_root(p2 / p3, p1 / p3, p0 / p3);
    if !g.is_finite() {
        return Vec::new();
    }

    #[rustfmt::skip]
    let d0 = Matrix3::new(
        a23 * (1.0 - g),  -(a23 * c12),              a23 * c31 * g,
        -(a23 * c12),     a23 - a12 + a13 * g,       -c23 * (a13 * g - a12),
        a23 * c31 * g,    -c23 * (a13 * g - a12),    g * (a13 - a23) - a12,
    );
    let (eig_vectors, eig_values) = eigen_decomposition_singular(&d0);
    let ratio = (-eig_values[1] / eig_values[0]).max(0.0).sqrt();

    let mut lambdas: Vec<Vector3<f64>> = Vec::with_capacity(4);
    for s in [ratio, -ratio] {
        // Equation (15): l1 = w0 l2 + w1 l3.
        let w2 = 1.0 / (s * eig_vectors.m12 - eig_vectors.m11);
        let w0 = w2 * (eig_vectors.m21 - s * eig_vectors.m22);
        let w1 = w2 * (eig_vectors.m31 - s * eig_vectors.m32);

        let a = 1.0 / ((a13 - a12) * w1 * w1 - a12 * b13 * w1 - a12);
        let b = a * (a13 * b12 * w1 - a12 * b13 * w0 - 2.0 * w0 * w1 * (a12 - a13));
        let c = a * ((a13 - a12) * w0 * w0 + a13 * b12 * w0 + a13);

        let Some((tau1, tau2)) = quadratic_roots(b, c) else {
            continue;
        };
        for tau in [tau1, tau2] {
            if tau <= 0.0 {
                continue;
            }
            // Equation (16).
            let d = a23 / (tau * (b23 + tau) + 1.0);
            if d <= 0.0 {
                continue;
            }
            let l2 = d.sqrt();
            let l3 = tau * l2;
            let l1 = w0 * l2 + w1 * l3;
            if l1 >= 0.0 {
                lambdas.push(Vector3::new(l1, l2, l3));
            }
        }
    }

    let src: Vec<DVec3> = world.iter().map(|&p| DVec3::from(p)).collect();
    lambdas
        .into_iter()
        .filter_map(|lambda| {
            let l = refine_lambda(lambda, [a12, a13, a23], [b12, b13, b23]);
            let dst: Vec<DVec3> = (0..3)
                .map(|i| {
                    let p = f[i] * l[i];
                    DVec3::new(p.x, p.y, p.z)
                })
                .collect();
            let (r, t, _) = umeyama(&src, &dst).ok()?;
            let finite = r.iter().flatten().chain(t.iter()).all(|v| v.is_finite());
            finite.then_some((r, t))
        })
        .collect()
}

/// Gauss-Newton on the three distance constraints
/// `lᵢ² + lⱼ² + bᵢⱼ lᵢ lⱼ = aᵢⱼ`.
fn refine_lambda(lambda: Vector3<f64>, a: [f64; 3], b: [f64; 3]) -> Vector3<f64> {
    let [a12, a13, a23] = a;
    let [b12, b13, b23] = b;
    let residual = |l: &Vector3<f64>| {
        Vector3::new(
            l.x * l.x + l.y * l.y + b12 * l.x * l.y - a12,
            l.x * l.x + l.z * l.z + b13 * l.x * l.z - a13,
            l.y * l.y + l.z * l.z + b23 * l.y * l.z - a23,
        )
    };

    let mut l = lambda;
    let mut res = residual(&l);
    for _ in 0..5 {
        if res.lp_norm(1) < 1e-14 {
            break;
        }
        let dr1dl1 = 2.0 * l.x + b12 * l.y;
        let dr1dl2 = 2.0 * l.y + b12 * l.x;
        let dr2dl1 = 2.0 * l.x + b13 * l.z;
        let dr2dl3 = 2.0 * l.z + b13 * l.x;
        let dr3dl2 = 2.0 * l.y + b23 * l.z;
        let dr3dl3 = 2.0 * l.z + b23 * l.y;
        let det = 1.0 / (-dr1dl1 * dr2dl3 * dr3dl2 - dr1dl2 * dr2dl1 * dr3dl3);

        #[rustfmt::skip]
        let adj = Matrix3::new(
            -dr2dl3 * dr3dl2, -dr1dl2 * dr3dl3,  dr1dl2 * dr2dl3,
            -dr2dl1 * dr3dl3,  dr1dl1 * dr3dl3, -dr1dl1 * dr2dl3,
             dr2dl1 * dr3dl2, -dr1dl1 * dr3dl2, -dr1dl2 * dr2dl1,
        );
        let next = l - (adj * res) * det;
        let next_res = residual(&next);
        if !(next_res.lp_norm(1) < res.lp_norm(1)) {
            break;
        }
        l = next;
        res = next_res;
    }
    l
}

/// Real roots of `r² + b r + c = 0`, computed without cancellation.
fn quadratic_roots(b: f64, c: f64) -> Option<(f64, f64)> {
    let disc = b * b - 4.0 * c;
    if !(disc >= 0.0) {
        return None;
    }
    let y = disc.sqrt();
    if b < 0.0 {
        Some((0.5 * (-b + y), 0.5 * (-b - y)))
    } else {
        Some((2.0 * c / (-b + y), 2.0 * c / (-b - y)))
    }
}

/// The root of `r³ + b r² + c r + d` with the steepest slope, by Newton-Raphson
/// from a starting point picked on the stationary points of the cubic.
fn cubic_root(b: f64, c: f64, d: f64) -> f64 {
    let mut r0;
    if b * b >= 3.0 * c {
        let v = (b * b - 3.0 * c).sqrt();
        let t1 = (-b - v) / 3.0;
        let k = ((t1 + b) * t1 + c) * t1 + d;
        if k > 0.0 {
            r0 = t1 - (-k / (3.0 * t1 + b)).sqrt();
        } else {
            let t2 = (-b + v) / 3.0;
            let k = ((t2 + b) * t2 + c) * t2 + d;
            r0 = t2 + (-k / (3.0 * t2 + b)).sqrt();
        }
    } else {
        r0 = -b / 3.0;
        if ((3.0 * r0 + 2.0 * b) * r0 + c).abs() < 1e-4 {
            r0 += 1.0;
        }
    }

    for i in 0..50 {
        let fx = ((r0 + b) * r0 + c) * r0 + d;
        if i >= 7 && fx.abs() <= 1e-13 {
            break;
        }
        let fpx = (3.0 * r0 + 2.0 * b) * r0 + c;
        r0 -= fx / fpx;
    }
    r0
}

/// Eigenvectors (as columns) and the two non-zero eigenvalues of a singular
/// symmetric 3×3 matrix, larger magnitude first. The third column spans the kernel.
fn eigen_decomposition_singular(x: &Matrix3<f64>) -> (Matrix3<f64>, [f64; 2]) {
    let v3 = x.row(0).transpose().cross(&x.row(1).transpose()).normalize();

    let x12_sqr = x.m12 * x.m12;
    let b = -x.m11 - x.m22 - x.m33;
    let c = -x12_sqr - x.m13 * x.m13 - x.m23 * x.m23 + x.m11 * (x.m22 + x.m33) + x.m22 * x.m33;
    let (mut e1, mut e2) = quadratic_roots(b, c).unwrap_or((-0.5 * b, -0.5 * b));
    if e1.abs() < e2.abs() {
        std::mem::swap(&mut e1, &mut e2);
    }

    let mx0011 = -x.m11 * x.m22;
    let prec_0 = x.m12 * x.m23 - x.m13 * x.m22;
    let prec_1 = x.m12 * x.m13 - x.m11 * x.m23;
    let eigen_vector = |e: f64| {
        let tmp = 1.0 / (e * (x.m11 + x.m22) + mx0011 - e * e + x12_sqr);
        let a1 = -(e * x.m13 + prec_0) * tmp;
        let a2 = -(e * x.m23 + prec_1) * tmp;
        let rnorm = 1.0 / (a1 * a1 + a2 * a2 + 1.0).sqrt();
        Vector3::new(a1 * rnorm, a2 * rnorm, rnorm)
    };

    let vectors = Matrix3::from_columns(&[eigen_vector(e1), eigen_vector(e2), v3]);
    (vectors, [e1, e2])
}
