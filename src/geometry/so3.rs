//! SO(3) helpers used by the SE(3) exponential and the modality Jacobians.

use nalgebra::{Matrix3, Vector3};

/// Small angle threshold for numerical stability.
const SMALL_ANGLE_THRESHOLD: f64 = 1e-8;

/// Constructs the skew-symmetric matrix [v]× such that [v]× u = v × u.
///
/// ```text
/// [v]× = |  0   -v_z   v_y |
///        |  v_z   0   -v_x |
///        | -v_y  v_x    0  |
/// ```
#[inline]
#[rustfmt::skip]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Computes the left Jacobian V(φ) of SO(3), which maps the translational
/// part of a twist onto the group:
///
/// ```text
/// V(φ) = I + (1 - cos|φ|)/|φ|² [φ]× + (|φ| - sin|φ|)/|φ|³ [φ]×²
/// ```
///
/// For small angles, V(φ) ≈ I + 0.5 [φ]×.
pub fn left_jacobian(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();

    if theta < SMALL_ANGLE_THRESHOLD {
        return Matrix3::identity() + 0.5 * skew(phi);
    }

    let theta_sq = theta * theta;
    let theta_cu = theta_sq * theta;
    let skew_phi = skew(phi);
    let skew_phi_sq = skew_phi * skew_phi;

    Matrix3::identity()
        + ((1.0 - theta.cos()) / theta_sq) * skew_phi
        + ((theta - theta.sin()) / theta_cu) * skew_phi_sq
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn skew_matches_cross_product() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        let u = Vector3::new(4.0, 5.0, 6.0);

        assert_relative_eq!(v.cross(&u), skew(&v) * u, epsilon = 1e-12);
    }

    #[test]
    fn skew_is_antisymmetric() {
        let v = Vector3::new(-0.3, 0.7, 1.1);
        let s = skew(&v);

        assert_relative_eq!(s, -s.transpose(), epsilon = 1e-12);
    }

    #[test]
    fn left_jacobian_identity_at_zero() {
        assert_relative_eq!(
            left_jacobian(&Vector3::zeros()),
            Matrix3::identity(),
            epsilon = 1e-10
        );
    }

    #[test]
    fn left_jacobian_small_angle_consistency() {
        // Series formula and closed form must agree near the threshold.
        let phi = Vector3::new(1e-7, -2e-7, 1.5e-7);
        let series = Matrix3::identity() + 0.5 * skew(&phi);

        assert_relative_eq!(left_jacobian(&phi), series, epsilon = 1e-12);
    }
}
