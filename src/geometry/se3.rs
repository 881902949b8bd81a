//! SE(3) rigid transform: unit quaternion rotation + translation.
//!
//! Body poses are stored as T_cb (body frame to camera frame). The 4x4
//! matrix conversions use row-major element order, which is the convention
//! external drivers supply initial poses in.

use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector3, Vector6};

use super::so3;

/// Rigid transform in SE(3).
#[derive(Debug, Clone, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Identity transform.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Build from a rotation matrix and translation vector.
    ///
    /// The rotation block is re-orthonormalized, so matrices that are only
    /// orthonormal to floating tolerance are accepted.
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix(&rotation));
        Self {
            rotation,
            translation,
        }
    }

    /// Build from a 4x4 homogeneous transform.
    pub fn from_matrix(m: &Matrix4<f64>) -> Self {
        let rot = m.fixed_view::<3, 3>(0, 0).into_owned();
        let trans = Vector3::new(m[(0, 3)], m[(1, 3)], m[(2, 3)]);
        Self::from_rt(rot, trans)
    }

    /// Build from 16 row-major elements, the layout external drivers supply
    /// initial poses in.
    pub fn from_row_major(elements: &[f64; 16]) -> Self {
        Self::from_matrix(&Matrix4::from_row_slice(elements))
    }

    /// 4x4 homogeneous transform.
    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(self.rotation.to_rotation_matrix().matrix());
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// Composition: `self * other` (apply `other` first, then `self`).
    pub fn compose(&self, other: &SE3) -> SE3 {
        SE3 {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Inverse transform.
    pub fn inverse(&self) -> SE3 {
        let rot_inv = self.rotation.inverse();
        SE3 {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Transform a point.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Rotate a direction (no translation).
    pub fn rotate(&self, d: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * d
    }

    /// Exponential map of a twist `ξ = [ω, v]` (rotation first).
    pub fn exp(xi: &Vector6<f64>) -> SE3 {
        let omega = Vector3::new(xi[0], xi[1], xi[2]);
        let v = Vector3::new(xi[3], xi[4], xi[5]);
        SE3 {
            rotation: UnitQuaternion::from_scaled_axis(omega),
            translation: so3::left_jacobian(&omega) * v,
        }
    }

    /// Rotation angle between two transforms, in radians.
    pub fn angle_to(&self, other: &SE3) -> f64 {
        (self.rotation.inverse() * other.rotation).angle()
    }

    /// Euclidean distance between the two translations, in meters.
    pub fn translation_to(&self, other: &SE3) -> f64 {
        (self.translation - other.translation).norm()
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}
