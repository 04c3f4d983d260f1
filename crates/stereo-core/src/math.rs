//! Mathematical utilities and type definitions.
//!
//! This module provides fundamental types used throughout the workspace
//! and a few helpers for homogeneous coordinates and rotations.

use nalgebra::{
    Isometry3, Matrix3, Matrix3x4, Matrix4, Point2, Point3, Rotation3, Vector2, Vector3,
};

/// Scalar type used throughout the library (currently `f64`).
pub type Real = f64;

/// 2D vector with [`Real`] components.
pub type Vec2 = Vector2<Real>;
/// 3D vector with [`Real`] components.
pub type Vec3 = Vector3<Real>;
/// 2D point with [`Real`] coordinates.
pub type Pt2 = Point2<Real>;
/// 3D point with [`Real`] coordinates.
pub type Pt3 = Point3<Real>;
/// 3×3 matrix with [`Real`] entries.
pub type Mat3 = Matrix3<Real>;
/// 3×4 projection matrix with [`Real`] entries.
pub type Mat34 = Matrix3x4<Real>;
/// 4×4 matrix with [`Real`] entries.
pub type Mat4 = Matrix4<Real>;
/// 3D rigid transform (SE(3)) using [`Real`].
pub type Iso3 = Isometry3<Real>;

/// Convert a 2D point in Euclidean coordinates into homogeneous coordinates.
pub fn to_homogeneous(p: &Pt2) -> Vec3 {
    Vec3::new(p.x, p.y, 1.0)
}

/// Convert a 3D homogeneous vector back to a 2D point.
///
/// The caller is responsible for ensuring that `w != 0`.
pub fn from_homogeneous(v: &Vec3) -> Pt2 {
    Pt2::new(v.x / v.z, v.y / v.z)
}

/// Cross-product matrix `[v]x` such that `[v]x * w == v × w`.
pub fn skew_symmetric(v: &Vec3) -> Mat3 {
    Mat3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Rotation matrix from an axis-angle (Rodrigues) vector.
pub fn rotation_from_axis_angle(omega: &Vec3) -> Mat3 {
    Rotation3::from_scaled_axis(*omega).into_inner()
}

/// Axis-angle (Rodrigues) vector of a rotation matrix.
///
/// The input is projected onto SO(3) first, so slightly non-orthonormal
/// matrices coming out of linear solvers are accepted.
pub fn axis_angle_from_rotation(r: &Mat3) -> Vec3 {
    project_to_so3(r).scaled_axis()
}

/// Closest rotation (in the Frobenius sense) to an arbitrary 3×3 matrix.
pub fn project_to_so3(m: &Mat3) -> Rotation3<Real> {
    let svd = m.svd(true, true);
    match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => {
            let mut r = u * v_t;
            if r.determinant() < 0.0 {
                let mut u_fixed = u;
                u_fixed.column_mut(2).neg_mut();
                r = u_fixed * v_t;
            }
            Rotation3::from_matrix_unchecked(r)
        }
        _ => Rotation3::from_matrix(m),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn skew_matches_cross_product() {
        let a = Vec3::new(0.3, -1.2, 2.0);
        let b = Vec3::new(-0.5, 0.25, 1.0);
        assert_relative_eq!(skew_symmetric(&a) * b, a.cross(&b), epsilon = 1e-12);
    }

    #[test]
    fn axis_angle_round_trip() {
        let omega = Vec3::new(0.1, -0.2, 0.05);
        let r = rotation_from_axis_angle(&omega);
        assert_relative_eq!(axis_angle_from_rotation(&r), omega, epsilon = 1e-12);
    }

    #[test]
    fn so3_projection_fixes_reflections() {
        let mut m = Mat3::identity();
        m[(2, 2)] = -1.0;
        let r = project_to_so3(&m);
        assert!((r.matrix().determinant() - 1.0).abs() < 1e-12);
    }
}
