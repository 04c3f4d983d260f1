use nalgebra::{RealField, Vector2};
use serde::{Deserialize, Serialize};

/// Lens distortion acting on normalized image coordinates.
pub trait DistortionModel<S: RealField + Copy> {
    fn distort(&self, n_undist: &Vector2<S>) -> Vector2<S>;
    fn undistort(&self, n_dist: &Vector2<S>) -> Vector2<S>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NoDistortion;

impl<S: RealField + Copy> DistortionModel<S> for NoDistortion {
    fn distort(&self, n_undist: &Vector2<S>) -> Vector2<S> {
        *n_undist
    }

    fn undistort(&self, n_dist: &Vector2<S>) -> Vector2<S> {
        *n_dist
    }
}

/// Brown-Conrady radial (k1, k2, k3) + tangential (p1, p2) distortion.
///
/// Undistortion is a fixed-point iteration with `iters` steps (8 when zero).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BrownConrady5<S: RealField> {
    pub k1: S,
    pub k2: S,
    pub k3: S,
    pub p1: S,
    pub p2: S,
    pub iters: u32,
}

impl<S: RealField + Copy> BrownConrady5<S> {
    /// Build from coefficients in OpenCV order `(k1, k2, p1, p2, k3)`.
    pub fn from_coeffs(coeffs: [S; 5], iters: u32) -> Self {
        Self {
            k1: coeffs[0],
            k2: coeffs[1],
            p1: coeffs[2],
            p2: coeffs[3],
            k3: coeffs[4],
            iters,
        }
    }

    /// Coefficients in OpenCV order `(k1, k2, p1, p2, k3)`.
    pub fn coeffs(&self) -> [S; 5] {
        [self.k1, self.k2, self.p1, self.p2, self.k3]
    }

    fn distort_impl(&self, x: S, y: S) -> (S, S) {
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;

        let radial = S::one() + self.k1 * r2 + self.k2 * r4 + self.k3 * r6;

        let two = S::one() + S::one();
        let xy = x * y;

        let x_tan = two * self.p1 * xy + self.p2 * (r2 + two * x * x);
        let y_tan = self.p1 * (r2 + two * y * y) + two * self.p2 * xy;

        (x * radial + x_tan, y * radial + y_tan)
    }
}

impl<S: RealField + Copy> DistortionModel<S> for BrownConrady5<S> {
    fn distort(&self, n_undist: &Vector2<S>) -> Vector2<S> {
        let (xd, yd) = self.distort_impl(n_undist.x, n_undist.y);
        Vector2::new(xd, yd)
    }

    fn undistort(&self, n_dist: &Vector2<S>) -> Vector2<S> {
        let mut x = n_dist.x;
        let mut y = n_dist.y;

        let iters = if self.iters == 0 { 8 } else { self.iters };
        for _ in 0..iters {
            let (xd, yd) = self.distort_impl(x, y);
            x -= xd - n_dist.x;
            y -= yd - n_dist.y;
        }
        Vector2::new(x, y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undistort_inverts_distort() {
        let dist = BrownConrady5 {
            k1: -0.12,
            k2: 0.03,
            k3: 0.0,
            p1: 0.001,
            p2: -0.0005,
            iters: 20,
        };
        let n = Vector2::new(0.25, -0.18);
        let back = dist.undistort(&dist.distort(&n));
        assert!((back - n).norm() < 1e-9, "{back:?} vs {n:?}");
    }

    #[test]
    fn opencv_order_round_trip() {
        let dist = BrownConrady5::from_coeffs([0.1, 0.2, 0.3, 0.4, 0.5], 8);
        assert_eq!(dist.k1, 0.1);
        assert_eq!(dist.p1, 0.3);
        assert_eq!(dist.k3, 0.5);
        assert_eq!(dist.coeffs(), [0.1, 0.2, 0.3, 0.4, 0.5]);
    }
}
