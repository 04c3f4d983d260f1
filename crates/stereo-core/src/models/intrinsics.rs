use nalgebra::{Matrix3, RealField, Vector2};
use serde::{Deserialize, Serialize};

/// Intrinsics that map normalized coordinates to pixel coordinates.
pub trait IntrinsicsModel<S: RealField + Copy> {
    /// Convert normalized (distorted) coordinates into pixel coordinates.
    fn normalized_to_pixel(&self, n: &Vector2<S>) -> Vector2<S>;
    /// Convert pixel coordinates into normalized (distorted) coordinates.
    fn pixel_to_normalized(&self, pixel: &Vector2<S>) -> Vector2<S>;
}

/// Standard pinhole intrinsics with optional skew.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FxFyCxCySkew<S: RealField + Copy> {
    /// Focal length in pixels along X.
    pub fx: S,
    /// Focal length in pixels along Y.
    pub fy: S,
    /// Principal point X coordinate in pixels.
    pub cx: S,
    /// Principal point Y coordinate in pixels.
    pub cy: S,
    /// Skew term (typically 0).
    pub skew: S,
}

impl<S: RealField + Copy> FxFyCxCySkew<S> {
    /// Return the 3x3 camera intrinsics matrix K.
    pub fn k_matrix(&self) -> Matrix3<S> {
        Matrix3::new(
            self.fx,
            self.skew,
            self.cx,
            S::zero(),
            self.fy,
            self.cy,
            S::zero(),
            S::zero(),
            S::one(),
        )
    }

    /// Read intrinsics back from an upper-triangular K (normalized by `K[2,2]`).
    ///
    /// Returns `None` when `K[2,2]` vanishes or the lower triangle is not zero.
    pub fn try_from_k_matrix(k: &Matrix3<S>) -> Option<Self> {
        let eps = nalgebra::convert::<f64, S>(1e-9);
        let k33 = k[(2, 2)];
        if k33.abs() < eps {
            return None;
        }
        let k = k / k33;
        if k[(1, 0)].abs() > eps || k[(2, 0)].abs() > eps || k[(2, 1)].abs() > eps {
            return None;
        }
        Some(Self {
            fx: k[(0, 0)],
            skew: k[(0, 1)],
            cx: k[(0, 2)],
            fy: k[(1, 1)],
            cy: k[(1, 2)],
        })
    }
}

impl<S: RealField + Copy> IntrinsicsModel<S> for FxFyCxCySkew<S> {
    fn normalized_to_pixel(&self, n: &Vector2<S>) -> Vector2<S> {
        let u = self.fx * n.x + self.skew * n.y + self.cx;
        let v = self.fy * n.y + self.cy;
        Vector2::new(u, v)
    }

    fn pixel_to_normalized(&self, pixel: &Vector2<S>) -> Vector2<S> {
        let y = (pixel.y - self.cy) / self.fy;
        let x = (pixel.x - self.cx - self.skew * y) / self.fx;
        Vector2::new(x, y)
    }
}
