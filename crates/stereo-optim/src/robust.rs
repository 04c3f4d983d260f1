use serde::{Deserialize, Serialize};
use stereo_core::Real;

/// Robust loss kernels for iteratively re-weighted least squares (IRLS).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RobustKernel {
    /// No robustness, pure L2 (quadratic).
    #[default]
    None,
    /// Huber loss with a given threshold (pixels).
    Huber { delta: Real },
    /// Cauchy loss with a scale parameter (pixels).
    Cauchy { c: Real },
}

impl RobustKernel {
    /// Return the robust loss `rho(r^2)` and the IRLS weight `w(r)` for a squared residual.
    ///
    /// Residuals and Jacobian rows are scaled by `sqrt(w)` before the
    /// linearised system is solved.
    pub fn rho_and_weight(self, r2: Real) -> (Real, Real) {
        match self {
            RobustKernel::None => (r2, 1.0),
            RobustKernel::Huber { delta } => {
                let r = r2.sqrt();
                if r <= delta {
                    (r2, 1.0)
                } else {
                    (2.0 * delta * r - delta * delta, delta / r)
                }
            }
            RobustKernel::Cauchy { c } => {
                let t = r2 / (c * c);
                (c * c * (1.0 + t).ln(), 1.0 / (1.0 + t))
            }
        }
    }

    /// `sqrt(w)` for a squared residual norm.
    pub fn row_scale(self, r2: Real) -> Real {
        self.rho_and_weight(r2).1.sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: Real, b: Real, tol: Real) {
        assert!(
            (a - b).abs() <= tol,
            "values differ: {} vs {} (tol={})",
            a,
            b,
            tol
        );
    }

    #[test]
    fn huber_matches_l2_for_small_residuals() {
        let kernel = RobustKernel::Huber { delta: 1.0 };
        let (rho, w) = kernel.rho_and_weight(0.25);
        approx_eq(rho, 0.25, 1e-12);
        approx_eq(w, 1.0, 1e-12);
    }

    #[test]
    fn huber_linear_for_large_residuals() {
        let kernel = RobustKernel::Huber { delta: 1.0 };
        let (rho, w) = kernel.rho_and_weight(25.0);
        approx_eq(rho, 9.0, 1e-12);
        approx_eq(w, 0.2, 1e-12);
        approx_eq(kernel.row_scale(25.0), 0.2_f64.sqrt(), 1e-12);
    }

    #[test]
    fn cauchy_weight_decreases_with_r() {
        let kernel = RobustKernel::Cauchy { c: 1.0 };
        let (_, w_small) = kernel.rho_and_weight(0.01);
        let (_, w_large) = kernel.rho_and_weight(100.0);
        assert!(w_small > 0.9, "w_small = {w_small}");
        assert!(w_large < 0.02, "w_large = {w_large}");
    }

    #[test]
    fn kernel_config_is_tagged_json() {
        let kernel: RobustKernel = serde_json::from_str(r#"{"kind":"huber","delta":2.0}"#).unwrap();
        assert_eq!(kernel, RobustKernel::Huber { delta: 2.0 });
        let none: RobustKernel = serde_json::from_str(r#"{"kind":"none"}"#).unwrap();
        assert_eq!(none, RobustKernel::None);
    }
}
