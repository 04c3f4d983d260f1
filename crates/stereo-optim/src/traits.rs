use nalgebra::{DMatrix, DVector};
use stereo_core::Real;

/// A dense least-squares cost `0.5 * ||s ∘ r(x)||^2`.
///
/// Implementors supply the raw residual vector and its Jacobian; the row
/// scales `s` come from [`Objective::irls_scales`] and are treated as
/// constants when differentiating.
pub trait Objective {
    fn num_params(&self) -> usize;
    fn num_residuals(&self) -> usize;

    fn raw_residuals(&self, x: &DVector<Real>) -> DVector<Real>;
    fn raw_jacobian(&self, x: &DVector<Real>) -> DMatrix<Real>;

    /// Per-row scale applied to residuals and Jacobian rows. All ones unless
    /// the objective uses a robust kernel.
    fn irls_scales(&self, raw: &DVector<Real>) -> DVector<Real> {
        DVector::from_element(raw.len(), 1.0)
    }

    fn residuals(&self, x: &DVector<Real>) -> DVector<Real> {
        let raw = self.raw_residuals(x);
        let scales = self.irls_scales(&raw);
        raw.component_mul(&scales)
    }

    fn jacobian(&self, x: &DVector<Real>) -> DMatrix<Real> {
        let scales = self.irls_scales(&self.raw_residuals(x));
        let mut jac = self.raw_jacobian(x);
        for (i, s) in scales.iter().enumerate().filter(|(_, s)| **s != 1.0) {
            jac.row_mut(i).scale_mut(*s);
        }
        jac
    }
}

/// Termination settings shared by every refinement stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolveOptions {
    /// Iteration cap. The LM backend allows `max_iters * (n + 1)` evaluations.
    pub max_iters: usize,
    pub ftol: Real,
    pub gtol: Real,
    pub xtol: Real,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            max_iters: 100,
            ftol: 1e-12,
            gtol: 1e-12,
            xtol: 1e-12,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SolveReport {
    pub evaluations: usize,
    pub initial_cost: Real,
    pub final_cost: Real,
    pub converged: bool,
    /// Backend termination reason, for logs.
    pub termination: String,
}

pub trait Minimizer {
    fn solve<P: Objective>(&self, problem: &P, x0: DVector<Real>, opts: &SolveOptions) -> (DVector<Real>, SolveReport);
}
