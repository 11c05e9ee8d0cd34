//! Conjugate gradient for the symmetric positive semi-definite normal
//! equations `(Aᵀ A + λ I) x = Aᵀ b`.

use tracing::debug;

use crate::error::{ReconError, Result};
use crate::operator::LinearOperator;
use crate::volume::VolumeSeries;

/// Fixed-iteration CG, warm-started from the caller's estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConjugateGradient {
    pub iterations: usize,
    /// Stop once `‖r‖ ≤ tolerance · ‖b‖`. None runs every iteration.
    pub tolerance: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct CgOutcome {
    pub solution: VolumeSeries,
    /// `‖r‖` before the first iteration and after each one.
    pub residual_norms: Vec<f64>,
    pub iterations_run: usize,
}

impl ConjugateGradient {
    pub fn new(iterations: usize) -> Self {
        Self {
            iterations,
            tolerance: None,
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Result<Self> {
        if !(tolerance.is_finite() && tolerance >= 0.0) {
            return Err(ReconError::parameter(format!(
                "CG tolerance must be non-negative, got {}",
                tolerance
            )));
        }
        self.tolerance = Some(tolerance);
        Ok(self)
    }

    pub fn solve<O>(&self, op: &O, b: &VolumeSeries, x0: VolumeSeries) -> Result<CgOutcome>
    where
        O: LinearOperator + ?Sized,
    {
        x0.ensure_compatible(b)?;
        let mut x = x0;
        if self.iterations == 0 {
            return Ok(CgOutcome {
                solution: x,
                residual_norms: Vec::new(),
                iterations_run: 0,
            });
        }

        let ax = op.apply(&x)?;
        x.ensure_compatible(&ax)?;
        let mut r = b.clone().difference(&ax);
        let mut p = r.clone();
        let mut rs = r.dot(&r);
        let threshold = self.tolerance.map(|t| t * b.norm());
        let mut residual_norms = vec![rs.sqrt()];
        let mut iterations_run = 0;

        for it in 0..self.iterations {
            if rs == 0.0 || threshold.is_some_and(|t| rs.sqrt() <= t) {
                break;
            }
            let ap = op.apply(&p)?;
            p.ensure_compatible(&ap)?;
            let curvature = p.dot(&ap);
            if !(curvature > 0.0) {
                debug!(iteration = it, curvature, "CG stopped on non-positive curvature");
                break;
            }
            let alpha = rs / curvature;
            x.axpy(alpha, &p);
            r.axpy(-alpha, &ap);
            let rs_next = r.dot(&r);
            residual_norms.push(rs_next.sqrt());
            iterations_run = it + 1;
            debug!(iteration = it, residual = rs_next.sqrt(), "CG");

            p.xpby(&r, rs_next / rs);
            rs = rs_next;
        }

        Ok(CgOutcome {
            solution: x,
            residual_norms,
            iterations_run,
        })
    }
}
