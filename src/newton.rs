//! Newton-Raphson iterative proportional fitting for a single geography.
//!
//! An alternative to the entropy balancer that sweeps the controls in order,
//! applying a closed-form second-order correction per control instead of a
//! general convex solve. Best effort by design: the routine reports whether
//! the weight change fell below tolerance or the sweep cap was hit, and the
//! caller decides whether a capped run is acceptable.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::data::{check_importance, check_marginal_vector, check_prior, HouseholdTable};
use crate::error::Result;

/// Correction factor applied to samples that contribute to a control whose
/// target total is zero.
const ZERO_TARGET_FACTOR: f64 = 0.01;

/// Configuration for the Newton-Raphson balancing sweeps.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewtonOptions {
    /// Mean absolute weight change below which the iteration stops.
    pub tolerance: f64,
    /// Hard cap on the number of full sweeps over the controls.
    pub max_iterations: usize,
    /// Per-sample weights are clamped into `[w / factor, w * factor]`.
    pub bound_factor: f64,
}

impl Default for NewtonOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-7,
            max_iterations: 10_000,
            bound_factor: 5.0,
        }
    }
}

impl NewtonOptions {
    /// Overrides the convergence tolerance while keeping other defaults.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Overrides the sweep cap while keeping other defaults.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Overrides the clamping factor while keeping other defaults.
    pub fn with_bound_factor(mut self, bound_factor: f64) -> Self {
        self.bound_factor = bound_factor;
        self
    }
}

/// Result of a Newton-Raphson balancing run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewtonSolution {
    /// Adjusted per-sample weights, clamped into the configured bounds.
    pub weights: DVector<f64>,
    /// Per-control relaxation factors accumulated across the sweeps.
    pub relaxation: DVector<f64>,
    /// Whether the mean absolute weight change met the tolerance.
    pub converged: bool,
    /// Number of sweeps performed.
    pub iterations: usize,
    /// Mean absolute weight change in the final sweep.
    pub weight_gap: f64,
}

/// Newton-Raphson list balancer for a single geography.
///
/// Sweeps the controls in order; each control's correction is computed from
/// the previous sweep's weights, while the relaxation factors are updated in
/// place and carried through the same sweep, so the control order matters.
pub fn balance_newton(
    table: &HouseholdTable,
    marginals: &DVector<f64>,
    prior: &DVector<f64>,
    importance: &DVector<f64>,
    options: &NewtonOptions,
) -> Result<NewtonSolution> {
    let n_samples = table.sample_count();
    let n_controls = table.control_count();
    check_marginal_vector(marginals, n_controls)?;
    check_prior(prior, n_samples)?;
    check_importance(importance, n_controls)?;

    let h = table.matrix();
    let lower = prior / options.bound_factor;
    let upper = prior * options.bound_factor;

    let mut relaxation = DVector::from_element(n_controls, 1.0);
    let mut current = prior.clone();
    let mut previous = prior.clone();
    let mut iterations = 0;
    let mut weight_gap = f64::INFINITY;
    let mut converged = false;

    while iterations < options.max_iterations {
        iterations += 1;

        for k in 0..n_controls {
            let column = h.column(k);
            let mut realized = 0.0;
            let mut curvature = 0.0;
            for i in 0..n_samples {
                let indicator = column[i];
                realized += previous[i] * indicator;
                curvature += previous[i] * indicator * indicator;
            }

            let target = marginals[k];
            let alpha = if realized > 0.0 {
                if target > 0.0 {
                    let numer = realized - target * relaxation[k];
                    let denom = curvature + target * relaxation[k] / importance[k];
                    1.0 - numer / denom
                } else {
                    ZERO_TARGET_FACTOR
                }
            } else {
                1.0
            };

            for i in 0..n_samples {
                let indicator = column[i];
                if indicator > 0.0 {
                    let updated = previous[i] * alpha.powf(indicator);
                    current[i] = updated.clamp(lower[i], upper[i]);
                }
            }

            relaxation[k] *= (1.0 / alpha).powf(1.0 / importance[k]);
        }

        weight_gap = (&current - &previous).abs().sum() / n_samples as f64;
        if weight_gap <= options.tolerance {
            converged = true;
            break;
        }
        previous.copy_from(&current);
    }

    Ok(NewtonSolution {
        weights: current,
        relaxation,
        converged,
        iterations,
        weight_gap,
    })
}
