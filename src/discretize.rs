//! Integerizing continuous tract weights into a binary household selection.
//!
//! Truncating the balanced weights to integers leaves fractional remainders
//! whose marginals still need to be honored. For each tract the remainders
//! feed a small convex program: select `y` in `[0, 1]` per sample, rewarding
//! samples with large remainders through a `ln` coefficient and penalizing
//! departures of `y`'s marginals from the truncation residuals. The slack
//! variables of the stated program are absorbed in closed form, leaving a
//! penalized objective whose absolute values are smoothed with a
//! pseudo-Huber term and maximized by monotone projected gradient ascent.
//! Thresholding the maximizer at one half yields the binary selection.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::data::HouseholdTable;
use crate::error::{BalanceError, Result};

/// Configuration for the weight discretizer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiscretizeOptions {
    /// Relaxation weight: the marginal-mismatch penalty is `gamma - 1`.
    pub gamma: f64,
    /// Width of the pseudo-Huber smoothing of the mismatch penalty.
    pub smoothing: f64,
    /// Largest per-sample movement below which the ascent stops.
    pub tolerance: f64,
    /// Hard cap on ascent iterations per tract.
    pub max_iterations: usize,
}

impl Default for DiscretizeOptions {
    fn default() -> Self {
        Self {
            gamma: 100.0,
            smoothing: 5e-3,
            tolerance: 1e-8,
            max_iterations: 10_000,
        }
    }
}

impl DiscretizeOptions {
    /// Overrides the relaxation weight while keeping other defaults.
    pub fn with_gamma(mut self, gamma: f64) -> Self {
        self.gamma = gamma;
        self
    }

    /// Overrides the smoothing width while keeping other defaults.
    pub fn with_smoothing(mut self, smoothing: f64) -> Self {
        self.smoothing = smoothing;
        self
    }

    /// Overrides the movement tolerance while keeping other defaults.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Overrides the iteration cap while keeping other defaults.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }
}

/// Discretizes continuous per-tract weights into a binary selection.
///
/// Samples whose weight is already integral carry no fractional remainder and
/// are never selected for rounding up; they are excluded from the objective
/// rather than feeding `ln(0)` into it.
pub fn discretize_weights(
    table: &HouseholdTable,
    weights: &DMatrix<f64>,
    options: &DiscretizeOptions,
) -> Result<DMatrix<u8>> {
    let n_samples = table.sample_count();
    if weights.nrows() == 0 {
        return Err(BalanceError::Empty {
            component: "weight matrix",
            unit: "tract",
        });
    }
    if weights.ncols() != n_samples {
        return Err(BalanceError::dimension_mismatch(
            "weight columns",
            n_samples,
            weights.ncols(),
        ));
    }
    for tract in 0..weights.nrows() {
        for sample in 0..n_samples {
            let value = weights[(tract, sample)];
            if !value.is_finite() || value < 0.0 {
                return Err(BalanceError::InvalidWeight {
                    tract,
                    sample,
                    value,
                });
            }
        }
    }
    if !options.gamma.is_finite() || options.gamma <= 1.0 {
        return Err(BalanceError::numerical("discretizer relaxation weight"));
    }
    if !options.smoothing.is_finite() || options.smoothing <= 0.0 {
        return Err(BalanceError::numerical("discretizer smoothing width"));
    }

    let h = table.matrix();
    let penalty = options.gamma - 1.0;
    let mut selection = DMatrix::<u8>::zeros(weights.nrows(), n_samples);

    for tract in 0..weights.nrows() {
        let fractional = DVector::from_fn(n_samples, |i, _| {
            weights[(tract, i)] - weights[(tract, i)].trunc()
        });
        let active: Vec<usize> = (0..n_samples).filter(|&i| fractional[i] > 0.0).collect();
        if active.is_empty() {
            continue;
        }

        // Marginal residual left behind by truncation: x*H - floor(x)*H.
        let residual = h.transpose() * &fractional;
        let coefficients = DVector::from_fn(n_samples, |i, _| {
            if fractional[i] > 0.0 {
                fractional[i].ln()
            } else {
                0.0
            }
        });

        let rounded = maximize_selection(
            h,
            &residual,
            &coefficients,
            &active,
            &fractional,
            penalty,
            options,
        );
        for &i in &active {
            if rounded[i] > 0.5 {
                selection[(tract, i)] = 1;
            }
        }
    }

    Ok(selection)
}

/// Projected gradient ascent on the smoothed per-tract selection objective,
/// starting from the fractional remainders (which carry zero penalty).
fn maximize_selection(
    h: &DMatrix<f64>,
    residual: &DVector<f64>,
    coefficients: &DVector<f64>,
    active: &[usize],
    fractional: &DVector<f64>,
    penalty: f64,
    options: &DiscretizeOptions,
) -> DVector<f64> {
    let n_controls = h.ncols();
    let mut y = fractional.clone();
    let mut objective = evaluate(h, residual, coefficients, active, &y, penalty, options);
    let mut step = 1.0_f64;

    for _ in 0..options.max_iterations {
        let realized = h.transpose() * &y;
        let mismatch = DVector::from_fn(n_controls, |k, _| {
            let gap = realized[k] - residual[k];
            gap / (gap * gap + options.smoothing * options.smoothing).sqrt()
        });
        let mut gradient = DVector::zeros(y.len());
        for &i in active {
            let mut pull = 0.0;
            for k in 0..n_controls {
                pull += h[(i, k)] * mismatch[k];
            }
            gradient[i] = coefficients[i] - penalty * pull;
        }

        let mut moved = false;
        let mut movement = 0.0_f64;
        for _ in 0..60 {
            let mut candidate = y.clone();
            for &i in active {
                candidate[i] = (y[i] + step * gradient[i]).clamp(0.0, 1.0);
            }
            let improved =
                evaluate(h, residual, coefficients, active, &candidate, penalty, options);
            if improved > objective {
                movement = active
                    .iter()
                    .fold(0.0_f64, |acc, &i| acc.max((candidate[i] - y[i]).abs()));
                y = candidate;
                objective = improved;
                step = (step * 2.0).min(1e3);
                moved = true;
                break;
            }
            step *= 0.5;
        }

        if !moved || movement <= options.tolerance {
            break;
        }
    }

    y
}

/// Smoothed selection objective: reward from the `ln` coefficients minus the
/// pseudo-Huber penalty on the marginal mismatch.
fn evaluate(
    h: &DMatrix<f64>,
    residual: &DVector<f64>,
    coefficients: &DVector<f64>,
    active: &[usize],
    y: &DVector<f64>,
    penalty: f64,
    options: &DiscretizeOptions,
) -> f64 {
    let mut reward = 0.0;
    for &i in active {
        reward += coefficients[i] * y[i];
    }
    let realized = h.transpose() * y;
    let delta = options.smoothing;
    let mut mismatch = 0.0;
    for k in 0..h.ncols() {
        let gap = realized[k] - residual[k];
        mismatch += (gap * gap + delta * delta).sqrt() - delta;
    }
    reward - penalty * mismatch
}
