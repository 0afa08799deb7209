//! Solver configuration and diagnostics shared by the entropy balancers.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Configuration for the dual Newton iterations behind the entropy balancers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntropyOptions {
    /// Tolerance on the largest marginal residual, relative to the scale of
    /// the supplied control totals.
    pub tolerance: f64,
    /// Maximum number of Newton sweeps before the solve is abandoned.
    pub max_iterations: usize,
}

impl Default for EntropyOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-8,
            max_iterations: 100,
        }
    }
}

impl EntropyOptions {
    /// Overrides the residual tolerance while keeping other defaults.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Overrides the sweep cap while keeping other defaults.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }
}

/// Diagnostics describing a completed entropy solve.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SolveSummary {
    /// Number of Newton sweeps performed.
    pub iterations: usize,
    /// Largest absolute marginal residual at exit.
    pub residual: f64,
}

/// How the hierarchical balancer arrived at its weights.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalanceOutcome {
    /// The problem was solved at the requested importance weights.
    Solved,
    /// Importance weights were relaxed before a solution was found.
    RelaxedAndSolved,
    /// Every attempt failed; the rescaled prior weights were returned.
    FallbackToPrior,
}

/// Why a single solve attempt was rejected.
#[derive(Clone, Copy, Debug)]
pub(crate) enum SolveFailure {
    /// The dual Hessian could not be factorized.
    Singular,
    /// An iterate produced a NaN or infinity.
    NonFinite,
    /// The residual tolerance was not met within the sweep cap.
    IterationLimit { residual: f64 },
}

/// Dual exponents beyond this magnitude overflow `exp` well before they carry
/// information; iterates that reach it are treated as non-finite.
pub(crate) const EXPONENT_CAP: f64 = 700.0;

/// Armijo sufficient-decrease constant for the backtracking line searches.
pub(crate) const ARMIJO_SLOPE: f64 = 1e-4;

/// Maximum number of step halvings attempted per Newton direction.
pub(crate) const MAX_HALVINGS: usize = 40;

/// Solves `matrix * x = rhs` for a symmetric positive definite system,
/// retrying once with a small ridge when the factorization fails.
pub(crate) fn solve_spd(matrix: &DMatrix<f64>, rhs: &DVector<f64>) -> Option<DVector<f64>> {
    if let Some(cholesky) = nalgebra::linalg::Cholesky::new(matrix.clone()) {
        return Some(cholesky.solve(rhs));
    }
    let order = matrix.nrows();
    let trace: f64 = (0..order).map(|k| matrix[(k, k)]).sum();
    let ridge = 1e-10 * (trace / order as f64).max(1.0);
    let mut damped = matrix.clone();
    for k in 0..order {
        damped[(k, k)] += ridge;
    }
    nalgebra::linalg::Cholesky::new(damped).map(|cholesky| cholesky.solve(rhs))
}

/// Largest absolute value over an iterator of floats.
pub(crate) fn max_abs<'a, I: IntoIterator<Item = &'a f64>>(values: I) -> f64 {
    values
        .into_iter()
        .fold(0.0_f64, |acc, value| acc.max(value.abs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn spd_solve_recovers_known_solution() {
        let matrix = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let expected = DVector::from_vec(vec![1.0, -2.0]);
        let rhs = &matrix * &expected;
        let solved = solve_spd(&matrix, &rhs).unwrap();
        assert_relative_eq!(solved, expected, epsilon = 1e-12);
    }

    #[test]
    fn spd_solve_applies_ridge_to_singular_system() {
        let matrix = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let rhs = DVector::from_vec(vec![1.0, 1.0]);
        assert!(solve_spd(&matrix, &rhs).is_some());
    }

    #[test]
    fn options_round_trip_through_serde() {
        let options = EntropyOptions::default().with_tolerance(1e-6);
        let encoded = serde_json::to_string(&options).unwrap();
        let decoded: EntropyOptions = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.tolerance, 1e-6);
        assert_eq!(decoded.max_iterations, options.max_iterations);

        let outcome = serde_json::to_string(&BalanceOutcome::FallbackToPrior).unwrap();
        assert_eq!(outcome, "\"FallbackToPrior\"");
    }
}
