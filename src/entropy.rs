//! Single-geography maximum entropy balancing.
//!
//! Reallocates sample weights to match one geography's control totals while
//! staying as close as possible, in the Kullback-Leibler sense, to the prior
//! weights. The constrained program is solved through its smooth convex dual:
//! stationarity gives `x_i = w_i * exp(-1 - (H lambda)_i)` and, when a
//! relaxation is allowed, `z_k = exp(A_k * lambda_k / mu_k - 1)`, leaving a
//! Newton iteration over the control multipliers `lambda`.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::data::{check_importance, check_marginal_vector, check_prior, HouseholdTable};
use crate::error::{BalanceError, Result};
use crate::solving::{
    max_abs, solve_spd, EntropyOptions, SolveSummary, ARMIJO_SLOPE, EXPONENT_CAP, MAX_HALVINGS,
};

/// Balanced weights for a single geography.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntropySolution {
    /// Per-sample allocation weights, non-negative.
    pub weights: DVector<f64>,
    /// Per-control relaxation factors; present only when importance weights
    /// were supplied.
    pub relaxation: Option<DVector<f64>>,
    /// Diagnostics from the dual Newton iteration.
    pub summary: SolveSummary,
}

/// Dual iterate together with the quantities derived from it.
struct DualState {
    weights: DVector<f64>,
    relaxation: Option<DVector<f64>>,
    objective: f64,
    residual: DVector<f64>,
}

/// Maximum entropy allocation for a single geography.
///
/// Without `importance` the control totals are matched exactly:
/// `x' H = A`. With `importance` the equality relaxes to `x' H = A .* z`,
/// where each `z_k` carries an entropy penalty scaled by `mu_k`.
///
/// There is no retry logic here: an infeasible or ill-conditioned problem
/// surfaces as an error and the caller decides what to do with it.
pub fn balance_entropy(
    table: &HouseholdTable,
    marginals: &DVector<f64>,
    prior: &DVector<f64>,
    importance: Option<&DVector<f64>>,
    options: &EntropyOptions,
) -> Result<EntropySolution> {
    let n_controls = table.control_count();
    check_marginal_vector(marginals, n_controls)?;
    check_prior(prior, table.sample_count())?;
    if let Some(mu) = importance {
        check_importance(mu, n_controls)?;
    }

    let scale = max_abs(marginals.iter()).max(1.0);
    let mut lambda = DVector::zeros(n_controls);
    let mut state = evaluate(table, marginals, prior, importance, &lambda)
        .ok_or_else(|| BalanceError::numerical("entropy dual evaluation"))?;

    let mut iterations = 0;
    loop {
        let residual_norm = max_abs(state.residual.iter());
        if residual_norm <= options.tolerance * scale {
            return Ok(EntropySolution {
                weights: state.weights,
                relaxation: state.relaxation,
                summary: SolveSummary {
                    iterations,
                    residual: residual_norm,
                },
            });
        }
        if iterations >= options.max_iterations {
            break;
        }

        let hessian = dual_hessian(table, marginals, importance, &state);
        let direction = solve_spd(&hessian, &state.residual)
            .ok_or_else(|| BalanceError::singular("entropy dual Hessian"))?;
        let slope = state.residual.dot(&direction);
        if !slope.is_finite() || slope <= 0.0 {
            break;
        }

        let mut accepted = None;
        let mut step = 1.0_f64;
        for _ in 0..MAX_HALVINGS {
            let candidate = &lambda + &direction * step;
            if let Some(next) = evaluate(table, marginals, prior, importance, &candidate) {
                if next.objective <= state.objective - ARMIJO_SLOPE * step * slope {
                    accepted = Some((candidate, next));
                    break;
                }
            }
            step *= 0.5;
        }

        match accepted {
            Some((candidate, next)) => {
                lambda = candidate;
                state = next;
                iterations += 1;
            }
            // No admissible step remains; report the unresolved residual.
            None => break,
        }
    }

    Err(BalanceError::DidNotConverge {
        iterations,
        residual: max_abs(state.residual.iter()),
    })
}

/// Evaluates weights, relaxation, dual objective and marginal residual at a
/// dual iterate, or `None` if anything overflows.
fn evaluate(
    table: &HouseholdTable,
    marginals: &DVector<f64>,
    prior: &DVector<f64>,
    importance: Option<&DVector<f64>>,
    lambda: &DVector<f64>,
) -> Option<DualState> {
    let h = table.matrix();
    let exponents = h * lambda;
    let mut weights = DVector::zeros(prior.len());
    for i in 0..prior.len() {
        let exponent = -1.0 - exponents[i];
        if exponent > EXPONENT_CAP {
            return None;
        }
        weights[i] = prior[i] * exponent.exp();
    }

    let realized = h.transpose() * &weights;
    let mut objective = weights.iter().sum::<f64>();
    let mut residual = DVector::zeros(marginals.len());

    match importance {
        Some(mu) => {
            let mut relaxation = DVector::zeros(marginals.len());
            for k in 0..marginals.len() {
                let exponent = marginals[k] * lambda[k] / mu[k] - 1.0;
                if exponent > EXPONENT_CAP {
                    return None;
                }
                relaxation[k] = exponent.exp();
                objective += mu[k] * relaxation[k];
                residual[k] = realized[k] - marginals[k] * relaxation[k];
            }
            if !objective.is_finite() {
                return None;
            }
            Some(DualState {
                weights,
                relaxation: Some(relaxation),
                objective,
                residual,
            })
        }
        None => {
            for k in 0..marginals.len() {
                objective += lambda[k] * marginals[k];
                residual[k] = realized[k] - marginals[k];
            }
            if !objective.is_finite() {
                return None;
            }
            Some(DualState {
                weights,
                relaxation: None,
                objective,
                residual,
            })
        }
    }
}

/// Hessian of the dual objective: `H' diag(x) H`, plus
/// `diag(A_k^2 z_k / mu_k)` when the marginals are relaxed.
fn dual_hessian(
    table: &HouseholdTable,
    marginals: &DVector<f64>,
    importance: Option<&DVector<f64>>,
    state: &DualState,
) -> DMatrix<f64> {
    let h = table.matrix();
    let scaled = DMatrix::from_fn(h.nrows(), h.ncols(), |i, k| state.weights[i] * h[(i, k)]);
    let mut hessian = h.transpose() * scaled;
    if let (Some(mu), Some(relaxation)) = (importance, state.relaxation.as_ref()) {
        for k in 0..marginals.len() {
            hessian[(k, k)] += marginals[k] * marginals[k] * relaxation[k] / mu[k];
        }
    }
    hessian
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn disjoint_table() -> HouseholdTable {
        HouseholdTable::new(DMatrix::from_row_slice(
            3,
            2,
            &[1.0, 0.0, 0.0, 1.0, 0.0, 1.0],
        ))
        .unwrap()
    }

    #[test]
    fn exact_balance_matches_disjoint_marginals() {
        let table = disjoint_table();
        let marginals = DVector::from_vec(vec![2.0, 1.0]);
        let prior = DVector::from_element(3, 1.0);

        let solution = balance_entropy(
            &table,
            &marginals,
            &prior,
            None,
            &EntropyOptions::default(),
        )
        .unwrap();

        let realized = table.matrix().transpose() * &solution.weights;
        assert_relative_eq!(realized, marginals, epsilon = 1e-6);
        // With a uniform prior the entropy objective splits the second
        // control's mass evenly across its two samples.
        assert_relative_eq!(solution.weights[1], solution.weights[2], epsilon = 1e-6);
        assert!(solution.weights.iter().all(|&w| w >= 0.0));
        assert!(solution.relaxation.is_none());
    }

    #[test]
    fn relaxed_balance_is_consistent_with_its_relaxation() {
        let table = HouseholdTable::new(DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 1.0]))
            .unwrap();
        let marginals = DVector::from_vec(vec![1.0, 1.0]);
        let prior = DVector::from_element(2, 1.0);
        let importance = DVector::from_element(2, 1000.0);

        let solution = balance_entropy(
            &table,
            &marginals,
            &prior,
            Some(&importance),
            &EntropyOptions::default(),
        )
        .unwrap();

        let relaxation = solution.relaxation.as_ref().unwrap();
        let realized = table.matrix().transpose() * &solution.weights;
        for k in 0..2 {
            assert_relative_eq!(realized[k], marginals[k] * relaxation[k], epsilon = 1e-6);
            // The plain entropy penalty pins the relaxation near 1/e once the
            // importance weight dominates the allocation term.
            assert_relative_eq!(relaxation[k], (-1.0_f64).exp(), epsilon = 1e-4);
        }
    }

    #[test]
    fn rejects_mismatched_marginals() {
        let table = disjoint_table();
        let marginals = DVector::from_vec(vec![2.0]);
        let prior = DVector::from_element(3, 1.0);
        let result = balance_entropy(
            &table,
            &marginals,
            &prior,
            None,
            &EntropyOptions::default(),
        );
        assert!(matches!(
            result,
            Err(BalanceError::DimensionMismatch { .. })
        ));
    }
}
