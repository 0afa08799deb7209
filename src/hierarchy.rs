//! Hierarchical maximum entropy balancing: many tracts at once, tied together
//! by a shared meta-marginal layer.
//!
//! Each tract's weighted column sums must match its own control totals up to
//! a penalized relaxation `z`, while the relaxed tract totals must aggregate
//! to the meta totals up to a second relaxation `q`. The program is solved on
//! its dual: per-tract multipliers take damped Newton steps (an m-by-m
//! Cholesky solve per tract), the meta multipliers take a diagonal Newton
//! step, and the sweeps repeat until every residual is below tolerance.
//!
//! A rejected solve is retried with uniformly weakened importance weights
//! until they reach their floor; if no attempt ever succeeds the rescaled
//! prior weights are returned and the outcome is tagged accordingly.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::data::{check_marginal_vector, check_prior, tract_shares, HouseholdTable, Marginals};
use crate::error::{BalanceError, Result};
use crate::solving::{
    max_abs, solve_spd, BalanceOutcome, EntropyOptions, SolveFailure, SolveSummary, ARMIJO_SLOPE,
    EXPONENT_CAP, MAX_HALVINGS,
};

/// Importance weights are never relaxed below this value.
pub const IMPORTANCE_FLOOR: f64 = 1.0;

/// Amount subtracted from large importance weights on each relaxation; values
/// at or below the step drop straight to the floor.
pub const IMPORTANCE_STEP: f64 = 10.0;

/// Configuration for the hierarchical balancer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HierarchicalOptions {
    /// Starting per-tract importance weight on the tract-level relaxation.
    pub importance: f64,
    /// Per-control importance weight on the meta-level relaxation.
    pub meta_importance: f64,
    /// Options for the dual Newton sweeps of each attempt.
    pub solver: EntropyOptions,
}

impl Default for HierarchicalOptions {
    fn default() -> Self {
        Self {
            importance: 1000.0,
            meta_importance: 1000.0,
            solver: EntropyOptions {
                tolerance: 1e-7,
                max_iterations: 300,
            },
        }
    }
}

impl HierarchicalOptions {
    /// Overrides the starting tract importance while keeping other defaults.
    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = importance;
        self
    }

    /// Overrides the meta importance while keeping other defaults.
    pub fn with_meta_importance(mut self, meta_importance: f64) -> Self {
        self.meta_importance = meta_importance;
        self
    }

    /// Overrides the dual solver options while keeping other defaults.
    pub fn with_solver(mut self, solver: EntropyOptions) -> Self {
        self.solver = solver;
        self
    }
}

/// Balanced weights and relaxations for every tract.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HierarchicalSolution {
    /// Per-tract, per-sample allocation weights (tracts by samples). Rows of
    /// zero-marginal tracts are entirely zero.
    pub weights: DMatrix<f64>,
    /// Tract-level relaxation factors (controls by tracts). Columns of
    /// zero-marginal tracts are entirely zero.
    pub relaxation: DMatrix<f64>,
    /// Meta-level relaxation factors, one per control.
    pub meta_relaxation: DVector<f64>,
    /// How the weights were obtained.
    pub outcome: BalanceOutcome,
    /// Number of solve attempts, including the successful one.
    pub attempts: usize,
    /// Diagnostics of the successful attempt; `None` when the balancer fell
    /// back to the prior.
    pub summary: Option<SolveSummary>,
}

/// Maximum entropy allocation across tracts with a shared meta layer.
///
/// Tracts whose marginal row is entirely zero are excluded from the solve and
/// re-inserted afterwards with zero weights and zero relaxation. The prior is
/// rescaled per tract by that tract's share of the total marginal mass before
/// optimization.
pub fn balance_hierarchical(
    table: &HouseholdTable,
    marginals: &Marginals,
    meta_marginals: &DVector<f64>,
    prior: &DVector<f64>,
    options: &HierarchicalOptions,
) -> Result<HierarchicalSolution> {
    let n_samples = table.sample_count();
    let n_controls = table.control_count();
    if marginals.control_count() != n_controls {
        return Err(BalanceError::dimension_mismatch(
            "marginal controls",
            n_controls,
            marginals.control_count(),
        ));
    }
    check_marginal_vector(meta_marginals, n_controls)?;
    check_prior(prior, n_samples)?;
    for (index, weight) in [options.importance, options.meta_importance]
        .into_iter()
        .enumerate()
    {
        if !weight.is_finite() || weight <= 0.0 {
            return Err(BalanceError::NonPositiveImportance { index, weight });
        }
    }

    let total_tracts = marginals.tract_count();
    let (totals, dropped) = marginals.retain_nonzero();
    if !dropped.is_empty() {
        log::info!(
            "{} tract(s) with zero marginals encountered; setting their weights to zero",
            dropped.len()
        );
    }
    if totals.nrows() == 0 {
        // Nothing left to balance; every tract is unconstrained.
        return Ok(HierarchicalSolution {
            weights: DMatrix::zeros(total_tracts, n_samples),
            relaxation: DMatrix::zeros(n_controls, total_tracts),
            meta_relaxation: DVector::from_element(n_controls, 1.0),
            outcome: BalanceOutcome::Solved,
            attempts: 0,
            summary: None,
        });
    }

    let shares = tract_shares(&totals);
    let rescaled_prior =
        DMatrix::from_fn(totals.nrows(), n_samples, |tract, i| prior[i] * shares[tract]);
    let meta_importance = DVector::from_element(n_controls, options.meta_importance);

    let mut importance = DVector::from_element(totals.nrows(), options.importance);
    let mut attempts = 0;
    let mut relaxed = false;
    let solved = loop {
        attempts += 1;
        match attempt_solve(
            table,
            &totals,
            meta_marginals,
            &rescaled_prior,
            &importance,
            &meta_importance,
            &options.solver,
        ) {
            Ok(attempt) => break Some(attempt),
            Err(failure) => {
                log::debug!("balance attempt {} rejected: {:?}", attempts, failure);
                if importance.iter().all(|&value| value == IMPORTANCE_FLOOR) {
                    break None;
                }
                importance = relax_importance(&importance);
                relaxed = true;
            }
        }
    };
    if relaxed {
        log::info!("solver failure encountered; importance weights have been relaxed");
    }

    let (kept_weights, kept_relaxation, meta_relaxation, summary, usable) = match solved {
        Some(attempt) if attempt.weights.iter().any(|&weight| weight > 0.0) => (
            attempt.weights,
            attempt.relaxation,
            attempt.meta_relaxation,
            Some(attempt.summary),
            true,
        ),
        _ => {
            log::info!("optimization produced no usable solution; using the rescaled prior weights");
            (
                rescaled_prior.clone(),
                DMatrix::from_element(n_controls, totals.nrows(), 1.0),
                DVector::from_element(n_controls, 1.0),
                None,
                false,
            )
        }
    };

    let outcome = if !usable {
        BalanceOutcome::FallbackToPrior
    } else if relaxed {
        BalanceOutcome::RelaxedAndSolved
    } else {
        BalanceOutcome::Solved
    };

    Ok(HierarchicalSolution {
        weights: reinsert_rows(&kept_weights, &dropped, total_tracts),
        relaxation: reinsert_columns(&kept_relaxation, &dropped, total_tracts),
        meta_relaxation,
        outcome,
        attempts,
        summary,
    })
}

/// One relaxation of the importance weights: entries above the step shrink by
/// the step, everything else drops to the floor. Monotone non-increasing.
pub(crate) fn relax_importance(importance: &DVector<f64>) -> DVector<f64> {
    importance.map(|value| {
        if value > IMPORTANCE_STEP {
            (value - IMPORTANCE_STEP).max(IMPORTANCE_FLOOR)
        } else {
            IMPORTANCE_FLOOR
        }
    })
}

/// Result of one successful solve attempt on the reduced problem.
struct Attempt {
    weights: DMatrix<f64>,
    relaxation: DMatrix<f64>,
    meta_relaxation: DVector<f64>,
    summary: SolveSummary,
}

/// Pure solve attempt at fixed importance weights: block-coordinate damped
/// Newton on the dual until every residual is below tolerance.
fn attempt_solve(
    table: &HouseholdTable,
    totals: &DMatrix<f64>,
    meta: &DVector<f64>,
    prior: &DMatrix<f64>,
    importance: &DVector<f64>,
    meta_importance: &DVector<f64>,
    options: &EntropyOptions,
) -> std::result::Result<Attempt, SolveFailure> {
    let h = table.matrix();
    let n_tracts = totals.nrows();
    let n_controls = totals.ncols();
    let n_samples = h.nrows();

    let mut lambda = DMatrix::<f64>::zeros(n_tracts, n_controls);
    let mut nu = DVector::<f64>::zeros(n_controls);

    let mut weights = DMatrix::<f64>::zeros(n_tracts, n_samples);
    let mut relaxation = DMatrix::<f64>::zeros(n_controls, n_tracts);
    let mut alloc_objective = DVector::<f64>::zeros(n_tracts);
    let mut relax_objective = DVector::<f64>::zeros(n_tracts);
    for tract in 0..n_tracts {
        let lambda_t = DVector::from_fn(n_controls, |k, _| lambda[(tract, k)]);
        let (x, z, alloc, relax) =
            tract_state(h, totals, prior, importance[tract], tract, &lambda_t, &nu)
                .ok_or(SolveFailure::NonFinite)?;
        commit_tract(
            tract,
            &x,
            &z,
            alloc,
            relax,
            &mut weights,
            &mut relaxation,
            &mut alloc_objective,
            &mut relax_objective,
        );
    }
    let (mut meta_relax, mut meta_objective) =
        meta_state(meta, meta_importance, &nu).ok_or(SolveFailure::NonFinite)?;

    let scale = max_abs(totals.iter()).max(max_abs(meta.iter())).max(1.0);
    let mut iterations = 0;
    loop {
        let realized = &weights * h;
        let tract_residuals = DMatrix::from_fn(n_tracts, n_controls, |t, k| {
            realized[(t, k)] - totals[(t, k)] * relaxation[(k, t)]
        });
        let meta_residuals = DVector::from_fn(n_controls, |k, _| {
            (0..n_tracts)
                .map(|t| totals[(t, k)] * relaxation[(k, t)])
                .sum::<f64>()
                - meta[k] * meta_relax[k]
        });
        let residual_norm =
            max_abs(tract_residuals.iter()).max(max_abs(meta_residuals.iter()));
        if !residual_norm.is_finite() {
            return Err(SolveFailure::NonFinite);
        }
        if residual_norm <= options.tolerance * scale {
            return Ok(Attempt {
                weights,
                relaxation,
                meta_relaxation: meta_relax,
                summary: SolveSummary {
                    iterations,
                    residual: residual_norm,
                },
            });
        }
        if iterations >= options.max_iterations {
            return Err(SolveFailure::IterationLimit {
                residual: residual_norm,
            });
        }
        iterations += 1;
        let mut progressed = false;

        // Tract blocks: the meta multipliers are fixed, so each tract's
        // residual row stays valid until its own update.
        for tract in 0..n_tracts {
            let scaled = DMatrix::from_fn(n_samples, n_controls, |i, k| {
                weights[(tract, i)] * h[(i, k)]
            });
            let mut hessian = h.transpose() * scaled;
            for k in 0..n_controls {
                hessian[(k, k)] +=
                    totals[(tract, k)] * totals[(tract, k)] * relaxation[(k, tract)]
                        / importance[tract];
            }
            let residual = DVector::from_fn(n_controls, |k, _| tract_residuals[(tract, k)]);
            let direction =
                solve_spd(&hessian, &residual).ok_or(SolveFailure::Singular)?;
            let slope = residual.dot(&direction);
            if !slope.is_finite() {
                return Err(SolveFailure::NonFinite);
            }
            if slope <= 0.0 {
                continue;
            }

            let current = alloc_objective[tract] + relax_objective[tract];
            let lambda_t = DVector::from_fn(n_controls, |k, _| lambda[(tract, k)]);
            let mut step = 1.0_f64;
            for _ in 0..MAX_HALVINGS {
                let candidate = &lambda_t + &direction * step;
                if let Some((x, z, alloc, relax)) =
                    tract_state(h, totals, prior, importance[tract], tract, &candidate, &nu)
                {
                    if alloc + relax <= current - ARMIJO_SLOPE * step * slope {
                        for k in 0..n_controls {
                            lambda[(tract, k)] = candidate[k];
                        }
                        commit_tract(
                            tract,
                            &x,
                            &z,
                            alloc,
                            relax,
                            &mut weights,
                            &mut relaxation,
                            &mut alloc_objective,
                            &mut relax_objective,
                        );
                        progressed = true;
                        break;
                    }
                }
                step *= 0.5;
            }
        }

        // Meta block: diagonal Newton step on the meta multipliers, using the
        // relaxation state left by the tract sweeps.
        let meta_residuals = DVector::from_fn(n_controls, |k, _| {
            (0..n_tracts)
                .map(|t| totals[(t, k)] * relaxation[(k, t)])
                .sum::<f64>()
                - meta[k] * meta_relax[k]
        });
        let direction = DVector::from_fn(n_controls, |k, _| {
            let curvature = (0..n_tracts)
                .map(|t| totals[(t, k)] * totals[(t, k)] * relaxation[(k, t)] / importance[t])
                .sum::<f64>()
                + meta[k] * meta[k] * meta_relax[k] / meta_importance[k];
            if curvature > 0.0 {
                meta_residuals[k] / curvature
            } else {
                0.0
            }
        });
        let slope = meta_residuals.dot(&direction);
        if !slope.is_finite() {
            return Err(SolveFailure::NonFinite);
        }
        if slope > 0.0 {
            let current = relax_objective.sum() + meta_objective;
            let mut step = 1.0_f64;
            for _ in 0..MAX_HALVINGS {
                let candidate_nu = &nu + &direction * step;
                let relax_candidate =
                    relaxation_state(totals, importance, &lambda, &candidate_nu);
                let meta_candidate = meta_state(meta, meta_importance, &candidate_nu);
                if let (Some((z, relax)), Some((q, q_objective))) =
                    (relax_candidate, meta_candidate)
                {
                    if relax.sum() + q_objective <= current - ARMIJO_SLOPE * step * slope {
                        nu = candidate_nu;
                        relaxation = z;
                        relax_objective = relax;
                        meta_relax = q;
                        meta_objective = q_objective;
                        progressed = true;
                        break;
                    }
                }
                step *= 0.5;
            }
        }

        if !progressed {
            return Err(SolveFailure::IterationLimit {
                residual: residual_norm,
            });
        }
    }
}

/// Allocation and relaxation for one tract at a dual iterate, together with
/// the tract's contributions to the dual objective, or `None` on overflow.
#[allow(clippy::type_complexity)]
fn tract_state(
    h: &DMatrix<f64>,
    totals: &DMatrix<f64>,
    prior: &DMatrix<f64>,
    importance: f64,
    tract: usize,
    lambda_t: &DVector<f64>,
    nu: &DVector<f64>,
) -> Option<(DVector<f64>, DVector<f64>, f64, f64)> {
    let exponents = h * lambda_t;
    let mut x = DVector::zeros(h.nrows());
    for i in 0..h.nrows() {
        let argument = -exponents[i];
        if argument > EXPONENT_CAP {
            return None;
        }
        x[i] = prior[(tract, i)] * argument.exp();
    }
    let mut z = DVector::zeros(lambda_t.len());
    for k in 0..lambda_t.len() {
        let argument = totals[(tract, k)] * (lambda_t[k] - nu[k]) / importance;
        if argument > EXPONENT_CAP {
            return None;
        }
        z[k] = argument.exp();
    }
    let alloc = x.iter().sum::<f64>();
    let relax = importance * z.iter().sum::<f64>();
    if !alloc.is_finite() || !relax.is_finite() {
        return None;
    }
    Some((x, z, alloc, relax))
}

/// Relaxation matrix and per-tract objective contributions at a meta iterate.
fn relaxation_state(
    totals: &DMatrix<f64>,
    importance: &DVector<f64>,
    lambda: &DMatrix<f64>,
    nu: &DVector<f64>,
) -> Option<(DMatrix<f64>, DVector<f64>)> {
    let n_tracts = totals.nrows();
    let n_controls = totals.ncols();
    let mut z = DMatrix::zeros(n_controls, n_tracts);
    let mut objective = DVector::zeros(n_tracts);
    for tract in 0..n_tracts {
        let mut sum = 0.0;
        for k in 0..n_controls {
            let argument = totals[(tract, k)] * (lambda[(tract, k)] - nu[k]) / importance[tract];
            if argument > EXPONENT_CAP {
                return None;
            }
            z[(k, tract)] = argument.exp();
            sum += z[(k, tract)];
        }
        objective[tract] = importance[tract] * sum;
        if !objective[tract].is_finite() {
            return None;
        }
    }
    Some((z, objective))
}

/// Meta relaxation and its objective contribution at a meta iterate.
fn meta_state(
    meta: &DVector<f64>,
    meta_importance: &DVector<f64>,
    nu: &DVector<f64>,
) -> Option<(DVector<f64>, f64)> {
    let mut q = DVector::zeros(meta.len());
    let mut objective = 0.0;
    for k in 0..meta.len() {
        let argument = nu[k] * meta[k] / meta_importance[k];
        if argument > EXPONENT_CAP {
            return None;
        }
        q[k] = argument.exp();
        objective += meta_importance[k] * q[k];
    }
    if !objective.is_finite() {
        return None;
    }
    Some((q, objective))
}

#[allow(clippy::too_many_arguments)]
fn commit_tract(
    tract: usize,
    x: &DVector<f64>,
    z: &DVector<f64>,
    alloc: f64,
    relax: f64,
    weights: &mut DMatrix<f64>,
    relaxation: &mut DMatrix<f64>,
    alloc_objective: &mut DVector<f64>,
    relax_objective: &mut DVector<f64>,
) {
    for i in 0..x.len() {
        weights[(tract, i)] = x[i];
    }
    for k in 0..z.len() {
        relaxation[(k, tract)] = z[k];
    }
    alloc_objective[tract] = alloc;
    relax_objective[tract] = relax;
}

/// Copies `kept` into a taller matrix, leaving all-zero rows at the dropped
/// positions.
fn reinsert_rows(kept: &DMatrix<f64>, dropped: &[usize], total_rows: usize) -> DMatrix<f64> {
    if dropped.is_empty() {
        return kept.clone();
    }
    let mut out = DMatrix::zeros(total_rows, kept.ncols());
    let mut source = 0;
    for row in 0..total_rows {
        if dropped.contains(&row) {
            continue;
        }
        for column in 0..kept.ncols() {
            out[(row, column)] = kept[(source, column)];
        }
        source += 1;
    }
    out
}

/// Copies `kept` into a wider matrix, leaving all-zero columns at the dropped
/// positions.
fn reinsert_columns(kept: &DMatrix<f64>, dropped: &[usize], total_columns: usize) -> DMatrix<f64> {
    if dropped.is_empty() {
        return kept.clone();
    }
    let mut out = DMatrix::zeros(kept.nrows(), total_columns);
    let mut source = 0;
    for column in 0..total_columns {
        if dropped.contains(&column) {
            continue;
        }
        for row in 0..kept.nrows() {
            out[(row, column)] = kept[(row, source)];
        }
        source += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn relaxation_schedule_is_monotone_with_floor() {
        let importance = DVector::from_vec(vec![1000.0, 15.0, 10.0, 3.0, 1.0]);
        let relaxed = relax_importance(&importance);
        assert_relative_eq!(
            relaxed,
            DVector::from_vec(vec![990.0, 5.0, 1.0, 1.0, 1.0]),
            epsilon = 1e-12
        );

        // Repeated relaxation reaches the all-ones fixed point and stays.
        let mut current = importance;
        for _ in 0..200 {
            let next = relax_importance(&current);
            for k in 0..next.len() {
                assert!(next[k] <= current[k]);
                assert!(next[k] >= IMPORTANCE_FLOOR);
            }
            current = next;
        }
        assert!(current.iter().all(|&value| value == IMPORTANCE_FLOOR));
    }

    #[test]
    fn reinsertion_restores_original_positions() {
        let kept = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let rows = reinsert_rows(&kept, &[1], 3);
        assert_eq!(rows.nrows(), 3);
        assert_eq!(rows[(0, 1)], 2.0);
        assert_eq!(rows[(1, 0)], 0.0);
        assert_eq!(rows[(2, 0)], 3.0);

        let columns = reinsert_columns(&kept, &[0], 3);
        assert_eq!(columns.ncols(), 3);
        assert_eq!(columns[(0, 0)], 0.0);
        assert_eq!(columns[(0, 1)], 1.0);
        assert_eq!(columns[(1, 2)], 4.0);
    }

    #[test]
    fn all_zero_marginals_short_circuit() {
        let table = HouseholdTable::new(DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 1.0]))
            .unwrap();
        let marginals = Marginals::new(DMatrix::zeros(2, 2)).unwrap();
        let meta = DVector::from_vec(vec![0.0, 0.0]);
        let prior = DVector::from_element(2, 1.0);

        let solution = balance_hierarchical(
            &table,
            &marginals,
            &meta,
            &prior,
            &HierarchicalOptions::default(),
        )
        .unwrap();

        assert_eq!(solution.attempts, 0);
        assert!(solution.weights.iter().all(|&w| w == 0.0));
        assert!(solution.relaxation.iter().all(|&z| z == 0.0));
    }
}
