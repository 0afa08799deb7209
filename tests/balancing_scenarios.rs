use approx::assert_relative_eq;
use listbalance::{
    balance_entropy, balance_hierarchical, balance_newton, discretize_weights, BalanceOutcome,
    DiscretizeOptions, EntropyOptions, HierarchicalOptions, HouseholdTable, Marginals,
    NewtonOptions,
};
use nalgebra::{DMatrix, DVector};

fn two_control_table() -> HouseholdTable {
    HouseholdTable::new(DMatrix::from_row_slice(
        4,
        2,
        &[1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0],
    ))
    .unwrap()
}

/// Three samples split across two disjoint controls: the balancer must place
/// two units of weight on the first control and one on the second, exactly.
#[test]
fn single_unit_allocates_marginal_mass() {
    let table = HouseholdTable::new(DMatrix::from_row_slice(
        3,
        2,
        &[1.0, 0.0, 0.0, 1.0, 0.0, 1.0],
    ))
    .unwrap();
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
    assert_relative_eq!(solution.weights[0], 2.0, epsilon = 1e-6);
    assert!(solution.weights.iter().all(|&weight| weight >= 0.0));
}

#[test]
fn hierarchical_balance_matches_marginals_up_to_relaxation() {
    let table = two_control_table();
    let marginals =
        Marginals::new(DMatrix::from_row_slice(2, 2, &[10.0, 2.0, 4.0, 8.0])).unwrap();
    let meta = DVector::from_vec(vec![14.0, 10.0]);
    let prior = DVector::from_element(4, 1.0);

    let solution = balance_hierarchical(
        &table,
        &marginals,
        &meta,
        &prior,
        &HierarchicalOptions::default(),
    )
    .unwrap();

    assert_eq!(solution.outcome, BalanceOutcome::Solved);
    assert_eq!(solution.attempts, 1);
    assert!(solution.weights.iter().all(|&weight| weight >= 0.0));

    // Tract-level balance holds exactly up to the relaxation factors, and the
    // strong default importance keeps the relaxed totals close to the targets.
    let realized = &solution.weights * table.matrix();
    for tract in 0..2 {
        for control in 0..2 {
            let target = marginals.totals()[(tract, control)];
            let relaxed = target * solution.relaxation[(control, tract)];
            assert_relative_eq!(realized[(tract, control)], relaxed, epsilon = 1e-4);
            assert_relative_eq!(realized[(tract, control)], target, max_relative = 0.1);
        }
    }

    // Relaxed tract totals aggregate onto the meta totals.
    for control in 0..2 {
        let aggregated: f64 = (0..2)
            .map(|tract| {
                marginals.totals()[(tract, control)] * solution.relaxation[(control, tract)]
            })
            .sum();
        let relaxed_meta = meta[control] * solution.meta_relaxation[control];
        assert_relative_eq!(aggregated, relaxed_meta, epsilon = 1e-4);
    }
}

#[test]
fn hierarchical_zeros_out_degenerate_tracts() {
    let table = two_control_table();
    let marginals = Marginals::new(DMatrix::from_row_slice(
        3,
        2,
        &[10.0, 2.0, 0.0, 0.0, 4.0, 8.0],
    ))
    .unwrap();
    let meta = DVector::from_vec(vec![14.0, 10.0]);
    let prior = DVector::from_element(4, 1.0);

    let solution = balance_hierarchical(
        &table,
        &marginals,
        &meta,
        &prior,
        &HierarchicalOptions::default(),
    )
    .unwrap();

    assert_eq!(solution.weights.nrows(), 3);
    for sample in 0..4 {
        assert_eq!(solution.weights[(1, sample)], 0.0);
    }
    for control in 0..2 {
        assert_eq!(solution.relaxation[(control, 1)], 0.0);
    }
    // The surviving tracts still balance.
    let realized = &solution.weights * table.matrix();
    for tract in [0usize, 2usize] {
        for control in 0..2 {
            let relaxed = marginals.totals()[(tract, control)]
                * solution.relaxation[(control, tract)];
            assert_relative_eq!(realized[(tract, control)], relaxed, epsilon = 1e-4);
        }
    }
}

/// Capping the dual sweeps at zero forces every attempt to fail, driving the
/// importance weights down their full schedule before the balancer gives up
/// and returns the rescaled prior.
#[test]
fn hierarchical_falls_back_to_prior_when_attempts_are_exhausted() {
    let table = two_control_table();
    let marginals =
        Marginals::new(DMatrix::from_row_slice(2, 2, &[10.0, 2.0, 4.0, 8.0])).unwrap();
    let meta = DVector::from_vec(vec![14.0, 10.0]);
    let prior = DVector::from_element(4, 1.0);
    let options = HierarchicalOptions::default()
        .with_solver(EntropyOptions::default().with_max_iterations(0));

    let solution = balance_hierarchical(&table, &marginals, &meta, &prior, &options).unwrap();

    assert_eq!(solution.outcome, BalanceOutcome::FallbackToPrior);
    assert!(solution.summary.is_none());
    // 1000 steps down to 10 in decrements of ten, then the floor: 101 attempts.
    assert_eq!(solution.attempts, 101);
    // Both tracts hold half the marginal mass, so every rescaled prior weight
    // is exactly one half.
    for tract in 0..2 {
        for sample in 0..4 {
            assert_relative_eq!(solution.weights[(tract, sample)], 0.5, epsilon = 1e-12);
        }
    }
    assert!(solution.relaxation.iter().all(|&z| z == 1.0));
    assert!(solution.meta_relaxation.iter().all(|&q| q == 1.0));
}

#[test]
fn newton_balancer_stays_within_bounds_and_converges() {
    let table = HouseholdTable::new(DMatrix::from_row_slice(
        3,
        2,
        &[1.0, 0.0, 1.0, 0.0, 0.0, 2.0],
    ))
    .unwrap();
    let marginals = DVector::from_vec(vec![4.0, 4.0]);
    let prior = DVector::from_element(3, 1.0);
    let importance = DVector::from_element(2, 1e6);

    let solution = balance_newton(
        &table,
        &marginals,
        &prior,
        &importance,
        &NewtonOptions::default(),
    )
    .unwrap();

    assert!(solution.converged);
    assert!(solution.weight_gap <= 1e-7);
    let realized = table.matrix().transpose() * &solution.weights;
    assert_relative_eq!(realized, marginals, epsilon = 1e-2);
    for i in 0..3 {
        assert!(solution.weights[i] >= prior[i] / 5.0);
        assert!(solution.weights[i] <= prior[i] * 5.0);
    }
}

/// End to end: hierarchical balance feeding the discretizer yields a strictly
/// binary selection of the same shape as the weights.
#[test]
fn discretized_selection_is_strictly_binary() {
    let table = two_control_table();
    let marginals =
        Marginals::new(DMatrix::from_row_slice(2, 2, &[10.0, 2.0, 4.0, 8.0])).unwrap();
    let meta = DVector::from_vec(vec![14.0, 10.0]);
    let prior = DVector::from_element(4, 1.0);

    let balanced = balance_hierarchical(
        &table,
        &marginals,
        &meta,
        &prior,
        &HierarchicalOptions::default(),
    )
    .unwrap();
    let selection =
        discretize_weights(&table, &balanced.weights, &DiscretizeOptions::default()).unwrap();

    assert_eq!(selection.nrows(), balanced.weights.nrows());
    assert_eq!(selection.ncols(), balanced.weights.ncols());
    assert!(selection.iter().all(|&flag| flag == 0 || flag == 1));
}

#[test]
fn solutions_serialize_for_diagnostics() {
    let table = two_control_table();
    let marginals =
        Marginals::new(DMatrix::from_row_slice(2, 2, &[10.0, 2.0, 4.0, 8.0])).unwrap();
    let meta = DVector::from_vec(vec![14.0, 10.0]);
    let prior = DVector::from_element(4, 1.0);

    let solution = balance_hierarchical(
        &table,
        &marginals,
        &meta,
        &prior,
        &HierarchicalOptions::default(),
    )
    .unwrap();

    let encoded = serde_json::to_string(&solution).unwrap();
    assert!(encoded.contains("\"Solved\""));
    let decoded: listbalance::HierarchicalSolution = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded.outcome, BalanceOutcome::Solved);
    assert_eq!(decoded.weights.nrows(), 2);
}
