//! Input containers and validation utilities used by the balancing routines.

use nalgebra::{DMatrix, DVector};

use crate::error::{BalanceError, Result};

/// Table of household categorical data: one row per sampled household, one
/// column per control, entries are non-negative indicator counts.
#[derive(Clone, Debug)]
pub struct HouseholdTable {
    table: DMatrix<f64>,
}

impl HouseholdTable {
    /// Validates and wraps a household-by-control indicator matrix.
    pub fn new(table: DMatrix<f64>) -> Result<Self> {
        if table.nrows() == 0 {
            return Err(BalanceError::Empty {
                component: "household table",
                unit: "sample",
            });
        }
        if table.ncols() == 0 {
            return Err(BalanceError::Empty {
                component: "household table",
                unit: "control",
            });
        }
        for row in 0..table.nrows() {
            for column in 0..table.ncols() {
                let value = table[(row, column)];
                if !value.is_finite() || value < 0.0 {
                    return Err(BalanceError::InvalidTableEntry { row, column, value });
                }
            }
        }
        Ok(Self { table })
    }

    /// Number of sampled households (rows).
    pub fn sample_count(&self) -> usize {
        self.table.nrows()
    }

    /// Number of controls (columns).
    pub fn control_count(&self) -> usize {
        self.table.ncols()
    }

    /// Returns a read-only view of the underlying matrix.
    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.table
    }
}

/// Marginal control totals: one row per geography (tract), one column per
/// control. A row that is entirely zero marks an unconstrained geography.
#[derive(Clone, Debug)]
pub struct Marginals {
    totals: DMatrix<f64>,
}

impl Marginals {
    /// Validates and wraps a tract-by-control matrix of target totals.
    pub fn new(totals: DMatrix<f64>) -> Result<Self> {
        if totals.nrows() == 0 {
            return Err(BalanceError::Empty {
                component: "marginals",
                unit: "tract",
            });
        }
        if totals.ncols() == 0 {
            return Err(BalanceError::Empty {
                component: "marginals",
                unit: "control",
            });
        }
        for tract in 0..totals.nrows() {
            for control in 0..totals.ncols() {
                let value = totals[(tract, control)];
                if !value.is_finite() || value < 0.0 {
                    return Err(BalanceError::InvalidMarginal {
                        tract,
                        control,
                        value,
                    });
                }
            }
        }
        Ok(Self { totals })
    }

    /// Number of tracts (rows).
    pub fn tract_count(&self) -> usize {
        self.totals.nrows()
    }

    /// Number of controls (columns).
    pub fn control_count(&self) -> usize {
        self.totals.ncols()
    }

    /// Returns a read-only view of the target totals.
    pub fn totals(&self) -> &DMatrix<f64> {
        &self.totals
    }

    /// Indices of tracts whose marginal row is entirely zero.
    pub fn zero_tracts(&self) -> Vec<usize> {
        (0..self.totals.nrows())
            .filter(|&tract| (0..self.totals.ncols()).all(|k| self.totals[(tract, k)] == 0.0))
            .collect()
    }

    /// Splits the totals into the rows with at least one non-zero entry and
    /// the indices of the dropped all-zero rows, preserving order.
    pub fn retain_nonzero(&self) -> (DMatrix<f64>, Vec<usize>) {
        let dropped = self.zero_tracts();
        if dropped.is_empty() {
            return (self.totals.clone(), dropped);
        }
        let kept: Vec<usize> = (0..self.totals.nrows())
            .filter(|tract| !dropped.contains(tract))
            .collect();
        let retained = DMatrix::from_fn(kept.len(), self.totals.ncols(), |row, column| {
            self.totals[(kept[row], column)]
        });
        (retained, dropped)
    }
}

/// Per-tract share of the total marginal mass: `rowsum(A) / sum(A)`.
///
/// The caller must guarantee at least one non-zero entry.
pub(crate) fn tract_shares(totals: &DMatrix<f64>) -> DVector<f64> {
    let total: f64 = totals.iter().sum();
    DVector::from_fn(totals.nrows(), |tract, _| {
        (0..totals.ncols()).map(|k| totals[(tract, k)]).sum::<f64>() / total
    })
}

pub(crate) fn check_prior(prior: &DVector<f64>, expected: usize) -> Result<()> {
    if prior.len() != expected {
        return Err(BalanceError::dimension_mismatch(
            "prior weights",
            expected,
            prior.len(),
        ));
    }
    for (index, &weight) in prior.iter().enumerate() {
        if !weight.is_finite() || weight <= 0.0 {
            return Err(BalanceError::NonPositivePrior { index, weight });
        }
    }
    Ok(())
}

pub(crate) fn check_importance(importance: &DVector<f64>, expected: usize) -> Result<()> {
    if importance.len() != expected {
        return Err(BalanceError::dimension_mismatch(
            "importance weights",
            expected,
            importance.len(),
        ));
    }
    for (index, &weight) in importance.iter().enumerate() {
        if !weight.is_finite() || weight <= 0.0 {
            return Err(BalanceError::NonPositiveImportance { index, weight });
        }
    }
    Ok(())
}

pub(crate) fn check_marginal_vector(marginals: &DVector<f64>, expected: usize) -> Result<()> {
    if marginals.len() != expected {
        return Err(BalanceError::dimension_mismatch(
            "marginal totals",
            expected,
            marginals.len(),
        ));
    }
    for (control, &value) in marginals.iter().enumerate() {
        if !value.is_finite() || value < 0.0 {
            return Err(BalanceError::InvalidMarginal {
                tract: 0,
                control,
                value,
            });
        }
    }
    Ok(())
}
