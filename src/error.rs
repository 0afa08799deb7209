use thiserror::Error;

/// Unified error type for `listbalance` operations.
#[derive(Debug, Error)]
pub enum BalanceError {
    /// Raised when provided arrays or matrices have incompatible dimensions.
    #[error("dimension mismatch in {context}: expected {expected} but found {found}")]
    DimensionMismatch {
        /// Human-readable context describing the operation.
        context: &'static str,
        /// The required dimension, often implied by the household table.
        expected: usize,
        /// The dimension that was actually supplied.
        found: usize,
    },

    /// Raised when the household table contains a negative or non-finite entry.
    #[error("household table entry at ({row}, {column}) must be non-negative, found {value}")]
    InvalidTableEntry { row: usize, column: usize, value: f64 },

    /// Raised when a marginal control total is negative or non-finite.
    #[error("marginal total at ({tract}, {control}) must be non-negative, found {value}")]
    InvalidMarginal {
        tract: usize,
        control: usize,
        value: f64,
    },

    /// Raised when a prior allocation weight is zero, negative or non-finite.
    #[error("prior weight at index {index} must be strictly positive, found {weight}")]
    NonPositivePrior { index: usize, weight: f64 },

    /// Raised when an importance weight is zero, negative or non-finite.
    #[error("importance weight at index {index} must be strictly positive, found {weight}")]
    NonPositiveImportance { index: usize, weight: f64 },

    /// Raised when a continuous weight handed to the discretizer is negative or non-finite.
    #[error("continuous weight at ({tract}, {sample}) must be non-negative, found {value}")]
    InvalidWeight {
        tract: usize,
        sample: usize,
        value: f64,
    },

    /// Raised when linear algebra operations encounter a singular system.
    #[error("matrix in {context} is singular")]
    SingularMatrix { context: &'static str },

    /// Raised when numerical routines produce NaN or infinity.
    #[error("encountered a non-finite value during {context}")]
    NumericalError { context: &'static str },

    /// Raised when the entropy balance fails to meet the residual tolerance.
    #[error(
        "entropy balance did not converge after {iterations} iterations; largest residual {residual}"
    )]
    DidNotConverge {
        /// Number of Newton steps performed before termination.
        iterations: usize,
        /// Largest absolute marginal residual in the last iteration.
        residual: f64,
    },

    /// Raised when an input container holds no rows or columns at all.
    #[error("{component} must contain at least one {unit}")]
    Empty {
        component: &'static str,
        unit: &'static str,
    },
}

impl BalanceError {
    /// Helper to format a [`DimensionMismatch`](BalanceError::DimensionMismatch) error.
    pub fn dimension_mismatch(context: &'static str, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            context,
            expected,
            found,
        }
    }

    /// Helper to raise when a matrix factorization fails due to singularity.
    pub fn singular(context: &'static str) -> Self {
        Self::SingularMatrix { context }
    }

    /// Helper for non-finite intermediate values.
    pub fn numerical(context: &'static str) -> Self {
        Self::NumericalError { context }
    }
}

/// Type alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, BalanceError>;
