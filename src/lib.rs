//! Maximum-entropy and Newton-Raphson list balancing for synthetic population weights.
//!
//! This crate reallocates a finite sample of household records into
//! per-geography weights so that weighted sums of the sample match externally
//! supplied marginal control totals, optionally at two nested geographic
//! levels at once. It offers tools to
//!
//! - validate household tables and marginal totals (`data` module),
//! - balance one geography by maximum entropy (`entropy` module) or by
//!   Newton-Raphson iterative proportional fitting (`newton` module),
//! - balance many tracts against a shared meta layer, with automatic
//!   importance-weight backoff on solver failure (`hierarchy` module), and
//! - discretize the balanced weights into a binary household selection
//!   (`discretize` module).
//!
//! Loading tables from files or databases and persisting results are left to
//! the caller; the engine consumes dense matrices and returns weight and
//! relaxation matrices, reporting diagnostics through the [`log`] facade.
//!
//! # Quick start
//!
//! ```no_run
//! use listbalance::{
//!     balance_hierarchical, discretize_weights, DiscretizeOptions, HierarchicalOptions,
//!     HouseholdTable, Marginals,
//! };
//! use nalgebra::{DMatrix, DVector};
//!
//! // Four sampled households described by two controls.
//! let table = HouseholdTable::new(DMatrix::from_row_slice(
//!     4,
//!     2,
//!     &[1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0],
//! ))
//! .expect("validated table");
//!
//! // Two tracts with their control totals and the shared meta totals.
//! let marginals = Marginals::new(DMatrix::from_row_slice(2, 2, &[10.0, 2.0, 4.0, 8.0]))
//!     .expect("validated marginals");
//! let meta = DVector::from_vec(vec![14.0, 10.0]);
//! let prior = DVector::from_element(4, 1.0);
//!
//! let balanced = balance_hierarchical(
//!     &table,
//!     &marginals,
//!     &meta,
//!     &prior,
//!     &HierarchicalOptions::default(),
//! )
//! .expect("well-formed problem");
//!
//! let selected = discretize_weights(&table, &balanced.weights, &DiscretizeOptions::default())
//!     .expect("well-formed weights");
//! println!(
//!     "selected {} households across {} tracts",
//!     selected.iter().filter(|&&flag| flag == 1).count(),
//!     selected.nrows(),
//! );
//! ```
//!
//! The balancers are stateless and synchronous; balancing many independent
//! geographies in parallel is the caller's responsibility.

pub mod data;
pub mod discretize;
pub mod entropy;
pub mod error;
pub mod hierarchy;
pub mod newton;
pub mod solving;

pub use data::{HouseholdTable, Marginals};
pub use discretize::{discretize_weights, DiscretizeOptions};
pub use entropy::{balance_entropy, EntropySolution};
pub use error::{BalanceError, Result};
pub use hierarchy::{balance_hierarchical, HierarchicalOptions, HierarchicalSolution};
pub use newton::{balance_newton, NewtonOptions, NewtonSolution};
pub use solving::{BalanceOutcome, EntropyOptions, SolveSummary};
