//! Training for chain models
//!
//! The [`Objective`] trait is the contract an external gradient-based
//! optimizer drives; [`LabelLikelihood`] implements it for a single
//! sequential pass and [`BatchedLabelLikelihood`] for parallel batches.
//! [`optimize`] runs L-BFGS over either; [`Trainer`] is the high-level
//! string-typed boundary.

mod batched;
mod lbfgs;
mod objective;
mod trainer;

// Re-export public types
pub use self::batched::{BatchedLabelLikelihood, CacheStaleIndicator, VersionStaleIndicator};
pub use self::lbfgs::{optimize, LbfgsParams, LineSearchAlgorithm};
pub use self::objective::{LabelLikelihood, Objective, Prior};
pub use self::trainer::{Tagger, Trainer};
