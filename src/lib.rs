//! Linear-chain CRF training and inference over weighted finite-state transducers
//!
//! This library trains and runs discriminative sequence models (globally
//! normalized CRFs and locally normalized MEMM-style chains) for tagging
//! tasks. The core is a state-transition lattice inference engine:
//! forward-backward (sum-product) and Viterbi (max-product) dynamic
//! programming over a weighted finite-state transducer with tied weight
//! groups, driven by a gradient-based trainer.
//!
//! # Examples
//!
//! ## Training
//!
//! ```no_run
//! use trellis::train::Trainer;
//! use trellis::Attribute;
//!
//! let mut trainer = Trainer::new();
//!
//! let xseq = vec![
//!     vec![Attribute::new("walk", 1.0)],
//!     vec![Attribute::new("shop", 1.0)],
//! ];
//! let yseq = vec!["sunny", "rainy"];
//! trainer.append(&xseq, &yseq)?;
//! trainer.with_gaussian_prior(10.0)?;
//!
//! let tagger = trainer.train()?;
//! # Ok::<(), trellis::Error>(())
//! ```
//!
//! ## Tagging
//!
//! ```no_run
//! # use trellis::train::Trainer;
//! # use trellis::Attribute;
//! # let mut trainer = Trainer::new();
//! # trainer.append(&[vec![Attribute::new("walk", 1.0)]], &["sunny"])?;
//! # let tagger = trainer.train()?;
//! let xseq = vec![
//!     vec![Attribute::new("walk", 1.0)],
//!     vec![Attribute::new("shop", 1.0)],
//! ];
//! let labels = tagger.tag(&xseq)?;
//! # Ok::<(), trellis::Error>(())
//! ```

mod alphabet;
mod attribute;
mod crf;
mod dataset;
mod error;
mod factors;
mod transducer;

/// Lattice inference: sum-product and max-product dynamic programming
pub mod lattice;

/// Training: objectives, priors, the threaded batch driver and L-BFGS
pub mod train;

// Re-export main types
pub use self::alphabet::Alphabet;
pub use self::attribute::Attribute;
pub use self::crf::{Connectivity, Crf, ModelKind, WeightTying};
pub use self::dataset::{Instance, Item, ObservedAttribute};
pub use self::error::{Error, Result};
pub use self::factors::{Factors, FactorsIncrementor, Incrementor, Version, WeightVector};
pub use self::transducer::{ArcId, ArcSpec, State, Transducer, Transition, WeightedTransducer};
